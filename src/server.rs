use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::config::{DetectOptions, Device};
use crate::error::{Error, Result};
use crate::inference::InferenceContext;
use crate::models::{self, ModelCatalogEntry, SelectedCatalog};
use crate::protocol::{ClientMessage, FrameError, ProcessedFrame, ServerMessage};

const MAX_WS_MESSAGE: usize = 8 << 20;
const MAX_UPLOAD: usize = 32 << 20;

#[derive(Clone)]
pub struct AppState {
    pub inference: Arc<InferenceContext>,
    /// Applied to every request; clients may override the confidence only.
    pub defaults: DetectOptions,
    pub models_dir: PathBuf,
}

impl AppState {
    pub fn new(
        inference: InferenceContext,
        defaults: DetectOptions,
        models_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inference: Arc::new(inference),
            defaults,
            models_dir: models_dir.into(),
        }
    }

    fn options_for(&self, confidence: Option<f32>) -> DetectOptions {
        match confidence {
            Some(c) => self.defaults.with_confidence(c),
            None => self.defaults.clone(),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    detector: Option<String>,
    selected: SelectedCatalog,
}

#[derive(Serialize)]
struct ConfigResponse {
    device: Device,
    /// Providers of the loaded detector; empty when no model is loaded.
    execution_providers: Vec<String>,
    capabilities: Capabilities,
    models: Vec<ModelCatalogEntry>,
    selected: SelectedCatalog,
    defaults: DetectOptions,
}

#[derive(Serialize)]
struct Capabilities {
    transport: Vec<&'static str>,
    tta: Vec<&'static str>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/config", get(config))
        .route("/upload-image", post(upload_image))
        .route("/ws", get(ws_upgrade))
        .layer(
            ServiceBuilder::new()
                .layer(
                    CorsLayer::new()
                        .allow_methods(Any)
                        .allow_origin(Any)
                        .allow_headers(Any),
                )
                .layer(DefaultBodyLimit::max(MAX_UPLOAD)),
        )
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("listening" = %listener.local_addr()?, "event" = "server.start");
    axum::serve(listener, router(state)).await
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let body = HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        detector: state
            .inference
            .engine()
            .ok()
            .map(|engine| engine.detector().name().to_string()),
        selected: state.inference.selected_models.clone(),
    };
    (StatusCode::OK, Json(body))
}

async fn config(State(state): State<AppState>) -> impl IntoResponse {
    let body = ConfigResponse {
        device: state.inference.device,
        execution_providers: state
            .inference
            .engine()
            .map(|engine| vec![engine.detector().execution_provider().to_string()])
            .unwrap_or_default(),
        capabilities: Capabilities {
            transport: vec!["http", "ws"],
            tta: vec!["hflip"],
        },
        models: models::inspect_models_dir(&state.models_dir),
        selected: state.inference.selected_models.clone(),
        defaults: state.defaults.clone(),
    };
    (StatusCode::OK, Json(body))
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn upload_image(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut file: Option<Bytes> = None;
    let mut confidence: Option<f32> = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return error_response(StatusCode::BAD_REQUEST, err.body_text()),
        };
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => match field.bytes().await {
                Ok(bytes) => file = Some(bytes),
                Err(err) => return error_response(StatusCode::BAD_REQUEST, err.body_text()),
            },
            "confidence" => {
                let text = match field.text().await {
                    Ok(text) => text,
                    Err(err) => return error_response(StatusCode::BAD_REQUEST, err.body_text()),
                };
                match text.trim().parse::<f32>() {
                    Ok(value) => confidence = Some(value),
                    Err(_) => {
                        return error_response(
                            StatusCode::BAD_REQUEST,
                            format!("invalid confidence value: {:?}", text.trim()),
                        );
                    }
                }
            }
            _ => {}
        }
    }

    let Some(bytes) = file.filter(|b| !b.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "no file provided");
    };
    let options = state.options_for(confidence);
    let inference = state.inference.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let image = codec::decode_image_bytes(&bytes)?;
        annotate(&inference, &image, &options)
    })
    .await;

    match outcome {
        Ok(Ok(frame)) => (StatusCode::OK, Json(frame)).into_response(),
        Ok(Err(Error::DecodeFailure(reason))) => {
            debug!("event" = "upload.decode_failed", %reason);
            error_response(StatusCode::BAD_REQUEST, "invalid image file")
        }
        Ok(Err(err @ Error::Unavailable(_))) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
        Ok(Err(err @ Error::InvalidConfig(_))) => {
            error_response(StatusCode::BAD_REQUEST, err.to_string())
        }
        Ok(Err(err)) => {
            error!("event" = "upload.failed", %err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
        Err(err) => {
            error!("event" = "upload.worker_failed", %err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "processing failed")
        }
    }
}

/// Runs the frame engine and packs the annotated frame for the wire.
/// Blocking; call from `spawn_blocking`.
fn annotate(
    inference: &InferenceContext,
    image: &image::RgbImage,
    options: &DetectOptions,
) -> Result<ProcessedFrame> {
    let engine = inference.engine()?;
    let result = engine.detect(image, options)?;
    Ok(ProcessedFrame {
        image: codec::encode_jpeg_data_url(&result.image)?,
        count: result.person_count,
        inference_time: result.inference_time,
    })
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(MAX_WS_MESSAGE)
        .max_frame_size(MAX_WS_MESSAGE)
        .on_upgrade(|socket| handle_socket(socket, state))
}

async fn send(
    socket: &mut WebSocket,
    message: &ServerMessage,
) -> std::result::Result<(), axum::Error> {
    let payload = serde_json::to_string(message).map_err(axum::Error::new)?;
    socket.send(Message::Text(payload)).await
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let conn = uuid::Uuid::new_v4();
    info!("event" = "ws.connect", %conn);
    let hello = ServerMessage::Connected { message: "connected to head detection server" };
    if send(&mut socket, &hello).await.is_err() {
        return;
    }

    while let Some(Ok(message)) = socket.recv().await {
        let reply = match message {
            Message::Text(text) => match process_frame_message(&state, &text).await {
                Ok(frame) => ServerMessage::ProcessedFrame(frame),
                Err(err) => {
                    warn!(
                        "event" = "ws.frame_error",
                        %conn,
                        code = err.code,
                        "message" = %err.message
                    );
                    err.into_message()
                }
            },
            Message::Binary(_) => FrameError::new(
                "unsupported",
                "binary frames are not supported; send JSON text",
            )
            .into_message(),
            Message::Ping(p) => {
                if socket.send(Message::Pong(p)).await.is_err() {
                    break;
                }
                continue;
            }
            Message::Pong(_) => continue,
            Message::Close(_) => break,
        };
        if send(&mut socket, &reply).await.is_err() {
            break;
        }
    }
    info!("event" = "ws.disconnect", %conn);
}

/// Handles one text message. Every failure is reported to the client and the
/// channel stays open.
pub async fn process_frame_message(
    state: &AppState,
    text: &str,
) -> std::result::Result<ProcessedFrame, FrameError> {
    let ClientMessage::Frame(frame) = serde_json::from_str::<ClientMessage>(text)
        .map_err(|e| FrameError::new("bad-message", format!("invalid message: {e}")))?;
    let data = frame
        .image
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| FrameError::new("no-image", "no image data"))?;
    let options = state.options_for(frame.confidence);
    let inference = state.inference.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let image = codec::decode_data_url(&data)?;
        annotate(&inference, &image, &options)
    })
    .await
    .map_err(|e| FrameError::new("internal", format!("processing failed: {e}")))?;
    Ok(outcome?)
}
