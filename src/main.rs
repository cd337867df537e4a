use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use head_highlight::config::{DEFAULT_CONFIDENCE, DEFAULT_NMS_IOU, DetectOptions, Device};
use head_highlight::inference::InferenceContext;
use head_highlight::overlay::{Renderer, TextFace};
use head_highlight::server::{self, AppState};

#[derive(Debug, Parser)]
#[command(version, about = "Head highlight detection server (HTTP upload + WebSocket stream)")]
struct Args {
    #[arg(long, default_value = "0.0.0.0:5000")]
    bind: SocketAddr,
    #[arg(long, default_value = "models")]
    models_dir: PathBuf,
    /// TrueType font for labels; the built-in bitmap face is used otherwise.
    #[arg(long)]
    font: Option<PathBuf>,
    /// `cpu`, `cuda` or `cuda:N`. CUDA falls back to the CPU when unavailable.
    #[arg(long, default_value = "cpu")]
    device: Device,
    #[arg(long, default_value_t = DEFAULT_CONFIDENCE)]
    confidence: f32,
    #[arg(long)]
    resize_long_edge: Option<u32>,
    #[arg(long)]
    tta_hflip: bool,
    #[arg(long, default_value_t = DEFAULT_NMS_IOU)]
    nms_iou: f32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,axum=info,hyper=info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let args = Args::parse();
    let defaults = DetectOptions {
        confidence_threshold: args.confidence,
        resize_long_edge: args.resize_long_edge,
        tta_hflip: args.tta_hflip,
        nms_iou: args.nms_iou,
    };
    defaults.validate().context("invalid detection options")?;

    let face = match &args.font {
        Some(path) => TextFace::load(path)
            .with_context(|| format!("loading font {}", path.display()))?,
        None => TextFace::Bitmap,
    };
    let models_dir = args.models_dir.clone();
    let device = args.device;
    let inference = tokio::task::spawn_blocking(move || {
        InferenceContext::new(&models_dir, Renderer::new(face), device)
    })
    .await
    .context("model loading task failed")?;
    info!(
        "event" = "server.config",
        bind = %args.bind,
        models_dir = %args.models_dir.display(),
        %device,
        tta_hflip = args.tta_hflip
    );

    let state = AppState::new(inference, defaults, &args.models_dir);
    server::serve(args.bind, state).await.context("server error")?;
    Ok(())
}
