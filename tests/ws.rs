mod common;

use futures_util::{SinkExt, StreamExt};
use head_highlight::server::{AppState, router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(state: AppState) -> Client {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    let (socket, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    socket
}

async fn next_json(socket: &mut Client) -> Value {
    loop {
        match socket.next().await.expect("socket closed").unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

async fn send_json(socket: &mut Client, value: Value) {
    socket.send(Message::Text(value.to_string())).await.unwrap();
}

#[tokio::test]
async fn greets_then_processes_frames() {
    let mut socket = connect(common::state_with(common::crowd())).await;
    assert_eq!(next_json(&mut socket).await["type"], "connected");

    let frame = json!({"type": "frame", "image": common::jpeg_data_url(), "confidence": 0.8});
    send_json(&mut socket, frame).await;
    let reply = next_json(&mut socket).await;
    assert_eq!(reply["type"], "processed_frame");
    assert_eq!(reply["count"], 2);
    assert!(reply["image"].as_str().unwrap().starts_with("data:image/jpeg;base64,"));

    let frame = json!({"type": "frame", "image": common::jpeg_data_url(), "confidence": 0.3});
    send_json(&mut socket, frame).await;
    assert_eq!(next_json(&mut socket).await["count"], 3);
}

#[tokio::test]
async fn bad_payloads_get_errors_without_closing() {
    let mut socket = connect(common::state_with(common::crowd())).await;
    next_json(&mut socket).await;

    send_json(&mut socket, json!({"type": "frame"})).await;
    let reply = next_json(&mut socket).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["error"], "no image data");

    send_json(&mut socket, json!({"type": "frame", "image": "!!not-base64!!"})).await;
    let reply = next_json(&mut socket).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["error"], "unable to decode image");

    socket.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    assert_eq!(next_json(&mut socket).await["code"], "unsupported");

    send_json(&mut socket, json!({"type": "frame", "image": common::jpeg_data_url()})).await;
    assert_eq!(next_json(&mut socket).await["type"], "processed_frame");
}

#[tokio::test]
async fn frames_without_model_report_unavailable() {
    let tmp = tempfile::tempdir().unwrap();
    let mut socket = connect(common::state_without_model(tmp.path())).await;
    next_json(&mut socket).await;
    send_json(&mut socket, json!({"type": "frame", "image": common::jpeg_data_url()})).await;
    let reply = next_json(&mut socket).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "unavailable");
}
