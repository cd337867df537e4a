use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Frame(FramePayload),
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct FramePayload {
    /// Raw base64 or a `data:image/...;base64,` URL.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected { message: &'static str },
    ProcessedFrame(ProcessedFrame),
    Error { code: &'static str, error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedFrame {
    /// JPEG data URL of the annotated frame.
    pub image: String,
    pub count: usize,
    /// Seconds spent in the detector.
    pub inference_time: f64,
}

/// Per-message failure. Sent back to the client; the channel stays open.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameError {
    pub code: &'static str,
    pub message: String,
}

impl FrameError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn into_message(self) -> ServerMessage {
        ServerMessage::Error { code: self.code, error: self.message }
    }
}

impl From<Error> for FrameError {
    fn from(err: Error) -> Self {
        let message = match &err {
            Error::DecodeFailure(_) => "unable to decode image".to_string(),
            other => other.to_string(),
        };
        FrameError::new(err.code(), message)
    }
}
