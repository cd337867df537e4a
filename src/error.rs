use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The image or video source could not be located, or an empty buffer
    /// reached the detector.
    #[error("input not found: {0}")]
    InputNotFound(String),

    /// Bytes were present but did not decode into an image.
    #[error("unable to decode image: {0}")]
    DecodeFailure(String),

    /// A capture device, model or output writer could not be opened.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("detector failed: {0}")]
    Detector(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to encode image: {0}")]
    Encode(String),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io { path: path.into(), source }
    }

    /// Short machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InputNotFound(_) => "input-not-found",
            Error::DecodeFailure(_) => "decode-failure",
            Error::Unavailable(_) => "unavailable",
            Error::Detector(_) => "detector",
            Error::InvalidConfig(_) => "invalid-config",
            Error::Encode(_) => "encode",
            Error::Io { .. } => "io",
        }
    }
}
