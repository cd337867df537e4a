//! Head-region highlighting for detected persons in images and video.

pub mod codec;
pub mod config;
pub mod error;
pub mod head;
pub mod infer;
pub mod inference;
pub mod models;
pub mod overlay;
pub mod protocol;
pub mod server;
pub mod video;

pub use error::{Error, Result};
