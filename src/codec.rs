//! Base64 / data-URL image transport encoding.

use std::io::Cursor;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;

use crate::error::{Error, Result};

pub const JPEG_QUALITY: u8 = 90;

/// Decodes encoded image bytes (JPEG, PNG, GIF) into RGB.
pub fn decode_image_bytes(bytes: &[u8]) -> Result<RgbImage> {
    if bytes.is_empty() {
        return Err(Error::DecodeFailure("empty payload".into()));
    }
    let img = image::load_from_memory(bytes).map_err(|e| Error::DecodeFailure(e.to_string()))?;
    Ok(img.to_rgb8())
}

/// Reads an image file. A missing file is `InputNotFound`; anything that
/// does not decode is `DecodeFailure`.
pub fn load_image(path: &Path) -> Result<RgbImage> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::InputNotFound(path.display().to_string()));
        }
        Err(e) => return Err(Error::io(path, e)),
    };
    decode_image_bytes(&bytes).map_err(|e| match e {
        Error::DecodeFailure(reason) => {
            Error::DecodeFailure(format!("{}: {reason}", path.display()))
        }
        other => other,
    })
}

/// Accepts raw base64 or a `data:image/...;base64,` URL.
pub fn decode_data_url(data: &str) -> Result<RgbImage> {
    let b64 = match data.split_once(',') {
        Some((_, payload)) => payload,
        None => data,
    };
    let bytes = STANDARD
        .decode(b64.trim())
        .map_err(|e| Error::DecodeFailure(format!("invalid base64: {e}")))?;
    decode_image_bytes(&bytes)
}

pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY)
        .encode_image(image)
        .map_err(|e| Error::Encode(e.to_string()))?;
    Ok(buf.into_inner())
}

pub fn encode_jpeg_data_url(image: &RgbImage) -> Result<String> {
    let jpeg = encode_jpeg(image)?;
    Ok(format!("data:image/jpeg;base64,{}", STANDARD.encode(jpeg)))
}
