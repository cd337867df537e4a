use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_CONFIDENCE: f32 = 0.8;
pub const DEFAULT_NMS_IOU: f32 = 0.5;
pub const DEFAULT_FALLBACK_FPS: f64 = 30.0;
pub const DEFAULT_MAX_DISPLAY_WIDTH: u32 = 1000;

/// Where the detector session runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    Cpu,
    /// CUDA device ordinal.
    Cuda(u32),
}

impl FromStr for Device {
    type Err = Error;

    /// Accepts `cpu`, `cuda` and `cuda:N`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|id| id.parse().ok())
                .map(Device::Cuda)
                .ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "unknown device {other:?} (use cpu, cuda or cuda:N)"
                    ))
                }),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(id) => write!(f, "cuda:{id}"),
        }
    }
}

/// Per-frame detection options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectOptions {
    pub confidence_threshold: f32,
    /// Downscale so the longer edge matches this before inference; boxes are
    /// mapped back to the source resolution afterwards.
    pub resize_long_edge: Option<u32>,
    pub tta_hflip: bool,
    pub nms_iou: f32,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE,
            resize_long_edge: None,
            tta_hflip: false,
            nms_iou: DEFAULT_NMS_IOU,
        }
    }
}

impl DetectOptions {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(Error::InvalidConfig(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if !(self.nms_iou > 0.0 && self.nms_iou <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "nms_iou must be within (0, 1], got {}",
                self.nms_iou
            )));
        }
        if self.resize_long_edge == Some(0) {
            return Err(Error::InvalidConfig("resize_long_edge must be positive".into()));
        }
        Ok(())
    }

    pub fn with_confidence(&self, confidence_threshold: f32) -> Self {
        Self { confidence_threshold, ..self.clone() }
    }
}

/// Options recognised by the video pipeline. Validated once when the
/// pipeline is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoOptions {
    pub detect: DetectOptions,
    pub output_path: Option<PathBuf>,
    /// Run detection on every `skip_frames + 1`-th frame only.
    pub skip_frames: u32,
    pub duration_seconds: Option<f64>,
    pub show_progress: bool,
    /// Frames handed to a display are downscaled to at most this width.
    pub max_display_width: Option<u32>,
    /// Used when the source does not report a frame rate.
    pub fallback_fps: f64,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            detect: DetectOptions::default(),
            output_path: None,
            skip_frames: 0,
            duration_seconds: None,
            show_progress: true,
            max_display_width: Some(DEFAULT_MAX_DISPLAY_WIDTH),
            fallback_fps: DEFAULT_FALLBACK_FPS,
        }
    }
}

impl VideoOptions {
    pub fn validate(&self) -> Result<()> {
        self.detect.validate()?;
        if let Some(d) = self.duration_seconds {
            if d <= 0.0 || Duration::try_from_secs_f64(d).is_err() {
                return Err(Error::InvalidConfig(format!(
                    "duration_seconds must be a positive number of seconds, got {d}"
                )));
            }
        }
        if let Some(path) = &self.output_path {
            crate::video::sink::check_output_path(path)?;
        }
        if !self.fallback_fps.is_finite() || self.fallback_fps <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "fallback_fps must be positive, got {}",
                self.fallback_fps
            )));
        }
        if self.max_display_width == Some(0) {
            return Err(Error::InvalidConfig("max_display_width must be positive".into()));
        }
        Ok(())
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_seconds
            .and_then(|d| Duration::try_from_secs_f64(d).ok())
    }

    /// Frame budget implied by the duration at the given source rate.
    pub fn frame_limit(&self, fps: f64) -> Option<u64> {
        match self.duration_seconds {
            Some(d) if d > 0.0 && fps > 0.0 => Some((d * fps).round() as u64),
            _ => None,
        }
    }
}
