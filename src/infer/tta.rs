//! Test-time augmentation: run the detector on extra views of the same frame
//! and merge everything into base-view coordinates.

use std::time::Duration;

use image::RgbImage;
use image::imageops;
use tracing::debug;

use super::{Detection, DetectorHandle};
use crate::error::Result;

/// An auxiliary view derived from the base image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxView {
    HorizontalFlip,
}

impl AuxView {
    pub fn apply(&self, base: &RgbImage) -> RgbImage {
        match self {
            AuxView::HorizontalFlip => imageops::flip_horizontal(base),
        }
    }

    /// Maps a detection found on this view back into base-view space.
    pub fn restore(&self, detection: Detection, base_width: u32) -> Detection {
        match self {
            AuxView::HorizontalFlip => Detection {
                bbox: detection.bbox.flip_horizontal(base_width as f32),
                ..detection
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuxView::HorizontalFlip => "hflip",
        }
    }
}

#[derive(Debug, Default)]
pub struct MergedViews {
    /// Base view first, then each auxiliary view in the order requested.
    pub detections: Vec<Detection>,
    /// Sum of forward-pass wall time across all views.
    pub inference_time: Duration,
}

/// Runs the base view plus every auxiliary view and concatenates the results.
/// No deduplication happens here.
pub fn merge_views(
    detector: &DetectorHandle,
    base: &RgbImage,
    aux_views: &[AuxView],
) -> Result<MergedViews> {
    let base_out = detector.run_view(base)?;
    let mut merged = MergedViews {
        detections: base_out.detections,
        inference_time: base_out.elapsed,
    };
    for view in aux_views {
        let transformed = view.apply(base);
        let out = detector.run_view(&transformed)?;
        debug!(
            "event" = "tta.view",
            view = view.name(),
            detections = out.detections.len(),
            elapsed_ms = out.elapsed.as_secs_f64() * 1000.0
        );
        merge_into(&mut merged.detections, *view, out.detections, base.width());
        merged.inference_time += out.elapsed;
    }
    Ok(merged)
}

/// Appends `view_detections` to `merged` after mapping them back to base space.
pub fn merge_into(
    merged: &mut Vec<Detection>,
    view: AuxView,
    view_detections: Vec<Detection>,
    base_width: u32,
) {
    merged.extend(
        view_detections
            .into_iter()
            .map(|d| view.restore(d, base_width)),
    );
}
