use std::path::Path;

use image::RgbImage;
use image::imageops::{self, FilterType};
use tracing::{debug, info, warn};

use crate::config::{DetectOptions, Device};
use crate::error::{Error, Result};
use crate::head::extract_head_regions;
use crate::infer::tta::{AuxView, merge_views};
use crate::infer::{DetectorHandle, PERSON_CLASS, filter_detections, non_max_suppression};
use crate::models::{SelectedCatalog, select_best_models};
use crate::overlay::Renderer;

/// Output of one processed frame. Owned by the caller.
#[derive(Debug, Clone)]
pub struct FrameResult {
    pub image: RgbImage,
    /// Seconds spent in detector forward passes, summed over views.
    pub inference_time: f64,
    pub person_count: usize,
}

/// Detection plus overlay for a single frame.
#[derive(Debug, Clone)]
pub struct HeadDetector {
    detector: DetectorHandle,
    renderer: Renderer,
}

impl HeadDetector {
    pub fn new(detector: DetectorHandle, renderer: Renderer) -> Self {
        Self { detector, renderer }
    }

    pub fn detector(&self) -> &DetectorHandle {
        &self.detector
    }

    pub fn detect(&self, image: &RgbImage, options: &DetectOptions) -> Result<FrameResult> {
        if image.width() == 0 || image.height() == 0 {
            return Err(Error::InputNotFound("empty image buffer".into()));
        }
        options.validate()?;

        let (view, scale) = resize_for_inference(image, options.resize_long_edge);
        let aux_views: &[AuxView] =
            if options.tta_hflip { &[AuxView::HorizontalFlip] } else { &[] };
        let merged = merge_views(&self.detector, &view, aux_views)?;
        let raw = merged.detections.len();

        let persons =
            filter_detections(merged.detections, PERSON_CLASS, options.confidence_threshold);
        let mut kept = non_max_suppression(persons, options.nms_iou);
        if scale != 1.0 {
            for d in &mut kept {
                d.bbox = d.bbox.unscale(scale);
            }
        }

        let regions = extract_head_regions(&kept);
        let annotated = self.renderer.render(image, &regions);
        debug!(
            "event" = "frame.detected",
            raw,
            kept = regions.len(),
            inference_ms = merged.inference_time.as_secs_f64() * 1000.0
        );
        Ok(FrameResult {
            image: annotated,
            inference_time: merged.inference_time.as_secs_f64(),
            person_count: regions.len(),
        })
    }
}

/// Downscales so the longer edge equals `long_edge`. Returns the view and the
/// factor applied (1.0 when untouched).
pub fn resize_for_inference(image: &RgbImage, long_edge: Option<u32>) -> (RgbImage, f32) {
    let (w, h) = image.dimensions();
    let current = w.max(h);
    match long_edge {
        Some(target) if target > 0 && target != current => {
            let scale = target as f32 / current as f32;
            let nw = ((w as f32 * scale) as u32).max(1);
            let nh = ((h as f32 * scale) as u32).max(1);
            (imageops::resize(image, nw, nh, FilterType::Triangle), scale)
        }
        _ => (image.clone(), 1.0),
    }
}

/// Model selection plus the frame engine built from it, shared by every
/// request handler.
pub struct InferenceContext {
    pub selected_models: SelectedCatalog,
    /// Device the engine was requested on; the detector reports the
    /// provider it ended up with.
    pub device: Device,
    engine: Option<HeadDetector>,
}

impl InferenceContext {
    /// Picks the best person detection model under `models_dir` and loads it
    /// on `device` when the `onnx` feature is enabled.
    pub fn new(models_dir: impl AsRef<Path>, renderer: Renderer, device: Device) -> Self {
        let selected = select_best_models(models_dir.as_ref());
        if selected.person_detection.is_none() {
            warn!(
                "event" = "models.missing",
                "message" = "no person detection model found",
                dir = %models_dir.as_ref().display()
            );
        }
        info!(
            "event" = "models.selected",
            has_person_detection = selected.person_detection.is_some(),
            %device
        );

        #[cfg(feature = "onnx")]
        let engine = selected.person_detection.as_ref().and_then(|sel| {
            use crate::infer::onnx::OnnxPersonDetector;
            match OnnxPersonDetector::load(&sel.path, Some(&sel.metadata), device) {
                Ok(det) => Some(HeadDetector::new(DetectorHandle::new(det), renderer.clone())),
                Err(err) => {
                    warn!("event" = "onnx.session.fail", %err);
                    None
                }
            }
        });

        #[cfg(not(feature = "onnx"))]
        let engine = {
            if selected.person_detection.is_some() {
                warn!(
                    "event" = "onnx.disabled",
                    "message" = "built without the onnx feature; detector not loaded"
                );
            }
            let _ = renderer;
            None
        };

        Self { selected_models: selected, device, engine }
    }

    pub fn with_engine(engine: HeadDetector) -> Self {
        Self {
            selected_models: SelectedCatalog::default(),
            device: Device::Cpu,
            engine: Some(engine),
        }
    }

    pub fn engine(&self) -> Result<&HeadDetector> {
        self.engine
            .as_ref()
            .ok_or_else(|| Error::Unavailable("no person detection model loaded".into()))
    }
}
