use std::path::Path;

use image::RgbImage;
use ndarray::Array3;
use ort::execution_providers::{CUDAExecutionProvider, ExecutionProviderDispatch};
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::value::Tensor;
use tracing::{debug, info, warn};

use super::{BoundingBox, CPU_PROVIDER, Detection, ViewDetector};
use crate::config::Device;
use crate::error::{Error, Result};
use crate::models::ModelMetadata;

/// Faster R-CNN style detector exported from torchvision.
///
/// Input is a single CHW float image in [0, 1]; outputs are `boxes` (N x 4,
/// xyxy in input pixels), `labels` (N, int64) and `scores` (N).
pub struct OnnxPersonDetector {
    session: Session,
    input_name: String,
    mean: Option<[f32; 3]>,
    std: Option<[f32; 3]>,
    provider: &'static str,
}

const CUDA_PROVIDER: &str = "CUDAExecutionProvider";

fn load_failed(path: &Path, err: impl std::fmt::Display) -> Error {
    Error::Unavailable(format!("failed to load {}: {err}", path.display()))
}

fn build_session(path: &Path, cuda_device: Option<u32>) -> Result<Session> {
    let mut builder = Session::builder()
        .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
        .and_then(|b| b.with_intra_threads(1))
        .map_err(|e| load_failed(path, e))?;
    if let Some(id) = cuda_device {
        let cuda = CUDAExecutionProvider::default()
            .with_device_id(id as i32)
            .build()
            .error_on_failure();
        let providers: [ExecutionProviderDispatch; 1] = [cuda];
        builder = builder
            .with_execution_providers(providers)
            .map_err(|e| load_failed(path, e))?;
    }
    builder.commit_from_file(path).map_err(|e| load_failed(path, e))
}

impl OnnxPersonDetector {
    /// Loads the model on `device`. A CUDA session that cannot be created
    /// falls back to the CPU provider with a warning.
    pub fn load(
        path: impl AsRef<Path>,
        metadata: Option<&ModelMetadata>,
        device: Device,
    ) -> Result<Self> {
        let path = path.as_ref();
        let (session, provider) = match device {
            Device::Cpu => (build_session(path, None)?, CPU_PROVIDER),
            Device::Cuda(id) => match build_session(path, Some(id)) {
                Ok(session) => (session, CUDA_PROVIDER),
                Err(err) => {
                    warn!("event" = "onnx.cuda.fallback", device = id, %err);
                    (build_session(path, None)?, CPU_PROVIDER)
                }
            },
        };

        let spec = metadata.and_then(|m| m.inputs.first());
        let input_name = spec
            .map(|s| s.name.clone())
            .unwrap_or_else(|| "images".to_string());
        let mean = spec.and_then(|s| s.mean.as_deref()).and_then(three);
        let std = spec.and_then(|s| s.std.as_deref()).and_then(three);
        info!(
            "event" = "onnx.session.ok",
            model = %path.display(),
            input = %input_name,
            provider
        );
        Ok(Self { session, input_name, mean, std, provider })
    }

    fn to_tensor(&self, view: &RgbImage) -> Array3<f32> {
        let (w, h) = view.dimensions();
        Array3::from_shape_fn((3, h as usize, w as usize), |(c, y, x)| {
            let v = view.get_pixel(x as u32, y as u32)[c] as f32 / 255.0;
            match (self.mean, self.std) {
                (Some(m), Some(s)) => (v - m[c]) / s[c],
                _ => v,
            }
        })
    }
}

fn three(values: &[f32]) -> Option<[f32; 3]> {
    match values {
        [a, b, c] => Some([*a, *b, *c]),
        _ => None,
    }
}

fn detector_err(err: ort::Error) -> Error {
    Error::Detector(err.to_string())
}

impl ViewDetector for OnnxPersonDetector {
    fn detect_view(&mut self, view: &RgbImage) -> Result<Vec<Detection>> {
        let input = Tensor::from_array(self.to_tensor(view)).map_err(detector_err)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input])
            .map_err(detector_err)?;

        let (_, boxes) = outputs["boxes"].try_extract_tensor::<f32>().map_err(detector_err)?;
        let (_, labels) = outputs["labels"].try_extract_tensor::<i64>().map_err(detector_err)?;
        let (_, scores) = outputs["scores"].try_extract_tensor::<f32>().map_err(detector_err)?;

        if boxes.len() != scores.len() * 4 || labels.len() != scores.len() {
            return Err(Error::Detector(format!(
                "output shape mismatch: {} box values, {} labels, {} scores",
                boxes.len(),
                labels.len(),
                scores.len()
            )));
        }

        let detections: Vec<Detection> = boxes
            .chunks_exact(4)
            .zip(labels.iter().zip(scores))
            .map(|(b, (&label, &score))| {
                Detection::new(BoundingBox::new(b[0], b[1], b[2], b[3]), score, label.max(0) as u32)
            })
            .collect();
        debug!("event" = "onnx.forward", detections = detections.len());
        Ok(detections)
    }

    fn name(&self) -> &str {
        "onnx-faster-rcnn"
    }

    fn execution_provider(&self) -> &str {
        self.provider
    }
}
