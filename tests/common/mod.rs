#![allow(dead_code)]

use head_highlight::Result;
use head_highlight::codec;
use head_highlight::config::{DetectOptions, Device};
use head_highlight::infer::{BoundingBox, Detection, DetectorHandle, PERSON_CLASS, ViewDetector};
use head_highlight::inference::{HeadDetector, InferenceContext};
use head_highlight::overlay::Renderer;
use head_highlight::server::AppState;
use image::{Rgb, RgbImage};

/// Returns the same detections for every view.
pub struct Scripted(pub Vec<Detection>);

impl ViewDetector for Scripted {
    fn detect_view(&mut self, _view: &RgbImage) -> Result<Vec<Detection>> {
        Ok(self.0.clone())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Two confident people and one weak one, laid out on a 200x150 frame.
pub fn crowd() -> Vec<Detection> {
    vec![
        Detection::new(BoundingBox::new(20.0, 40.0, 80.0, 140.0), 0.92, PERSON_CLASS),
        Detection::new(BoundingBox::new(110.0, 30.0, 180.0, 145.0), 0.85, PERSON_CLASS),
        Detection::new(BoundingBox::new(150.0, 10.0, 190.0, 60.0), 0.50, PERSON_CLASS),
    ]
}

/// Reports a fixed execution provider and finds nobody.
pub struct OnProvider(pub &'static str);

impl ViewDetector for OnProvider {
    fn detect_view(&mut self, _view: &RgbImage) -> Result<Vec<Detection>> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn execution_provider(&self) -> &str {
        self.0
    }
}

pub fn state_with_provider(provider: &'static str) -> AppState {
    let engine = HeadDetector::new(DetectorHandle::new(OnProvider(provider)), Renderer::default());
    AppState::new(InferenceContext::with_engine(engine), DetectOptions::default(), "models")
}

pub fn state_with(detections: Vec<Detection>) -> AppState {
    let engine = HeadDetector::new(DetectorHandle::new(Scripted(detections)), Renderer::default());
    AppState::new(InferenceContext::with_engine(engine), DetectOptions::default(), "models")
}

pub fn state_without_model(models_dir: &std::path::Path) -> AppState {
    AppState::new(
        InferenceContext::new(models_dir, Renderer::default(), Device::Cpu),
        DetectOptions::default(),
        models_dir,
    )
}

pub fn frame() -> RgbImage {
    RgbImage::from_fn(200, 150, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 90]))
}

pub fn jpeg_bytes() -> Vec<u8> {
    codec::encode_jpeg(&frame()).unwrap()
}

pub fn jpeg_data_url() -> String {
    codec::encode_jpeg_data_url(&frame()).unwrap()
}
