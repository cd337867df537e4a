#[cfg(feature = "onnx")]
pub mod onnx;
pub mod tta;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use image::RgbImage;
use serde::Serialize;

use crate::error::{Error, Result};

/// COCO category id for "person", as emitted by torchvision detectors.
pub const PERSON_CLASS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        intersection_over_union(self, other)
    }

    /// Reflects the box about the vertical midline of a view `view_width` wide.
    /// Applying it twice with the same width yields the original box.
    pub fn flip_horizontal(&self, view_width: f32) -> Self {
        Self {
            x1: view_width - self.x2,
            y1: self.y1,
            x2: view_width - self.x1,
            y2: self.y2,
        }
    }

    /// Maps a box found on a view resized by `scale` back to the source image.
    pub fn unscale(&self, scale: f32) -> Self {
        Self {
            x1: self.x1 / scale,
            y1: self.y1 / scale,
            x2: self.x2 / scale,
            y2: self.y2 / scale,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub score: f32,
    pub label: u32,
}

impl Detection {
    pub fn new(bbox: BoundingBox, score: f32, label: u32) -> Self {
        Self { bbox, score, label }
    }
}

pub fn intersection_over_union(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);
    let w = (x2 - x1).max(0.0);
    let h = (y2 - y1).max(0.0);
    let inter = w * h;
    if inter <= 0.0 {
        return 0.0;
    }
    let union = a.area() + b.area() - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

/// Keeps detections of `class` scoring at least `confidence_threshold`, in order.
pub fn filter_detections(
    detections: Vec<Detection>,
    class: u32,
    confidence_threshold: f32,
) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|d| d.label == class && d.score >= confidence_threshold)
        .collect()
}

/// Greedy non-max suppression.
///
/// Candidates are visited in descending score order; a candidate survives when
/// its IoU with every already kept box stays below `iou_threshold`. The sort is
/// stable, so among equal scores the earlier entry is kept. Output is in
/// suppression order.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    if detections.is_empty() {
        return detections;
    }
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut selected: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let keep = selected
            .iter()
            .all(|s| s.bbox.iou(&candidate.bbox) < iou_threshold);
        if keep {
            selected.push(candidate);
        }
    }
    selected
}

/// One forward pass of the underlying detection network over a single view.
///
/// Implementations may hold device state and are not assumed reentrant;
/// callers go through [`DetectorHandle`], which serializes access.
pub trait ViewDetector: Send {
    /// Raw detections in the pixel space of `view`, every class, unfiltered.
    fn detect_view(&mut self, view: &RgbImage) -> Result<Vec<Detection>>;

    fn name(&self) -> &str;

    /// ONNX Runtime execution provider the detector actually runs on.
    fn execution_provider(&self) -> &str {
        CPU_PROVIDER
    }
}

pub const CPU_PROVIDER: &str = "CPUExecutionProvider";

#[derive(Debug)]
pub struct ViewOutput {
    pub detections: Vec<Detection>,
    pub elapsed: Duration,
}

/// Shared, explicitly passed handle to one detector on one device.
///
/// Cloning is cheap. Forward passes are serialized through a single-slot
/// mutex; everything outside [`DetectorHandle::run_view`] runs unlocked.
#[derive(Clone)]
pub struct DetectorHandle {
    inner: Arc<Mutex<Box<dyn ViewDetector>>>,
    name: Arc<str>,
    provider: Arc<str>,
}

impl DetectorHandle {
    pub fn new(detector: impl ViewDetector + 'static) -> Self {
        let name: Arc<str> = Arc::from(detector.name());
        let provider: Arc<str> = Arc::from(detector.execution_provider());
        Self {
            inner: Arc::new(Mutex::new(Box::new(detector))),
            name,
            provider,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn execution_provider(&self) -> &str {
        &self.provider
    }

    pub fn run_view(&self, view: &RgbImage) -> Result<ViewOutput> {
        let mut detector = self
            .inner
            .lock()
            .map_err(|_| {
                Error::Detector(format!("{} is poisoned by an earlier panic", self.name))
            })?;
        let started = Instant::now();
        let detections = detector.detect_view(view)?;
        Ok(ViewOutput {
            detections,
            elapsed: started.elapsed(),
        })
    }
}

impl std::fmt::Debug for DetectorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorHandle")
            .field("name", &self.name)
            .field("provider", &self.provider)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Detection {
        Detection::new(BoundingBox::new(x1, y1, x2, y2), score, PERSON_CLASS)
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = BoundingBox::new(10.0, 10.0, 50.0, 90.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn flip_is_an_involution() {
        let boxes = [
            BoundingBox::new(0.0, 5.0, 12.5, 40.0),
            BoundingBox::new(100.25, 3.0, 639.0, 479.0),
            BoundingBox::new(317.0, 0.0, 323.0, 1.0),
        ];
        for b in boxes {
            let twice = b.flip_horizontal(640.0).flip_horizontal(640.0);
            assert!((twice.x1 - b.x1).abs() < 1e-4);
            assert!((twice.x2 - b.x2).abs() < 1e-4);
            assert_eq!(twice.y1, b.y1);
            assert_eq!(twice.y2, b.y2);
        }
    }

    #[test]
    fn flip_preserves_vertical_extent_and_ordering() {
        let flipped = BoundingBox::new(10.0, 20.0, 30.0, 60.0).flip_horizontal(100.0);
        assert_eq!(flipped, BoundingBox::new(70.0, 20.0, 90.0, 60.0));
    }

    #[test]
    fn filter_keeps_target_class_at_threshold() {
        let input = vec![
            det(0.0, 0.0, 10.0, 10.0, 0.8),
            Detection::new(BoundingBox::new(0.0, 0.0, 10.0, 10.0), 0.99, 3),
            det(5.0, 5.0, 15.0, 15.0, 0.79),
            det(20.0, 0.0, 30.0, 10.0, 0.95),
        ];
        let kept = filter_detections(input, PERSON_CLASS, 0.8);
        let scores: Vec<f32> = kept.iter().map(|d| d.score).collect();
        assert_eq!(scores, vec![0.8, 0.95]);
    }

    #[test]
    fn filter_is_monotonic_in_threshold() {
        let input: Vec<Detection> = (0..20)
            .map(|i| det(i as f32, 0.0, i as f32 + 5.0, 5.0, i as f32 / 20.0))
            .collect();
        let mut previous = usize::MAX;
        for step in 0..=10 {
            let threshold = step as f32 / 10.0;
            let count = filter_detections(input.clone(), PERSON_CLASS, threshold).len();
            assert!(count <= previous);
            previous = count;
        }
    }

    #[test]
    fn filter_of_empty_is_empty() {
        assert!(filter_detections(Vec::new(), PERSON_CLASS, 0.5).is_empty());
    }

    #[test]
    fn nms_removes_overlapping_lower_scores() {
        let input = vec![
            det(0.0, 0.0, 100.0, 100.0, 0.7),
            det(2.0, 2.0, 102.0, 102.0, 0.9),
            det(200.0, 0.0, 300.0, 100.0, 0.8),
        ];
        let kept = non_max_suppression(input, 0.5);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].score, 0.9);
        assert_eq!(kept[1].score, 0.8);
    }

    #[test]
    fn nms_tie_keeps_earlier_entry() {
        let first = det(0.0, 0.0, 100.0, 100.0, 0.9);
        let second = det(1.0, 1.0, 101.0, 101.0, 0.9);
        let kept = non_max_suppression(vec![first, second], 0.5);
        assert_eq!(kept, vec![first]);
    }

    #[test]
    fn nms_survivors_stay_below_threshold() {
        let mut input = Vec::new();
        for i in 0..12 {
            for j in 0..4 {
                let x = (i * 7) as f32;
                let y = (j * 11) as f32;
                let score = ((i * 31 + j * 17) % 97) as f32 / 97.0;
                input.push(det(x, y, x + 40.0, y + 60.0, score));
            }
        }
        for threshold in [0.1f32, 0.3, 0.5, 0.7, 1.0] {
            let kept = non_max_suppression(input.clone(), threshold);
            for (i, a) in kept.iter().enumerate() {
                for b in &kept[i + 1..] {
                    assert!(a.bbox.iou(&b.bbox) < threshold);
                }
            }
        }
    }

    #[test]
    fn unscale_inverts_resize_factor() {
        let b = BoundingBox::new(10.0, 20.0, 30.0, 40.0).unscale(0.5);
        assert_eq!(b, BoundingBox::new(20.0, 40.0, 60.0, 80.0));
    }
}
