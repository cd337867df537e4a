//! Head-region geometry derived from person boxes.

use imageproc::rect::Rect;

use crate::infer::Detection;

/// Fraction of the person box height treated as the head.
pub const HEAD_RATIO: f64 = 0.3;

/// Integer pixel rectangle over the top slice of a person box. Both corners
/// are inclusive, so `y2 == y1` is a one pixel strip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadRegion {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
    pub score: f32,
}

impl HeadRegion {
    pub fn from_detection(detection: &Detection) -> Self {
        let b = detection.bbox;
        let (x1, y1, x2, y2) = (b.x1 as i32, b.y1 as i32, b.x2 as i32, b.y2 as i32);
        let head_height = ((y2 - y1) as f64 * HEAD_RATIO) as i32;
        Self {
            x1,
            y1,
            x2,
            y2: y1 + head_height,
            score: detection.score,
        }
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    pub(crate) fn rect(&self) -> Rect {
        inclusive_rect(self.x1, self.y1, self.x2, self.y2)
    }
}

/// Rectangle covering `x1..=x2`, `y1..=y2`, never smaller than one pixel.
pub(crate) fn inclusive_rect(x1: i32, y1: i32, x2: i32, y2: i32) -> Rect {
    let w = (x2 - x1 + 1).max(1) as u32;
    let h = (y2 - y1 + 1).max(1) as u32;
    Rect::at(x1, y1).of_size(w, h)
}

pub fn extract_head_regions(detections: &[Detection]) -> Vec<HeadRegion> {
    detections.iter().map(HeadRegion::from_detection).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infer::{BoundingBox, PERSON_CLASS};

    fn det(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection::new(BoundingBox::new(x1, y1, x2, y2), 0.9, PERSON_CLASS)
    }

    #[test]
    fn head_of_hundred_pixel_box_is_thirty_tall() {
        let head = HeadRegion::from_detection(&det(10.0, 20.0, 60.0, 120.0));
        assert_eq!((head.x1, head.y1, head.x2, head.y2), (10, 20, 60, 50));
        assert_eq!(head.height(), 30);
    }

    #[test]
    fn head_height_is_floor_of_thirty_percent() {
        for h in 1..400 {
            let head = HeadRegion::from_detection(&det(0.0, 5.0, 10.0, 5.0 + h as f32));
            assert_eq!(head.height(), (h * 3) / 10, "box height {h}");
        }
    }

    #[test]
    fn fractional_coordinates_truncate_toward_zero() {
        let head = HeadRegion::from_detection(&det(10.9, 20.7, 50.2, 80.99));
        assert_eq!((head.x1, head.y1, head.x2), (10, 20, 50));
        assert_eq!(head.height(), 18);
    }

    #[test]
    fn tiny_box_degenerates_to_strip() {
        let head = HeadRegion::from_detection(&det(3.0, 4.0, 9.0, 6.0));
        assert_eq!(head.height(), 0);
        let rect = head.rect();
        assert_eq!((rect.width(), rect.height()), (7, 1));
    }

    #[test]
    fn extraction_is_one_to_one() {
        let dets = vec![det(0.0, 0.0, 10.0, 10.0), det(20.0, 0.0, 40.0, 50.0)];
        assert_eq!(extract_head_regions(&dets).len(), 2);
    }
}
