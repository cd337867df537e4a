//! Head-region overlay: translucent fill, borders, per-person labels and the
//! people counter.

pub mod font;

use std::sync::Arc;

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};

pub use font::TextFace;

use crate::head::{HeadRegion, inclusive_rect};

pub const HIGHLIGHT: Rgb<u8> = Rgb([0, 255, 255]);
pub const TEXT_COLOR: Rgb<u8> = Rgb([0, 0, 0]);

/// Weight, in percent, of the filled overlay in the single blend pass.
pub const FILL_WEIGHT_PERCENT: u32 = 10;

const LABEL_MIN_SCALE: f32 = 0.2;
const LABEL_SHRINK: f32 = 0.9;
const COUNTER_ORIGIN: i32 = 10;

/// Where a per-person label lands. Rectangle corners are inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelLayout {
    pub text: String,
    pub scale: f32,
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
    pub text_x: i32,
    pub text_y: i32,
}

/// Deterministic overlay renderer. Cheap to clone; the face is shared.
#[derive(Debug, Clone)]
pub struct Renderer {
    face: Arc<TextFace>,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new(TextFace::Bitmap)
    }
}

impl Renderer {
    pub fn new(face: TextFace) -> Self {
        Self { face: Arc::new(face) }
    }

    pub fn face(&self) -> &TextFace {
        &self.face
    }

    /// Returns a copy of `image` with every region highlighted and labelled in
    /// order, plus the "Total People" counter.
    pub fn render(&self, image: &RgbImage, regions: &[HeadRegion]) -> RgbImage {
        let mut output = if regions.is_empty() {
            image.clone()
        } else {
            translucent_fill(image, regions)
        };
        for (idx, region) in regions.iter().enumerate() {
            draw_hollow_rect_mut(&mut output, region.rect(), HIGHLIGHT);
            let layout = self.layout_label(idx + 1, region);
            draw_filled_rect_mut(
                &mut output,
                inclusive_rect(layout.x1, layout.y1, layout.x2, layout.y2),
                HIGHLIGHT,
            );
            self.face.draw(
                &mut output,
                TEXT_COLOR,
                layout.text_x,
                layout.text_y,
                layout.scale,
                &layout.text,
            );
        }
        self.draw_counter(&mut output, regions.len());
        output
    }

    /// Sizes the label to fit the box width and places it above the head, or
    /// below when there is no room above.
    pub fn layout_label(&self, index: usize, region: &HeadRegion) -> LabelLayout {
        let text = format!("Person {} ({:.2})", index, region.score);
        let region_h = region.height().max(8);
        let mut scale = (region_h as f32 / 60.0).clamp(0.3, 0.9);
        let pad_x = ((6.0 * scale) as i32).max(4);
        let pad_y = ((3.0 * scale) as i32).max(2);
        let available = region.width().max(10);

        let (mut text_w, mut text_h) = self.face.text_size(scale, &text);
        while text_w as i32 + pad_x * 2 > available && scale > LABEL_MIN_SCALE {
            scale *= LABEL_SHRINK;
            (text_w, text_h) = self.face.text_size(scale, &text);
        }

        let label_w = text_w as i32 + pad_x * 2;
        let label_h = text_h as i32 + pad_y * 2;
        let mut x1 = region.x1;
        let mut x2 = x1 + label_w;
        let (mut y1, mut y2) = (region.y1 - label_h, region.y1);
        if y1 < 0 {
            y1 = region.y2;
            y2 = y1 + label_h;
        }
        if x2 > region.x2 {
            x2 = region.x2;
            x1 = region.x1.max(x2 - label_w);
        }

        LabelLayout {
            text,
            scale,
            x1,
            y1,
            x2,
            y2,
            text_x: x1 + pad_x,
            text_y: y1 + pad_y,
        }
    }

    /// Inclusive bounds of the counter background for an image `width` wide.
    pub fn counter_bounds(&self, width: u32, count: usize) -> (i32, i32, i32, i32) {
        let (scale, text) = counter_text(width, count);
        let (text_w, text_h) = self.face.text_size(scale, &text);
        (
            COUNTER_ORIGIN,
            COUNTER_ORIGIN,
            COUNTER_ORIGIN + text_w as i32 + 20,
            COUNTER_ORIGIN + text_h as i32 + 18,
        )
    }

    fn draw_counter(&self, canvas: &mut RgbImage, count: usize) {
        let (scale, text) = counter_text(canvas.width(), count);
        let (x1, y1, x2, y2) = self.counter_bounds(canvas.width(), count);
        draw_filled_rect_mut(canvas, inclusive_rect(x1, y1, x2, y2), HIGHLIGHT);
        self.face.draw(canvas, TEXT_COLOR, x1 + 8, y1 + 9, scale, &text);
    }
}

fn counter_text(width: u32, count: usize) -> (f32, String) {
    let scale = (width as f32 / 1000.0).clamp(0.8, 2.0);
    (scale, format!("Total People: {count}"))
}

/// Fills every region on a copy and blends it over the original once, so
/// overlapping regions are not darkened twice.
fn translucent_fill(image: &RgbImage, regions: &[HeadRegion]) -> RgbImage {
    let mut overlay = image.clone();
    for region in regions {
        draw_filled_rect_mut(&mut overlay, region.rect(), HIGHLIGHT);
    }
    let mut output = image.clone();
    for (dst, &top) in output.iter_mut().zip(overlay.iter()) {
        let blended = FILL_WEIGHT_PERCENT * top as u32 + (100 - FILL_WEIGHT_PERCENT) * *dst as u32;
        *dst = ((blended + 50) / 100) as u8;
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(x1: i32, y1: i32, x2: i32, y2: i32, score: f32) -> HeadRegion {
        HeadRegion { x1, y1, x2, y2, score }
    }

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    #[test]
    fn zero_regions_only_draw_counter() {
        let renderer = Renderer::default();
        let input = gradient(320, 240);
        let output = renderer.render(&input, &[]);
        let (x1, y1, x2, y2) = renderer.counter_bounds(320, 0);
        for (x, y, p) in output.enumerate_pixels() {
            let (xi, yi) = (x as i32, y as i32);
            let inside = xi >= x1 && xi <= x2 && yi >= y1 && yi <= y2;
            if !inside {
                assert_eq!(p, input.get_pixel(x, y), "pixel {x},{y} changed");
            }
        }
        assert_eq!(*output.get_pixel(x1 as u32, y1 as u32), HIGHLIGHT);
    }

    #[test]
    fn rendering_is_deterministic() {
        let renderer = Renderer::default();
        let input = gradient(400, 300);
        let regions = [region(40, 100, 160, 140, 0.91), region(120, 110, 260, 150, 0.85)];
        assert_eq!(renderer.render(&input, &regions), renderer.render(&input, &regions));
    }

    #[test]
    fn fill_blends_ten_percent_once() {
        let renderer = Renderer::default();
        let input = RgbImage::from_pixel(300, 300, Rgb([100, 100, 100]));
        let regions = [region(150, 200, 280, 260, 0.9), region(160, 210, 290, 270, 0.9)];
        let output = renderer.render(&input, &regions);
        // interior of both regions, away from borders and labels
        let p = output.get_pixel(200, 240);
        assert_eq!(p.0, [90, 116, 116]);
    }

    #[test]
    fn label_sits_flush_above_head() {
        let renderer = Renderer::default();
        let head = region(100, 120, 400, 150, 0.87);
        let layout = renderer.layout_label(1, &head);
        assert_eq!(layout.text, "Person 1 (0.87)");
        assert_eq!(layout.y2, 120);
        assert!(layout.y1 < 120);
        assert_eq!(layout.x1, 100);
        assert!(layout.x2 <= 400);
    }

    #[test]
    fn label_falls_below_when_no_room_above() {
        let renderer = Renderer::default();
        let head = region(10, 2, 300, 40, 0.9);
        let layout = renderer.layout_label(2, &head);
        assert_eq!(layout.y1, 40);
        assert!(layout.y2 > 40);
    }

    #[test]
    fn label_shrinks_and_clamps_to_narrow_box() {
        let renderer = Renderer::default();
        let head = region(50, 100, 80, 160, 0.5);
        let layout = renderer.layout_label(3, &head);
        assert!(layout.scale < 0.9);
        assert!(layout.scale <= LABEL_MIN_SCALE / LABEL_SHRINK);
        assert_eq!(layout.x2, 80);
        assert_eq!(layout.x1, 50);
    }

    #[test]
    fn label_scale_starts_from_region_height() {
        let renderer = Renderer::default();
        let wide = region(0, 200, 2000, 230, 0.5);
        let layout = renderer.layout_label(1, &wide);
        assert!((layout.scale - 0.5).abs() < 1e-6);
    }

    #[test]
    fn strip_region_renders() {
        let renderer = Renderer::default();
        let input = gradient(64, 64);
        let output = renderer.render(&input, &[region(5, 30, 40, 30, 0.99)]);
        assert_eq!(output.dimensions(), (64, 64));
        assert_eq!(*output.get_pixel(20, 30), HIGHLIGHT);
    }

    #[test]
    fn regions_past_image_edges_are_clipped() {
        let renderer = Renderer::default();
        let input = gradient(50, 50);
        let output = renderer.render(&input, &[region(30, 40, 90, 80, 0.6)]);
        assert_eq!(output.dimensions(), (50, 50));
    }

    #[test]
    fn truetype_labels_fit_and_render_deterministically() {
        let font = concat!(env!("CARGO_MANIFEST_DIR"), "/assets/fonts/DejaVuSansMono.ttf");
        let face = TextFace::load(font).unwrap();
        let renderer = Renderer::new(face);
        let head = region(60, 120, 160, 150, 0.93);
        let layout = renderer.layout_label(1, &head);
        assert_eq!(layout.y2, 120);
        assert!(layout.x1 >= 60 && layout.x2 <= 160);

        let input = gradient(320, 240);
        let first = renderer.render(&input, &[head]);
        assert_eq!(first, renderer.render(&input, &[head]));
        assert_ne!(first, input);
    }
}
