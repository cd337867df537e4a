//! Text faces for overlay labels.

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use crate::error::{Error, Result};

/// Nominal text height in pixels at scale 1.0.
pub const BASE_TEXT_HEIGHT: f32 = 22.0;

/// Em size for TrueType faces; cap height lands near [`BASE_TEXT_HEIGHT`].
const TRUETYPE_EM_PER_SCALE: f32 = 30.0;

const GLYPH_COLS: usize = 5;
const GLYPH_ROWS: usize = 7;
const GLYPH_ADVANCE: usize = GLYPH_COLS + 1;

pub enum TextFace {
    Truetype(FontVec),
    /// Built-in 5x7 face, used when no font file is configured.
    Bitmap,
}

impl TextFace {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
        let font = FontVec::try_from_vec(bytes).map_err(|e| {
            Error::InvalidConfig(format!("{} is not a usable font: {e}", path.display()))
        })?;
        Ok(TextFace::Truetype(font))
    }

    /// Width and height in pixels of `text` rendered at `scale`.
    pub fn text_size(&self, scale: f32, text: &str) -> (u32, u32) {
        match self {
            TextFace::Truetype(font) => text_size(truetype_scale(scale), font, text),
            TextFace::Bitmap => {
                let cell = bitmap_cell(scale);
                let chars = text.chars().count();
                if chars == 0 {
                    return (0, 0);
                }
                let cols = chars * GLYPH_ADVANCE - 1;
                (
                    (cols as f32 * cell).ceil() as u32,
                    (scale * BASE_TEXT_HEIGHT).ceil() as u32,
                )
            }
        }
    }

    /// Draws `text` with its top-left corner at (`x`, `y`).
    pub fn draw(
        &self,
        canvas: &mut RgbImage,
        color: Rgb<u8>,
        x: i32,
        y: i32,
        scale: f32,
        text: &str,
    ) {
        match self {
            TextFace::Truetype(font) => {
                draw_text_mut(canvas, color, x, y, truetype_scale(scale), font, text)
            }
            TextFace::Bitmap => draw_bitmap_text(canvas, color, x, y, scale, text),
        }
    }
}

fn truetype_scale(scale: f32) -> PxScale {
    PxScale::from(scale * TRUETYPE_EM_PER_SCALE)
}

impl std::fmt::Debug for TextFace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TextFace::Truetype(_) => f.write_str("TextFace::Truetype"),
            TextFace::Bitmap => f.write_str("TextFace::Bitmap"),
        }
    }
}

fn bitmap_cell(scale: f32) -> f32 {
    scale * BASE_TEXT_HEIGHT / GLYPH_ROWS as f32
}

fn draw_bitmap_text(canvas: &mut RgbImage, color: Rgb<u8>, x: i32, y: i32, scale: f32, text: &str) {
    let cell = bitmap_cell(scale);
    let span = |origin: i32, index: usize| {
        let start = (origin as f32 + index as f32 * cell).round() as i32;
        let end = (origin as f32 + (index + 1) as f32 * cell).round() as i32;
        (start, (end - start).max(1) as u32)
    };
    for (i, ch) in text.chars().enumerate() {
        let rows = glyph(ch);
        for (r, bits) in rows.iter().enumerate() {
            for c in 0..GLYPH_COLS {
                if bits & (1 << (GLYPH_COLS - 1 - c)) == 0 {
                    continue;
                }
                let (px, w) = span(x, i * GLYPH_ADVANCE + c);
                let (py, h) = span(y, r);
                draw_filled_rect_mut(canvas, Rect::at(px, py).of_size(w, h), color);
            }
        }
    }
}

fn glyph(ch: char) -> [u8; GLYPH_ROWS] {
    match ch {
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11111, 0b00010, 0b00100, 0b00010, 0b00001, 0b10001, 0b01110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        'a' => [0b00000, 0b00000, 0b01110, 0b00001, 0b01111, 0b10001, 0b01111],
        'b' => [0b10000, 0b10000, 0b10110, 0b11001, 0b10001, 0b10001, 0b11110],
        'c' => [0b00000, 0b00000, 0b01110, 0b10000, 0b10000, 0b10001, 0b01110],
        'd' => [0b00001, 0b00001, 0b01101, 0b10011, 0b10001, 0b10001, 0b01111],
        'e' => [0b00000, 0b00000, 0b01110, 0b10001, 0b11111, 0b10000, 0b01110],
        'f' => [0b00110, 0b01001, 0b01000, 0b11100, 0b01000, 0b01000, 0b01000],
        'g' => [0b00000, 0b01111, 0b10001, 0b10001, 0b01111, 0b00001, 0b01110],
        'h' => [0b10000, 0b10000, 0b10110, 0b11001, 0b10001, 0b10001, 0b10001],
        'i' => [0b00100, 0b00000, 0b01100, 0b00100, 0b00100, 0b00100, 0b01110],
        'j' => [0b00010, 0b00000, 0b00110, 0b00010, 0b00010, 0b10010, 0b01100],
        'k' => [0b10000, 0b10000, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010],
        'l' => [0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'm' => [0b00000, 0b00000, 0b11010, 0b10101, 0b10101, 0b10001, 0b10001],
        'n' => [0b00000, 0b00000, 0b10110, 0b11001, 0b10001, 0b10001, 0b10001],
        'o' => [0b00000, 0b00000, 0b01110, 0b10001, 0b10001, 0b10001, 0b01110],
        'p' => [0b00000, 0b00000, 0b11110, 0b10001, 0b11110, 0b10000, 0b10000],
        'q' => [0b00000, 0b00000, 0b01101, 0b10011, 0b01111, 0b00001, 0b00001],
        'r' => [0b00000, 0b00000, 0b10110, 0b11001, 0b10000, 0b10000, 0b10000],
        's' => [0b00000, 0b00000, 0b01110, 0b10000, 0b01110, 0b00001, 0b11110],
        't' => [0b01000, 0b01000, 0b11100, 0b01000, 0b01000, 0b01001, 0b00110],
        'u' => [0b00000, 0b00000, 0b10001, 0b10001, 0b10001, 0b10011, 0b01101],
        'v' => [0b00000, 0b00000, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'w' => [0b00000, 0b00000, 0b10001, 0b10001, 0b10101, 0b10101, 0b01010],
        'x' => [0b00000, 0b00000, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001],
        'y' => [0b00000, 0b00000, 0b10001, 0b10001, 0b01111, 0b00001, 0b01110],
        'z' => [0b00000, 0b00000, 0b11111, 0b00010, 0b00100, 0b01000, 0b11111],
        '(' => [0b00010, 0b00100, 0b01000, 0b01000, 0b01000, 0b00100, 0b00010],
        ')' => [0b01000, 0b00100, 0b00010, 0b00010, 0b00010, 0b00100, 0b01000],
        '.' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b01100, 0b01100],
        ':' => [0b00000, 0b01100, 0b01100, 0b00000, 0b01100, 0b01100, 0b00000],
        '-' => [0b00000, 0b00000, 0b00000, 0b11111, 0b00000, 0b00000, 0b00000],
        '_' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b11111],
        '/' => [0b00000, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b00000],
        '%' => [0b11000, 0b11001, 0b00010, 0b00100, 0b01000, 0b10011, 0b00011],
        // space and anything unknown advance without ink
        _ => [0; GLYPH_ROWS],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_size_scales_with_text_and_scale() {
        let face = TextFace::Bitmap;
        let (w1, h1) = face.text_size(1.0, "Person 1");
        let (w2, h2) = face.text_size(0.5, "Person 1");
        assert_eq!(h1, 22);
        assert!(w2 < w1 && h2 < h1);
        assert!(face.text_size(1.0, "Person 10").0 > w1);
        assert_eq!(face.text_size(1.0, ""), (0, 0));
    }

    #[test]
    fn bitmap_draw_stays_inside_measured_bounds() {
        let face = TextFace::Bitmap;
        let mut canvas = RgbImage::new(200, 60);
        let (w, h) = face.text_size(0.7, "Total People: 3");
        face.draw(&mut canvas, Rgb([255, 255, 255]), 5, 6, 0.7, "Total People: 3");
        for (x, y, p) in canvas.enumerate_pixels() {
            if p.0 != [0, 0, 0] {
                assert!(x >= 5 && x < 5 + w && y >= 6 && y < 6 + h, "ink at {x},{y}");
            }
        }
    }

    #[test]
    fn missing_font_file_is_an_io_error() {
        let err = TextFace::load("/nonexistent/font.ttf").unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    fn bundled_face() -> TextFace {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/assets/fonts/DejaVuSansMono.ttf");
        TextFace::load(path).unwrap()
    }

    #[test]
    fn truetype_size_grows_with_scale_and_text() {
        let face = bundled_face();
        let (w1, h1) = face.text_size(1.0, "Person 1 (0.87)");
        let (w2, h2) = face.text_size(0.5, "Person 1 (0.87)");
        assert!(w1 > 0 && h1 > 0);
        assert!(w2 < w1 && h2 < h1);
        assert!(face.text_size(1.0, "Person 12 (0.87)").0 > w1);
    }

    #[test]
    fn truetype_draw_inks_near_measured_box() {
        let face = bundled_face();
        let mut canvas = RgbImage::new(300, 80);
        let (w, h) = face.text_size(0.8, "Total People: 3");
        face.draw(&mut canvas, Rgb([255, 255, 255]), 10, 12, 0.8, "Total People: 3");
        let mut inked = 0;
        for (x, y, p) in canvas.enumerate_pixels() {
            if p.0 != [0, 0, 0] {
                inked += 1;
                assert!(x + 4 >= 10 && x < 10 + w + 4, "ink at {x},{y}");
                assert!(y + 4 >= 12 && y < 12 + h + 4, "ink at {x},{y}");
            }
        }
        assert!(inked > 0);
    }

    #[test]
    fn non_font_bytes_are_invalid_config() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("fake.ttf");
        std::fs::write(&path, b"not a font").unwrap();
        assert!(matches!(TextFace::load(&path), Err(Error::InvalidConfig(_))));
    }
}
