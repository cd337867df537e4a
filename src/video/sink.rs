use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::codecs::gif::{GifEncoder, Repeat};
use image::imageops::{self, FilterType};
use image::{Delay, DynamicImage, Frame, RgbImage};
use tracing::{debug, info};

use super::source::has_extension;
use crate::error::{Error, Result};

/// Consumer of annotated frames at the source's native resolution.
pub trait FrameSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()>;

    /// Flushes and releases the output. Consumes the sink so it cannot be
    /// written after release.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Containers handed to ffmpeg when the `video-ffmpeg` feature is built.
pub const CONTAINER_EXTENSIONS: [&str; 4] = ["mp4", "avi", "mov", "mkv"];

pub(crate) fn is_container(path: &Path) -> bool {
    CONTAINER_EXTENSIONS.iter().any(|ext| has_extension(path, ext))
}

/// Rejects output paths no sink can write.
pub fn check_output_path(path: &Path) -> Result<()> {
    if has_extension(path, "gif") || path.extension().is_none() {
        return Ok(());
    }
    if is_container(path) {
        if cfg!(feature = "video-ffmpeg") {
            return Ok(());
        }
        return Err(Error::InvalidConfig(format!(
            "{} needs a build with the `video-ffmpeg` feature",
            path.display()
        )));
    }
    Err(Error::InvalidConfig(format!(
        "unsupported output format for {} (use .gif, .mp4/.avi/.mov/.mkv or a directory)",
        path.display()
    )))
}

/// `.gif` paths get an animated GIF; paths without an extension become a
/// directory of numbered PNG frames. Video containers go through ffmpeg.
pub fn open_sink(path: &Path, fps: f64, resolution: (u32, u32)) -> Result<Box<dyn FrameSink>> {
    check_output_path(path)?;
    if has_extension(path, "gif") {
        return Ok(Box::new(GifSink::create(path, fps, resolution)?));
    }
    if path.extension().is_none() {
        return Ok(Box::new(DirectorySink::create(path, resolution)?));
    }
    open_container_sink(path, fps, resolution)
}

#[cfg(feature = "video-ffmpeg")]
fn open_container_sink(
    path: &Path,
    fps: f64,
    resolution: (u32, u32),
) -> Result<Box<dyn FrameSink>> {
    Ok(Box::new(super::ffmpeg::FfmpegSink::create(path, fps, resolution)?))
}

#[cfg(not(feature = "video-ffmpeg"))]
fn open_container_sink(
    path: &Path,
    _fps: f64,
    _resolution: (u32, u32),
) -> Result<Box<dyn FrameSink>> {
    Err(Error::InvalidConfig(format!(
        "{} needs a build with the `video-ffmpeg` feature",
        path.display()
    )))
}

pub(super) fn fit_native(frame: &RgbImage, resolution: (u32, u32)) -> Option<RgbImage> {
    if frame.dimensions() == resolution || resolution.0 == 0 || resolution.1 == 0 {
        None
    } else {
        Some(imageops::resize(frame, resolution.0, resolution.1, FilterType::Triangle))
    }
}

pub struct GifSink {
    encoder: GifEncoder<BufWriter<File>>,
    delay: Delay,
    resolution: (u32, u32),
    path: PathBuf,
    written: u64,
}

impl GifSink {
    pub fn create(path: &Path, fps: f64, resolution: (u32, u32)) -> Result<Self> {
        let file = File::create(path).map_err(|e| Error::io(path, e))?;
        let mut encoder = GifEncoder::new(BufWriter::new(file));
        encoder
            .set_repeat(Repeat::Infinite)
            .map_err(|e| Error::Encode(e.to_string()))?;
        let delay_ms = if fps > 0.0 { (1000.0 / fps).round() as u32 } else { 33 };
        info!("event" = "sink.open", kind = "gif", fps, path = %path.display());
        Ok(Self {
            encoder,
            delay: Delay::from_numer_denom_ms(delay_ms.max(1), 1),
            resolution,
            path: path.to_path_buf(),
            written: 0,
        })
    }
}

impl FrameSink for GifSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        let resized = fit_native(frame, self.resolution);
        let rgb = resized.as_ref().unwrap_or(frame);
        let rgba = DynamicImage::ImageRgb8(rgb.clone()).to_rgba8();
        self.encoder
            .encode_frame(Frame::from_parts(rgba, 0, 0, self.delay))
            .map_err(|e| Error::Encode(e.to_string()))?;
        self.written += 1;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        debug!(
            "event" = "sink.close",
            kind = "gif",
            frames = self.written,
            path = %self.path.display()
        );
        // the encoder writes the trailer when dropped
        drop(self.encoder);
        Ok(())
    }
}

pub struct DirectorySink {
    dir: PathBuf,
    resolution: (u32, u32),
    next_index: u64,
}

impl DirectorySink {
    pub fn create(dir: &Path, resolution: (u32, u32)) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        info!("event" = "sink.open", kind = "directory", dir = %dir.display());
        Ok(Self { dir: dir.to_path_buf(), resolution, next_index: 1 })
    }
}

impl FrameSink for DirectorySink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        let path = self.dir.join(format!("frame_{:06}.png", self.next_index));
        let resized = fit_native(frame, self.resolution);
        resized
            .as_ref()
            .unwrap_or(frame)
            .save(&path)
            .map_err(|e| Error::Encode(format!("{}: {e}", path.display())))?;
        self.next_index += 1;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        debug!("event" = "sink.close", kind = "directory", frames = self.next_index - 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn directory_sink_numbers_frames_at_native_size() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("annotated");
        let mut sink = open_sink(&out, 25.0, (20, 10)).unwrap();
        sink.write_frame(&RgbImage::from_pixel(20, 10, Rgb([1, 2, 3]))).unwrap();
        sink.write_frame(&RgbImage::from_pixel(10, 5, Rgb([4, 5, 6]))).unwrap();
        sink.finish().unwrap();
        assert_eq!(image::image_dimensions(out.join("frame_000001.png")).unwrap(), (20, 10));
        assert_eq!(image::image_dimensions(out.join("frame_000002.png")).unwrap(), (20, 10));
    }

    #[test]
    fn gif_sink_writes_decodable_animation() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("clip.gif");
        let mut sink = open_sink(&out, 10.0, (16, 16)).unwrap();
        for shade in [0u8, 128, 255] {
            sink.write_frame(&RgbImage::from_pixel(16, 16, Rgb([shade, shade, shade]))).unwrap();
        }
        sink.finish().unwrap();
        let mut source = crate::video::source::GifSource::open(&out, 30.0).unwrap();
        use crate::video::source::FrameSource;
        assert_eq!(source.resolution(), (16, 16));
        assert!((source.fps().unwrap() - 10.0).abs() < 0.5);
        let mut frames = 0;
        while source.read_frame().unwrap().is_some() {
            frames += 1;
        }
        assert_eq!(frames, 3);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let err = open_sink(&tmp.path().join("out.txt"), 30.0, (10, 10)).err().unwrap();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(!tmp.path().join("out.txt").exists());
    }

    #[test]
    fn output_path_check_accepts_gif_and_directories() {
        check_output_path(Path::new("clip.GIF")).unwrap();
        check_output_path(Path::new("frames")).unwrap();
        assert!(check_output_path(Path::new("clip.webm")).is_err());
    }

    #[cfg(not(feature = "video-ffmpeg"))]
    #[test]
    fn containers_need_the_ffmpeg_feature() {
        let err = check_output_path(Path::new("out.mp4")).unwrap_err();
        assert!(err.to_string().contains("video-ffmpeg"), "{err}");
    }
}
