use std::collections::VecDeque;
use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, DynamicImage, Frames, RgbImage};
use tracing::{debug, info};

use super::sink::is_container;
use crate::error::{Error, Result};

/// Pull-based frame producer. `Ok(None)` marks end of stream.
pub trait FrameSource {
    fn read_frame(&mut self) -> Result<Option<RgbImage>>;

    /// Native frame rate, when the source knows it.
    fn fps(&self) -> Option<f64>;

    fn resolution(&self) -> (u32, u32);

    /// Releases the underlying device or file. Called once when the pipeline
    /// drains.
    fn close(&mut self) {}
}

/// Where frames come from: a camera index or a path on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoSource {
    Camera(u32),
    Path(PathBuf),
}

impl VideoSource {
    /// All-digit strings name a camera index; anything else is a path.
    pub fn parse(source: &str) -> Self {
        match source.parse::<u32>() {
            Ok(index) if source.chars().all(|c| c.is_ascii_digit()) => VideoSource::Camera(index),
            _ => VideoSource::Path(PathBuf::from(source)),
        }
    }

    pub fn open(&self, fallback_fps: f64) -> Result<Box<dyn FrameSource>> {
        match self {
            VideoSource::Camera(index) => open_camera(*index),
            VideoSource::Path(path) if path.is_dir() => {
                Ok(Box::new(ImageSequenceSource::open(path, fallback_fps)?))
            }
            VideoSource::Path(path) if has_extension(path, "gif") => {
                Ok(Box::new(GifSource::open(path, fallback_fps)?))
            }
            VideoSource::Path(path) if !path.exists() => Err(Error::Unavailable(format!(
                "unable to open video source: {} does not exist",
                path.display()
            ))),
            VideoSource::Path(path) if is_container(path) => open_container(path),
            VideoSource::Path(path) => Err(Error::Unavailable(format!(
                "unable to open video source: {} is not a frame directory, .gif or video file",
                path.display()
            ))),
        }
    }
}

impl FromStr for VideoSource {
    type Err = Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(VideoSource::parse(s))
    }
}

impl std::fmt::Display for VideoSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoSource::Camera(index) => write!(f, "camera {index}"),
            VideoSource::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

pub(crate) fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

const FRAME_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Numbered still images in a directory, played back in file-name order.
pub struct ImageSequenceSource {
    frames: VecDeque<PathBuf>,
    fps: f64,
    resolution: (u32, u32),
}

impl ImageSequenceSource {
    pub fn open(dir: impl AsRef<Path>, fps: f64) -> Result<Self> {
        let dir = dir.as_ref();
        let read = std::fs::read_dir(dir).map_err(|e| {
            Error::Unavailable(format!("unable to open video source {}: {e}", dir.display()))
        })?;
        let mut frames: Vec<PathBuf> = read
            .flatten()
            .map(|entry| entry.path())
            .filter(|p| FRAME_EXTENSIONS.iter().any(|ext| has_extension(p, ext)))
            .collect();
        frames.sort();
        let first = frames.first().ok_or_else(|| {
            Error::Unavailable(format!("unable to open video source {}: no frames", dir.display()))
        })?;
        let resolution = image::image_dimensions(first)
            .map_err(|e| Error::Unavailable(format!("unable to read {}: {e}", first.display())))?;
        info!(
            "event" = "source.open",
            kind = "sequence",
            frames = frames.len(),
            fps,
            dir = %dir.display()
        );
        Ok(Self { frames: frames.into(), fps, resolution })
    }
}

impl FrameSource for ImageSequenceSource {
    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        let Some(path) = self.frames.pop_front() else {
            return Ok(None);
        };
        let img = image::open(&path)
            .map_err(|e| Error::DecodeFailure(format!("{}: {e}", path.display())))?;
        Ok(Some(img.to_rgb8()))
    }

    fn fps(&self) -> Option<f64> {
        Some(self.fps)
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn close(&mut self) {
        self.frames.clear();
    }
}

/// Animated GIF decoded frame by frame.
pub struct GifSource {
    frames: Option<Frames<'static>>,
    pending: Option<RgbImage>,
    fps: f64,
    resolution: (u32, u32),
}

impl GifSource {
    pub fn open(path: impl AsRef<Path>, fallback_fps: f64) -> Result<Self> {
        let path = path.as_ref();
        let unavailable = |e: &dyn std::fmt::Display| {
            Error::Unavailable(format!("unable to open video source {}: {e}", path.display()))
        };
        let file = File::open(path).map_err(|e| unavailable(&e))?;
        let decoder = GifDecoder::new(BufReader::new(file)).map_err(|e| unavailable(&e))?;
        let mut frames = decoder.into_frames();
        let first = match frames.next() {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(unavailable(&e)),
            None => return Err(unavailable(&"no frames")),
        };
        let (numer, denom) = first.delay().numer_denom_ms();
        let delay_ms = numer as f64 / denom.max(1) as f64;
        let fps = if delay_ms > 0.0 { 1000.0 / delay_ms } else { fallback_fps };
        let pending = DynamicImage::ImageRgba8(first.into_buffer()).to_rgb8();
        let resolution = pending.dimensions();
        info!("event" = "source.open", kind = "gif", fps, path = %path.display());
        Ok(Self { frames: Some(frames), pending: Some(pending), fps, resolution })
    }
}

impl FrameSource for GifSource {
    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        let Some(frames) = self.frames.as_mut() else {
            return Ok(None);
        };
        match frames.next() {
            Some(Ok(frame)) => Ok(Some(DynamicImage::ImageRgba8(frame.into_buffer()).to_rgb8())),
            Some(Err(e)) => Err(Error::DecodeFailure(e.to_string())),
            None => Ok(None),
        }
    }

    fn fps(&self) -> Option<f64> {
        Some(self.fps)
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn close(&mut self) {
        self.pending = None;
        self.frames = None;
        debug!("event" = "source.close", kind = "gif");
    }
}

#[cfg(feature = "video-ffmpeg")]
fn open_container(path: &Path) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(super::ffmpeg::FfmpegSource::open(path)?))
}

#[cfg(not(feature = "video-ffmpeg"))]
fn open_container(path: &Path) -> Result<Box<dyn FrameSource>> {
    Err(Error::Unavailable(format!(
        "unable to open video source: decoding {} needs the `video-ffmpeg` feature",
        path.display()
    )))
}

#[cfg(feature = "camera")]
fn open_camera(index: u32) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(camera::CameraSource::open(index)?))
}

#[cfg(not(feature = "camera"))]
fn open_camera(index: u32) -> Result<Box<dyn FrameSource>> {
    Err(Error::Unavailable(format!(
        "camera {index} requested but camera capture is not compiled in \
         (enable the `camera` feature)"
    )))
}

#[cfg(feature = "camera")]
mod camera {
    use image::RgbImage;
    use nokhwa::Camera;
    use nokhwa::pixel_format::RgbFormat;
    use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
    use tracing::{info, warn};

    use super::FrameSource;
    use crate::error::{Error, Result};

    pub struct CameraSource {
        camera: Camera,
        open: bool,
    }

    impl CameraSource {
        pub fn open(index: u32) -> Result<Self> {
            let requested =
                RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
            let mut camera = Camera::new(CameraIndex::Index(index), requested)
                .map_err(|e| Error::Unavailable(format!("unable to open camera {index}: {e}")))?;
            camera
                .open_stream()
                .map_err(|e| Error::Unavailable(format!("unable to start camera {index}: {e}")))?;
            info!("event" = "source.open", kind = "camera", index, fps = camera.frame_rate());
            Ok(Self { camera, open: true })
        }
    }

    impl FrameSource for CameraSource {
        fn read_frame(&mut self) -> Result<Option<RgbImage>> {
            if !self.open {
                return Ok(None);
            }
            let frame = self
                .camera
                .frame()
                .map_err(|e| Error::DecodeFailure(format!("camera read failed: {e}")))?;
            let decoded = frame
                .decode_image::<RgbFormat>()
                .map_err(|e| Error::DecodeFailure(e.to_string()))?;
            Ok(Some(decoded))
        }

        fn fps(&self) -> Option<f64> {
            match self.camera.frame_rate() {
                0 => None,
                fps => Some(fps as f64),
            }
        }

        fn resolution(&self) -> (u32, u32) {
            let res = self.camera.resolution();
            (res.width(), res.height())
        }

        fn close(&mut self) {
            if self.open {
                self.open = false;
                if let Err(err) = self.camera.stop_stream() {
                    warn!("event" = "source.close_failed", %err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn digit_strings_are_camera_indices() {
        assert_eq!(VideoSource::parse("0"), VideoSource::Camera(0));
        assert_eq!(VideoSource::parse("12"), VideoSource::Camera(12));
        assert_eq!(VideoSource::parse("clip.gif"), VideoSource::Path(PathBuf::from("clip.gif")));
        assert_eq!(VideoSource::parse("+1"), VideoSource::Path(PathBuf::from("+1")));
    }

    #[test]
    fn missing_path_is_unavailable() {
        let err = VideoSource::parse("/definitely/not/here.mp4").open(30.0).err().unwrap();
        assert!(matches!(err, Error::Unavailable(_)));
    }

    #[test]
    fn sequence_plays_frames_in_name_order() {
        let tmp = tempfile::tempdir().unwrap();
        let frames = [("frame_002.png", 20u8), ("frame_001.png", 10), ("frame_003.png", 30)];
        for (name, shade) in frames {
            RgbImage::from_pixel(8, 6, Rgb([shade, 0, 0])).save(tmp.path().join(name)).unwrap();
        }
        std::fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();
        let mut source = ImageSequenceSource::open(tmp.path(), 12.0).unwrap();
        assert_eq!(source.resolution(), (8, 6));
        assert_eq!(source.fps(), Some(12.0));
        let shades: Vec<u8> = std::iter::from_fn(|| source.read_frame().unwrap())
            .map(|f| f.get_pixel(0, 0)[0])
            .collect();
        assert_eq!(shades, vec![10, 20, 30]);
    }

    #[cfg(not(feature = "video-ffmpeg"))]
    #[test]
    fn container_files_need_the_ffmpeg_feature() {
        let tmp = tempfile::tempdir().unwrap();
        let clip = tmp.path().join("clip.mp4");
        std::fs::write(&clip, b"not really a video").unwrap();
        let err = VideoSource::Path(clip).open(30.0).err().unwrap();
        assert!(matches!(err, Error::Unavailable(_)));
        assert!(err.to_string().contains("video-ffmpeg"), "{err}");
    }

    #[cfg(feature = "video-ffmpeg")]
    #[test]
    fn corrupt_container_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let clip = tmp.path().join("clip.mp4");
        std::fs::write(&clip, b"not really a video").unwrap();
        let err = VideoSource::Path(clip).open(30.0).err().unwrap();
        assert!(matches!(err, Error::Unavailable(_)));
    }

    #[test]
    fn empty_directory_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(ImageSequenceSource::open(tmp.path(), 30.0), Err(Error::Unavailable(_))));
    }
}
