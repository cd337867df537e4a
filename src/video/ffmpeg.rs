//! Video container decode and encode through FFmpeg.
//!
//! Sources decode the best video stream to RGB24. Sinks encode MPEG-4 Part 2
//! into whatever container the output extension names.

use std::path::{Path, PathBuf};

use ffmpeg_next as ffmpeg;
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling::{self, Flags};
use image::RgbImage;
use tracing::{debug, info};

use super::sink::{FrameSink, fit_native};
use super::source::FrameSource;
use crate::error::{Error, Result};

fn init() -> Result<()> {
    ffmpeg::init().map_err(|e| Error::Unavailable(format!("unable to initialise ffmpeg: {e}")))
}

pub struct FfmpegSource {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::decoder::Video,
    scaler: scaling::Context,
    fps: Option<f64>,
    resolution: (u32, u32),
    eof_sent: bool,
    done: bool,
}

impl FfmpegSource {
    pub fn open(path: &Path) -> Result<Self> {
        init()?;
        let unavailable = |e: ffmpeg::Error| {
            Error::Unavailable(format!("unable to open video source {}: {e}", path.display()))
        };
        let input = ffmpeg::format::input(&path).map_err(unavailable)?;
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| Error::Unavailable(format!("{} has no video track", path.display())))?;
        let stream_index = stream.index();
        let rate = stream.avg_frame_rate();
        let fps = (rate.numerator() > 0 && rate.denominator() > 0)
            .then(|| f64::from(rate.numerator()) / f64::from(rate.denominator()));
        let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .and_then(|context| context.decoder().video())
            .map_err(unavailable)?;
        let (width, height) = (decoder.width(), decoder.height());
        let scaler = scaling::Context::get(
            decoder.format(),
            width,
            height,
            Pixel::RGB24,
            width,
            height,
            Flags::BILINEAR,
        )
        .map_err(unavailable)?;
        info!(
            "event" = "source.open",
            kind = "ffmpeg",
            width,
            height,
            ?fps,
            path = %path.display()
        );
        Ok(Self {
            input,
            stream_index,
            decoder,
            scaler,
            fps,
            resolution: (width, height),
            eof_sent: false,
            done: false,
        })
    }

    fn convert(&mut self, decoded: &ffmpeg::frame::Video) -> Result<RgbImage> {
        let mut rgb = ffmpeg::frame::Video::empty();
        self.scaler
            .run(decoded, &mut rgb)
            .map_err(|e| Error::DecodeFailure(format!("scaling frame to RGB failed: {e}")))?;
        frame_to_image(&rgb)
    }
}

impl FrameSource for FfmpegSource {
    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        while !self.done {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return self.convert(&decoded).map(Some);
            }
            if self.eof_sent {
                self.done = true;
                break;
            }
            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) if packet.stream() == self.stream_index => self
                    .decoder
                    .send_packet(&packet)
                    .map_err(|e| Error::DecodeFailure(format!("decoder rejected packet: {e}")))?,
                Ok(()) => {}
                Err(ffmpeg::Error::Eof) => {
                    self.decoder.send_eof().map_err(|e| {
                        Error::DecodeFailure(format!("flushing decoder failed: {e}"))
                    })?;
                    self.eof_sent = true;
                }
                Err(err) => {
                    return Err(Error::DecodeFailure(format!("reading packet failed: {err}")));
                }
            }
        }
        Ok(None)
    }

    fn fps(&self) -> Option<f64> {
        self.fps
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn close(&mut self) {
        self.done = true;
        debug!("event" = "source.close", kind = "ffmpeg");
    }
}

/// Copies an RGB24 frame row by row; FFmpeg pads rows to its stride.
fn frame_to_image(frame: &ffmpeg::frame::Video) -> Result<RgbImage> {
    let (width, height) = (frame.width(), frame.height());
    let row_bytes = width as usize * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);
    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let line = data
            .get(start..start + row_bytes)
            .ok_or_else(|| Error::DecodeFailure("ffmpeg frame row is out of bounds".into()))?;
        pixels.extend_from_slice(line);
    }
    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| Error::DecodeFailure("ffmpeg frame has an unexpected size".into()))
}

pub struct FfmpegSink {
    output: ffmpeg::format::context::Output,
    encoder: ffmpeg::encoder::video::Encoder,
    scaler: scaling::Context,
    stream_index: usize,
    encoder_time_base: ffmpeg::Rational,
    resolution: (u32, u32),
    next_pts: i64,
    path: PathBuf,
}

impl FfmpegSink {
    pub fn create(path: &Path, fps: f64, resolution: (u32, u32)) -> Result<Self> {
        init()?;
        let encode = |e: ffmpeg::Error| Error::Encode(format!("{}: {e}", path.display()));
        let (width, height) = resolution;
        if width < 2 || height < 2 {
            return Err(Error::Encode(format!(
                "{}: frame size {width}x{height} is too small",
                path.display()
            )));
        }
        // YUV 4:2:0 needs even dimensions
        let (enc_width, enc_height) = (width & !1, height & !1);
        let rate = fps.round().clamp(1.0, 240.0) as i32;
        let time_base = ffmpeg::Rational::new(1, rate);

        let mut output = ffmpeg::format::output(&path).map_err(encode)?;
        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);
        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::MPEG4)
            .ok_or_else(|| Error::Encode("ffmpeg was built without an MPEG-4 encoder".into()))?;
        let mut stream = output.add_stream(codec).map_err(encode)?;
        let stream_index = stream.index();

        let mut encoder = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .map_err(encode)?;
        encoder.set_width(enc_width);
        encoder.set_height(enc_height);
        encoder.set_format(Pixel::YUV420P);
        encoder.set_time_base(time_base);
        encoder.set_frame_rate(Some(ffmpeg::Rational::new(rate, 1)));
        if global_header {
            encoder.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }
        let encoder = encoder.open_as(codec).map_err(encode)?;
        stream.set_time_base(time_base);
        stream.set_parameters(&encoder);
        output.write_header().map_err(encode)?;

        let scaler = scaling::Context::get(
            Pixel::RGB24,
            width,
            height,
            Pixel::YUV420P,
            enc_width,
            enc_height,
            Flags::BILINEAR,
        )
        .map_err(encode)?;
        info!("event" = "sink.open", kind = "ffmpeg", fps = rate, path = %path.display());
        Ok(Self {
            output,
            encoder,
            scaler,
            stream_index,
            encoder_time_base: time_base,
            resolution,
            next_pts: 0,
            path: path.to_path_buf(),
        })
    }

    fn write_packets(&mut self) -> Result<()> {
        let stream_time_base = self
            .output
            .stream(self.stream_index)
            .map(|s| s.time_base())
            .unwrap_or(self.encoder_time_base);
        let mut packet = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(self.encoder_time_base, stream_time_base);
            packet
                .write_interleaved(&mut self.output)
                .map_err(|e| Error::Encode(format!("{}: {e}", self.path.display())))?;
        }
        Ok(())
    }
}

impl FrameSink for FfmpegSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        let resized = fit_native(frame, self.resolution);
        let frame = resized.as_ref().unwrap_or(frame);
        let (width, height) = self.resolution;

        let mut rgb = ffmpeg::frame::Video::new(Pixel::RGB24, width, height);
        let row_bytes = width as usize * 3;
        let stride = rgb.stride(0);
        let plane = rgb.data_mut(0);
        for (row, line) in frame.as_raw().chunks_exact(row_bytes).enumerate() {
            plane[row * stride..row * stride + row_bytes].copy_from_slice(line);
        }

        let mut yuv = ffmpeg::frame::Video::empty();
        self.scaler
            .run(&rgb, &mut yuv)
            .map_err(|e| Error::Encode(format!("colour conversion failed: {e}")))?;
        yuv.set_pts(Some(self.next_pts));
        self.next_pts += 1;
        self.encoder
            .send_frame(&yuv)
            .map_err(|e| Error::Encode(format!("encoder rejected frame: {e}")))?;
        self.write_packets()
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.encoder
            .send_eof()
            .map_err(|e| Error::Encode(format!("flushing encoder failed: {e}")))?;
        self.write_packets()?;
        self.output
            .write_trailer()
            .map_err(|e| Error::Encode(format!("{}: {e}", self.path.display())))?;
        debug!(
            "event" = "sink.close",
            kind = "ffmpeg",
            frames = self.next_pts,
            path = %self.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn encoded_clip_decodes_with_same_frame_count() {
        let tmp = tempfile::tempdir().unwrap();
        let clip = tmp.path().join("clip.mp4");
        let mut sink = FfmpegSink::create(&clip, 10.0, (64, 48)).unwrap();
        for shade in [0u8, 60, 120, 180, 240] {
            sink.write_frame(&RgbImage::from_pixel(64, 48, Rgb([shade, shade, shade]))).unwrap();
        }
        Box::new(sink).finish().unwrap();

        let mut source = FfmpegSource::open(&clip).unwrap();
        assert_eq!(source.resolution(), (64, 48));
        assert!((source.fps().unwrap() - 10.0).abs() < 0.5);
        let mut frames = Vec::new();
        while let Some(frame) = source.read_frame().unwrap() {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 5);
        let last = frames[4].get_pixel(32, 24)[0];
        assert!(last > 200, "lossy but close: {last}");
        source.close();
        assert!(source.read_frame().unwrap().is_none());
    }

    #[test]
    fn odd_sizes_are_encoded() {
        let tmp = tempfile::tempdir().unwrap();
        let clip = tmp.path().join("odd.avi");
        let mut sink = FfmpegSink::create(&clip, 25.0, (33, 21)).unwrap();
        sink.write_frame(&RgbImage::from_pixel(33, 21, Rgb([9, 9, 9]))).unwrap();
        Box::new(sink).finish().unwrap();
        assert!(std::fs::metadata(&clip).unwrap().len() > 0);
    }
}
