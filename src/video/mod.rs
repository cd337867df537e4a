//! Frame-scheduling video loop: skip policy, duration limit, progress and
//! throughput accounting around [`HeadDetector`].

#[cfg(feature = "video-ffmpeg")]
mod ffmpeg;
pub mod sink;
pub mod source;

use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use image::RgbImage;
use image::imageops::{self, FilterType};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::VideoOptions;
use crate::error::Result;
use crate::inference::HeadDetector;

pub use sink::{FrameSink, open_sink};
pub use source::{FrameSource, VideoSource};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Cooperative stop flag, checked once per loop iteration.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayControl {
    Continue,
    Quit,
}

/// Live preview of annotated frames. Returning [`DisplayControl::Quit`]
/// cancels the run.
pub trait FrameDisplay {
    fn show(&mut self, frame: &RgbImage) -> DisplayControl;
}

/// Which frames get a detector pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSchedule {
    skip_frames: u32,
}

impl FrameSchedule {
    pub fn new(skip_frames: u32) -> Self {
        Self { skip_frames }
    }

    /// `frame_number` is 1-based.
    pub fn should_process(&self, frame_number: u64) -> bool {
        self.skip_frames == 0
            || (frame_number.saturating_sub(1)) % (self.skip_frames as u64 + 1) == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub frames_read: u64,
    pub frames_processed: u64,
    pub elapsed: Duration,
    pub model_fps: f64,
    pub frame_limit: Option<u64>,
    pub duration: Option<Duration>,
    pub percent: Option<f64>,
}

impl std::fmt::Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} frames read, {} processed, {:.1}s elapsed, model {:.1} fps",
            self.frames_read,
            self.frames_processed,
            self.elapsed.as_secs_f64(),
            self.model_fps
        )?;
        if let Some(limit) = self.frame_limit {
            write!(f, ", limit {limit}")?;
        }
        if let Some(percent) = self.percent {
            write!(f, " ({percent:.0}%)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum StopReason {
    EndOfStream,
    FrameLimit,
    DurationElapsed,
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoSummary {
    pub frames_read: u64,
    pub frames_processed: u64,
    /// Processed frames per second of model time; 0 when nothing ran.
    pub avg_fps: f64,
    pub output_path: Option<PathBuf>,
    pub stop_reason: StopReason,
}

type ProgressObserver = Box<dyn FnMut(&Progress) + Send>;

fn log_progress(progress: &Progress) {
    info!(
        "event" = "video.progress",
        frames_read = progress.frames_read,
        frames_processed = progress.frames_processed,
        model_fps = progress.model_fps,
        percent = progress.percent,
        "{progress}"
    );
}

/// Owns the source and sink between open and release. Releasing twice is a
/// no-op; `Drop` covers early unwinds.
struct Drain {
    source: Option<Box<dyn FrameSource>>,
    sink: Option<Box<dyn FrameSink>>,
}

impl Drain {
    fn release(&mut self) -> Result<()> {
        if let Some(mut source) = self.source.take() {
            source.close();
        }
        match self.sink.take() {
            Some(sink) => sink.finish(),
            None => Ok(()),
        }
    }
}

impl Drop for Drain {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!("event" = "video.release_failed", %err);
        }
    }
}

pub struct VideoPipeline {
    engine: HeadDetector,
    options: VideoOptions,
    cancel: Cancellation,
    display: Option<Box<dyn FrameDisplay>>,
    observer: ProgressObserver,
}

impl VideoPipeline {
    pub fn new(engine: HeadDetector, options: VideoOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            engine,
            options,
            cancel: Cancellation::new(),
            display: None,
            observer: Box::new(log_progress),
        })
    }

    pub fn with_display(mut self, display: impl FrameDisplay + 'static) -> Self {
        self.display = Some(Box::new(display));
        self
    }

    pub fn with_progress_observer(
        mut self,
        observer: impl FnMut(&Progress) + Send + 'static,
    ) -> Self {
        self.observer = Box::new(observer);
        self
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> Cancellation {
        self.cancel.clone()
    }

    pub fn options(&self) -> &VideoOptions {
        &self.options
    }

    /// Opens `source`, and the configured output if any, then runs to
    /// completion.
    pub fn run(&mut self, source: &VideoSource) -> Result<VideoSummary> {
        let source = source.open(self.options.fallback_fps)?;
        self.run_source(source)
    }

    pub fn run_source(&mut self, mut source: Box<dyn FrameSource>) -> Result<VideoSummary> {
        let sink = match &self.options.output_path {
            Some(path) => {
                let fps = self.effective_fps(source.as_ref());
                match open_sink(path, fps, source.resolution()) {
                    Ok(sink) => Some(sink),
                    Err(err) => {
                        source.close();
                        return Err(err);
                    }
                }
            }
            None => None,
        };
        Ok(self.run_with_sink(source, sink))
    }

    fn effective_fps(&self, source: &dyn FrameSource) -> f64 {
        source
            .fps()
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .unwrap_or(self.options.fallback_fps)
    }

    /// Runs the loop against an already opened source and sink. Both are
    /// released exactly once before this returns, whatever the stop reason.
    pub fn run_with_sink(
        &mut self,
        source: Box<dyn FrameSource>,
        sink: Option<Box<dyn FrameSink>>,
    ) -> VideoSummary {
        let fps = self.effective_fps(source.as_ref());
        let frame_limit = self.options.frame_limit(fps);
        let duration = self.options.duration();
        let schedule = FrameSchedule::new(self.options.skip_frames);
        info!(
            "event" = "video.start",
            fps,
            frame_limit,
            skip_frames = self.options.skip_frames,
            output = ?self.options.output_path
        );

        let mut drain = Drain { source: Some(source), sink };
        let started = Instant::now();
        let mut last_report = started;
        let mut frames_read: u64 = 0;
        let mut frames_processed: u64 = 0;
        let mut model_time = 0.0f64;
        let mut last_output: Option<RgbImage> = None;

        let stop_reason = loop {
            if self.cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if duration.is_some_and(|d| started.elapsed() >= d) {
                break StopReason::DurationElapsed;
            }
            if frame_limit == Some(frames_read) {
                break StopReason::FrameLimit;
            }

            let Some(source) = drain.source.as_mut() else {
                break StopReason::EndOfStream;
            };
            let frame = match source.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break StopReason::EndOfStream,
                Err(err) => {
                    warn!("event" = "video.read_failed", frame = frames_read + 1, %err);
                    break StopReason::EndOfStream;
                }
            };
            frames_read += 1;

            if schedule.should_process(frames_read) {
                match self.engine.detect(&frame, &self.options.detect) {
                    Ok(result) => {
                        frames_processed += 1;
                        model_time += result.inference_time;
                        last_output = Some(result.image);
                    }
                    Err(err) => {
                        warn!("event" = "video.detect_failed", frame = frames_read, %err);
                        break StopReason::Failed(err.to_string());
                    }
                }
            }
            let output = last_output.as_ref().unwrap_or(&frame);

            if let Some(sink) = drain.sink.as_mut() {
                if let Err(err) = sink.write_frame(output) {
                    warn!("event" = "video.write_failed", frame = frames_read, %err);
                    break StopReason::Failed(err.to_string());
                }
            }
            if let Some(display) = self.display.as_mut() {
                let shown = fit_to_width(output, self.options.max_display_width);
                if display.show(&shown) == DisplayControl::Quit {
                    self.cancel.cancel();
                }
            }

            if self.options.show_progress && last_report.elapsed() >= PROGRESS_INTERVAL {
                last_report = Instant::now();
                let elapsed = started.elapsed();
                let percent = match (frame_limit, duration) {
                    (Some(limit), _) if limit > 0 => {
                        Some(frames_read as f64 / limit as f64 * 100.0)
                    }
                    (_, Some(d)) => Some(elapsed.as_secs_f64() / d.as_secs_f64() * 100.0),
                    _ => None,
                }
                .map(|p| p.min(100.0));
                (self.observer)(&Progress {
                    frames_read,
                    frames_processed,
                    elapsed,
                    model_fps: average_fps(frames_processed, model_time),
                    frame_limit,
                    duration,
                    percent,
                });
            }
        };

        if let Err(err) = drain.release() {
            warn!("event" = "video.release_failed", %err);
        }

        let summary = VideoSummary {
            frames_read,
            frames_processed,
            avg_fps: average_fps(frames_processed, model_time),
            output_path: self.options.output_path.clone(),
            stop_reason,
        };
        info!(
            "event" = "video.done",
            frames_read,
            frames_processed,
            avg_fps = summary.avg_fps,
            stop = ?summary.stop_reason
        );
        summary
    }
}

fn average_fps(frames: u64, model_seconds: f64) -> f64 {
    if frames > 0 && model_seconds > 0.0 {
        frames as f64 / model_seconds
    } else {
        0.0
    }
}

/// Downscales (aspect preserved) when wider than `max_width`.
pub fn fit_to_width(frame: &RgbImage, max_width: Option<u32>) -> Cow<'_, RgbImage> {
    match max_width {
        Some(max) if max > 0 && frame.width() > max => {
            let scale = max as f64 / frame.width() as f64;
            let height = ((frame.height() as f64 * scale) as u32).max(1);
            Cow::Owned(imageops::resize(frame, max, height, FilterType::Triangle))
        }
        _ => Cow::Borrowed(frame),
    }
}
