use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use head_highlight::codec;
use head_highlight::config::{
    DEFAULT_CONFIDENCE, DEFAULT_FALLBACK_FPS, DEFAULT_MAX_DISPLAY_WIDTH, DEFAULT_NMS_IOU,
    DetectOptions, Device, VideoOptions,
};
use head_highlight::inference::{HeadDetector, InferenceContext};
use head_highlight::overlay::{Renderer, TextFace};
use head_highlight::video::{VideoPipeline, VideoSource, fit_to_width};

/// Highlights the heads of detected people in an image or a video stream.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(long, default_value = "models", global = true)]
    models_dir: PathBuf,
    /// TrueType font for labels; the built-in bitmap face is used otherwise.
    #[arg(long, global = true)]
    font: Option<PathBuf>,
    /// `cpu`, `cuda` or `cuda:N`. CUDA falls back to the CPU when unavailable.
    #[arg(long, default_value = "cpu", global = true)]
    device: Device,
    /// Verbose logging.
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Annotate a single image.
    Image {
        input: PathBuf,
        /// Defaults to `<input stem>_heads.jpg` next to the input.
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        detect: DetectArgs,
    },
    /// Annotate a camera index, a directory of frames, a GIF or a video file.
    Video {
        source: VideoSource,
        /// `.gif`, a video container (`video-ffmpeg` builds) or a directory
        /// for numbered PNG frames.
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        skip_frames: u32,
        /// Stop after this many seconds of input.
        #[arg(long)]
        duration: Option<f64>,
        #[arg(long)]
        no_progress: bool,
        #[arg(long, default_value_t = DEFAULT_FALLBACK_FPS)]
        fallback_fps: f64,
        #[command(flatten)]
        detect: DetectArgs,
    },
}

#[derive(Debug, Args)]
struct DetectArgs {
    #[arg(short, long, default_value_t = DEFAULT_CONFIDENCE)]
    confidence: f32,
    #[arg(long)]
    resize_long_edge: Option<u32>,
    /// Merge detections from a horizontally flipped view.
    #[arg(long)]
    tta_hflip: bool,
    #[arg(long, default_value_t = DEFAULT_NMS_IOU)]
    nms_iou: f32,
}

impl From<&DetectArgs> for DetectOptions {
    fn from(args: &DetectArgs) -> Self {
        DetectOptions {
            confidence_threshold: args.confidence,
            resize_long_edge: args.resize_long_edge,
            tta_hflip: args.tta_hflip,
            nms_iou: args.nms_iou,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let face = match &cli.font {
        Some(path) => TextFace::load(path)
            .with_context(|| format!("loading font {}", path.display()))?,
        None => TextFace::Bitmap,
    };
    let context = InferenceContext::new(&cli.models_dir, Renderer::new(face), cli.device);
    let engine = context
        .engine()
        .with_context(|| {
            format!("no usable person detection model under {}", cli.models_dir.display())
        })?
        .clone();
    info!(
        "event" = "detector.ready",
        device = %cli.device,
        provider = engine.detector().execution_provider()
    );

    match &cli.command {
        Command::Image { input, output, detect } => {
            run_image(&engine, input, output.as_deref(), detect)
        }
        Command::Video {
            source,
            output,
            skip_frames,
            duration,
            no_progress,
            fallback_fps,
            detect,
        } => {
            let options = VideoOptions {
                detect: detect.into(),
                output_path: output.clone(),
                skip_frames: *skip_frames,
                duration_seconds: *duration,
                show_progress: !no_progress,
                max_display_width: Some(DEFAULT_MAX_DISPLAY_WIDTH),
                fallback_fps: *fallback_fps,
            };
            run_video(engine, source, options)
        }
    }
}

fn run_image(
    engine: &HeadDetector,
    input: &Path,
    output: Option<&Path>,
    detect: &DetectArgs,
) -> anyhow::Result<()> {
    let image = codec::load_image(input)?;
    let result = engine.detect(&image, &detect.into())?;

    let output = match output {
        Some(path) => path.to_path_buf(),
        None => {
            let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("image");
            input.with_file_name(format!("{stem}_heads.jpg"))
        }
    };
    fit_to_width(&result.image, Some(DEFAULT_MAX_DISPLAY_WIDTH))
        .save(&output)
        .with_context(|| format!("saving {}", output.display()))?;
    info!("event" = "image.saved", path = %output.display(), count = result.person_count);

    let summary = json!({
        "count": result.person_count,
        "inference_time": result.inference_time,
        "output": output,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn run_video(
    engine: HeadDetector,
    source: &VideoSource,
    options: VideoOptions,
) -> anyhow::Result<()> {
    let mut pipeline = VideoPipeline::new(engine, options)?;
    let cancel = pipeline.cancellation();
    if let Err(err) = ctrlc::set_handler(move || cancel.cancel()) {
        warn!("event" = "ctrlc.unavailable", %err);
    }

    let summary = pipeline
        .run(source)
        .with_context(|| format!("processing {source}"))?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
