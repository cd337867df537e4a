use std::fs;
use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Parser;
use head_highlight::models::{self, MODEL_KINDS};
use tracing::{info, warn};

/// Fetches model weights declared in `<models>/<kind>/<version>/metadata.json`
/// and verifies their SHA-256.
#[derive(Debug, Parser)]
struct Args {
    #[arg(long, default_value = "models")]
    models_dir: PathBuf,
    /// Re-download even when a model file is already present.
    #[arg(long)]
    force: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    let args = Args::parse();
    info!("event" = "download.start", dir = %args.models_dir.display());

    for kind in MODEL_KINDS {
        let kind_dir = args.models_dir.join(kind);
        if !kind_dir.exists() {
            fs::create_dir_all(&kind_dir)
                .with_context(|| format!("creating {}", kind_dir.display()))?;
            info!("event" = "download.created", dir = %kind_dir.display());
            continue;
        }
        let mut versions: Vec<PathBuf> = fs::read_dir(&kind_dir)
            .with_context(|| format!("listing {}", kind_dir.display()))?
            .flatten()
            .map(|entry| entry.path())
            .filter(|p| p.is_dir())
            .collect();
        versions.sort();

        for dir in versions {
            let meta_path = dir.join("metadata.json");
            let Some(meta) = models::read_metadata(&meta_path) else {
                warn!("event" = "download.no_metadata", path = %meta_path.display());
                continue;
            };
            if !models::has_download_source(&meta) {
                warn!(
                    "event" = "download.skip",
                    "message" = "provide url and sha256",
                    path = %meta_path.display()
                );
                continue;
            }
            let model_path = dir.join("model.onnx");
            if model_path.exists() && !args.force {
                info!("event" = "download.present", path = %model_path.display());
                continue;
            }

            info!("event" = "download.fetch", url = %meta.url, path = %model_path.display());
            let resp = reqwest::blocking::get(&meta.url)
                .and_then(|r| r.error_for_status())
                .with_context(|| format!("downloading {}", meta.url))?;
            let buf = resp.bytes().context("reading response body")?;
            let digest = models::sha256_hex(&buf);
            if !digest.eq_ignore_ascii_case(&meta.sha256) {
                bail!("checksum mismatch for {}: {} != {}", meta.url, digest, meta.sha256);
            }
            fs::write(&model_path, &buf)
                .with_context(|| format!("writing {}", model_path.display()))?;
            info!("event" = "download.saved", path = %model_path.display(), bytes = buf.len());
        }
    }
    Ok(())
}
