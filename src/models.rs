use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Model kinds looked up under the models directory.
pub const MODEL_KINDS: [&str; 1] = ["person_detection"];

#[derive(Debug, Clone, Serialize)]
pub struct ModelCatalogEntry {
    pub kind: String,
    pub versions: Vec<String>,
}

/// Lists every `<kind>/<version>/` directory that carries a `metadata.json`.
pub fn inspect_models_dir(base_dir: impl AsRef<Path>) -> Vec<ModelCatalogEntry> {
    let base = base_dir.as_ref();
    MODEL_KINDS
        .iter()
        .map(|kind| {
            let kind_dir = base.join(kind);
            let mut versions: Vec<String> = version_dirs(&kind_dir)
                .into_iter()
                .filter(|v| kind_dir.join(v).join("metadata.json").exists())
                .collect();
            versions.sort();
            ModelCatalogEntry { kind: kind.to_string(), versions }
        })
        .collect()
}

fn version_dirs(kind_dir: &Path) -> Vec<String> {
    let Ok(read) = fs::read_dir(kind_dir) else {
        return Vec::new();
    };
    read.flatten()
        .filter(|item| item.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .map(|item| item.file_name().to_string_lossy().to_string())
        .collect()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputSpec {
    pub name: String,
    pub shape: Vec<i64>,
    pub layout: String,
    #[serde(default)]
    pub mean: Option<Vec<f32>>,
    #[serde(default)]
    pub std: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelMetadata {
    pub name: String,
    pub version: String,
    pub url: String,
    pub sha256: String,
    pub inputs: Vec<InputSpec>,
    pub license: String,
    #[serde(default)]
    pub accuracy: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelSelection {
    pub kind: String,
    pub version: String,
    pub path: PathBuf,
    pub metadata: ModelMetadata,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct SelectedCatalog {
    pub person_detection: Option<ModelSelection>,
}

pub fn read_metadata(path: &Path) -> Option<ModelMetadata> {
    let data = fs::read_to_string(path).ok()?;
    serde_json::from_str::<ModelMetadata>(&data).ok()
}

/// Lowercase hex SHA-256, the format `metadata.json` declares.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// True when the metadata carries a usable download source.
pub fn has_download_source(metadata: &ModelMetadata) -> bool {
    !metadata.url.is_empty() && !metadata.sha256.is_empty() && metadata.sha256 != "<to-fill>"
}

fn discover_kind(base_dir: &Path, kind: &str) -> Vec<ModelSelection> {
    let kind_dir = base_dir.join(kind);
    version_dirs(&kind_dir)
        .into_iter()
        .filter_map(|version| {
            let dir = kind_dir.join(&version);
            let metadata = read_metadata(&dir.join("metadata.json"))?;
            let path = ["model.onnx", "model.ort", "model"]
                .into_iter()
                .map(|fname| dir.join(fname))
                .find(|p| p.exists())?;
            Some(ModelSelection { kind: kind.to_string(), version, path, metadata })
        })
        .collect()
}

/// Highest declared accuracy wins; ties and missing accuracies fall back to the
/// lexically greatest version.
fn pick_best(mut items: Vec<ModelSelection>) -> Option<ModelSelection> {
    items.sort_by(|a, b| {
        let acc_a = a.metadata.accuracy.unwrap_or(f64::NEG_INFINITY);
        let acc_b = b.metadata.accuracy.unwrap_or(f64::NEG_INFINITY);
        acc_b
            .partial_cmp(&acc_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.version.cmp(&a.version))
    });
    items.into_iter().next()
}

pub fn select_best_models(base_dir: impl AsRef<Path>) -> SelectedCatalog {
    SelectedCatalog {
        person_detection: pick_best(discover_kind(base_dir.as_ref(), "person_detection")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_version(base: &Path, version: &str, accuracy: Option<f64>, with_model: bool) {
        let dir = base.join("person_detection").join(version);
        fs::create_dir_all(&dir).unwrap();
        let meta = serde_json::json!({
            "name": "fasterrcnn_resnet50_fpn",
            "version": version,
            "url": "https://example.invalid/model.onnx",
            "sha256": "00",
            "inputs": [{ "name": "images", "shape": [3, -1, -1], "layout": "CHW" }],
            "license": "BSD-3-Clause",
            "accuracy": accuracy,
        });
        fs::write(dir.join("metadata.json"), meta.to_string()).unwrap();
        if with_model {
            fs::write(dir.join("model.onnx"), b"onnx").unwrap();
        }
    }

    #[test]
    fn catalog_lists_versions_with_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        write_version(tmp.path(), "0002", None, false);
        write_version(tmp.path(), "0001", None, true);
        fs::create_dir_all(tmp.path().join("person_detection").join("scratch")).unwrap();
        let catalog = inspect_models_dir(tmp.path());
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].versions, vec!["0001", "0002"]);
    }

    #[test]
    fn selection_prefers_accuracy_and_requires_model_file() {
        let tmp = tempfile::tempdir().unwrap();
        write_version(tmp.path(), "0001", Some(0.37), true);
        write_version(tmp.path(), "0002", Some(0.41), true);
        write_version(tmp.path(), "0003", Some(0.99), false);
        let selected = select_best_models(tmp.path()).person_detection.unwrap();
        assert_eq!(selected.version, "0002");
        assert!(selected.path.ends_with("model.onnx"));
    }

    #[test]
    fn missing_directory_selects_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(select_best_models(tmp.path().join("absent")).person_detection.is_none());
    }

    #[test]
    fn checksum_is_lowercase_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
