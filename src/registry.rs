//! Static registry of servable models.
//!
//! The registry is built once at startup, either from a JSON file or by scanning a
//! directory for `*.gguf` weights, and is read-only afterwards.

use bon::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A model the scheduler can load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
pub struct Model {
    #[builder(into)]
    pub id: String,
    #[builder(into)]
    pub path: PathBuf,
    #[builder(into)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[builder(into)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    #[builder(into)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate model id: {0}")]
    DuplicateId(String),

    #[error("empty model id for path {0}")]
    EmptyId(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: Vec<Model>,
    index: HashMap<String, usize>,
}

impl ModelRegistry {
    /// Build a registry, rejecting empty or duplicate ids.
    pub fn new(models: Vec<Model>) -> Result<Self, RegistryError> {
        let mut index = HashMap::with_capacity(models.len());
        for (i, model) in models.iter().enumerate() {
            if model.id.trim().is_empty() {
                return Err(RegistryError::EmptyId(model.path.clone()));
            }
            if index.insert(model.id.clone(), i).is_some() {
                return Err(RegistryError::DuplicateId(model.id.clone()));
            }
        }
        Ok(Self { models, index })
    }

    pub fn get(&self, id: &str) -> Option<&Model> {
        self.index.get(id).map(|&i| &self.models[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Load a JSON array of models.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| RegistryError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let models: Vec<Model> =
            serde_json::from_str(&content).map_err(|source| RegistryError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        info!(path = %path.display(), count = models.len(), "Loaded model registry");
        Self::new(models)
    }

    /// List `*.gguf` files in `dir` (non-recursive). The id is the file stem.
    pub async fn scan_dir(dir: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let dir = dir.as_ref();
        let io_err = |source: std::io::Error| RegistryError::Io {
            path: dir.to_path_buf(),
            source,
        };

        let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
        let mut models = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            let is_gguf = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("gguf"));
            if !is_gguf || !entry.file_type().await.map_err(io_err)?.is_file() {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            debug!(path = %path.display(), "Found model file");
            models.push(Model::builder().id(stem).path(path.clone()).build());
        }
        models.sort_by(|a, b| a.id.cmp(&b.id));

        info!(dir = %dir.display(), count = models.len(), "Scanned model directory");
        Self::new(models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn model(id: &str) -> Model {
        Model::builder().id(id).path(format!("/models/{id}.gguf")).build()
    }

    #[test]
    fn test_lookup() {
        let registry = ModelRegistry::new(vec![model("alpha"), model("beta")]).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.get("beta").unwrap().path,
            PathBuf::from("/models/beta.gguf")
        );
        assert!(registry.get("gamma").is_none());
        assert!(registry.contains("alpha"));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = ModelRegistry::new(vec![model("alpha"), model("alpha")]).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId(id) if id == "alpha"));
    }

    #[test]
    fn test_empty_id_rejected() {
        let err = ModelRegistry::new(vec![model("  ")]).unwrap_err();
        assert!(matches!(err, RegistryError::EmptyId(_)));
    }

    #[tokio::test]
    async fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"id": "alpha", "path": "/m/alpha.gguf", "quantization": "Q4_K_M"}},
                {{"id": "beta", "path": "/m/beta.gguf", "family": "llama"}}
            ]"#
        )
        .unwrap();

        let registry = ModelRegistry::from_file(file.path()).await.unwrap();
        assert_eq!(registry.len(), 2);
        let alpha = registry.get("alpha").unwrap();
        assert_eq!(alpha.quantization.as_deref(), Some("Q4_K_M"));
        assert_eq!(alpha.family, None);
    }

    #[tokio::test]
    async fn test_from_file_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let err = ModelRegistry::from_file(file.path()).await.unwrap_err();
        assert!(matches!(err, RegistryError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_scan_dir_lists_gguf_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("zeta.gguf"), b"z").unwrap();
        std::fs::write(dir.path().join("alpha.GGUF"), b"a").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"n").unwrap();
        std::fs::create_dir(dir.path().join("sub.gguf")).unwrap();

        let registry = ModelRegistry::scan_dir(dir.path()).await.unwrap();
        let ids: Vec<_> = registry.models().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }
}
