use std::path::{Path, PathBuf};

use crate::error::ServiceResult;
use crate::loader::resolve_path;
use crate::service::ArtifactPaths;

pub const MODEL_FILE: &str = "model2_linear_regression.onnx";
pub const MODEL_INFO_FILE: &str = "model_info.json";

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    /// Ordered fallback list for the model artifact.
    pub model_candidates: Vec<PathBuf>,
    /// Ordered fallback list for the metadata sidecar.
    pub metadata_candidates: Vec<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let root = PathBuf::from(lookup("PROJECT_ROOT").unwrap_or_else(|| ".".to_string()));

        let host = lookup("HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port = lookup("PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(8000);
        let workers = lookup("WORKERS")
            .and_then(|w| w.parse().ok())
            .filter(|w: &usize| *w > 0)
            .unwrap_or_else(num_cpus::get);

        let model_candidates = match lookup("MODEL_PATH") {
            Some(path) => vec![PathBuf::from(path)],
            None => default_candidates(&root, MODEL_FILE),
        };
        let metadata_candidates = match lookup("MODEL_INFO_PATH") {
            Some(path) => vec![PathBuf::from(path)],
            None => default_candidates(&root, MODEL_INFO_FILE),
        };

        Self {
            host,
            port,
            workers,
            model_candidates,
            metadata_candidates,
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn resolve_artifacts(&self) -> ServiceResult<ArtifactPaths> {
        Ok(ArtifactPaths {
            model: resolve_path(&self.model_candidates)?,
            metadata: resolve_path(&self.metadata_candidates)?,
        })
    }
}

/// `models/` first, then the notebooks' own `models/` directory.
fn default_candidates(root: &Path, file: &str) -> Vec<PathBuf> {
    vec![
        root.join("models").join(file),
        root.join("notebooks").join("models").join(file),
    ]
}
