use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{ServiceError, ServiceResult};
use crate::inference::{LinearRegressor, OnnxRegressor, Regressor};

/// Raw metadata as written by the training notebooks.
pub type MetadataRecord = Map<String, Value>;

/// The part of the metadata record the service depends on.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ModelInfo {
    pub model2_features: Vec<String>,
    #[serde(default)]
    pub model2_r2: Option<f64>,
    #[serde(default)]
    pub model2_rmse: Option<f64>,
}

impl ModelInfo {
    /// Checks the record against the typed schema once, at load time.
    pub fn from_record(record: &MetadataRecord) -> ServiceResult<Self> {
        if !record.contains_key("model2_features") {
            return Err(ServiceError::Configuration(
                "metadata missing valid 'model2_features' list".to_string(),
            ));
        }
        let info: ModelInfo = serde_json::from_value(Value::Object(record.clone())).map_err(|e| {
            ServiceError::Configuration(format!(
                "metadata missing valid 'model2_features' list: {}",
                e
            ))
        })?;
        if info.model2_features.is_empty() {
            return Err(ServiceError::Configuration(
                "'model2_features' must list at least one feature".to_string(),
            ));
        }
        Ok(info)
    }
}

/// First candidate that exists, or the first candidate when none do so the
/// caller's open fails with a meaningful "not found".
pub fn resolve_path(candidates: &[PathBuf]) -> ServiceResult<PathBuf> {
    let first = candidates
        .first()
        .ok_or_else(|| ServiceError::Configuration("no candidate paths given".to_string()))?;

    let resolved = candidates
        .iter()
        .find(|p| p.exists())
        .unwrap_or(first)
        .clone();
    debug!("Resolved {:?} to {}", candidates, resolved.display());
    Ok(resolved)
}

pub fn load_metadata(path: &Path) -> ServiceResult<MetadataRecord> {
    let raw = fs::read_to_string(path).map_err(|e| ServiceError::metadata(path, e))?;
    match serde_json::from_str::<Value>(&raw).map_err(|e| ServiceError::metadata(path, e))? {
        Value::Object(record) => Ok(record),
        other => Err(ServiceError::metadata(
            path,
            format!("expected a JSON object, found {}", json_kind(&other)),
        )),
    }
}

/// Loads the model artifact, picking the decoder from the file extension.
///
/// `width` pins the ONNX input shape to `[1, width]`; coefficient artifacts
/// carry their own width.
pub fn load_model(path: &Path, width: usize) -> ServiceResult<Box<dyn Regressor>> {
    if !path.exists() {
        return Err(ServiceError::artifact(path, "file not found"));
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    let model: Box<dyn Regressor> = match extension.as_deref() {
        Some("onnx") => Box::new(OnnxRegressor::load(path, width)?),
        Some("json") => Box::new(LinearRegressor::from_json_file(path)?),
        _ => {
            return Err(ServiceError::artifact(
                path,
                "unsupported artifact format (expected .onnx or .json)",
            ))
        }
    };

    info!(
        "Loaded model artifact {} ({} inputs)",
        path.display(),
        model.input_width()
    );
    Ok(model)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
