use std::fs;
use std::path::Path;

use serde::Deserialize;
use tract_onnx::pb;
use tract_onnx::prelude::*;

use crate::error::{ServiceError, ServiceResult};

/// Version of the JSON coefficient artifact this build understands.
pub const LINEAR_FORMAT_VERSION: u32 = 1;

/// A loaded regression model: one ordered numeric row in, one number out.
///
/// Implementations are read-only after load and shared across actix workers.
pub trait Regressor: Send + Sync {
    fn predict_row(&self, row: &[f64]) -> ServiceResult<f64>;

    /// Number of columns the model was trained on.
    fn input_width(&self) -> usize;

    /// Feature names embedded in the artifact, in training order, if any.
    fn feature_names(&self) -> Option<&[String]> {
        None
    }

    /// Largest input magnitude the model can represent.
    fn input_limit(&self) -> f64 {
        f64::MAX
    }
}

/// ONNX graph executed with tract, pinned to a `[1, n]` float input.
pub struct OnnxRegressor {
    model: TypedRunnableModel<TypedModel>,
    width: usize,
}

impl OnnxRegressor {
    pub fn load<P: AsRef<Path>>(model_path: P, width: usize) -> ServiceResult<Self> {
        let path = model_path.as_ref();
        let onnx = tract_onnx::onnx();

        let proto = onnx
            .proto_model_for_path(path)
            .map_err(|e| ServiceError::artifact(path, e))?;
        if let Some(declared) = declared_width(&proto) {
            if declared != width {
                return Err(ServiceError::Configuration(format!(
                    "model expects {} inputs but metadata lists {} features",
                    declared, width
                )));
            }
        }

        let model = onnx
            .model_for_path(path)
            .and_then(|m| {
                m.with_input_fact(
                    0,
                    InferenceFact::dt_shape(f32::datum_type(), tvec!(1, width)),
                )
            })
            .and_then(|m| m.into_optimized())
            .and_then(|m| m.into_runnable())
            .map_err(|e| ServiceError::artifact(path, e))?;

        Ok(Self { model, width })
    }

    fn run(&self, row: &[f64]) -> TractResult<f32> {
        let features: Vec<f32> = row.iter().map(|v| *v as f32).collect();
        let input_tensor = Tensor::from_shape(&[1, self.width], &features)?;
        let outputs = self.model.run(tvec!(input_tensor.into()))?;

        let prediction: f32 = *outputs[0]
            .to_array_view::<f32>()?
            .iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("model produced an empty output tensor"))?;

        Ok(prediction)
    }
}

impl Regressor for OnnxRegressor {
    fn predict_row(&self, row: &[f64]) -> ServiceResult<f64> {
        if row.len() != self.width {
            return Err(ServiceError::Inference(format!(
                "expected {} features, got {}",
                self.width,
                row.len()
            )));
        }
        self.run(row)
            .map(f64::from)
            .map_err(|e| ServiceError::Inference(e.to_string()))
    }

    fn input_width(&self) -> usize {
        self.width
    }

    fn input_limit(&self) -> f64 {
        f64::from(f32::MAX)
    }
}

/// Trailing dimension of the graph's first non-constant input, when it is static.
fn declared_width(proto: &pb::ModelProto) -> Option<usize> {
    let graph = proto.graph.as_ref()?;
    let input = graph
        .input
        .iter()
        .find(|i| !graph.initializer.iter().any(|t| t.name == i.name))?;
    let pb::type_proto::Value::TensorType(tensor) = input.r#type.as_ref()?.value.as_ref()?;
    match &tensor.shape.as_ref()?.dim.last()?.value {
        Some(pb::tensor_shape_proto::dimension::Value::DimValue(v)) if *v > 0 => Some(*v as usize),
        _ => None,
    }
}

/// On-disk layout of the JSON coefficient artifact.
#[derive(Debug, Clone, Deserialize)]
struct LinearArtifact {
    format_version: u32,
    coefficients: Vec<f64>,
    intercept: f64,
    #[serde(default)]
    feature_names: Option<Vec<String>>,
}

/// Plain `y = w·x + b` model read from exported coefficients.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearRegressor {
    coefficients: Vec<f64>,
    intercept: f64,
    feature_names: Option<Vec<String>>,
}

impl LinearRegressor {
    pub fn new(coefficients: Vec<f64>, intercept: f64) -> Self {
        Self {
            coefficients,
            intercept,
            feature_names: None,
        }
    }

    pub fn with_feature_names(mut self, names: Vec<String>) -> Self {
        self.feature_names = Some(names);
        self
    }

    pub fn from_json_file(path: &Path) -> ServiceResult<Self> {
        let raw = fs::read_to_string(path).map_err(|e| ServiceError::artifact(path, e))?;
        let artifact: LinearArtifact =
            serde_json::from_str(&raw).map_err(|e| ServiceError::artifact(path, e))?;

        if artifact.format_version != LINEAR_FORMAT_VERSION {
            return Err(ServiceError::artifact(
                path,
                format!(
                    "unsupported format_version {} (expected {})",
                    artifact.format_version, LINEAR_FORMAT_VERSION
                ),
            ));
        }
        if artifact.coefficients.is_empty() {
            return Err(ServiceError::artifact(path, "artifact has no coefficients"));
        }
        if let Some(names) = &artifact.feature_names {
            if names.len() != artifact.coefficients.len() {
                return Err(ServiceError::artifact(
                    path,
                    format!(
                        "{} feature names for {} coefficients",
                        names.len(),
                        artifact.coefficients.len()
                    ),
                ));
            }
        }

        Ok(Self {
            coefficients: artifact.coefficients,
            intercept: artifact.intercept,
            feature_names: artifact.feature_names,
        })
    }
}

impl Regressor for LinearRegressor {
    fn predict_row(&self, row: &[f64]) -> ServiceResult<f64> {
        if row.len() != self.coefficients.len() {
            return Err(ServiceError::Inference(format!(
                "expected {} features, got {}",
                self.coefficients.len(),
                row.len()
            )));
        }
        let dot: f64 = self
            .coefficients
            .iter()
            .zip(row)
            .map(|(w, x)| w * x)
            .sum();
        Ok(dot + self.intercept)
    }

    fn input_width(&self) -> usize {
        self.coefficients.len()
    }

    fn feature_names(&self) -> Option<&[String]> {
        self.feature_names.as_deref()
    }
}
