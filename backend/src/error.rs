use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Metadata has the wrong shape or disagrees with the artifact. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Model artifact absent, unreadable or in an unsupported format.
    #[error("Artifact error ({}): {message}", .path.display())]
    Artifact { path: PathBuf, message: String },

    /// Metadata file absent, unreadable or not valid JSON.
    #[error("Metadata error ({}): {message}", .path.display())]
    Metadata { path: PathBuf, message: String },

    /// Required features missing from a request payload.
    #[error("Missing features: {missing:?}")]
    Validation { missing: Vec<String> },

    /// A required feature could not be coerced to a finite number.
    #[error("Feature '{feature}' is not a finite number: {value}")]
    Type { feature: String, value: String },

    #[error("Inference error: {0}")]
    Inference(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn artifact(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        ServiceError::Artifact {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn metadata(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        ServiceError::Metadata {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Per-request failures the caller can fix by changing the payload.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServiceError::Validation { .. } | ServiceError::Type { .. }
        )
    }
}
