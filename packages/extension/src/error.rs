//! Error types for extension points and context wiring.

use brickyard_messenger::{MessengerError, SerializedError};
use brickyard_pipeline::PipelineError;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while installing or running extensions.
#[derive(Debug, Error)]
pub enum ExtensionError {
    /// A run of one of the extension's pipelines failed.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// A call to another context failed.
    #[error(transparent)]
    Messenger(#[from] MessengerError),

    /// A user-facing, recoverable condition.
    #[error("{0}")]
    Business(String),

    /// The extension point has no installed extension with this id.
    #[error("extension {extension_id} is not installed on {extension_point_id}")]
    ExtensionNotFound {
        extension_point_id: String,
        extension_id: Uuid,
    },

    /// No extension point of the expected kind is registered under the id.
    #[error("extension point not found: {0}")]
    ExtensionPointNotFound(String),

    /// The context received a call before its extension points were loaded.
    #[error("extension points are not loaded yet")]
    NotReady,

    /// An extension's config does not match its extension point.
    #[error("invalid extension config: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExtensionError {
    pub fn business(message: impl Into<String>) -> Self {
        ExtensionError::Business(message.into())
    }

    /// The error name used when the error is serialized.
    pub fn name(&self) -> &str {
        match self {
            ExtensionError::Pipeline(error) => error.name(),
            ExtensionError::Messenger(error) => error.name(),
            ExtensionError::Business(_) => "BusinessError",
            ExtensionError::ExtensionNotFound { .. } => "ExtensionNotFoundError",
            ExtensionError::ExtensionPointNotFound(_) => "ExtensionPointNotFoundError",
            ExtensionError::NotReady => "NotReadyError",
            ExtensionError::InvalidConfig(_) => "InvalidConfigError",
            ExtensionError::Serialization(_) => "SerializationError",
        }
    }
}

impl From<&ExtensionError> for SerializedError {
    fn from(error: &ExtensionError) -> Self {
        match error {
            ExtensionError::Pipeline(inner) => SerializedError::from(inner),
            ExtensionError::Messenger(inner) => SerializedError::from(inner),
            other => SerializedError::new(other.name(), other.to_string()),
        }
    }
}

impl From<ExtensionError> for SerializedError {
    fn from(error: ExtensionError) -> Self {
        SerializedError::from(&error)
    }
}

/// Result type alias for extension operations.
pub type Result<T> = std::result::Result<T, ExtensionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_errors_keep_their_name() {
        let error = ExtensionError::from(PipelineError::business("no spreadsheet"));
        assert_eq!(error.name(), "BusinessError");
        assert_eq!(SerializedError::from(&error).message, "no spreadsheet");
    }

    #[test]
    fn missing_extension_is_named() {
        let error = ExtensionError::ExtensionNotFound {
            extension_point_id: "acme/panel".to_string(),
            extension_id: Uuid::nil(),
        };
        let serialized = SerializedError::from(error);
        assert_eq!(serialized.name, "ExtensionNotFoundError");
        assert!(serialized.message.contains("acme/panel"));
    }
}
