//! Error types for pipeline runs.

use brickyard_messenger::{MessengerError, SerializedError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

/// One JSON Schema violation found while validating a block's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaViolation {
    /// JSON pointer into the input.
    pub instance_location: String,
    /// JSON pointer into the schema, ending at the failed keyword.
    pub keyword_location: String,
    pub error: String,
}

/// Errors that can occur while running a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No block is registered under the id.
    #[error("block not found: {id}")]
    BlockNotFound { id: String },

    /// The rendered arguments do not satisfy the block's input schema.
    #[error("invalid inputs for block {block_id}: {}", summarize(.errors))]
    InputValidation {
        block_id: String,
        schema: Value,
        input: Value,
        errors: Vec<SchemaViolation>,
    },

    /// A service dependency could not be located.
    #[error("service {service_id} is not configured: {reason}")]
    ServiceNotConfigured {
        service_id: String,
        id: Option<String>,
        reason: String,
    },

    /// A user-facing, recoverable condition.
    #[error("{0}")]
    Business(String),

    /// A block or control-flow config is malformed.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A block failed. Carries the step that failed.
    #[error("{source}")]
    Step {
        block_instance_id: Uuid,
        block_id: String,
        extension_id: Option<Uuid>,
        #[source]
        source: Box<PipelineError>,
    },

    /// A run handle was reused.
    #[error("run already started: {0}")]
    RunAlreadyStarted(Uuid),

    /// A call to another context failed.
    #[error(transparent)]
    Messenger(#[from] MessengerError),

    /// An error raised in another context, as received.
    #[error("{0}")]
    Remote(SerializedError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn summarize(errors: &[SchemaViolation]) -> String {
    errors
        .iter()
        .map(|violation| format!("{} ({})", violation.error, violation.instance_location))
        .collect::<Vec<_>>()
        .join("; ")
}

impl PipelineError {
    pub fn business(message: impl Into<String>) -> Self {
        PipelineError::Business(message.into())
    }

    /// The error name used when the error is serialized.
    pub fn name(&self) -> &str {
        match self {
            PipelineError::BlockNotFound { .. } => "BlockNotFoundError",
            PipelineError::InputValidation { .. } => "InputValidationError",
            PipelineError::ServiceNotConfigured { .. } => "ServiceNotConfiguredError",
            PipelineError::Business(_) => "BusinessError",
            PipelineError::InvalidConfig(_) => "InvalidConfigError",
            PipelineError::Step { source, .. } => source.name(),
            PipelineError::RunAlreadyStarted(_) => "RunAlreadyStartedError",
            PipelineError::Messenger(error) => error.name(),
            PipelineError::Remote(error) => &error.name,
            PipelineError::Serialization(_) => "SerializationError",
        }
    }

    /// The underlying failure, looking through step annotations.
    pub fn cause(&self) -> &PipelineError {
        match self {
            PipelineError::Step { source, .. } => source.cause(),
            other => other,
        }
    }

    /// The instance id of the step that failed, if the error was raised by
    /// a step.
    pub fn block_instance_id(&self) -> Option<Uuid> {
        match self {
            PipelineError::Step {
                block_instance_id, ..
            } => Some(*block_instance_id),
            _ => None,
        }
    }
}

impl From<SerializedError> for PipelineError {
    fn from(error: SerializedError) -> Self {
        PipelineError::Remote(error)
    }
}

impl From<&PipelineError> for SerializedError {
    fn from(error: &PipelineError) -> Self {
        match error {
            PipelineError::Step {
                block_instance_id,
                extension_id,
                source,
                ..
            } => {
                let mut inner = SerializedError::from(source.as_ref());
                let mut data = match inner.data.take() {
                    Some(Value::Object(map)) => map,
                    _ => Default::default(),
                };
                data.insert("blockInstanceId".to_string(), json!(block_instance_id));
                if let Some(extension_id) = extension_id {
                    data.insert("extensionId".to_string(), json!(extension_id));
                }
                inner.with_data(Value::Object(data))
            }
            PipelineError::InputValidation {
                schema,
                input,
                errors,
                ..
            } => SerializedError::new(error.name(), error.to_string()).with_data(json!({
                "schema": schema,
                "input": input,
                "errors": errors,
            })),
            PipelineError::ServiceNotConfigured { service_id, id, .. } => {
                SerializedError::new(error.name(), error.to_string())
                    .with_data(json!({"serviceId": service_id, "id": id}))
            }
            PipelineError::Messenger(inner) => SerializedError::from(inner),
            PipelineError::Remote(inner) => inner.clone(),
            other => SerializedError::new(other.name(), other.to_string()),
        }
    }
}

impl From<PipelineError> for SerializedError {
    fn from(error: PipelineError) -> Self {
        SerializedError::from(&error)
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn violation() -> SchemaViolation {
        SchemaViolation {
            instance_location: "".to_string(),
            keyword_location: "/required".to_string(),
            error: "\"url\" is a required property".to_string(),
        }
    }

    #[test]
    fn input_validation_serializes_details() {
        let error = PipelineError::InputValidation {
            block_id: "@brickyard/open-tab".to_string(),
            schema: json!({"required": ["url"]}),
            input: json!({}),
            errors: vec![violation()],
        };

        let serialized = SerializedError::from(&error);
        assert_eq!(serialized.name, "InputValidationError");
        let data = serialized.data.unwrap();
        assert_eq!(data["errors"][0]["keywordLocation"], "/required");
        assert_eq!(data["input"], json!({}));
    }

    #[test]
    fn step_annotation_keeps_cause() {
        let instance = Uuid::new_v4();
        let error = PipelineError::Step {
            block_instance_id: instance,
            block_id: "@brickyard/open-tab".to_string(),
            extension_id: None,
            source: Box::new(PipelineError::business("no URL")),
        };

        assert_eq!(error.to_string(), "no URL");
        assert_eq!(error.name(), "BusinessError");
        assert!(matches!(error.cause(), PipelineError::Business(_)));
        assert_eq!(error.block_instance_id(), Some(instance));

        let serialized = SerializedError::from(&error);
        assert_eq!(serialized.name, "BusinessError");
        assert_eq!(
            serialized.data.unwrap()["blockInstanceId"],
            json!(instance.to_string())
        );
    }

    #[test]
    fn remote_errors_pass_through() {
        let remote = SerializedError::new("TypeError", "x is undefined");
        let error = PipelineError::from(remote.clone());
        assert_eq!(SerializedError::from(&error), remote);
    }
}
