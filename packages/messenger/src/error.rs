//! Error types for the messenger.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::context::{ContextAddress, ContextKind};

/// Errors raised when code runs in the wrong execution context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The code expected to run in a specific context.
    #[error("this code can only run in the {expected} context, not in {actual}")]
    Unexpected {
        expected: ContextKind,
        actual: ContextKind,
    },

    /// The code is not allowed to run in this context.
    #[error("this code cannot run in the {0} context")]
    Forbidden(ContextKind),

    /// A remote method was called from a context that may not send it.
    #[error("{method} cannot be called from the {actual} context")]
    NotAllowed { method: String, actual: ContextKind },
}

/// Errors that can occur while sending or dispatching a remote call.
#[derive(Debug, Error)]
pub enum MessengerError {
    /// The target did not reply before the deadline.
    #[error("{method} timed out: the target did not respond within {}ms", .after.as_millis())]
    Timeout { method: String, after: Duration },

    /// The target context went away before replying.
    #[error("connection to {target} was lost before {method} completed")]
    Connection {
        method: String,
        target: ContextAddress,
    },

    /// No live context matches the call's target.
    #[error("no receiver for {method}: {target}")]
    NoReceiver { method: String, target: String },

    /// The receiving context has no handler for the method.
    #[error("no handler registered for {0}")]
    UnknownMethod(String),

    /// A handler is already registered under this name.
    #[error("a handler is already registered for {0}")]
    DuplicateMethod(String),

    /// The method name is not a flat UPPER_SNAKE_CASE identifier.
    #[error("invalid method name: {0:?}")]
    InvalidMethodName(String),

    /// A context with this address is already connected.
    #[error("a context is already connected at {0}")]
    AddressInUse(ContextAddress),

    /// The call was made from the wrong context.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// The remote handler failed.
    #[error("{0}")]
    Remote(SerializedError),

    /// Arguments or results could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MessengerError {
    /// The error name used on the wire.
    pub fn name(&self) -> &str {
        match self {
            MessengerError::Timeout { .. } => "TimeoutError",
            MessengerError::Connection { .. } => "ConnectionError",
            MessengerError::NoReceiver { .. } => "NoReceiverError",
            MessengerError::UnknownMethod(_) => "UnknownMethodError",
            MessengerError::DuplicateMethod(_) => "DuplicateMethodError",
            MessengerError::InvalidMethodName(_) => "InvalidMethodNameError",
            MessengerError::AddressInUse(_) => "AddressInUseError",
            MessengerError::Context(_) => "ContextError",
            MessengerError::Remote(error) => &error.name,
            MessengerError::Serialization(_) => "SerializationError",
        }
    }

    /// Rebuild a typed error from a serialized reply.
    ///
    /// Registry failures keep their own kind so callers can match on them;
    /// everything else stays a [`MessengerError::Remote`].
    pub fn from_remote(method: &str, error: SerializedError) -> Self {
        match error.name.as_str() {
            "UnknownMethodError" => MessengerError::UnknownMethod(method.to_string()),
            _ => MessengerError::Remote(error),
        }
    }
}

impl From<&MessengerError> for SerializedError {
    fn from(error: &MessengerError) -> Self {
        match error {
            MessengerError::Remote(remote) => remote.clone(),
            other => SerializedError::new(other.name(), other.to_string()),
        }
    }
}

impl From<MessengerError> for SerializedError {
    fn from(error: MessengerError) -> Self {
        SerializedError::from(&error)
    }
}

/// A structured-clone-safe error that can cross a context boundary.
///
/// Preserves `name`, `message` and, when available, `stack`. Extra
/// structured detail (e.g. schema violations) travels in `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl SerializedError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            data: None,
        }
    }

    /// Attach structured detail to the error.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Serialize an arbitrary error, recording its source chain as the stack.
    pub fn from_error(name: impl Into<String>, error: &dyn std::error::Error) -> Self {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {}", cause));
            source = cause.source();
        }

        Self {
            name: name.into(),
            message: error.to_string(),
            stack: (!chain.is_empty()).then(|| chain.join("\n")),
            data: None,
        }
    }

    /// Serialize the payload of a caught handler panic.
    pub(crate) fn from_panic(method: &str, payload: Box<dyn std::any::Any + Send>) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());

        Self::new("Error", format!("handler for {} panicked: {}", method, detail))
    }
}

impl fmt::Display for SerializedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for SerializedError {}

/// Result type alias for messenger operations.
pub type Result<T> = std::result::Result<T, MessengerError>;
