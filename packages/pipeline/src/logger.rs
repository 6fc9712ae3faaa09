//! Context-carrying logger handed to blocks.
//!
//! A [`Logger`] remembers where it is being used (which deployment,
//! extension, block, service) and attaches that context to every `tracing`
//! event it emits. Child loggers inherit the parent's context and override
//! the fields they set.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a log message comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MessageContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blueprint_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension_point_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_id: Option<Uuid>,
}

impl MessageContext {
    /// Fields set in `other` win.
    pub fn merge(&self, other: &MessageContext) -> MessageContext {
        MessageContext {
            deployment_id: other.deployment_id.or(self.deployment_id),
            blueprint_id: other.blueprint_id.clone().or_else(|| self.blueprint_id.clone()),
            extension_point_id: other
                .extension_point_id
                .clone()
                .or_else(|| self.extension_point_id.clone()),
            block_id: other.block_id.clone().or_else(|| self.block_id.clone()),
            extension_id: other.extension_id.or(self.extension_id),
            service_id: other.service_id.clone().or_else(|| self.service_id.clone()),
            auth_id: other.auth_id.or(self.auth_id),
        }
    }

    pub fn for_block(block_id: impl Into<String>) -> Self {
        MessageContext {
            block_id: Some(block_id.into()),
            ..Default::default()
        }
    }

    pub fn for_extension(extension_id: Uuid) -> Self {
        MessageContext {
            extension_id: Some(extension_id),
            ..Default::default()
        }
    }
}

macro_rules! emit {
    ($level:ident, $context:expr, $message:expr) => {{
        let context = $context;
        tracing::$level!(
            deployment_id = context.deployment_id.map(tracing::field::display),
            blueprint_id = context.blueprint_id.as_deref(),
            extension_point_id = context.extension_point_id.as_deref(),
            block_id = context.block_id.as_deref(),
            extension_id = context.extension_id.map(tracing::field::display),
            service_id = context.service_id.as_deref(),
            auth_id = context.auth_id.map(tracing::field::display),
            "{}",
            $message
        )
    }};
}

/// Logger passed to every block invocation.
#[derive(Debug, Clone, Default)]
pub struct Logger {
    context: MessageContext,
}

impl Logger {
    pub fn new(context: MessageContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &MessageContext {
        &self.context
    }

    /// A logger for a narrower scope, e.g. one block of a run.
    pub fn child_logger(&self, context: &MessageContext) -> Logger {
        Logger {
            context: self.context.merge(context),
        }
    }

    pub fn trace(&self, message: &str) {
        emit!(trace, &self.context, message);
    }

    pub fn debug(&self, message: &str) {
        emit!(debug, &self.context, message);
    }

    pub fn info(&self, message: &str) {
        emit!(info, &self.context, message);
    }

    pub fn warn(&self, message: &str) {
        emit!(warn, &self.context, message);
    }

    pub fn error(&self, message: &str) {
        emit!(error, &self.context, message);
    }
}
