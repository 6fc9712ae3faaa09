//! Call envelopes and their wire shape.
//!
//! A [`CallEnvelope`] is the unit a stub hands to the transport: a method
//! name, a target selector and the JSON arguments. Before it crosses a context
//! boundary it is lowered to a [`Message`] (`{type, payload?, meta?}`) and
//! encoded as JSON text, so anything that is not plain JSON never leaves the
//! caller.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::context::{ContextAddress, FrameId, TabId};
use crate::error::{Result, SerializedError};

/// Where a call should be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(
    tag = "mode",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ContextSelector {
    /// The background context.
    Background,
    /// A specific content script.
    Tab { tab_id: TabId, frame_id: FrameId },
    /// The top frame of every open tab.
    Broadcast,
    /// The tab that opened the caller's tab.
    Opener,
    /// The frame that registered this nonce.
    FrameNonce { nonce: String },
}

impl ContextSelector {
    pub fn tab(tab_id: TabId) -> Self {
        ContextSelector::Tab {
            tab_id,
            frame_id: 0,
        }
    }

    pub fn frame_nonce(nonce: impl Into<String>) -> Self {
        ContextSelector::FrameNonce {
            nonce: nonce.into(),
        }
    }
}

impl fmt::Display for ContextSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextSelector::Background => f.write_str("background"),
            ContextSelector::Tab { tab_id, frame_id } => {
                write!(f, "tab {} (frame {})", tab_id, frame_id)
            }
            ContextSelector::Broadcast => f.write_str("broadcast"),
            ContextSelector::Opener => f.write_str("opener"),
            ContextSelector::FrameNonce { nonce } => write!(f, "frame with nonce {}", nonce),
        }
    }
}

/// Unique identifier correlating a request with its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A remote invocation before it is sent.
#[derive(Debug, Clone, PartialEq)]
pub struct CallEnvelope {
    pub name: String,
    pub target: ContextSelector,
    pub args: Vec<Value>,
}

impl CallEnvelope {
    pub fn new(name: impl Into<String>, target: ContextSelector, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            target,
            args,
        }
    }

    /// Lower to the wire message. Frame-targeted calls carry their nonce in
    /// `meta.nonce`.
    pub fn to_message(&self) -> Message {
        let meta = match &self.target {
            ContextSelector::FrameNonce { nonce } => Some(Meta {
                nonce: Some(nonce.clone()),
                extra: Map::new(),
            }),
            _ => None,
        };

        Message {
            kind: self.name.clone(),
            payload: Some(Value::Array(self.args.clone())),
            meta,
        }
    }
}

/// Message metadata. Unknown keys are preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The wire shape of a request: `{type, payload?, meta?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

impl Message {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// The positional arguments carried in the payload.
    pub fn args(&self) -> Vec<Value> {
        match &self.payload {
            Some(Value::Array(args)) => args.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other.clone()],
        }
    }

    pub fn nonce(&self) -> Option<&str> {
        self.meta.as_ref().and_then(|meta| meta.nonce.as_deref())
    }
}

/// The wire shape of a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Reply {
    Value(Value),
    Error(SerializedError),
}

impl Reply {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl From<std::result::Result<Value, SerializedError>> for Reply {
    fn from(result: std::result::Result<Value, SerializedError>) -> Self {
        match result {
            Ok(value) => Reply::Value(value),
            Err(error) => Reply::Error(error),
        }
    }
}

/// Packets moved between contexts over the hub's channels.
#[derive(Debug)]
pub(crate) enum Packet {
    Request {
        correlation_id: CorrelationId,
        sender: ContextAddress,
        body: String,
    },
    Response {
        correlation_id: CorrelationId,
        body: String,
    },
    /// Another context was torn down.
    Disconnected(ContextAddress),
    /// This context is being torn down.
    Close,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn selector_wire_shape() {
        assert_eq!(
            serde_json::to_value(ContextSelector::tab(9)).unwrap(),
            json!({"mode": "tab", "tabId": 9, "frameId": 0})
        );
        assert_eq!(
            serde_json::to_value(ContextSelector::frame_nonce("abc")).unwrap(),
            json!({"mode": "frameNonce", "nonce": "abc"})
        );
        assert_eq!(
            serde_json::to_value(ContextSelector::Broadcast).unwrap(),
            json!({"mode": "broadcast"})
        );
    }

    #[test]
    fn envelope_carries_nonce_in_meta() {
        let envelope = CallEnvelope::new(
            "RUN_BRICK",
            ContextSelector::frame_nonce("n-1"),
            vec![json!({"a": 1})],
        );
        let message = envelope.to_message();
        assert_eq!(message.kind, "RUN_BRICK");
        assert_eq!(message.nonce(), Some("n-1"));
        assert_eq!(message.args(), vec![json!({"a": 1})]);
    }

    #[test]
    fn envelope_without_nonce_has_no_meta() {
        let envelope = CallEnvelope::new("CLOSE_TAB", ContextSelector::Background, vec![]);
        let text = envelope.to_message().encode().unwrap();
        assert_eq!(text, r#"{"type":"CLOSE_TAB","payload":[]}"#);
    }

    #[test]
    fn meta_preserves_unknown_keys() {
        let text = r#"{"type":"X","meta":{"nonce":"n","origin":"popup"}}"#;
        let message = Message::decode(text).unwrap();
        let meta = message.meta.as_ref().unwrap();
        assert_eq!(meta.nonce.as_deref(), Some("n"));
        assert_eq!(meta.extra.get("origin"), Some(&json!("popup")));
        assert_eq!(Message::decode(&message.encode().unwrap()).unwrap(), message);
    }

    #[test]
    fn scalar_payload_is_a_single_argument() {
        let message = Message {
            kind: "X".to_string(),
            payload: Some(json!(5)),
            meta: None,
        };
        assert_eq!(message.args(), vec![json!(5)]);
    }

    #[test]
    fn reply_wire_shape() {
        let ok = Reply::Value(json!([1, 2]));
        assert_eq!(ok.encode().unwrap(), r#"{"value":[1,2]}"#);

        let err = Reply::Error(SerializedError::new("BusinessError", "nope"));
        let back = Reply::decode(&err.encode().unwrap()).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn correlation_ids_are_unique() {
        assert_ne!(CorrelationId::new(), CorrelationId::new());
    }
}
