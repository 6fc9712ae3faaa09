//! Execution contexts and the context guard.
//!
//! Every piece of extension code runs in exactly one isolated context: the
//! background worker, a content script inside some tab/frame, the devtools
//! panel, the action popup, or the options page. Contexts share no memory and
//! talk only through the messenger.
//!
//! The guard functions here are cheap sanity preconditions. Code that must run
//! in the background (or must never run there) checks once and fails fast with
//! a [`ContextError`] instead of misbehaving later.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ContextError;

/// Browser tab identifier.
pub type TabId = u32;

/// Frame identifier within a tab. The top-level frame is `0`.
pub type FrameId = u32;

/// The kind of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContextKind {
    Background,
    ContentScript,
    DevTools,
    ActionPopup,
    Options,
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextKind::Background => "background",
            ContextKind::ContentScript => "contentScript",
            ContextKind::DevTools => "devTools",
            ContextKind::ActionPopup => "actionPopup",
            ContextKind::Options => "options",
        };
        f.write_str(name)
    }
}

/// The address of one live context.
///
/// Content scripts are addressed by tab and frame; devtools panels by the tab
/// they inspect. There is a single background, popup and options context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(
    tag = "kind",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ContextAddress {
    Background,
    Tab { tab_id: TabId, frame_id: FrameId },
    DevTools { tab_id: TabId },
    ActionPopup,
    Options,
}

impl ContextAddress {
    /// The top-level frame of a tab.
    pub fn tab(tab_id: TabId) -> Self {
        ContextAddress::Tab {
            tab_id,
            frame_id: 0,
        }
    }

    /// A specific frame of a tab.
    pub fn frame(tab_id: TabId, frame_id: FrameId) -> Self {
        ContextAddress::Tab { tab_id, frame_id }
    }

    /// The kind of context living at this address.
    pub fn kind(&self) -> ContextKind {
        match self {
            ContextAddress::Background => ContextKind::Background,
            ContextAddress::Tab { .. } => ContextKind::ContentScript,
            ContextAddress::DevTools { .. } => ContextKind::DevTools,
            ContextAddress::ActionPopup => ContextKind::ActionPopup,
            ContextAddress::Options => ContextKind::Options,
        }
    }

    /// The tab this context belongs to, if any.
    pub fn tab_id(&self) -> Option<TabId> {
        match self {
            ContextAddress::Tab { tab_id, .. } | ContextAddress::DevTools { tab_id } => {
                Some(*tab_id)
            }
            _ => None,
        }
    }

    /// Whether this is the top-level frame of a tab.
    pub fn is_top_frame(&self) -> bool {
        matches!(self, ContextAddress::Tab { frame_id: 0, .. })
    }
}

impl fmt::Display for ContextAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextAddress::Tab { tab_id, frame_id } => {
                write!(f, "tab {} (frame {})", tab_id, frame_id)
            }
            ContextAddress::DevTools { tab_id } => write!(f, "devtools for tab {}", tab_id),
            other => write!(f, "{}", other.kind()),
        }
    }
}

/// Require that the current context is `expected`.
pub fn expect_context(actual: ContextKind, expected: ContextKind) -> Result<(), ContextError> {
    if actual == expected {
        Ok(())
    } else {
        Err(ContextError::Unexpected { expected, actual })
    }
}

/// Require that the current context is anything but `forbidden`.
pub fn forbid_context(actual: ContextKind, forbidden: ContextKind) -> Result<(), ContextError> {
    if actual == forbidden {
        Err(ContextError::Forbidden(forbidden))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expect_matching_context() {
        assert!(expect_context(ContextKind::Background, ContextKind::Background).is_ok());
    }

    #[test]
    fn expect_wrong_context() {
        let err = expect_context(ContextKind::ContentScript, ContextKind::Background).unwrap_err();
        assert_eq!(
            err,
            ContextError::Unexpected {
                expected: ContextKind::Background,
                actual: ContextKind::ContentScript,
            }
        );
        assert!(err.to_string().contains("background"));
    }

    #[test]
    fn forbid_context_rejects_only_forbidden() {
        assert!(forbid_context(ContextKind::DevTools, ContextKind::Background).is_ok());
        assert_eq!(
            forbid_context(ContextKind::Background, ContextKind::Background),
            Err(ContextError::Forbidden(ContextKind::Background))
        );
    }

    #[test]
    fn address_kinds() {
        assert_eq!(ContextAddress::Background.kind(), ContextKind::Background);
        assert_eq!(ContextAddress::tab(3).kind(), ContextKind::ContentScript);
        assert_eq!(
            ContextAddress::DevTools { tab_id: 3 }.kind(),
            ContextKind::DevTools
        );
        assert_eq!(ContextAddress::frame(3, 7).tab_id(), Some(3));
        assert!(ContextAddress::tab(3).is_top_frame());
        assert!(!ContextAddress::frame(3, 7).is_top_frame());
    }

    #[test]
    fn address_wire_shape() {
        let json = serde_json::to_value(ContextAddress::frame(4, 2)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "tab", "tabId": 4, "frameId": 2})
        );
        let back: ContextAddress = serde_json::from_value(json).unwrap();
        assert_eq!(back, ContextAddress::frame(4, 2));
    }

    #[test]
    fn address_display() {
        assert_eq!(ContextAddress::tab(1).to_string(), "tab 1 (frame 0)");
        assert_eq!(ContextAddress::Background.to_string(), "background");
    }
}
