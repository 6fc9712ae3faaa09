//! Browser context menu entries.
//!
//! Menu entries are owned by the background context. Content scripts ask
//! for an entry through a [`MenuHost`], which is either the background's own
//! [`MenuRegistry`] or a stub forwarding to it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// A context menu entry for one extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuSpec {
    pub extension_id: Uuid,
    /// `%s` is replaced with the selected text.
    pub title: String,
    /// Where the entry shows up (`all`, `selection`, `link`, ...).
    pub contexts: Vec<String>,
    #[serde(default)]
    pub document_url_patterns: Vec<String>,
}

/// Creates and removes context menu entries.
#[async_trait]
pub trait MenuHost: Send + Sync {
    /// Create the entry, or update it if the extension already has one.
    async fn ensure(&self, spec: MenuSpec) -> Result<()>;

    /// Remove the extension's entry. Returns whether there was one.
    async fn uninstall(&self, extension_id: Uuid) -> Result<bool>;
}

/// The background's table of menu entries.
#[derive(Debug, Clone, Default)]
pub struct MenuRegistry {
    entries: Arc<Mutex<BTreeMap<Uuid, MenuSpec>>>,
}

impl MenuRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Uuid, MenuSpec>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, extension_id: Uuid) -> Option<MenuSpec> {
        self.lock().get(&extension_id).cloned()
    }

    pub fn entries(&self) -> Vec<MenuSpec> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl MenuHost for MenuRegistry {
    async fn ensure(&self, spec: MenuSpec) -> Result<()> {
        tracing::debug!(extension_id = %spec.extension_id, title = %spec.title, "ensure context menu");
        self.lock().insert(spec.extension_id, spec);
        Ok(())
    }

    async fn uninstall(&self, extension_id: Uuid) -> Result<bool> {
        let removed = self.lock().remove(&extension_id).is_some();
        tracing::debug!(%extension_id, removed, "uninstall context menu");
        Ok(removed)
    }
}
