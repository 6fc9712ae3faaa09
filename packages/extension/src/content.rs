//! Methods a content script serves.
//!
//! The popup asks the active tab's content script for an action panel's
//! renderer data with [`RUN_BROWSER_ACTION`]; the content script runs the
//! panel body against its page and answers with [`RendererData`].

use std::collections::BTreeMap;
use std::sync::Arc;

use brickyard_messenger::{
    CallerInfo, ContextKind, ContextSelector, Endpoint, MethodRegistry, RemoteMethod,
    Result as MessengerResult, SerializedError, TabId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{ExtensionError, Result};
use crate::extension_point::{ActionPanelExtensionPoint, ExtensionRuntime, RendererData};

pub const RUN_BROWSER_ACTION: &str = "RUN_BROWSER_ACTION";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserActionRequest {
    pub extension_id: Uuid,
    pub extension_point_id: String,
}

/// The action panels installed in one content script.
///
/// Handles are cheap to clone. The method registry is frozen when the
/// content script connects, but panels and the runtime they run on are
/// loaded afterwards, so both live behind a lock.
#[derive(Clone, Default)]
pub struct ActionPanels {
    inner: Arc<RwLock<PanelsInner>>,
}

#[derive(Default)]
struct PanelsInner {
    runtime: Option<ExtensionRuntime>,
    panels: BTreeMap<String, Arc<ActionPanelExtensionPoint>>,
}

impl ActionPanels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the runtime panels run on.
    pub async fn set_runtime(&self, runtime: ExtensionRuntime) {
        self.inner.write().await.runtime = Some(runtime);
    }

    /// Add a panel, replacing one with the same id.
    pub async fn add(&self, panel: ActionPanelExtensionPoint) {
        let id = panel.metadata().id.clone();
        self.inner.write().await.panels.insert(id, Arc::new(panel));
    }

    pub async fn ids(&self) -> Vec<String> {
        self.inner.read().await.panels.keys().cloned().collect()
    }

    pub async fn renderer_data(&self, request: &BrowserActionRequest) -> Result<RendererData> {
        // Never hold the lock across a panel run.
        let (runtime, panel) = {
            let inner = self.inner.read().await;
            let runtime = inner.runtime.clone().ok_or(ExtensionError::NotReady)?;
            let panel = inner
                .panels
                .get(&request.extension_point_id)
                .cloned()
                .ok_or_else(|| {
                    ExtensionError::ExtensionPointNotFound(request.extension_point_id.clone())
                })?;
            (runtime, panel)
        };
        panel.generate_data(&runtime, request.extension_id).await
    }
}

/// Register the content script's methods on `registry`.
pub fn register_content_methods(
    registry: &mut MethodRegistry,
    panels: ActionPanels,
) -> MessengerResult<()> {
    registry.register_fn(
        RUN_BROWSER_ACTION,
        move |(request,): (BrowserActionRequest,), _caller: CallerInfo| {
            let panels = panels.clone();
            async move {
                panels
                    .renderer_data(&request)
                    .await
                    .map_err(SerializedError::from)
            }
        },
    )
}

/// Ask the content script in `tab_id` for an action panel's renderer data.
/// Only the popup and the background may ask.
pub async fn run_browser_action(
    endpoint: &Endpoint,
    tab_id: TabId,
    request: BrowserActionRequest,
) -> Result<RendererData> {
    let method: RemoteMethod<(BrowserActionRequest,), RendererData> =
        RemoteMethod::new(RUN_BROWSER_ACTION)?
            .allowed_from(&[ContextKind::ActionPopup, ContextKind::Background]);
    Ok(method
        .call(endpoint, ContextSelector::tab(tab_id), (request,))
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_uses_camel_case() {
        let id = Uuid::new_v4();
        let request: BrowserActionRequest = serde_json::from_value(json!({
            "extensionId": id,
            "extensionPointId": "acme/panel"
        }))
        .unwrap();
        assert_eq!(request.extension_id, id);
        assert_eq!(request.extension_point_id, "acme/panel");
    }
}
