//! Installed extensions, as the runtime sees them.

use brickyard_pipeline::{ApiVersion, MessageContext, ServiceDependency};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// The deployment an extension was installed through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: Uuid,
    /// Paused deployments keep their extensions installed but inert.
    #[serde(default = "active_by_default")]
    pub active: bool,
}

fn active_by_default() -> bool {
    true
}

/// An extension with its definitions resolved, attached to one extension
/// point. `C` is the extension point's config type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedExtension<C> {
    pub id: Uuid,
    pub extension_point_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub config: C,
    #[serde(default)]
    pub services: Vec<ServiceDependency>,
    /// Values of the blueprint options, exposed to blocks as `@options`.
    #[serde(default)]
    pub options_args: Map<String, Value>,
    #[serde(default)]
    pub api_version: ApiVersion,
    #[serde(default, rename = "_deployment", skip_serializing_if = "Option::is_none")]
    pub deployment: Option<Deployment>,
    #[serde(default, rename = "_recipe", skip_serializing_if = "Option::is_none")]
    pub blueprint_id: Option<String>,
}

impl<C> ResolvedExtension<C> {
    pub fn new(id: Uuid, extension_point_id: impl Into<String>, config: C) -> Self {
        Self {
            id,
            extension_point_id: extension_point_id.into(),
            label: None,
            config,
            services: Vec::new(),
            options_args: Map::new(),
            api_version: ApiVersion::default(),
            deployment: None,
            blueprint_id: None,
        }
    }

    pub fn with_services(mut self, services: Vec<ServiceDependency>) -> Self {
        self.services = services;
        self
    }

    pub fn with_options_args(mut self, options_args: Map<String, Value>) -> Self {
        self.options_args = options_args;
        self
    }

    pub fn with_api_version(mut self, api_version: ApiVersion) -> Self {
        self.api_version = api_version;
        self
    }

    pub fn with_deployment(mut self, deployment: Deployment) -> Self {
        self.deployment = Some(deployment);
        self
    }

    /// Extensions installed outside a deployment are always active.
    pub fn is_deployment_active(&self) -> bool {
        self.deployment.as_ref().map_or(true, |deployment| deployment.active)
    }

    /// Logging context for runs of this extension.
    pub fn message_context(&self) -> MessageContext {
        MessageContext {
            deployment_id: self.deployment.as_ref().map(|deployment| deployment.id),
            blueprint_id: self.blueprint_id.clone(),
            extension_point_id: Some(self.extension_point_id.clone()),
            extension_id: Some(self.id),
            ..Default::default()
        }
    }

    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or("No Label")
    }
}

/// Identity of an extension point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Metadata {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_stored_shape() {
        let id = Uuid::new_v4();
        let deployment = Uuid::new_v4();
        let extension: ResolvedExtension<Value> = serde_json::from_value(json!({
            "id": id,
            "extensionPointId": "acme/context-menu",
            "config": {"title": "Search"},
            "services": [{"id": "google/sheet", "outputKey": "sheet"}],
            "optionsArgs": {"channel": "#general"},
            "apiVersion": "v3",
            "_deployment": {"id": deployment, "active": false}
        }))
        .unwrap();

        assert_eq!(extension.id, id);
        assert_eq!(extension.services[0].output_key, "sheet");
        assert_eq!(extension.api_version, ApiVersion::V3);
        assert!(!extension.is_deployment_active());
        assert_eq!(extension.message_context().deployment_id, Some(deployment));
    }

    #[test]
    fn extensions_without_deployment_are_active() {
        let extension = ResolvedExtension::new(Uuid::new_v4(), "acme/menu", json!({}));
        assert!(extension.is_deployment_active());
        assert_eq!(extension.display_label(), "No Label");
    }
}
