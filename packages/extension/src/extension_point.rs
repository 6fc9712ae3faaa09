//! Extension points: the places in a page where extensions hook in.
//!
//! There are three kinds, modelled as the closed [`ExtensionPoint`] enum:
//!
//! - **Menu items** run an action pipeline when their button is clicked.
//! - **Context menus** register a browser context menu entry per extension
//!   and run the action pipeline when the entry is clicked.
//! - **Action panels** run their body headless and hand the first
//!   renderer's arguments to the extension popup ([`RendererData`]).
//!
//! Every kind reads its input with the extension point's reader, binds the
//! extension's services and hands the pipeline to the shared
//! [`ExtensionRuntime`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use brickyard_pipeline::{
    make_service_context, pipeline_block_ids, InitialValues, Logger, PipelineInput,
    PipelineOutcome, Reader, ReaderRoot, ReduceOptions, Reducer, ServiceContext, ServiceLocator,
};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{ExtensionError, Result};
use crate::extension::{Metadata, ResolvedExtension};
use crate::menus::{MenuHost, MenuSpec};

/// Collaborators shared by every extension point in a context.
#[derive(Clone)]
pub struct ExtensionRuntime {
    reducer: Reducer,
    locator: Arc<dyn ServiceLocator>,
    menus: Arc<dyn MenuHost>,
    logger: Logger,
}

impl ExtensionRuntime {
    pub fn new(
        reducer: Reducer,
        locator: Arc<dyn ServiceLocator>,
        menus: Arc<dyn MenuHost>,
    ) -> Self {
        Self {
            reducer,
            locator,
            menus,
            logger: Logger::default(),
        }
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn reducer(&self) -> &Reducer {
        &self.reducer
    }

    pub fn menus(&self) -> &Arc<dyn MenuHost> {
        &self.menus
    }

    /// Locate and bind `extension`'s services.
    async fn service_context<C>(&self, extension: &ResolvedExtension<C>) -> Result<ServiceContext> {
        Ok(make_service_context(&extension.services, self.locator.as_ref()).await?)
    }

    /// Run one of `extension`'s pipelines.
    async fn run_pipeline<C>(
        &self,
        extension: &ResolvedExtension<C>,
        pipeline: &PipelineInput,
        input: Map<String, Value>,
        root: ReaderRoot,
        service_context: ServiceContext,
        headless: bool,
    ) -> PipelineOutcome {
        let logger = self.logger.child_logger(&extension.message_context());

        let initial = InitialValues::new(Value::Object(input))
            .with_root(root)
            .with_services(service_context)
            .with_options_args(extension.options_args.clone());
        let options = ReduceOptions {
            headless,
            api_version: extension.api_version,
            ..ReduceOptions::default()
        }
        .with_extension(extension.id)
        .with_logger(logger);

        self.reducer
            .reduce_pipeline(pipeline.clone(), initial, options)
            .await
    }

    /// Run a pipeline to completion and report failures to the extension's
    /// log.
    async fn run_action<C>(
        &self,
        extension: &ResolvedExtension<C>,
        pipeline: &PipelineInput,
        input: Map<String, Value>,
        root: ReaderRoot,
    ) -> Result<Value> {
        let logger = self.logger.child_logger(&extension.message_context());
        let result = match self.service_context(extension).await {
            Ok(service_context) => {
                match self
                    .run_pipeline(extension, pipeline, input, root, service_context, false)
                    .await
                {
                    PipelineOutcome::Completed(value) => Ok(value),
                    PipelineOutcome::Failed(error) => Err(ExtensionError::from(error)),
                    PipelineOutcome::HeadlessAborted(_) => Err(ExtensionError::business(
                        "Renderer reached outside a headless run",
                    )),
                }
            }
            Err(error) => Err(error),
        };
        if let Err(error) = &result {
            match error {
                ExtensionError::Business(_) => logger.warn(&error.to_string()),
                _ => logger.error(&error.to_string()),
            }
        }
        result
    }
}

impl fmt::Debug for ExtensionRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionRuntime")
            .field("reducer", &self.reducer)
            .field("logger", &self.logger)
            .finish_non_exhaustive()
    }
}

fn find_extension<'a, C>(
    extensions: &'a [ResolvedExtension<C>],
    extension_point_id: &str,
    extension_id: Uuid,
) -> Result<&'a ResolvedExtension<C>> {
    extensions
        .iter()
        .find(|extension| extension.id == extension_id)
        .ok_or_else(|| ExtensionError::ExtensionNotFound {
            extension_point_id: extension_point_id.to_string(),
            extension_id,
        })
}

fn block_ids(pipeline: &PipelineInput) -> Vec<String> {
    pipeline_block_ids(&pipeline.clone().normalize())
}

/// Add `extension` to `extensions`, replacing an older version of it.
fn upsert<C>(extensions: &mut Vec<ResolvedExtension<C>>, extension: ResolvedExtension<C>) {
    match extensions.iter_mut().find(|existing| existing.id == extension.id) {
        Some(existing) => *existing = extension,
        None => extensions.push(extension),
    }
}

fn typed<C: DeserializeOwned>(
    metadata: &Metadata,
    extension: ResolvedExtension<Value>,
) -> Result<ResolvedExtension<C>> {
    if extension.extension_point_id != metadata.id {
        return Err(ExtensionError::InvalidConfig(format!(
            "extension {} belongs to {}, not {}",
            extension.id, extension.extension_point_id, metadata.id
        )));
    }
    let config = serde_json::from_value(extension.config).map_err(|e| {
        ExtensionError::InvalidConfig(format!("extension {}: {}", extension.id, e))
    })?;
    Ok(ResolvedExtension {
        id: extension.id,
        extension_point_id: extension.extension_point_id,
        label: extension.label,
        config,
        services: extension.services,
        options_args: extension.options_args,
        api_version: extension.api_version,
        deployment: extension.deployment,
        blueprint_id: extension.blueprint_id,
    })
}

/// What a call to [`ExtensionPoint::run`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    /// Installed extensions.
    pub extensions: usize,
    /// Extensions that could not be set up.
    pub failed: usize,
}

// Menu items

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuItemConfig {
    pub caption: String,
    pub action: PipelineInput,
}

/// A button added to a menu on the page.
pub struct MenuItemExtensionPoint {
    metadata: Metadata,
    reader: Arc<dyn Reader>,
    extensions: Vec<ResolvedExtension<MenuItemConfig>>,
}

impl MenuItemExtensionPoint {
    pub fn new(metadata: Metadata, reader: Arc<dyn Reader>) -> Self {
        Self {
            metadata,
            reader,
            extensions: Vec::new(),
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn add_extension(&mut self, extension: ResolvedExtension<MenuItemConfig>) {
        upsert(&mut self.extensions, extension);
    }

    pub fn extensions(&self) -> &[ResolvedExtension<MenuItemConfig>] {
        &self.extensions
    }

    /// Run the action of the clicked item. `root` is the menu the item was
    /// added to.
    pub async fn click(
        &self,
        runtime: &ExtensionRuntime,
        extension_id: Uuid,
        root: ReaderRoot,
    ) -> Result<Value> {
        let extension = find_extension(&self.extensions, &self.metadata.id, extension_id)?;
        let input = self.reader.read(&root).await?;
        runtime
            .run_action(extension, &extension.config.action, input, root)
            .await
    }
}

// Context menus

/// What a context menu's readers and pipeline see as their root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TargetMode {
    /// Readers see the clicked element, the pipeline sees the document.
    #[default]
    Legacy,
    /// Everything sees the document.
    Document,
    /// Everything sees the clicked element.
    EventTarget,
}

impl TargetMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetMode::Legacy => "legacy",
            TargetMode::Document => "document",
            TargetMode::EventTarget => "eventTarget",
        }
    }
}

impl FromStr for TargetMode {
    type Err = ExtensionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "legacy" => Ok(TargetMode::Legacy),
            "document" => Ok(TargetMode::Document),
            "eventTarget" => Ok(TargetMode::EventTarget),
            other => Err(ExtensionError::business(format!("Unknown targetMode: {}", other))),
        }
    }
}

impl TryFrom<String> for TargetMode {
    type Error = ExtensionError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TargetMode> for String {
    fn from(mode: TargetMode) -> Self {
        mode.as_str().to_string()
    }
}

impl fmt::Display for TargetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMenuConfig {
    pub title: String,
    pub action: PipelineInput,
}

/// A click on a context menu entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextMenuClick {
    /// The element that was right-clicked, or the one holding the
    /// selection. `None` means the document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ReaderRoot>,
    /// Data the browser reports with the click (`selectionText`,
    /// `linkUrl`, ...).
    #[serde(default)]
    pub data: Map<String, Value>,
    pub document_url: String,
}

/// Entries in the browser's right-click menu.
pub struct ContextMenuExtensionPoint {
    metadata: Metadata,
    reader: Arc<dyn Reader>,
    target_mode: TargetMode,
    contexts: Vec<String>,
    document_url_patterns: Vec<String>,
    extensions: Vec<ResolvedExtension<ContextMenuConfig>>,
}

impl ContextMenuExtensionPoint {
    pub fn new(metadata: Metadata, reader: Arc<dyn Reader>) -> Self {
        Self {
            metadata,
            reader,
            target_mode: TargetMode::default(),
            contexts: vec!["all".to_string()],
            document_url_patterns: Vec::new(),
            extensions: Vec::new(),
        }
    }

    pub fn with_target_mode(mut self, target_mode: TargetMode) -> Self {
        self.target_mode = target_mode;
        self
    }

    pub fn with_contexts(mut self, contexts: Vec<String>) -> Self {
        self.contexts = contexts;
        self
    }

    pub fn with_document_url_patterns(mut self, patterns: Vec<String>) -> Self {
        self.document_url_patterns = patterns;
        self
    }

    pub fn target_mode(&self) -> TargetMode {
        self.target_mode
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn add_extension(&mut self, extension: ResolvedExtension<ContextMenuConfig>) {
        upsert(&mut self.extensions, extension);
    }

    pub fn extensions(&self) -> &[ResolvedExtension<ContextMenuConfig>] {
        &self.extensions
    }

    pub fn decide_reader_root(&self, target: &ReaderRoot) -> ReaderRoot {
        match self.target_mode {
            TargetMode::Legacy | TargetMode::EventTarget => target.clone(),
            TargetMode::Document => ReaderRoot::Document,
        }
    }

    pub fn decide_pipeline_root(&self, target: &ReaderRoot) -> ReaderRoot {
        match self.target_mode {
            TargetMode::EventTarget => target.clone(),
            TargetMode::Legacy | TargetMode::Document => ReaderRoot::Document,
        }
    }

    fn menu_spec(&self, extension: &ResolvedExtension<ContextMenuConfig>) -> MenuSpec {
        let mut patterns: Vec<String> = Vec::new();
        for pattern in &self.document_url_patterns {
            if !pattern.is_empty() && !patterns.contains(pattern) {
                patterns.push(pattern.clone());
            }
        }
        MenuSpec {
            extension_id: extension.id,
            title: extension.config.title.clone(),
            contexts: self.contexts.clone(),
            document_url_patterns: patterns,
        }
    }

    /// Make sure `extension` has a menu entry. Returns `false` if the
    /// extension's deployment is paused and the entry was left alone.
    pub async fn ensure_menu(
        &self,
        runtime: &ExtensionRuntime,
        extension: &ResolvedExtension<ContextMenuConfig>,
    ) -> Result<bool> {
        if !extension.is_deployment_active() {
            tracing::debug!(extension_id = %extension.id, "skipping menu for paused deployment");
            return Ok(false);
        }
        runtime.menus.ensure(self.menu_spec(extension)).await?;
        Ok(true)
    }

    /// Ensure a menu entry for every extension. One failing extension does
    /// not stop the others.
    pub async fn register_extensions(&self, runtime: &ExtensionRuntime) -> RunReport {
        let results = join_all(self.extensions.iter().map(|extension| async move {
            tracing::debug!(
                extension_id = %extension.id,
                label = extension.display_label(),
                "register context menu handler"
            );
            let result = self.ensure_menu(runtime, extension).await;
            if let Err(error) = &result {
                runtime
                    .logger
                    .child_logger(&extension.message_context())
                    .error(&error.to_string());
            }
            result
        }))
        .await;

        let failed = results.iter().filter(|result| result.is_err()).count();
        if failed > 0 {
            tracing::warn!(
                extension_point_id = %self.metadata.id,
                "An error occurred adding {} context menu item(s)",
                failed
            );
        }
        RunReport {
            extensions: self.extensions.len(),
            failed,
        }
    }

    /// Run the action of the clicked entry.
    pub async fn handle_click(
        &self,
        runtime: &ExtensionRuntime,
        extension_id: Uuid,
        click: ContextMenuClick,
    ) -> Result<Value> {
        let extension = find_extension(&self.extensions, &self.metadata.id, extension_id)?;
        let target = click.target.unwrap_or_default();

        let mut input = self.reader.read(&self.decide_reader_root(&target)).await?;
        input.extend(click.data);
        input.insert("documentUrl".to_string(), Value::String(click.document_url));

        runtime
            .run_action(
                extension,
                &extension.config.action,
                input,
                self.decide_pipeline_root(&target),
            )
            .await
    }

    /// Remove every extension from this extension point. With `global`,
    /// their menu entries are removed as well; entries that fail to go away
    /// are logged and skipped.
    pub async fn uninstall(
        &mut self,
        runtime: &ExtensionRuntime,
        global: bool,
    ) -> Vec<ResolvedExtension<ContextMenuConfig>> {
        let extensions = std::mem::take(&mut self.extensions);
        if global {
            for extension in &extensions {
                if let Err(error) = runtime.menus.uninstall(extension.id).await {
                    tracing::error!(extension_id = %extension.id, %error, "failed to remove context menu");
                }
            }
        }
        extensions
    }
}

// Action panels

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionPanelConfig {
    pub heading: String,
    pub body: PipelineInput,
}

/// What the popup needs to render an action panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RendererData {
    /// The renderer's arguments.
    pub args: Value,
    /// The renderer's context, services included.
    pub ctxt: Value,
}

/// A panel shown in the extension's toolbar popup.
pub struct ActionPanelExtensionPoint {
    metadata: Metadata,
    reader: Arc<dyn Reader>,
    extensions: Vec<ResolvedExtension<ActionPanelConfig>>,
}

impl ActionPanelExtensionPoint {
    pub fn new(metadata: Metadata, reader: Arc<dyn Reader>) -> Self {
        Self {
            metadata,
            reader,
            extensions: Vec::new(),
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn add_extension(&mut self, extension: ResolvedExtension<ActionPanelConfig>) {
        upsert(&mut self.extensions, extension);
    }

    pub fn extensions(&self) -> &[ResolvedExtension<ActionPanelConfig>] {
        &self.extensions
    }

    /// Run the extension's body up to its renderer.
    ///
    /// A body that finishes without reaching a renderer is a
    /// [`ExtensionError::Business`] error.
    pub async fn generate_data(
        &self,
        runtime: &ExtensionRuntime,
        extension_id: Uuid,
    ) -> Result<RendererData> {
        let extension = find_extension(&self.extensions, &self.metadata.id, extension_id)?;
        let input = self.reader.read(&ReaderRoot::Document).await?;
        let service_context = runtime.service_context(extension).await?;

        let outcome = runtime
            .run_pipeline(
                extension,
                &extension.config.body,
                input,
                ReaderRoot::Document,
                service_context.clone(),
                true,
            )
            .await;

        match outcome {
            PipelineOutcome::HeadlessAborted(signal) => {
                let mut ctxt = match signal.ctxt {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                for (key, value) in service_context.iter() {
                    ctxt.insert(key.clone(), value.clone());
                }
                Ok(RendererData {
                    args: signal.args,
                    ctxt: Value::Object(ctxt),
                })
            }
            PipelineOutcome::Completed(_) => Err(ExtensionError::business(
                "Action panel body must include a renderer",
            )),
            PipelineOutcome::Failed(error) => Err(error.into()),
        }
    }
}

// The closed set

/// Which kind of extension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExtensionPointKind {
    MenuItem,
    ContextMenu,
    ActionPanel,
}

/// Any extension point.
pub enum ExtensionPoint {
    MenuItem(MenuItemExtensionPoint),
    ContextMenu(ContextMenuExtensionPoint),
    ActionPanel(ActionPanelExtensionPoint),
}

impl ExtensionPoint {
    pub fn metadata(&self) -> &Metadata {
        match self {
            ExtensionPoint::MenuItem(point) => &point.metadata,
            ExtensionPoint::ContextMenu(point) => &point.metadata,
            ExtensionPoint::ActionPanel(point) => &point.metadata,
        }
    }

    pub fn id(&self) -> &str {
        &self.metadata().id
    }

    pub fn kind(&self) -> ExtensionPointKind {
        match self {
            ExtensionPoint::MenuItem(_) => ExtensionPointKind::MenuItem,
            ExtensionPoint::ContextMenu(_) => ExtensionPointKind::ContextMenu,
            ExtensionPoint::ActionPanel(_) => ExtensionPointKind::ActionPanel,
        }
    }

    pub fn extension_ids(&self) -> Vec<Uuid> {
        match self {
            ExtensionPoint::MenuItem(point) => point.extensions.iter().map(|e| e.id).collect(),
            ExtensionPoint::ContextMenu(point) => point.extensions.iter().map(|e| e.id).collect(),
            ExtensionPoint::ActionPanel(point) => point.extensions.iter().map(|e| e.id).collect(),
        }
    }

    /// Install an extension whose config has not been checked yet.
    pub fn install(&mut self, extension: ResolvedExtension<Value>) -> Result<()> {
        match self {
            ExtensionPoint::MenuItem(point) => {
                let extension = typed(&point.metadata, extension)?;
                point.add_extension(extension);
            }
            ExtensionPoint::ContextMenu(point) => {
                let extension = typed(&point.metadata, extension)?;
                point.add_extension(extension);
            }
            ExtensionPoint::ActionPanel(point) => {
                let extension = typed(&point.metadata, extension)?;
                point.add_extension(extension);
            }
        }
        Ok(())
    }

    /// Ids of every block the extension's pipeline uses, nested pipelines
    /// included.
    pub fn blocks(&self, extension_id: Uuid) -> Result<Vec<String>> {
        let id = &self.metadata().id;
        Ok(match self {
            ExtensionPoint::MenuItem(point) => {
                block_ids(&find_extension(&point.extensions, id, extension_id)?.config.action)
            }
            ExtensionPoint::ContextMenu(point) => {
                block_ids(&find_extension(&point.extensions, id, extension_id)?.config.action)
            }
            ExtensionPoint::ActionPanel(point) => {
                block_ids(&find_extension(&point.extensions, id, extension_id)?.config.body)
            }
        })
    }

    /// Bring the extension point's installed extensions into effect.
    ///
    /// Context menus register their entries; menu items and action panels
    /// are driven by clicks and only report what is installed.
    pub async fn run(&self, runtime: &ExtensionRuntime) -> RunReport {
        let extensions = self.extension_ids().len();
        if extensions == 0 {
            tracing::debug!(
                extension_point_id = %self.id(),
                kind = ?self.kind(),
                "extension point has no installed extensions"
            );
            return RunReport::default();
        }

        match self {
            ExtensionPoint::ContextMenu(point) => point.register_extensions(runtime).await,
            ExtensionPoint::MenuItem(_) | ExtensionPoint::ActionPanel(_) => RunReport {
                extensions,
                failed: 0,
            },
        }
    }
}

impl fmt::Debug for ExtensionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionPoint")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("extensions", &self.extension_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn target_mode_parses_known_modes() {
        assert_eq!("eventTarget".parse::<TargetMode>().unwrap(), TargetMode::EventTarget);
        assert_eq!(
            serde_json::from_value::<TargetMode>(json!("document")).unwrap(),
            TargetMode::Document
        );
        assert_eq!(serde_json::to_value(TargetMode::Legacy).unwrap(), json!("legacy"));
    }

    #[test]
    fn unknown_target_mode_is_a_business_error() {
        let error = "selection".parse::<TargetMode>().unwrap_err();
        assert!(matches!(error, ExtensionError::Business(_)));
        assert_eq!(error.to_string(), "Unknown targetMode: selection");
        assert!(serde_json::from_value::<TargetMode>(json!("selection")).is_err());
    }

    #[test]
    fn click_round_trips_camel_case() {
        let click: ContextMenuClick = serde_json::from_value(json!({
            "target": {"type": "element", "selector": "#row-2"},
            "data": {"selectionText": "hello"},
            "documentUrl": "https://example.test/"
        }))
        .unwrap();
        assert_eq!(click.target, Some(ReaderRoot::Element("#row-2".to_string())));
        assert_eq!(click.data["selectionText"], "hello");
    }
}
