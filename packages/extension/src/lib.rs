//! # Brickyard Extension
//!
//! Extension points and the methods each browser context serves.
//!
//! - [`extension_point`]: menu items, context menus and action panels, each
//!   running an extension's pipeline through a shared [`ExtensionRuntime`].
//! - [`background`]: trace, menu and service methods owned by the
//!   background, with the stubs content scripts use to reach them.
//! - [`content`]: the content script's `RUN_BROWSER_ACTION` method.
//!
//! A content script is typically wired like this:
//!
//! ```ignore
//! let panels = ActionPanels::new();
//! let mut registry = MethodRegistry::new();
//! register_content_methods(&mut registry, panels.clone())?;
//!
//! let tab = hub.connect(ContextAddress::tab(tab_id), registry)?;
//! let reducer = Reducer::new(blocks).with_tracer(Arc::new(RemoteTraceSink::new(tab.clone())?));
//! let runtime = ExtensionRuntime::new(
//!     reducer,
//!     Arc::new(RemoteLocator::new(tab.clone())?),
//!     Arc::new(RemoteMenuHost::new(tab.clone())?),
//! );
//! panels.set_runtime(runtime).await;
//! ```

pub mod background;
pub mod content;
pub mod error;
pub mod extension;
pub mod extension_point;
pub mod menus;

pub use background::{
    latest_traces, register_background_methods, BackgroundState, RemoteLocator, RemoteMenuHost,
    RemoteTraceSink, CLEAR_EXTENSION_TRACES, ENSURE_CONTEXT_MENU, GET_LATEST_TRACES,
    LOCATE_SERVICE, RECORD_TRACE_ENTRY, RECORD_TRACE_EXIT, REFRESH_SERVICES,
    UNINSTALL_CONTEXT_MENU,
};
pub use content::{
    register_content_methods, run_browser_action, ActionPanels, BrowserActionRequest,
    RUN_BROWSER_ACTION,
};
pub use error::{ExtensionError, Result};
pub use extension::{Deployment, Metadata, ResolvedExtension};
pub use extension_point::{
    ActionPanelConfig, ActionPanelExtensionPoint, ContextMenuClick, ContextMenuConfig,
    ContextMenuExtensionPoint, ExtensionPoint, ExtensionPointKind, ExtensionRuntime,
    MenuItemConfig, MenuItemExtensionPoint, RendererData, RunReport, TargetMode,
};
pub use menus::{MenuHost, MenuRegistry, MenuSpec};
