//! Methods the background context serves, and the stubs other contexts use
//! to reach them.
//!
//! The background owns run traces, context menu entries and service
//! configurations. A content script runs pipelines locally but reports
//! traces through a [`RemoteTraceSink`], registers menus through a
//! [`RemoteMenuHost`] and locates services through a [`RemoteLocator`].

use std::sync::Arc;

use async_trait::async_trait;
use brickyard_messenger::{
    CallerInfo, Endpoint, MethodRegistry, RemoteMethod, Result as MessengerResult,
    SerializedError,
};
use brickyard_pipeline::{
    CachedLocator, PipelineError, SanitizedServiceConfiguration, ServiceLocator, TraceEntryData,
    TraceExitData, TraceRecord, TraceSink, TraceStore,
};
use uuid::Uuid;

use crate::error::Result;
use crate::menus::{MenuHost, MenuRegistry, MenuSpec};

pub const RECORD_TRACE_ENTRY: &str = "RECORD_TRACE_ENTRY";
pub const RECORD_TRACE_EXIT: &str = "RECORD_TRACE_EXIT";
pub const CLEAR_EXTENSION_TRACES: &str = "CLEAR_EXTENSION_TRACES";
pub const GET_LATEST_TRACES: &str = "GET_LATEST_TRACES";
pub const ENSURE_CONTEXT_MENU: &str = "ENSURE_CONTEXT_MENU";
pub const UNINSTALL_CONTEXT_MENU: &str = "UNINSTALL_CONTEXT_MENU";
pub const LOCATE_SERVICE: &str = "LOCATE_SERVICE";
pub const REFRESH_SERVICES: &str = "REFRESH_SERVICES";

/// State the background serves to other contexts.
#[derive(Clone)]
pub struct BackgroundState {
    pub traces: TraceStore,
    pub menus: MenuRegistry,
    pub locator: Arc<CachedLocator>,
}

impl BackgroundState {
    pub fn new(locator: Arc<dyn ServiceLocator>) -> Self {
        Self {
            traces: TraceStore::new(),
            menus: MenuRegistry::new(),
            locator: Arc::new(CachedLocator::new(locator)),
        }
    }
}

/// Register every background method on `registry`.
pub fn register_background_methods(
    registry: &mut MethodRegistry,
    state: &BackgroundState,
) -> MessengerResult<()> {
    let traces = state.traces.clone();
    registry.register_fn(
        RECORD_TRACE_ENTRY,
        move |(entry,): (TraceEntryData,), _caller: CallerInfo| {
            let traces = traces.clone();
            async move {
                traces.record_entry(entry);
                Ok::<_, SerializedError>(())
            }
        },
    )?;

    let traces = state.traces.clone();
    registry.register_fn(
        RECORD_TRACE_EXIT,
        move |(exit,): (TraceExitData,), _caller: CallerInfo| {
            let traces = traces.clone();
            async move {
                traces.record_exit(exit);
                Ok::<_, SerializedError>(())
            }
        },
    )?;

    let traces = state.traces.clone();
    registry.register_fn(
        CLEAR_EXTENSION_TRACES,
        move |(extension_id,): (Uuid,), _caller: CallerInfo| {
            let traces = traces.clone();
            async move {
                let dropped = traces.clear(extension_id);
                tracing::debug!(%extension_id, dropped, "cleared traces");
                Ok::<_, SerializedError>(dropped)
            }
        },
    )?;

    let traces = state.traces.clone();
    registry.register_fn(
        GET_LATEST_TRACES,
        move |(extension_id,): (Uuid,), _caller: CallerInfo| {
            let traces = traces.clone();
            async move { Ok::<_, SerializedError>(traces.latest_run(extension_id)) }
        },
    )?;

    let menus = state.menus.clone();
    registry.register_fn(
        ENSURE_CONTEXT_MENU,
        move |(spec,): (MenuSpec,), _caller: CallerInfo| {
            let menus = menus.clone();
            async move { menus.ensure(spec).await.map_err(SerializedError::from) }
        },
    )?;

    let menus = state.menus.clone();
    registry.register_fn(
        UNINSTALL_CONTEXT_MENU,
        move |(extension_id,): (Uuid,), _caller: CallerInfo| {
            let menus = menus.clone();
            async move { menus.uninstall(extension_id).await.map_err(SerializedError::from) }
        },
    )?;

    let locator = state.locator.clone();
    registry.register_fn(
        LOCATE_SERVICE,
        move |(service_id, id): (String, Option<String>), _caller: CallerInfo| {
            let locator = locator.clone();
            async move {
                locator
                    .locate(&service_id, id.as_deref())
                    .await
                    .map_err(SerializedError::from)
            }
        },
    )?;

    let locator = state.locator.clone();
    registry.register_fn(REFRESH_SERVICES, move |(): (), _caller: CallerInfo| {
        let locator = locator.clone();
        async move {
            locator.refresh().await;
            Ok::<_, SerializedError>(())
        }
    })?;

    Ok(())
}

/// Reports traces to the background.
#[derive(Clone)]
pub struct RemoteTraceSink {
    endpoint: Endpoint,
    entry: RemoteMethod<(TraceEntryData,), ()>,
    exit: RemoteMethod<(TraceExitData,), ()>,
    clear: RemoteMethod<(Uuid,), usize>,
}

impl RemoteTraceSink {
    pub fn new(endpoint: Endpoint) -> MessengerResult<Self> {
        Ok(Self {
            endpoint,
            entry: RemoteMethod::background(RECORD_TRACE_ENTRY)?,
            exit: RemoteMethod::background(RECORD_TRACE_EXIT)?,
            clear: RemoteMethod::background(CLEAR_EXTENSION_TRACES)?,
        })
    }
}

#[async_trait]
impl TraceSink for RemoteTraceSink {
    async fn add_entry(&self, entry: TraceEntryData) -> brickyard_pipeline::Result<()> {
        Ok(self.entry.call_background(&self.endpoint, (entry,)).await?)
    }

    async fn add_exit(&self, exit: TraceExitData) -> brickyard_pipeline::Result<()> {
        Ok(self.exit.call_background(&self.endpoint, (exit,)).await?)
    }

    async fn clear_extension_traces(&self, extension_id: Uuid) -> brickyard_pipeline::Result<()> {
        self.clear
            .call_background(&self.endpoint, (extension_id,))
            .await?;
        Ok(())
    }
}

/// Asks the background for the traces of an extension's latest run.
pub async fn latest_traces(endpoint: &Endpoint, extension_id: Uuid) -> Result<Vec<TraceRecord>> {
    let method: RemoteMethod<(Uuid,), Vec<TraceRecord>> = RemoteMethod::new(GET_LATEST_TRACES)?;
    Ok(method.call_background(endpoint, (extension_id,)).await?)
}

/// Manages context menu entries through the background.
#[derive(Clone)]
pub struct RemoteMenuHost {
    endpoint: Endpoint,
    ensure: RemoteMethod<(MenuSpec,), ()>,
    uninstall: RemoteMethod<(Uuid,), bool>,
}

impl RemoteMenuHost {
    pub fn new(endpoint: Endpoint) -> MessengerResult<Self> {
        Ok(Self {
            endpoint,
            ensure: RemoteMethod::background(ENSURE_CONTEXT_MENU)?,
            uninstall: RemoteMethod::background(UNINSTALL_CONTEXT_MENU)?,
        })
    }
}

#[async_trait]
impl MenuHost for RemoteMenuHost {
    async fn ensure(&self, spec: MenuSpec) -> Result<()> {
        Ok(self.ensure.call_background(&self.endpoint, (spec,)).await?)
    }

    async fn uninstall(&self, extension_id: Uuid) -> Result<bool> {
        Ok(self
            .uninstall
            .call_background(&self.endpoint, (extension_id,))
            .await?)
    }
}

/// Locates services through the background.
#[derive(Clone)]
pub struct RemoteLocator {
    endpoint: Endpoint,
    locate: RemoteMethod<(String, Option<String>), SanitizedServiceConfiguration>,
    refresh: RemoteMethod<(), ()>,
}

impl RemoteLocator {
    pub fn new(endpoint: Endpoint) -> MessengerResult<Self> {
        Ok(Self {
            endpoint,
            locate: RemoteMethod::background(LOCATE_SERVICE)?,
            refresh: RemoteMethod::background(REFRESH_SERVICES)?,
        })
    }

    /// Drop the background's cached configurations.
    pub async fn refresh(&self) -> Result<()> {
        Ok(self.refresh.call_background(&self.endpoint, ()).await?)
    }
}

#[async_trait]
impl ServiceLocator for RemoteLocator {
    async fn locate(
        &self,
        service_id: &str,
        id: Option<&str>,
    ) -> brickyard_pipeline::Result<SanitizedServiceConfiguration> {
        self.locate
            .call_background(
                &self.endpoint,
                (service_id.to_string(), id.map(str::to_string)),
            )
            .await
            .map_err(|error| PipelineError::ServiceNotConfigured {
                service_id: service_id.to_string(),
                id: id.map(str::to_string),
                reason: error.to_string(),
            })
    }
}
