//! Binding service dependencies into a run's context.
//!
//! An extension declares the services it needs (`{id, outputKey, config}`).
//! Before a run, each dependency is located and its sanitized configuration
//! is exposed to blocks as `@<outputKey>`, alongside a `__service` entry
//! describing the configuration itself.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::error::{PipelineError, Result};

/// A service an extension depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDependency {
    /// Registry id of the service, e.g. `google/sheet`.
    pub id: String,
    /// Name blocks use to refer to the service, without the `@`.
    pub output_key: String,
    /// Which configuration of the service to use. `None` lets the locator
    /// pick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

/// A located service configuration with secrets removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizedServiceConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub service_id: String,
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Requests go through the server-side proxy.
    #[serde(default)]
    pub proxy: bool,
}

/// Finds service configurations.
#[async_trait]
pub trait ServiceLocator: Send + Sync {
    async fn locate(
        &self,
        service_id: &str,
        id: Option<&str>,
    ) -> Result<SanitizedServiceConfiguration>;
}

/// Read-only services visible to a run, keyed `@<outputKey>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceContext(BTreeMap<String, Value>);

impl ServiceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> BTreeSet<String> {
        self.0.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Bind a service configuration under `@<output_key>`.
    pub fn insert(
        &mut self,
        output_key: &str,
        configuration: &SanitizedServiceConfiguration,
    ) -> Result<()> {
        let key = format!("@{}", output_key);
        if self.0.contains_key(&key) {
            return Err(PipelineError::business(format!(
                "Service output key {} is used more than once",
                key
            )));
        }

        let mut value = configuration.config.clone();
        value.insert(
            "__service".to_string(),
            serde_json::to_value(configuration)?,
        );
        self.0.insert(key, Value::Object(value));
        Ok(())
    }
}

/// Locate every dependency and bind it into a [`ServiceContext`].
///
/// Any dependency that cannot be located fails the whole call with
/// [`PipelineError::ServiceNotConfigured`].
pub async fn make_service_context(
    dependencies: &[ServiceDependency],
    locator: &dyn ServiceLocator,
) -> Result<ServiceContext> {
    let mut context = ServiceContext::new();

    for dependency in dependencies {
        let configuration = locator
            .locate(&dependency.id, dependency.config.as_deref())
            .await
            .map_err(|error| match error {
                PipelineError::ServiceNotConfigured { .. } => error,
                other => PipelineError::ServiceNotConfigured {
                    service_id: dependency.id.clone(),
                    id: dependency.config.clone(),
                    reason: other.to_string(),
                },
            })?;

        context.insert(&dependency.output_key, &configuration)?;
        tracing::debug!(
            service_id = %dependency.id,
            output_key = %dependency.output_key,
            "bound service"
        );
    }

    Ok(context)
}

/// Locator over a fixed list of configurations.
#[derive(Debug, Clone, Default)]
pub struct StaticLocator {
    configurations: Vec<SanitizedServiceConfiguration>,
}

impl StaticLocator {
    pub fn new(configurations: Vec<SanitizedServiceConfiguration>) -> Self {
        Self { configurations }
    }
}

#[async_trait]
impl ServiceLocator for StaticLocator {
    async fn locate(
        &self,
        service_id: &str,
        id: Option<&str>,
    ) -> Result<SanitizedServiceConfiguration> {
        self.configurations
            .iter()
            .find(|configuration| {
                configuration.service_id == service_id
                    && id.map_or(true, |id| configuration.id.as_deref() == Some(id))
            })
            .cloned()
            .ok_or_else(|| PipelineError::ServiceNotConfigured {
                service_id: service_id.to_string(),
                id: id.map(str::to_string),
                reason: "no matching configuration".to_string(),
            })
    }
}

type LocatorKey = (String, Option<String>);

/// Caches another locator's answers until [`CachedLocator::refresh`].
pub struct CachedLocator {
    inner: Arc<dyn ServiceLocator>,
    cache: RwLock<BTreeMap<LocatorKey, SanitizedServiceConfiguration>>,
}

impl CachedLocator {
    pub fn new(inner: Arc<dyn ServiceLocator>) -> Self {
        Self {
            inner,
            cache: RwLock::new(BTreeMap::new()),
        }
    }

    /// Forget everything located so far.
    pub async fn refresh(&self) {
        let mut cache = self.cache.write().await;
        let dropped = cache.len();
        cache.clear();
        tracing::debug!(dropped, "refreshed service locator");
    }
}

#[async_trait]
impl ServiceLocator for CachedLocator {
    async fn locate(
        &self,
        service_id: &str,
        id: Option<&str>,
    ) -> Result<SanitizedServiceConfiguration> {
        let key = (service_id.to_string(), id.map(str::to_string));
        if let Some(hit) = self.cache.read().await.get(&key) {
            return Ok(hit.clone());
        }

        let configuration = self.inner.locate(service_id, id).await?;
        self.cache.write().await.insert(key, configuration.clone());
        Ok(configuration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sheet() -> SanitizedServiceConfiguration {
        SanitizedServiceConfiguration {
            id: Some("cfg-1".to_string()),
            service_id: "google/sheet".to_string(),
            config: match json!({"spreadsheetId": "abc"}) {
                Value::Object(map) => map,
                _ => unreachable!(),
            },
            proxy: false,
        }
    }

    fn dependency(output_key: &str) -> ServiceDependency {
        ServiceDependency {
            id: "google/sheet".to_string(),
            output_key: output_key.to_string(),
            config: Some("cfg-1".to_string()),
        }
    }

    #[tokio::test]
    async fn binds_services_under_output_keys() {
        let locator = StaticLocator::new(vec![sheet()]);
        let context = make_service_context(&[dependency("sheet")], &locator)
            .await
            .unwrap();

        let bound = context.get("@sheet").unwrap();
        assert_eq!(bound["spreadsheetId"], "abc");
        assert_eq!(bound["__service"]["serviceId"], "google/sheet");
        assert_eq!(context.keys().into_iter().collect::<Vec<_>>(), vec!["@sheet"]);
    }

    #[tokio::test]
    async fn missing_service_fails_whole_call() {
        let locator = StaticLocator::new(vec![sheet()]);
        let missing = ServiceDependency {
            id: "slack/webhook".to_string(),
            output_key: "slack".to_string(),
            config: None,
        };

        let err = make_service_context(&[dependency("sheet"), missing], &locator)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ServiceNotConfigured { ref service_id, .. } if service_id == "slack/webhook"
        ));
    }

    #[tokio::test]
    async fn duplicate_output_keys_are_rejected() {
        let locator = StaticLocator::new(vec![sheet()]);
        let err = make_service_context(&[dependency("sheet"), dependency("sheet")], &locator)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Business(_)));
    }

    struct CountingLocator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ServiceLocator for CountingLocator {
        async fn locate(
            &self,
            _service_id: &str,
            _id: Option<&str>,
        ) -> Result<SanitizedServiceConfiguration> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(sheet())
        }
    }

    #[tokio::test]
    async fn cached_locator_until_refresh() {
        let counting = Arc::new(CountingLocator {
            calls: AtomicUsize::new(0),
        });
        let cached = CachedLocator::new(counting.clone());

        cached.locate("google/sheet", Some("cfg-1")).await.unwrap();
        cached.locate("google/sheet", Some("cfg-1")).await.unwrap();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);

        cached.refresh().await;
        cached.locate("google/sheet", Some("cfg-1")).await.unwrap();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
    }
}
