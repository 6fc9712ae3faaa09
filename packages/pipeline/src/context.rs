//! The per-run execution context blocks read from and write to.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::block::ReaderRoot;
use crate::config::{pipeline_output_keys, ApiVersion, BlockConfig};
use crate::error::{PipelineError, Result};
use crate::services::ServiceContext;

/// Key under which the run's input is exposed in [`ApiVersion::V3`] runs.
pub const INPUT_KEY: &str = "@input";

/// Key under which extension option values are exposed.
pub const OPTIONS_KEY: &str = "@options";

/// What a run starts from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InitialValues {
    /// Usually the output of the extension point's reader.
    pub input: Value,
    pub root: ReaderRoot,
    pub service_context: ServiceContext,
    /// Values the user configured for the extension's options.
    pub options_args: Map<String, Value>,
}

impl InitialValues {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            ..Default::default()
        }
    }

    pub fn with_services(mut self, service_context: ServiceContext) -> Self {
        self.service_context = service_context;
        self
    }

    pub fn with_root(mut self, root: ReaderRoot) -> Self {
        self.root = root;
        self
    }

    pub fn with_options_args(mut self, options_args: Map<String, Value>) -> Self {
        self.options_args = options_args;
        self
    }
}

/// Values visible to the blocks of one run.
///
/// Service entries are read-only: neither the input nor any block output
/// may replace them.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    values: Map<String, Value>,
    service_keys: BTreeSet<String>,
    api_version: ApiVersion,
}

impl ExecutionContext {
    pub fn new(initial: &InitialValues, api_version: ApiVersion) -> Result<Self> {
        let mut values = Map::new();

        if api_version.merges_outputs() {
            if let Value::Object(input) = &initial.input {
                values.extend(input.clone());
            }
        } else {
            values.insert(INPUT_KEY.to_string(), initial.input.clone());
        }

        if !initial.options_args.is_empty() {
            values.insert(
                OPTIONS_KEY.to_string(),
                Value::Object(initial.options_args.clone()),
            );
        }

        let service_keys = initial.service_context.keys();
        for (key, value) in initial.service_context.iter() {
            if values.contains_key(key) {
                return Err(PipelineError::business(format!(
                    "Input shadows service key {}",
                    key
                )));
            }
            values.insert(key.clone(), value.clone());
        }

        Ok(Self {
            values,
            service_keys,
            api_version,
        })
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn api_version(&self) -> ApiVersion {
        self.api_version
    }

    pub fn snapshot(&self) -> Value {
        Value::Object(self.values.clone())
    }

    /// Reject pipelines whose output keys would replace a service, before
    /// any block runs.
    pub fn check_output_keys(&self, pipeline: &[BlockConfig]) -> Result<()> {
        for (_, key) in pipeline_output_keys(pipeline) {
            self.ensure_not_service(&format!("@{}", key))?;
        }
        Ok(())
    }

    fn ensure_not_service(&self, key: &str) -> Result<()> {
        if self.service_keys.contains(key) {
            Err(PipelineError::business(format!(
                "Block output key shadows service key {}",
                key
            )))
        } else {
            Ok(())
        }
    }

    /// Bind `value` under `key` for the rest of this context's life.
    pub fn bind(&mut self, key: &str, value: Value) -> Result<()> {
        self.ensure_not_service(key)?;
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    /// Make a step's output visible to later steps.
    ///
    /// Keyed outputs are stored under `@<output_key>`. Un-keyed object
    /// outputs are merged into the context unless the run uses
    /// [`ApiVersion::V3`]; other un-keyed outputs are dropped.
    pub fn merge_output(&mut self, config: &BlockConfig, output: &Value) -> Result<()> {
        if let Some(output_key) = &config.output_key {
            return self.bind(&format!("@{}", output_key), output.clone());
        }

        if !self.api_version.merges_outputs() {
            return Ok(());
        }

        if let Value::Object(fields) = output {
            for key in fields.keys() {
                self.ensure_not_service(key)?;
            }
            self.values.extend(fields.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::SanitizedServiceConfiguration;
    use serde_json::json;

    fn services() -> ServiceContext {
        let mut context = ServiceContext::new();
        context
            .insert(
                "sheet",
                &SanitizedServiceConfiguration {
                    id: None,
                    service_id: "google/sheet".to_string(),
                    config: Map::new(),
                    proxy: false,
                },
            )
            .unwrap();
        context
    }

    #[test]
    fn v1_spreads_input_and_merges_outputs() {
        let initial = InitialValues::new(json!({"title": "Page"})).with_services(services());
        let mut ctxt = ExecutionContext::new(&initial, ApiVersion::V1).unwrap();
        assert_eq!(ctxt.get("title"), Some(&json!("Page")));
        assert!(ctxt.get("@sheet").is_some());

        ctxt.merge_output(&BlockConfig::new("a", json!({})), &json!({"count": 1}))
            .unwrap();
        assert_eq!(ctxt.get("count"), Some(&json!(1)));

        ctxt.merge_output(
            &BlockConfig::new("b", json!({})).with_output_key("rows"),
            &json!([1, 2]),
        )
        .unwrap();
        assert_eq!(ctxt.get("@rows"), Some(&json!([1, 2])));
        assert_eq!(ctxt.get("rows"), None);
    }

    #[test]
    fn v3_exposes_input_and_ignores_unkeyed_outputs() {
        let initial = InitialValues::new(json!({"title": "Page"}));
        let mut ctxt = ExecutionContext::new(&initial, ApiVersion::V3).unwrap();
        assert_eq!(ctxt.get("@input"), Some(&json!({"title": "Page"})));
        assert_eq!(ctxt.get("title"), None);

        ctxt.merge_output(&BlockConfig::new("a", json!({})), &json!({"count": 1}))
            .unwrap();
        assert_eq!(ctxt.get("count"), None);
    }

    #[test]
    fn options_args_are_exposed() {
        let mut options = Map::new();
        options.insert("channel".to_string(), json!("#general"));
        let initial = InitialValues::new(Value::Null).with_options_args(options);
        let ctxt = ExecutionContext::new(&initial, ApiVersion::V1).unwrap();
        assert_eq!(ctxt.get("@options"), Some(&json!({"channel": "#general"})));
    }

    #[test]
    fn outputs_cannot_shadow_services() {
        let initial = InitialValues::new(json!({})).with_services(services());
        let mut ctxt = ExecutionContext::new(&initial, ApiVersion::V1).unwrap();

        let keyed = BlockConfig::new("a", json!({})).with_output_key("sheet");
        assert!(ctxt.check_output_keys(&[keyed.clone()]).is_err());
        assert!(matches!(
            ctxt.merge_output(&keyed, &json!(1)),
            Err(PipelineError::Business(_))
        ));

        let flat = BlockConfig::new("b", json!({}));
        assert!(ctxt.merge_output(&flat, &json!({"@sheet": 1})).is_err());
        assert!(ctxt.get("@sheet").unwrap().is_object());
    }

    #[test]
    fn input_cannot_shadow_services() {
        let initial = InitialValues::new(json!({"@sheet": "mine"})).with_services(services());
        let err = ExecutionContext::new(&initial, ApiVersion::V1).unwrap_err();
        assert!(matches!(err, PipelineError::Business(_)));
    }
}
