//! Pipeline configuration: which blocks to run, with what, in which order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{PipelineError, Result};

/// Built-in conditional block: `{condition, if: Pipeline, else?: Pipeline}`.
pub const IF_ELSE_BLOCK_ID: &str = "@brickyard/if-else";

/// Built-in loop block: `{elements, elementKey?, body: Pipeline}`.
pub const FOR_EACH_BLOCK_ID: &str = "@brickyard/for-each";

/// One step of a pipeline.
///
/// Steps nested in a control-flow config are stored as JSON and parsed
/// when they run, so building a `BlockConfig` writes an `instanceId` into
/// every nested step that lacks one. Re-parsing then yields the same ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawBlockConfig")]
pub struct BlockConfig {
    /// Registry id of the block to run.
    pub id: String,

    /// Arguments, possibly containing `{{ template }}` expressions.
    pub config: Value,

    /// Run the step only when this renders truthy.
    #[serde(rename = "if", skip_serializing_if = "Option::is_none")]
    pub condition: Option<Value>,

    /// Identifies this step in traces and errors.
    pub instance_id: Uuid,

    /// Store the output under `@<output_key>` instead of merging it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBlockConfig {
    id: String,
    #[serde(default)]
    config: Value,
    #[serde(default, rename = "if")]
    condition: Option<Value>,
    #[serde(default = "Uuid::new_v4")]
    instance_id: Uuid,
    #[serde(default)]
    output_key: Option<String>,
    #[serde(default)]
    label: Option<String>,
}

impl From<RawBlockConfig> for BlockConfig {
    fn from(raw: RawBlockConfig) -> Self {
        let mut config = Self {
            id: raw.id,
            config: raw.config,
            condition: raw.condition,
            instance_id: raw.instance_id,
            output_key: raw.output_key,
            label: raw.label,
        };
        config.assign_nested_instance_ids();
        config
    }
}

impl BlockConfig {
    pub fn new(id: impl Into<String>, config: Value) -> Self {
        let mut config = Self {
            id: id.into(),
            config,
            condition: None,
            instance_id: Uuid::new_v4(),
            output_key: None,
            label: None,
        };
        config.assign_nested_instance_ids();
        config
    }

    /// Give every nested step without an `instanceId` a fresh one, at any
    /// depth. Ids already present are kept.
    pub fn assign_nested_instance_ids(&mut self) {
        assign_nested_ids(&self.id, &mut self.config);
    }

    pub fn with_condition(mut self, condition: Value) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_output_key(mut self, output_key: impl Into<String>) -> Self {
        self.output_key = Some(output_key.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn is_control_flow(&self) -> bool {
        self.id == IF_ELSE_BLOCK_ID || self.id == FOR_EACH_BLOCK_ID
    }

    /// Pipelines nested inside a control-flow step.
    pub fn nested_pipelines(&self) -> Result<Vec<Pipeline>> {
        match self.id.as_str() {
            IF_ELSE_BLOCK_ID => {
                let config: IfElseConfig = parse_config(self)?;
                Ok(vec![config.if_true, config.if_false])
            }
            FOR_EACH_BLOCK_ID => {
                let config: ForEachConfig = parse_config(self)?;
                Ok(vec![config.body])
            }
            _ => Ok(Vec::new()),
        }
    }
}

/// An ordered sequence of steps.
pub type Pipeline = Vec<BlockConfig>;

/// A pipeline as authored: a single step or a list of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PipelineInput {
    Many(Pipeline),
    One(BlockConfig),
}

impl PipelineInput {
    pub fn normalize(self) -> Pipeline {
        match self {
            PipelineInput::Many(pipeline) => pipeline,
            PipelineInput::One(config) => vec![config],
        }
    }
}

impl From<BlockConfig> for PipelineInput {
    fn from(config: BlockConfig) -> Self {
        PipelineInput::One(config)
    }
}

impl From<Pipeline> for PipelineInput {
    fn from(pipeline: Pipeline) -> Self {
        PipelineInput::Many(pipeline)
    }
}

/// Config of [`IF_ELSE_BLOCK_ID`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IfElseConfig {
    pub condition: Value,
    #[serde(rename = "if", default)]
    pub if_true: Pipeline,
    #[serde(rename = "else", default)]
    pub if_false: Pipeline,
}

/// Config of [`FOR_EACH_BLOCK_ID`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForEachConfig {
    pub elements: Value,
    #[serde(default = "default_element_key")]
    pub element_key: String,
    #[serde(default)]
    pub body: Pipeline,
}

/// Config keys holding nested pipelines, per control-flow block.
fn nested_pipeline_keys(block_id: &str) -> &'static [&'static str] {
    match block_id {
        IF_ELSE_BLOCK_ID => &["if", "else"],
        FOR_EACH_BLOCK_ID => &["body"],
        _ => &[],
    }
}

fn assign_nested_ids(block_id: &str, config: &mut Value) {
    for key in nested_pipeline_keys(block_id) {
        let Some(Value::Array(steps)) = config.get_mut(*key) else {
            continue;
        };
        for step in steps {
            let Value::Object(step) = step else {
                continue;
            };
            step.entry("instanceId")
                .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
            let id = step
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if let Some(inner) = step.get_mut("config") {
                assign_nested_ids(&id, inner);
            }
        }
    }
}

fn default_element_key() -> String {
    "element".to_string()
}

pub(crate) fn parse_config<T: serde::de::DeserializeOwned>(config: &BlockConfig) -> Result<T> {
    serde_json::from_value(config.config.clone())
        .map_err(|e| PipelineError::InvalidConfig(format!("{}: {}", config.id, e)))
}

/// How block outputs flow into the context of later blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiVersion {
    /// Object outputs without an output key are merged into the context.
    #[default]
    V1,
    /// Same data flow as `V1`.
    V2,
    /// Explicit data flow: only keyed outputs reach later blocks, and the
    /// run's input is available as `@input`.
    V3,
}

impl ApiVersion {
    pub fn merges_outputs(&self) -> bool {
        !matches!(self, ApiVersion::V3)
    }
}

/// Ids of every block used by a pipeline, nested pipelines included, in
/// order of first appearance.
pub fn pipeline_block_ids(pipeline: &[BlockConfig]) -> Vec<String> {
    let mut ids = Vec::new();
    collect_block_ids(pipeline, &mut ids);
    ids
}

fn collect_block_ids(pipeline: &[BlockConfig], ids: &mut Vec<String>) {
    for config in pipeline {
        if !ids.contains(&config.id) {
            ids.push(config.id.clone());
        }
        // Malformed control-flow configs surface when the step runs.
        if let Ok(nested) = config.nested_pipelines() {
            for pipeline in nested {
                collect_block_ids(&pipeline, ids);
            }
        }
    }
}

/// Output keys of every step, nested pipelines included.
pub fn pipeline_output_keys(pipeline: &[BlockConfig]) -> Vec<(Uuid, String)> {
    let mut keys = Vec::new();
    collect_output_keys(pipeline, &mut keys);
    keys
}

fn collect_output_keys(pipeline: &[BlockConfig], keys: &mut Vec<(Uuid, String)>) {
    for config in pipeline {
        if let Some(key) = &config.output_key {
            keys.push((config.instance_id, key.clone()));
        }
        if let Ok(nested) = config.nested_pipelines() {
            for pipeline in nested {
                collect_output_keys(&pipeline, keys);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn block_config_from_json() {
        let config: BlockConfig = serde_json::from_value(json!({
            "id": "@brickyard/open-tab",
            "config": {"url": "{{ url }}"},
            "if": "{{ enabled }}",
            "outputKey": "tab",
            "label": "Open"
        }))
        .unwrap();

        assert_eq!(config.id, "@brickyard/open-tab");
        assert_eq!(config.condition, Some(json!("{{ enabled }}")));
        assert_eq!(config.output_key.as_deref(), Some("tab"));
        assert!(!config.is_control_flow());
    }

    #[test]
    fn single_block_normalizes_to_pipeline() {
        let input: PipelineInput =
            serde_json::from_value(json!({"id": "@brickyard/log", "config": {}})).unwrap();
        let pipeline = input.normalize();
        assert_eq!(pipeline.len(), 1);

        let input: PipelineInput = serde_json::from_value(json!([
            {"id": "a"},
            {"id": "b"}
        ]))
        .unwrap();
        assert_eq!(input.normalize().len(), 2);
    }

    #[test]
    fn block_ids_include_nested_pipelines() {
        let pipeline = vec![
            BlockConfig::new("a", json!({})),
            BlockConfig::new(
                IF_ELSE_BLOCK_ID,
                json!({
                    "condition": true,
                    "if": [{"id": "b"}],
                    "else": [{"id": "a"}, {"id": FOR_EACH_BLOCK_ID, "config": {
                        "elements": [],
                        "body": [{"id": "c", "outputKey": "inner"}]
                    }}]
                }),
            ),
        ];

        assert_eq!(
            pipeline_block_ids(&pipeline),
            vec!["a", IF_ELSE_BLOCK_ID, "b", FOR_EACH_BLOCK_ID, "c"]
        );
        let keys: Vec<String> = pipeline_output_keys(&pipeline)
            .into_iter()
            .map(|(_, key)| key)
            .collect();
        assert_eq!(keys, vec!["inner"]);
    }

    #[test]
    fn nested_instance_ids_survive_reparsing() {
        let kept = Uuid::new_v4();
        let config: BlockConfig = serde_json::from_value(json!({
            "id": IF_ELSE_BLOCK_ID,
            "config": {
                "condition": true,
                "if": [{"id": "a", "instanceId": kept}],
                "else": [{"id": FOR_EACH_BLOCK_ID, "config": {
                    "elements": [1],
                    "body": [{"id": "b"}]
                }}]
            }
        }))
        .unwrap();

        let ids = |config: &BlockConfig| {
            let nested = config.nested_pipelines().unwrap();
            let inner = nested[1][0].nested_pipelines().unwrap();
            (nested[0][0].instance_id, nested[1][0].instance_id, inner[0][0].instance_id)
        };
        let first = ids(&config);
        assert_eq!(first.0, kept);
        assert_eq!(ids(&config), first);

        let reloaded: BlockConfig =
            serde_json::from_value(serde_json::to_value(&config).unwrap()).unwrap();
        assert_eq!(reloaded, config);
        assert_eq!(ids(&reloaded), first);
    }

    #[test]
    fn for_each_defaults() {
        let config = BlockConfig::new(FOR_EACH_BLOCK_ID, json!({"elements": [1, 2]}));
        let parsed: ForEachConfig = parse_config(&config).unwrap();
        assert_eq!(parsed.element_key, "element");
        assert!(parsed.body.is_empty());
    }

    #[test]
    fn malformed_control_flow_config() {
        let config = BlockConfig::new(IF_ELSE_BLOCK_ID, json!({"if": []}));
        let err = config.nested_pipelines().unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn api_version_wire_shape() {
        assert_eq!(serde_json::to_value(ApiVersion::V3).unwrap(), json!("v3"));
        assert!(ApiVersion::default().merges_outputs());
        assert!(!ApiVersion::V3.merges_outputs());
    }
}
