//! Run traces: what each block received and produced.
//!
//! The reducer reports an entry before a block runs and an exit after it
//! finishes, fails or is interrupted. Traces are grouped per extension and
//! are append-only apart from [`TraceSink::clear_extension_traces`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use brickyard_messenger::SerializedError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::BlockConfig;
use crate::error::Result;

/// Reported just before a block runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEntryData {
    pub extension_id: Uuid,
    pub run_id: Uuid,
    pub block_instance_id: Uuid,
    pub block_id: String,
    pub timestamp: DateTime<Utc>,
    /// The context the arguments were rendered against.
    pub template_context: Value,
    pub rendered_args: Value,
}

/// Reported once a block is done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceExitData {
    pub extension_id: Uuid,
    pub run_id: Uuid,
    pub block_instance_id: Uuid,
    pub block_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
    /// The block was not executed (a renderer reached in a headless run).
    #[serde(default)]
    pub skipped_run: bool,
}

/// One block's trace: its entry, and its exit once known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    pub extension_id: Uuid,
    pub run_id: Uuid,
    pub block_instance_id: Uuid,
    pub block_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendered_args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
    #[serde(default)]
    pub skipped_run: bool,
}

impl TraceRecord {
    /// Whether the block has finished.
    pub fn is_final(&self) -> bool {
        self.exit_timestamp.is_some()
    }

    fn from_entry(entry: TraceEntryData) -> Self {
        Self {
            extension_id: entry.extension_id,
            run_id: entry.run_id,
            block_instance_id: entry.block_instance_id,
            block_id: entry.block_id,
            timestamp: entry.timestamp,
            template_context: Some(entry.template_context),
            rendered_args: Some(entry.rendered_args),
            exit_timestamp: None,
            output: None,
            error: None,
            skipped_run: false,
        }
    }

    fn from_exit(exit: TraceExitData) -> Self {
        Self {
            extension_id: exit.extension_id,
            run_id: exit.run_id,
            block_instance_id: exit.block_instance_id,
            block_id: exit.block_id,
            timestamp: exit.timestamp,
            template_context: None,
            rendered_args: None,
            exit_timestamp: Some(exit.timestamp),
            output: exit.output,
            error: exit.error,
            skipped_run: exit.skipped_run,
        }
    }

    fn apply_exit(&mut self, exit: TraceExitData) {
        self.exit_timestamp = Some(exit.timestamp);
        self.output = exit.output;
        self.error = exit.error;
        self.skipped_run = exit.skipped_run;
    }
}

/// Where the reducer reports traces.
#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn add_entry(&self, entry: TraceEntryData) -> Result<()>;

    async fn add_exit(&self, exit: TraceExitData) -> Result<()>;

    async fn clear_extension_traces(&self, extension_id: Uuid) -> Result<()>;
}

/// Drops every trace.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTraceSink;

#[async_trait]
impl TraceSink for NullTraceSink {
    async fn add_entry(&self, _entry: TraceEntryData) -> Result<()> {
        Ok(())
    }

    async fn add_exit(&self, _exit: TraceExitData) -> Result<()> {
        Ok(())
    }

    async fn clear_extension_traces(&self, _extension_id: Uuid) -> Result<()> {
        Ok(())
    }
}

/// In-memory trace store. Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct TraceStore {
    records: Arc<Mutex<BTreeMap<Uuid, Vec<TraceRecord>>>>,
}

impl TraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Uuid, Vec<TraceRecord>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_entry(&self, entry: TraceEntryData) {
        self.lock()
            .entry(entry.extension_id)
            .or_default()
            .push(TraceRecord::from_entry(entry));
    }

    /// Complete the latest open record for the same run and step. An exit
    /// without a matching entry is kept as a record of its own.
    pub fn record_exit(&self, exit: TraceExitData) {
        let mut records = self.lock();
        let traces = records.entry(exit.extension_id).or_default();
        let open = traces.iter_mut().rev().find(|record| {
            record.run_id == exit.run_id
                && record.block_instance_id == exit.block_instance_id
                && !record.is_final()
        });

        match open {
            Some(record) => record.apply_exit(exit),
            None => traces.push(TraceRecord::from_exit(exit)),
        }
    }

    /// Drop every record of an extension. Returns how many were dropped.
    pub fn clear(&self, extension_id: Uuid) -> usize {
        self.lock()
            .remove(&extension_id)
            .map(|records| records.len())
            .unwrap_or(0)
    }

    /// All records of an extension, oldest first.
    pub fn records(&self, extension_id: Uuid) -> Vec<TraceRecord> {
        self.lock().get(&extension_id).cloned().unwrap_or_default()
    }

    /// Records of the extension's most recent run.
    pub fn latest_run(&self, extension_id: Uuid) -> Vec<TraceRecord> {
        let records = self.lock();
        let Some(traces) = records.get(&extension_id) else {
            return Vec::new();
        };
        let Some(run_id) = traces.last().map(|record| record.run_id) else {
            return Vec::new();
        };
        traces
            .iter()
            .filter(|record| record.run_id == run_id)
            .cloned()
            .collect()
    }

    /// The failed record of the most recent run, if that run failed.
    pub fn latest_error(&self, extension_id: Uuid) -> Option<TraceRecord> {
        self.latest_run(extension_id)
            .into_iter()
            .rev()
            .find(|record| record.error.is_some())
    }
}

#[async_trait]
impl TraceSink for TraceStore {
    async fn add_entry(&self, entry: TraceEntryData) -> Result<()> {
        self.record_entry(entry);
        Ok(())
    }

    async fn add_exit(&self, exit: TraceExitData) -> Result<()> {
        self.record_exit(exit);
        Ok(())
    }

    async fn clear_extension_traces(&self, extension_id: Uuid) -> Result<()> {
        let dropped = self.clear(extension_id);
        tracing::debug!(%extension_id, dropped, "cleared traces");
        Ok(())
    }
}

const REQUIRED_FIELD_MESSAGE: &str = "Error from the last run: This field is required";

/// Map a failed trace back onto the fields of the pipeline that produced it.
///
/// Returns `None` if the trace has no error or its step is not part of
/// `pipeline`. Otherwise keys are step indexes; a missing required property
/// becomes `{"<index>": {"config": {"<property>": ...}}}` and any other error
/// becomes `{"<index>": message}`.
pub fn pipeline_field_errors(
    pipeline: &[BlockConfig],
    trace: &TraceRecord,
) -> Option<Map<String, Value>> {
    let error = trace.error.as_ref()?;
    let index = pipeline
        .iter()
        .position(|config| config.instance_id == trace.block_instance_id)?
        .to_string();

    let mut errors = Map::new();
    apply_input_errors(&mut errors, error, &index);
    apply_general_error(&mut errors, error, &index);
    Some(errors)
}

fn apply_input_errors(errors: &mut Map<String, Value>, error: &SerializedError, index: &str) {
    if error.name != "InputValidationError" {
        return;
    }
    let Some(violations) = error
        .data
        .as_ref()
        .and_then(|data| data.get("errors"))
        .and_then(Value::as_array)
    else {
        return;
    };

    for violation in violations {
        match required_property(violation) {
            Some(property) => set_nested(
                errors,
                &[index, "config", &property],
                Value::String(REQUIRED_FIELD_MESSAGE.to_string()),
            ),
            None => set_nested(errors, &[index], Value::String(error.message.clone())),
        }
    }
}

fn apply_general_error(errors: &mut Map<String, Value>, error: &SerializedError, index: &str) {
    // A nested error from the input pass is more precise; keep it.
    if errors.get(index).is_some_and(Value::is_object) {
        return;
    }
    errors.insert(index.to_string(), Value::String(error.message.clone()));
}

/// The property named by a "required" violation.
fn required_property(violation: &Value) -> Option<String> {
    let message = violation.get("error")?.as_str()?;
    let keyword = violation
        .get("keywordLocation")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let is_required = keyword.ends_with("/required")
        || keyword == "required"
        || message.contains("required property");
    if !is_required {
        return None;
    }

    let start = message.find('"')? + 1;
    let end = start + message[start..].find('"')?;
    Some(message[start..end].to_string())
}

fn set_nested(errors: &mut Map<String, Value>, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };

    let mut current = errors;
    for segment in parents {
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = match slot {
            Value::Object(map) => map,
            _ => return,
        };
    }
    current.insert(last.to_string(), value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(extension_id: Uuid, run_id: Uuid, step: Uuid) -> TraceEntryData {
        TraceEntryData {
            extension_id,
            run_id,
            block_instance_id: step,
            block_id: "@brickyard/open-tab".to_string(),
            timestamp: Utc::now(),
            template_context: json!({}),
            rendered_args: json!({"url": "https://a.test"}),
        }
    }

    fn exit(extension_id: Uuid, run_id: Uuid, step: Uuid, error: Option<SerializedError>) -> TraceExitData {
        TraceExitData {
            extension_id,
            run_id,
            block_instance_id: step,
            block_id: "@brickyard/open-tab".to_string(),
            timestamp: Utc::now(),
            output: error.is_none().then(|| json!({"ok": true})),
            error,
            skipped_run: false,
        }
    }

    #[test]
    fn exit_completes_matching_entry() {
        let store = TraceStore::new();
        let (extension, run, step) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        store.record_entry(entry(extension, run, step));
        assert!(!store.records(extension)[0].is_final());

        store.record_exit(exit(extension, run, step, None));
        let records = store.records(extension);
        assert_eq!(records.len(), 1);
        assert!(records[0].is_final());
        assert_eq!(records[0].output, Some(json!({"ok": true})));
        assert_eq!(records[0].rendered_args, Some(json!({"url": "https://a.test"})));
    }

    #[test]
    fn clear_only_touches_one_extension() {
        let store = TraceStore::new();
        let (a, b, run) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.record_entry(entry(a, run, Uuid::new_v4()));
        store.record_entry(entry(a, run, Uuid::new_v4()));
        store.record_entry(entry(b, run, Uuid::new_v4()));

        assert_eq!(store.clear(a), 2);
        assert!(store.records(a).is_empty());
        assert_eq!(store.records(b).len(), 1);
    }

    #[test]
    fn latest_error_looks_at_latest_run() {
        let store = TraceStore::new();
        let extension = Uuid::new_v4();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let step = Uuid::new_v4();

        store.record_entry(entry(extension, first, step));
        store.record_exit(exit(
            extension,
            first,
            step,
            Some(SerializedError::new("BusinessError", "old failure")),
        ));
        assert!(store.latest_error(extension).is_some());

        store.record_entry(entry(extension, second, step));
        store.record_exit(exit(extension, second, step, None));
        assert!(store.latest_error(extension).is_none());
        assert_eq!(store.latest_run(extension).len(), 1);
    }

    #[test]
    fn trace_record_wire_shape() {
        let (extension, run, step) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let record = TraceRecord::from_entry(entry(extension, run, step));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["extensionId"], json!(extension.to_string()));
        assert_eq!(json["blockInstanceId"], json!(step.to_string()));
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
        assert!(json.get("output").is_none());
    }

    fn failed_trace(step: Uuid, error: SerializedError) -> TraceRecord {
        let mut record = TraceRecord::from_entry(entry(Uuid::new_v4(), Uuid::new_v4(), step));
        record.error = Some(error);
        record.exit_timestamp = Some(Utc::now());
        record
    }

    fn pipeline() -> Vec<BlockConfig> {
        vec![
            BlockConfig::new("a", json!({})),
            BlockConfig::new("b", json!({})),
            BlockConfig::new("c", json!({})),
            BlockConfig::new("d", json!({})),
        ]
    }

    #[test]
    fn required_property_maps_to_config_field() {
        let pipeline = pipeline();
        let error = SerializedError::new("InputValidationError", "invalid inputs").with_data(json!({
            "errors": [
                {
                    "instanceLocation": "",
                    "keywordLocation": "/required",
                    "error": "\"url\" is a required property"
                }
            ]
        }));

        let errors =
            pipeline_field_errors(&pipeline, &failed_trace(pipeline[3].instance_id, error)).unwrap();
        assert_eq!(
            Value::Object(errors),
            json!({"3": {"config": {"url": "Error from the last run: This field is required"}}})
        );
    }

    #[test]
    fn draft4_style_required_message_is_understood() {
        let violation = json!({
            "instanceLocation": "#",
            "keywordLocation": "#/required",
            "error": "Instance does not have required property \"spreadsheetId\"."
        });
        assert_eq!(required_property(&violation).as_deref(), Some("spreadsheetId"));
    }

    #[test]
    fn other_validation_errors_map_to_the_step() {
        let pipeline = pipeline();
        let error = SerializedError::new("InputValidationError", "invalid inputs").with_data(json!({
            "errors": [
                {
                    "instanceLocation": "/count",
                    "keywordLocation": "/properties/count/type",
                    "error": "\"three\" is not of type \"integer\""
                }
            ]
        }));

        let errors =
            pipeline_field_errors(&pipeline, &failed_trace(pipeline[1].instance_id, error)).unwrap();
        assert_eq!(Value::Object(errors), json!({"1": "invalid inputs"}));
    }

    #[test]
    fn general_error_sets_step_message() {
        let pipeline = pipeline();
        let error = SerializedError::new("BusinessError", "Test Error");
        let errors =
            pipeline_field_errors(&pipeline, &failed_trace(pipeline[3].instance_id, error)).unwrap();
        assert_eq!(errors.get("3"), Some(&json!("Test Error")));
    }

    #[test]
    fn general_error_does_not_override_nested_error() {
        let mut errors = Map::new();
        set_nested(&mut errors, &["3", "config", "name"], json!("required"));
        apply_general_error(&mut errors, &SerializedError::new("Error", "Test Error"), "3");
        assert_eq!(errors["3"], json!({"config": {"name": "required"}}));
    }

    #[test]
    fn unrelated_traces_yield_nothing() {
        let pipeline = pipeline();
        let error = SerializedError::new("BusinessError", "Test Error");
        assert!(pipeline_field_errors(&pipeline, &failed_trace(Uuid::new_v4(), error)).is_none());

        let ok = TraceRecord::from_entry(entry(Uuid::new_v4(), Uuid::new_v4(), pipeline[0].instance_id));
        assert!(pipeline_field_errors(&pipeline, &ok).is_none());
    }
}
