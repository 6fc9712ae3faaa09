//! Input validation against a block's JSON Schema (draft 7).

use serde_json::Value;

use crate::error::{PipelineError, Result, SchemaViolation};

/// Check rendered arguments against `schema`.
///
/// Every violation is reported, not just the first.
pub fn validate_input(block_id: &str, schema: &Value, input: &Value) -> Result<()> {
    let validator = jsonschema::draft7::new(schema).map_err(|e| {
        PipelineError::InvalidConfig(format!("invalid input schema for {}: {}", block_id, e))
    })?;

    let errors: Vec<SchemaViolation> = validator
        .iter_errors(input)
        .map(|error| SchemaViolation {
            instance_location: error.instance_path.to_string(),
            keyword_location: error.schema_path.to_string(),
            error: error.to_string(),
        })
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::InputValidation {
            block_id: block_id.to_string(),
            schema: schema.clone(),
            input: input.clone(),
            errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string"},
                "count": {"type": "integer"}
            },
            "required": ["url"]
        })
    }

    #[test]
    fn valid_input_passes() {
        assert!(validate_input("@brickyard/open-tab", &schema(), &json!({"url": "https://a.test"})).is_ok());
    }

    #[test]
    fn reports_every_violation() {
        let err = validate_input("@brickyard/open-tab", &schema(), &json!({"count": "three"}))
            .unwrap_err();

        match err {
            PipelineError::InputValidation { block_id, errors, input, .. } => {
                assert_eq!(block_id, "@brickyard/open-tab");
                assert_eq!(input, json!({"count": "three"}));
                assert_eq!(errors.len(), 2);
                assert!(errors
                    .iter()
                    .any(|violation| violation.keyword_location.ends_with("required")
                        && violation.error.contains("url")));
                assert!(errors
                    .iter()
                    .any(|violation| violation.instance_location == "/count"));
            }
            other => panic!("expected an input validation error, got {:?}", other),
        }
    }

    #[test]
    fn broken_schema_is_a_config_error() {
        let err = validate_input("x", &json!({"type": 12}), &json!({})).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }
}
