//! `{{ path }}` templates and condition truthiness.
//!
//! A string that is exactly one placeholder renders to the raw value at the
//! path, so `"{{ @sheet.rows }}"` yields an array rather than text.
//! Placeholders embedded in longer strings are interpolated as text.
//! Missing paths render as `null` (or the empty string when interpolated).

use serde_json::{Map, Value};

use crate::error::{PipelineError, Result};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Render every template string inside `template` against `ctxt`.
pub fn render(template: &Value, ctxt: &Map<String, Value>) -> Result<Value> {
    match template {
        Value::String(text) => render_str(text, ctxt),
        Value::Array(items) => items
            .iter()
            .map(|item| render(item, ctxt))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut rendered = Map::with_capacity(map.len());
            for (key, value) in map {
                rendered.insert(key.clone(), render(value, ctxt)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

fn render_str(text: &str, ctxt: &Map<String, Value>) -> Result<Value> {
    if let Some(path) = sole_placeholder(text) {
        return Ok(lookup(ctxt, parse_path(path)?).cloned().unwrap_or(Value::Null));
    }

    let mut output = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        let after_open = &rest[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            break;
        };

        output.push_str(&rest[..start]);
        let value = lookup(ctxt, parse_path(&after_open[..end])?);
        output.push_str(&to_text(value));
        rest = &after_open[end + CLOSE.len()..];
    }
    output.push_str(rest);

    Ok(Value::String(output))
}

/// The path of a string consisting of a single placeholder.
fn sole_placeholder(text: &str) -> Option<&str> {
    let inner = text.trim().strip_prefix(OPEN)?.strip_suffix(CLOSE)?;
    if inner.contains(OPEN) || inner.contains(CLOSE) {
        None
    } else {
        Some(inner)
    }
}

fn parse_path(expression: &str) -> Result<Vec<&str>> {
    let expression = expression.trim();
    if expression.is_empty() {
        return Err(PipelineError::InvalidConfig(
            "empty template expression".to_string(),
        ));
    }

    let segments: Vec<&str> = expression.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(PipelineError::InvalidConfig(format!(
            "invalid template expression: {}",
            expression
        )));
    }
    Ok(segments)
}

fn to_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

/// Follow `path` from the context root. Numeric segments index arrays.
pub fn lookup<'a, S: AsRef<str>>(ctxt: &'a Map<String, Value>, path: impl IntoIterator<Item = S>) -> Option<&'a Value> {
    let mut segments = path.into_iter();
    let first = segments.next()?;
    let mut current = ctxt.get(first.as_ref())?;

    for segment in segments {
        let segment = segment.as_ref();
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Coerce a rendered value to a boolean.
///
/// `null`, `false`, `0` and the strings `""`, `"false"`, `"f"`, `"no"`,
/// `"n"`, `"off"` and `"0"` (in any case, ignoring surrounding whitespace)
/// are false. Everything else is true.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "" | "false" | "f" | "no" | "n" | "off" | "0"
        ),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Render `condition` and coerce the result.
pub fn evaluate_condition(condition: &Value, ctxt: &Map<String, Value>) -> Result<bool> {
    Ok(is_truthy(&render(condition, ctxt)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctxt() -> Map<String, Value> {
        match json!({
            "name": "Ada",
            "count": 3,
            "rows": [{"title": "first"}, {"title": "second"}],
            "@sheet": {"token": "abc", "enabled": "no"},
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn sole_placeholder_keeps_type() {
        assert_eq!(render(&json!("{{ count }}"), &ctxt()).unwrap(), json!(3));
        assert_eq!(
            render(&json!("{{rows}}"), &ctxt()).unwrap(),
            json!([{"title": "first"}, {"title": "second"}])
        );
        assert_eq!(render(&json!("{{ missing }}"), &ctxt()).unwrap(), Value::Null);
    }

    #[test]
    fn embedded_placeholders_interpolate() {
        assert_eq!(
            render(&json!("Hello {{ name }}, you have {{ count }} rows"), &ctxt()).unwrap(),
            json!("Hello Ada, you have 3 rows")
        );
        assert_eq!(
            render(&json!("[{{ missing }}]"), &ctxt()).unwrap(),
            json!("[]")
        );
    }

    #[test]
    fn paths_reach_into_services_and_arrays() {
        assert_eq!(
            render(&json!("{{ @sheet.token }}"), &ctxt()).unwrap(),
            json!("abc")
        );
        assert_eq!(
            render(&json!("{{ rows.1.title }}"), &ctxt()).unwrap(),
            json!("second")
        );
        assert_eq!(render(&json!("{{ rows.9.title }}"), &ctxt()).unwrap(), Value::Null);
    }

    #[test]
    fn renders_nested_structures() {
        let template = json!({
            "greeting": "Hi {{ name }}",
            "items": ["{{ count }}", 7, true],
            "token": "{{ @sheet.token }}"
        });
        assert_eq!(
            render(&template, &ctxt()).unwrap(),
            json!({"greeting": "Hi Ada", "items": [3, 7, true], "token": "abc"})
        );
    }

    #[test]
    fn unclosed_placeholder_is_literal() {
        assert_eq!(
            render(&json!("a {{ name"), &ctxt()).unwrap(),
            json!("a {{ name")
        );
    }

    #[test]
    fn empty_expression_is_an_error() {
        assert!(render(&json!("{{ }}"), &ctxt()).is_err());
        assert!(render(&json!("{{ a..b }}"), &ctxt()).is_err());
    }

    #[test]
    fn truthiness() {
        for falsy in [
            json!(null),
            json!(false),
            json!(0),
            json!(""),
            json!("false"),
            json!("F"),
            json!(" no "),
            json!("n"),
            json!("OFF"),
            json!("0"),
        ] {
            assert!(!is_truthy(&falsy), "{} should be falsy", falsy);
        }
        for truthy in [json!(true), json!(1), json!("yes"), json!([]), json!({})] {
            assert!(is_truthy(&truthy), "{} should be truthy", truthy);
        }
    }

    #[test]
    fn conditions() {
        assert!(evaluate_condition(&json!(true), &ctxt()).unwrap());
        assert!(evaluate_condition(&json!("{{ name }}"), &ctxt()).unwrap());
        assert!(!evaluate_condition(&json!("{{ @sheet.enabled }}"), &ctxt()).unwrap());
        assert!(!evaluate_condition(&json!("{{ missing }}"), &ctxt()).unwrap());
    }
}
