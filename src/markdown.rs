use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// Renders any serializable value as a Markdown bullet list, for use in system prompts.
/// Fields appear in the order the value serializes them.
pub fn to_markdown<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    let mut lines = Vec::new();
    render(&value, 0, &mut lines);
    Ok(lines.join("\n"))
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some("_none_".to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

fn render(value: &Value, depth: usize, lines: &mut Vec<String>) {
    let pad = "  ".repeat(depth);
    match value {
        Value::Object(map) => {
            for (key, field) in map {
                match scalar(field) {
                    Some(text) => lines.push(format!("{pad}- **{key}**: {text}")),
                    None => {
                        lines.push(format!("{pad}- **{key}**:"));
                        render(field, depth + 1, lines);
                    }
                }
            }
        }
        Value::Array(items) if items.is_empty() => lines.push(format!("{pad}- _none_")),
        Value::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                match scalar(item) {
                    Some(text) => lines.push(format!("{pad}- {text}")),
                    None => {
                        lines.push(format!("{pad}{}.", idx + 1));
                        render(item, depth + 1, lines);
                    }
                }
            }
        }
        other => {
            if let Some(text) = scalar(other) {
                lines.push(format!("{pad}{text}"));
            }
        }
    }
}
