//! Validation of the model's final answer against the agent's declared result type.

use std::marker::PhantomData;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{AgentError, Result};

/// Turns the raw text of a final model answer into the agent's output type.
pub trait OutputSchema<O>: Send + Sync {
    /// Schema sent to the provider, `None` for free-form text.
    fn json_schema(&self) -> Option<Value>;

    /// Short identifier for the output type, used in `response_format`.
    fn name(&self) -> &str;

    fn parse(&self, raw: &str) -> Result<O>;
}

/// Accepts any text unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextOutput;

impl OutputSchema<String> for TextOutput {
    fn json_schema(&self) -> Option<Value> {
        None
    }

    fn name(&self) -> &str {
        "text"
    }

    fn parse(&self, raw: &str) -> Result<String> {
        Ok(raw.to_string())
    }
}

/// Deserializes the answer as JSON into `T`, with the schema derived by `schemars`.
pub struct JsonOutput<T> {
    name: String,
    type_name: &'static str,
    schema: Value,
    _marker: PhantomData<fn() -> T>,
}

impl<T: JsonSchema> JsonOutput<T> {
    pub fn new() -> Self {
        let type_name = std::any::type_name::<T>();
        let schema = schemars::schema_for!(T);
        Self {
            name: schema_name(type_name),
            type_name,
            schema: schema.to_value(),
            _marker: PhantomData,
        }
    }
}

impl<T: JsonSchema> Default for JsonOutput<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OutputSchema<T> for JsonOutput<T>
where
    T: DeserializeOwned + JsonSchema,
{
    fn json_schema(&self) -> Option<Value> {
        Some(self.schema.clone())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn parse(&self, raw: &str) -> Result<T> {
        let body = strip_code_fence(raw);
        serde_json::from_str(body).map_err(|err| AgentError::OutputValidation {
            type_name: self.type_name.to_string(),
            reason: err.to_string(),
        })
    }
}

/// `response_format` names must match `[a-zA-Z0-9_-]+`.
fn schema_name(type_name: &str) -> String {
    let base = type_name.split('<').next().unwrap_or(type_name);
    let short = base.rsplit("::").next().unwrap_or(base);
    let cleaned: String = short
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        "result".to_string()
    } else {
        cleaned
    }
}

/// Models sometimes wrap JSON answers in a Markdown fence.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
