use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::RunContext;
use crate::error::{AgentError, Result};

/// A function the model may call during a run. `D` is the agent's dependency type.
#[async_trait]
pub trait Tool<D = ()>: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    /// JSON Schema for the arguments object.
    fn parameters(&self) -> Option<Value> {
        None
    }

    async fn call(&self, ctx: &RunContext<D>, input: Value) -> Result<Value>;
}

/// Static description of a tool, sent to the provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescription {
    pub name: String,
    pub description: String,
    pub parameters: Option<Value>,
}

pub struct ToolRegistry<D = ()> {
    tools: HashMap<String, Arc<dyn Tool<D>>>,
}

impl<D> Default for ToolRegistry<D> {
    fn default() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }
}

impl<D> Clone for ToolRegistry<D> {
    fn clone(&self) -> Self {
        Self {
            tools: self.tools.clone(),
        }
    }
}

impl<D: Send + Sync> ToolRegistry<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Tool<D> + 'static>(&mut self, tool: T) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn with_tool<T: Tool<D> + 'static>(mut self, tool: T) -> Self {
        self.register(tool);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn describe(&self) -> Vec<ToolDescription> {
        let mut descriptions: Vec<ToolDescription> = self
            .tools
            .values()
            .map(|tool| ToolDescription {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect();

        descriptions.sort_by(|a, b| a.name.cmp(&b.name));
        descriptions
    }

    pub async fn call(&self, name: &str, ctx: &RunContext<D>, input: Value) -> Result<Value> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))?;
        tool.call(ctx, input)
            .await
            .map_err(|source| AgentError::ToolInvocation {
                name: name.to_string(),
                source: Box::new(source),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct First;
    struct Second;

    #[async_trait]
    impl Tool for First {
        fn name(&self) -> &str {
            "a_first"
        }

        fn description(&self) -> &str {
            "First tool"
        }

        async fn call(&self, _ctx: &RunContext<()>, input: Value) -> Result<Value> {
            Ok(input)
        }
    }

    #[async_trait]
    impl Tool for Second {
        fn name(&self) -> &str {
            "second"
        }

        fn description(&self) -> &str {
            "Second tool"
        }

        async fn call(&self, _ctx: &RunContext<()>, _input: Value) -> Result<Value> {
            Err(AgentError::Protocol("always fails".into()))
        }
    }

    struct Lookup;

    #[async_trait]
    impl Tool<String> for Lookup {
        fn name(&self) -> &str {
            "lookup"
        }

        fn description(&self) -> &str {
            "Reads the dependency"
        }

        async fn call(&self, ctx: &RunContext<String>, _input: Value) -> Result<Value> {
            Ok(json!({ "deps": ctx.deps }))
        }
    }

    #[tokio::test]
    async fn returns_sorted_descriptions() {
        let mut registry = ToolRegistry::<()>::new();
        registry.register(Second);
        registry.register(First);

        let names: Vec<String> = registry.describe().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["a_first", "second"]);
    }

    #[tokio::test]
    async fn wraps_tool_failures() {
        let registry = ToolRegistry::<()>::new().with_tool(Second);
        let ctx = RunContext::new((), "hi", "stub");

        let err = registry.call("second", &ctx, json!({})).await.unwrap_err();
        assert!(matches!(err, AgentError::ToolInvocation { ref name, .. } if name == "second"));

        let err = registry.call("missing", &ctx, json!({})).await.unwrap_err();
        assert!(matches!(err, AgentError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn passes_dependencies_to_tools() {
        let registry = ToolRegistry::<String>::new().with_tool(Lookup);
        let ctx = RunContext::new("customer-1".to_string(), "hi", "stub");

        let output = registry.call("lookup", &ctx, json!({})).await.unwrap();
        assert_eq!(output, json!({ "deps": "customer-1" }));
    }
}
