use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use structured_agent::{
    to_markdown, Agent, LanguageModel, ModelConfig, RunContext, Tool, ToolRegistry,
};

pub const SIMPLE_PROMPT: &str =
    "You are a helpful customer support agent. Be concise and friendly.";

const ANALYST_PROMPT: &str = "You are an intelligent customer support agent. \
Analyze queries carefully and provide structured responses.";

/// Structured response with metadata.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ResponseModel {
    pub response: String,
    pub needs_escalation: bool,
    pub follow_up_required: bool,
    /// Customer sentiment analysis
    pub sentiment: String,
}

/// Structure for order details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub status: String,
    pub items: Vec<String>,
}

/// Structure for incoming customer queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerDetails {
    pub customer_id: String,
    pub name: String,
    pub email: String,
    pub orders: Option<Vec<Order>>,
}

pub fn sample_customer() -> CustomerDetails {
    CustomerDetails {
        customer_id: "1".into(),
        name: "John Doe".into(),
        email: "john.doe@example.com".into(),
        orders: Some(vec![Order {
            order_id: "12345".into(),
            status: "shipped".into(),
            items: vec!["Blue Jeans".into(), "T-Shirt".into()],
        }]),
    }
}

/// Looks up the shipping status of the customer's first order.
pub struct ShippingInfoTool {
    db: HashMap<String, String>,
}

impl Default for ShippingInfoTool {
    fn default() -> Self {
        let db = [
            ("12345", "Shipped on 2024-12-01"),
            ("67890", "Out for delivery"),
        ]
        .into_iter()
        .map(|(id, status)| (id.to_string(), status.to_string()))
        .collect();
        Self { db }
    }
}

#[async_trait]
impl Tool<CustomerDetails> for ShippingInfoTool {
    fn name(&self) -> &str {
        "get_shipping_info"
    }

    fn description(&self) -> &str {
        "Get the customer's shipping information."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({"type": "object", "properties": {}}))
    }

    async fn call(
        &self,
        ctx: &RunContext<CustomerDetails>,
        _input: Value,
    ) -> structured_agent::Result<Value> {
        let Some(order) = ctx.deps.orders.as_deref().and_then(|orders| orders.first()) else {
            return Ok(json!("The customer has no orders on file."));
        };
        let status = self
            .db
            .get(&order.order_id)
            .cloned()
            .unwrap_or_else(|| format!("No shipping information for order {}", order.order_id));
        Ok(json!(status))
    }
}

fn base<M: LanguageModel>(model: Arc<M>, cfg: &ModelConfig) -> Agent<M> {
    Agent::new(model)
        .with_model_name(cfg.model.clone())
        .with_max_steps(cfg.max_steps)
        .with_streaming(cfg.stream)
}

fn customer_prompt(ctx: &RunContext<CustomerDetails>) -> structured_agent::Result<String> {
    Ok(format!("Customer details:\n{}", to_markdown(&ctx.deps)?))
}

pub fn simple_agent<M: LanguageModel>(model: Arc<M>, cfg: &ModelConfig) -> Agent<M> {
    base(model, cfg).with_system_prompt(SIMPLE_PROMPT)
}

pub fn analyst_agent<M: LanguageModel>(
    model: Arc<M>,
    cfg: &ModelConfig,
) -> Agent<M, (), ResponseModel> {
    base(model, cfg)
        .with_system_prompt(ANALYST_PROMPT)
        .with_output_type::<ResponseModel>()
}

pub fn deps_agent<M: LanguageModel>(
    model: Arc<M>,
    cfg: &ModelConfig,
) -> Agent<M, CustomerDetails, ResponseModel> {
    base(model, cfg)
        .with_deps_type::<CustomerDetails>()
        .with_system_prompt(format!(
            "{ANALYST_PROMPT} Always greet the customer and provide a helpful response."
        ))
        .with_dynamic_system_prompt(customer_prompt)
        .with_output_type::<ResponseModel>()
}

pub fn tools_agent<M: LanguageModel>(
    model: Arc<M>,
    cfg: &ModelConfig,
) -> Agent<M, CustomerDetails, ResponseModel> {
    base(model, cfg)
        .with_deps_type::<CustomerDetails>()
        .with_system_prompt(format!(
            "{ANALYST_PROMPT} Use tools to look up relevant information. \
             Always greet the customer and provide a helpful response."
        ))
        .with_dynamic_system_prompt(customer_prompt)
        .with_tools(ToolRegistry::new().with_tool(ShippingInfoTool::default()))
        .with_output_type::<ResponseModel>()
}
