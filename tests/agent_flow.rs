use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use structured_agent::{
    history, to_markdown, Agent, AgentError, HistoryPolicy, Message, ModelConfig, OpenAIClient,
    Result, Role, RunContext, RunEvent, StubModel, Tool, ToolCall, ToolRegistry,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
struct SupportResponse {
    response: String,
    needs_escalation: bool,
    follow_up_required: bool,
    /// Customer sentiment analysis
    sentiment: String,
}

#[derive(Debug, Clone, Serialize)]
struct Order {
    order_id: String,
    status: String,
    items: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct Customer {
    customer_id: String,
    name: String,
    email: String,
    orders: Option<Vec<Order>>,
}

fn john() -> Customer {
    Customer {
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

struct ShippingInfo;

#[async_trait]
impl Tool<Customer> for ShippingInfo {
    fn name(&self) -> &str {
        "get_shipping_info"
    }

    fn description(&self) -> &str {
        "Get the customer's shipping information."
    }

    async fn call(&self, ctx: &RunContext<Customer>, _input: Value) -> Result<Value> {
        let order = ctx
            .deps
            .orders
            .as_ref()
            .and_then(|orders| orders.first())
            .ok_or_else(|| AgentError::Protocol("customer has no orders".into()))?;
        match order.order_id.as_str() {
            "12345" => Ok(json!("Shipped on 2024-12-01")),
            "67890" => Ok(json!("Out for delivery")),
            other => Ok(json!(format!("unknown order {other}"))),
        }
    }
}

fn support_json(response: &str) -> String {
    json!({
        "response": response,
        "needs_escalation": false,
        "follow_up_required": true,
        "sentiment": "neutral",
    })
    .to_string()
}

fn support_agent(model: Arc<StubModel>) -> Agent<StubModel, Customer, SupportResponse> {
    Agent::new(model)
        .with_deps_type::<Customer>()
        .with_system_prompt("You are an intelligent customer support agent.")
        .with_dynamic_system_prompt(|ctx| Ok(format!("Customer details: {}", to_markdown(&ctx.deps)?)))
        .with_tools(ToolRegistry::new().with_tool(ShippingInfo))
        .with_output_type::<SupportResponse>()
}

#[test]
fn client_is_not_built_without_credential() {
    let cfg = ModelConfig {
        api_key_env: "STRUCTURED_AGENT_IT_NEVER_SET".into(),
        ..ModelConfig::default()
    };
    std::env::remove_var("STRUCTURED_AGENT_IT_NEVER_SET");

    match OpenAIClient::from_config(&cfg) {
        Err(AgentError::MissingCredential { var }) => assert_eq!(var, "STRUCTURED_AGENT_IT_NEVER_SET"),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("client built without a credential"),
    }
}

#[tokio::test]
async fn tool_run_produces_paired_transcript() {
    let model = StubModel::new(vec![
        r#"{"action":"call_tool","name":"get_shipping_info","arguments":{}}"#.into(),
        support_json("Hello John! Order #12345 shipped on 2024-12-01."),
    ]);
    let agent = support_agent(model.clone());

    let result = agent
        .run_with("What's the status of my last order?", john())
        .await
        .unwrap();

    assert_eq!(result.output().response, "Hello John! Order #12345 shipped on 2024-12-01.");
    let roles: Vec<Role> = result.all_messages().iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
    assert!(history::validate(result.all_messages()).is_ok());

    // The second request carries the call and its response back to back.
    let second = &model.requests()[1];
    let call_at = second.iter().position(|m| m.tool_call.is_some()).unwrap();
    let call_id = second[call_at].tool_call.as_ref().unwrap().id.clone();
    assert_eq!(second[call_at + 1].tool_result.as_ref().unwrap().tool_call_id, call_id);
    assert_eq!(
        second[call_at + 1].tool_result.as_ref().unwrap().output,
        json!("Shipped on 2024-12-01")
    );
}

#[tokio::test]
async fn customer_details_reach_system_prompt() {
    let model = StubModel::new(vec![support_json("You ordered Blue Jeans and a T-Shirt.")]);
    let agent = support_agent(model.clone());

    agent.run_with("What did I order?", john()).await.unwrap();

    let system = &model.requests()[0][0];
    assert_eq!(system.role, Role::System);
    assert!(system.content.contains("- **email**: john.doe@example.com"));
    assert!(system.content.contains("      - Blue Jeans"));
    assert!(system.content.contains("get_shipping_info"));
}

#[tokio::test]
async fn mismatched_tool_result_is_rejected_locally() {
    let model = StubModel::new(vec![support_json("unused")]);
    let agent = support_agent(model.clone());
    let history = vec![
        Message::user("where is my order?"),
        Message::tool_call(ToolCall {
            id: Some("call_a".into()),
            name: "get_shipping_info".into(),
            arguments: json!({}),
        }),
        Message::tool("get_shipping_info", json!("Shipped"), Some("call_b".into())),
        Message::assistant("It shipped."),
    ];

    let err = agent.run("thanks", john(), &history).await.unwrap_err();

    assert!(matches!(err, AgentError::InvalidHistory { .. }));
    assert_eq!(model.call_count(), 0);
}

#[tokio::test]
async fn orphan_tool_result_is_repaired() {
    let model = StubModel::new(vec![support_json("You asked about your order.")]);
    let agent = support_agent(model.clone()).with_history_policy(HistoryPolicy::Repair);
    let history = vec![
        Message::user("where is my order?"),
        Message::tool("get_shipping_info", json!("Shipped"), Some("call_x".into())),
        Message::assistant("It shipped."),
    ];

    let result = agent
        .run("What was my previous question?", john(), &history)
        .await
        .unwrap();

    assert_eq!(result.all_messages().len(), 4);
    assert!(model.requests()[0].iter().all(|m| m.role != Role::Tool));
}

#[tokio::test]
async fn incomplete_structured_answer_is_rejected() {
    let model = StubModel::new(vec![
        json!({"response": "On its way", "sentiment": "neutral"}).to_string(),
    ]);
    let agent = support_agent(model);

    let err = agent.run_with("Where is my order?", john()).await.unwrap_err();

    match err {
        AgentError::OutputValidation { reason, .. } => assert!(reason.contains("needs_escalation")),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn follow_up_history_round_trips_through_json() {
    let model = StubModel::new(vec![
        r#"{"action":"call_tool","name":"get_shipping_info","arguments":{}}"#.into(),
        support_json("It shipped on 2024-12-01."),
        support_json("You asked about the status of your last order."),
    ]);
    let agent = support_agent(model.clone());

    let first = agent
        .run_with("What's the status of my last order?", john())
        .await
        .unwrap();
    let saved = serde_json::to_string(first.new_messages()).unwrap();
    let restored: Vec<Message> = serde_json::from_str(&saved).unwrap();

    let second = agent
        .run("What was my previous question?", john(), &restored)
        .await
        .unwrap();

    assert_eq!(second.new_messages().len(), 2);
    assert_eq!(second.all_messages().len(), 6);
    assert_eq!(model.requests()[2].len(), 6);
}

#[tokio::test]
async fn streamed_run_ends_with_completion() {
    let model = StubModel::new(vec![
        r#"{"action":"call_tool","name":"get_shipping_info","arguments":{}}"#.into(),
        support_json("Shipped on 2024-12-01."),
    ]);
    let agent = support_agent(model);

    let mut events = Box::pin(agent.run_stream("Status?", john(), &[]));
    let mut saw_delta = false;
    let mut completed = None;
    while let Some(event) = events.next().await {
        match event.unwrap() {
            RunEvent::TextDelta(_) => {
                assert!(completed.is_none());
                saw_delta = true;
            }
            RunEvent::Completed(result) => completed = Some(result),
            RunEvent::ToolCall(call) => assert_eq!(call.name, "get_shipping_info"),
            RunEvent::ToolResult(result) => assert_eq!(result.output, json!("Shipped on 2024-12-01")),
        }
    }

    assert!(saw_delta);
    assert_eq!(completed.unwrap().output().response, "Shipped on 2024-12-01.");
}
