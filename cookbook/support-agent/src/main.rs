//! Customer support walkthrough: a plain agent, a structured result, injected
//! customer details and a shipping lookup tool.
//!
//! Runs against an OpenAI-compatible endpoint, or fully offline with `--offline`.

mod support;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde::Serialize;
use structured_agent::{
    init_tracing, load_dotenv, AppConfig, LanguageModel, OpenAIClient, RunEvent, RunResult,
    StubModel,
};

use crate::support::{
    analyst_agent, deps_agent, sample_customer, simple_agent, tools_agent, CustomerDetails,
    ResponseModel,
};

#[derive(Parser)]
#[command(name = "support-agent")]
#[command(about = "Customer support agents with typed results")]
struct Cli {
    /// TOML configuration file; `AGENT_*` variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use a scripted model instead of calling the provider
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    scenario: Scenario,
}

#[derive(Subcommand, Clone, Copy, Debug)]
enum Scenario {
    /// Free-text answer plus a follow-up question that reuses the history
    Simple,
    /// Answer validated into a `ResponseModel`
    Structured,
    /// Customer details injected into the system prompt
    Deps,
    /// Shipping status looked up through a tool
    Tools,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv()?;
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::from_env_or_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => AppConfig::from_env().context("failed to load config from environment")?,
    };
    init_tracing(&config.logging)?;
    tracing::info!(scenario = ?cli.scenario, model = %config.model.model, "starting");

    if cli.offline {
        let model = StubModel::new(offline_script(cli.scenario));
        run_scenario(model, &config, cli.scenario).await
    } else {
        let model = Arc::new(
            OpenAIClient::from_config(&config.model).context("failed to create model client")?,
        );
        run_scenario(model, &config, cli.scenario).await
    }
}

async fn run_scenario<M: LanguageModel>(
    model: Arc<M>,
    config: &AppConfig,
    scenario: Scenario,
) -> anyhow::Result<()> {
    let cfg = &config.model;
    match scenario {
        Scenario::Simple => {
            let agent = simple_agent(model, cfg);
            let prompt = "How can I track my order #12345?";
            let result = if cfg.stream {
                let events = agent.run_stream(prompt, (), &[]);
                futures::pin_mut!(events);
                let mut completed = None;
                while let Some(event) = events.next().await {
                    match event? {
                        RunEvent::TextDelta(delta) => print!("{delta}"),
                        RunEvent::Completed(result) => completed = Some(result),
                        RunEvent::ToolCall(_) | RunEvent::ToolResult(_) => {}
                    }
                }
                println!();
                completed.context("stream ended without a result")?
            } else {
                agent.run_with(prompt, ()).await?
            };
            print_run("Response", &result)?;

            separator();
            let follow_up = agent
                .run("What was my previous question?", (), result.new_messages())
                .await
                .context("follow-up question failed")?;
            println!("Response to follow-up question:\n{}", follow_up.output());
        }
        Scenario::Structured => {
            let agent = analyst_agent(model, cfg);
            let result = agent.run_with("How can I track my order #12345?", ()).await?;
            print_run("Structured response", &result)?;
        }
        Scenario::Deps => {
            let customer = sample_customer();
            let agent = deps_agent(model, cfg);
            let result = agent.run_with("What did I order?", customer.clone()).await?;
            print_run("Structured response", &result)?;
            print_summary(&customer, result.output());
        }
        Scenario::Tools => {
            let customer = sample_customer();
            let agent = tools_agent(model, cfg);
            let result = agent
                .run_with("What's the status of my last order?", customer.clone())
                .await?;
            print_run("Structured response", &result)?;
            print_summary(&customer, result.output());
        }
    }
    Ok(())
}

fn print_run<O: Serialize>(title: &str, result: &RunResult<O>) -> anyhow::Result<()> {
    println!("All messages:\n{}", result.all_messages_json()?);
    println!("\n{title}:\n{}", serde_json::to_string_pretty(result.output())?);
    let usage = result.usage();
    println!(
        "\nUsage: {} request(s), {} prompt + {} completion = {} tokens",
        usage.requests, usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
    );
    Ok(())
}

fn print_summary(customer: &CustomerDetails, output: &ResponseModel) {
    println!(
        "\nCustomer Details:\nName: {}\nEmail: {}\n\nResponse Details:\n{}\n\nStatus:\n\
         Follow-up Required: {}\nNeeds Escalation: {}",
        customer.name,
        customer.email,
        output.response,
        output.follow_up_required,
        output.needs_escalation
    );
}

fn separator() {
    println!("\n{}\n", "=".repeat(60));
}

fn offline_script(scenario: Scenario) -> Vec<String> {
    let answer = |response: &str, sentiment: &str| {
        serde_json::json!({
            "response": response,
            "needs_escalation": false,
            "follow_up_required": false,
            "sentiment": sentiment,
        })
        .to_string()
    };
    match scenario {
        Scenario::Simple => vec![
            "You can track order #12345 from the Orders page of your account.".into(),
            "You asked how to track your order #12345.".into(),
        ],
        Scenario::Structured => vec![answer(
            "You can track order #12345 from the Orders page of your account.",
            "neutral",
        )],
        Scenario::Deps => vec![answer(
            "Hello John! Your order #12345 contains Blue Jeans and a T-Shirt.",
            "positive",
        )],
        Scenario::Tools => vec![
            r#"{"action":"call_tool","name":"get_shipping_info","arguments":{}}"#.into(),
            answer(
                "Hello John! Your order #12345 was shipped on 2024-12-01.",
                "positive",
            ),
        ],
    }
}
