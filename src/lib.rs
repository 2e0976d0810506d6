//! Typed LLM agents with checked conversation history.
//!
//! The crate provides:
//! - A language model abstraction (`LanguageModel`) with an OpenAI-compatible client
//!   and a scripted `StubModel`.
//! - Tools over a typed dependency (`Tool<D>`, `ToolRegistry<D>`, `RunContext<D>`).
//! - An `Agent` that loops between the model and tools and validates the final
//!   answer against a declared result type (`OutputSchema`).
//! - History checks that keep every tool call paired with its tool response.

pub mod agent;
pub mod config;
pub mod context;
pub mod error;
pub mod history;
pub mod llm;
pub mod markdown;
pub mod memory;
pub mod message;
pub mod output;
pub mod telemetry;
pub mod tool;

pub use agent::{Agent, RunEvent, RunResult};
pub use config::{load_dotenv, AppConfig, LogFormat, LoggingConfig, ModelConfig};
pub use context::RunContext;
pub use error::{AgentError, Result};
pub use history::HistoryPolicy;
pub use llm::{
    CompletionChunk, CompletionStream, LanguageModel, ModelCompletion, OpenAIClient, OutputSpec,
    StubModel, Usage,
};
pub use markdown::to_markdown;
pub use memory::ConversationMemory;
pub use message::{Message, Role, ToolCall, ToolResult};
pub use output::{JsonOutput, OutputSchema, TextOutput};
pub use telemetry::init_tracing;
pub use tool::{Tool, ToolDescription, ToolRegistry};
