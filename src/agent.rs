use std::sync::Arc;

use futures::stream::{Stream, StreamExt};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::RunContext;
use crate::error::{AgentError, Result};
use crate::history::{self, HistoryPolicy};
use crate::llm::{CompletionChunk, LanguageModel, ModelCompletion, OutputSpec, Usage};
use crate::memory::ConversationMemory;
use crate::message::{Message, ToolCall, ToolResult};
use crate::output::{JsonOutput, OutputSchema, TextOutput};
use crate::tool::ToolRegistry;

type SystemPromptFn<D> = Arc<dyn Fn(&RunContext<D>) -> Result<String> + Send + Sync>;

/// Outcome of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult<O> {
    pub output: O,
    messages: Vec<Message>,
    new_message_index: usize,
    usage: Usage,
}

impl<O> RunResult<O> {
    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn into_output(self) -> O {
        self.output
    }

    /// Prior history plus every message produced by this run.
    pub fn all_messages(&self) -> &[Message] {
        &self.messages
    }

    /// Messages produced by this run only, starting with the user prompt.
    /// Pass these as history to continue the conversation.
    pub fn new_messages(&self) -> &[Message] {
        &self.messages[self.new_message_index..]
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn all_messages_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.messages)?)
    }
}

/// Progress of a run, as yielded by [`Agent::run_stream`].
#[derive(Debug, Clone)]
pub enum RunEvent<O> {
    TextDelta(String),
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    Completed(RunResult<O>),
}

/// An agent definition: model, prompts, tools and the declared result type.
///
/// `D` is the dependency type injected into tools and dynamic system prompts, `O`
/// the validated output type. The definition is immutable once built; every call
/// to [`Agent::run`] is an independent conversation.
pub struct Agent<M: LanguageModel, D = (), O = String> {
    model: Arc<M>,
    model_name: String,
    system_prompt: String,
    dynamic_prompts: Vec<SystemPromptFn<D>>,
    tools: ToolRegistry<D>,
    output: Arc<dyn OutputSchema<O>>,
    max_steps: usize,
    streaming: bool,
    history_policy: HistoryPolicy,
}

impl<M: LanguageModel> Agent<M> {
    pub fn new(model: Arc<M>) -> Self {
        Self {
            model,
            model_name: "default".to_string(),
            system_prompt: "You are a helpful agent.".to_string(),
            dynamic_prompts: Vec::new(),
            tools: ToolRegistry::default(),
            output: Arc::new(TextOutput),
            max_steps: 6,
            streaming: false,
            history_policy: HistoryPolicy::default(),
        }
    }
}

impl<M: LanguageModel, O> Agent<M, (), O> {
    /// Switches the dependency type. Tools and dynamic prompts are typed over the
    /// dependency, so this must be called before registering them.
    pub fn with_deps_type<D>(self) -> Agent<M, D, O> {
        if !self.tools.is_empty() || !self.dynamic_prompts.is_empty() {
            tracing::warn!("with_deps_type discards tools and dynamic prompts registered earlier");
        }
        Agent {
            model: self.model,
            model_name: self.model_name,
            system_prompt: self.system_prompt,
            dynamic_prompts: Vec::new(),
            tools: ToolRegistry::default(),
            output: self.output,
            max_steps: self.max_steps,
            streaming: self.streaming,
            history_policy: self.history_policy,
        }
    }
}

impl<M, D, O> Agent<M, D, O>
where
    M: LanguageModel,
    D: Send + Sync + 'static,
    O: Send + 'static,
{
    /// Name recorded in the run context and logs.
    pub fn with_model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = name.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Adds a system prompt section computed from the run context at every step.
    pub fn with_dynamic_system_prompt<F>(mut self, prompt: F) -> Self
    where
        F: Fn(&RunContext<D>) -> Result<String> + Send + Sync + 'static,
    {
        self.dynamic_prompts.push(Arc::new(prompt));
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry<D>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_history_policy(mut self, policy: HistoryPolicy) -> Self {
        self.history_policy = policy;
        self
    }

    /// Declares a structured result type; final answers must deserialize into `T`.
    pub fn with_output_type<T>(self) -> Agent<M, D, T>
    where
        T: DeserializeOwned + JsonSchema + Send + 'static,
    {
        self.with_output_schema(JsonOutput::<T>::new())
    }

    pub fn with_output_schema<T, S>(self, schema: S) -> Agent<M, D, T>
    where
        S: OutputSchema<T> + 'static,
    {
        Agent {
            model: self.model,
            model_name: self.model_name,
            system_prompt: self.system_prompt,
            dynamic_prompts: self.dynamic_prompts,
            tools: self.tools,
            output: Arc::new(schema),
            max_steps: self.max_steps,
            streaming: self.streaming,
            history_policy: self.history_policy,
        }
    }

    /// Runs one conversation with no prior history.
    pub async fn run_with(&self, prompt: impl Into<String>, deps: D) -> Result<RunResult<O>> {
        self.run(prompt, deps, &[]).await
    }

    /// Sends `prompt` after `history` and returns the validated result.
    pub async fn run(
        &self,
        prompt: impl Into<String>,
        deps: D,
        history: &[Message],
    ) -> Result<RunResult<O>> {
        let events = self.drive(prompt.into(), deps, history.to_vec(), self.streaming);
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            if let RunEvent::Completed(result) = event? {
                return Ok(result);
            }
        }
        Err(AgentError::Protocol("run ended without a result".into()))
    }

    /// Like [`Agent::run`] but streams text deltas and tool activity as they happen.
    /// The last item is always [`RunEvent::Completed`] unless an error is yielded.
    pub fn run_stream(
        &self,
        prompt: impl Into<String>,
        deps: D,
        history: &[Message],
    ) -> impl Stream<Item = Result<RunEvent<O>>> + Send + '_ {
        self.drive(prompt.into(), deps, history.to_vec(), true)
    }

    fn drive(
        &self,
        prompt: String,
        deps: D,
        prior: Vec<Message>,
        stream: bool,
    ) -> impl Stream<Item = Result<RunEvent<O>>> + Send + '_ {
        async_stream::try_stream! {
            let prior = history::enforce(self.history_policy, prior)?;
            let mut memory = ConversationMemory::with_messages(prior);
            let new_message_index = memory.len();
            memory.push(Message::user(prompt.clone()));

            let mut ctx = RunContext::new(deps, prompt, self.model_name.clone());
            let tools = self.tools.describe();
            let spec = self.output.json_schema().map(|schema| OutputSpec {
                name: self.output.name().to_string(),
                schema,
            });

            for step in 0..self.max_steps {
                ctx.step = step;
                history::validate(memory.messages())?;

                let system = self.build_system_message(&ctx, spec.as_ref())?;
                let mut request = vec![Message::system(system)];
                request.extend(memory.iter().cloned());
                tracing::debug!(model = %self.model_name, step, messages = request.len(), "calling model");

                let completion = if stream {
                    let mut chunks = self.model.stream_chat(&request, &tools, spec.as_ref()).await?;
                    let mut done: Option<ModelCompletion> = None;
                    while let Some(chunk) = chunks.next().await {
                        match chunk? {
                            CompletionChunk::TextDelta(delta) => {
                                if !delta.is_empty() {
                                    yield RunEvent::TextDelta(delta);
                                }
                            }
                            CompletionChunk::Done(completion) => done = Some(completion),
                        }
                    }
                    done.ok_or_else(|| {
                        AgentError::Protocol("stream ended without a final completion".into())
                    })?
                } else {
                    self.model.complete_chat(&request, &tools, spec.as_ref()).await?
                };
                ctx.usage.add(&completion.usage);

                if !completion.tool_calls.is_empty() {
                    // Text sent alongside tool calls stays on the first call message.
                    let mut preamble = completion.content.filter(|text| !text.trim().is_empty());
                    for mut call in completion.tool_calls {
                        if call.id.is_none() {
                            call.id = Some(format!("call_{}", uuid::Uuid::new_v4().simple()));
                        }
                        tracing::info!(tool = %call.name, id = ?call.id, "model requested tool");
                        let mut message = Message::tool_call(call.clone());
                        if let Some(text) = preamble.take() {
                            message.content = text;
                        }
                        memory.push(message);
                        yield RunEvent::ToolCall(call.clone());

                        let output = self.tools.call(&call.name, &ctx, call.arguments.clone()).await?;
                        let message = Message::tool(&call.name, output, call.id.clone());
                        if let Some(result) = message.tool_result.clone() {
                            yield RunEvent::ToolResult(result);
                        }
                        memory.push(message);
                    }
                    continue;
                }

                let content = completion.content.ok_or_else(|| {
                    AgentError::Protocol("model response missing content and tool calls".into())
                })?;
                let output = self.output.parse(&content)?;
                memory.push(Message::assistant(content));

                tracing::info!(
                    model = %self.model_name,
                    steps = step + 1,
                    requests = ctx.usage.requests,
                    total_tokens = ctx.usage.total_tokens,
                    "run completed"
                );
                yield RunEvent::Completed(RunResult {
                    output,
                    messages: memory.into_messages(),
                    new_message_index,
                    usage: ctx.usage,
                });
                return;
            }

            Err::<(), _>(AgentError::StepLimit(self.max_steps))?;
        }
    }

    fn build_system_message(&self, ctx: &RunContext<D>, spec: Option<&OutputSpec>) -> Result<String> {
        let mut prompt = self.system_prompt.clone();
        for dynamic in &self.dynamic_prompts {
            prompt.push_str("\n\n");
            prompt.push_str(&dynamic(ctx)?);
        }

        if self.tools.is_empty() {
            prompt.push_str("\n\nNo tools are available.");
        } else {
            prompt.push_str("\n\nWhen a tool is relevant, call it with JSON arguments. Available tools:\n");
            for tool in self.tools.describe() {
                prompt.push_str(&format!("- {}: {}\n", tool.name, tool.description));
            }
        }

        if let Some(spec) = spec {
            prompt.push_str(&format!(
                "\n\nYour final answer must be a single JSON object matching this schema: {}",
                spec.schema
            ));
        }
        Ok(prompt)
    }
}
