//! Language model abstraction, the OpenAI-compatible HTTP client and a scripted stub.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::ModelConfig;
use crate::error::{AgentError, Result};
use crate::message::{Message, Role, ToolCall};
use crate::tool::ToolDescription;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Token accounting for one or more provider calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub requests: u32,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.requests += other.requests;
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Result of a chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelCompletion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
}

impl ModelCompletion {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
            usage: Usage::default(),
        }
    }

    pub fn tool_call(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            content: None,
            tool_calls: vec![ToolCall {
                id: None,
                name: name.into(),
                arguments,
            }],
            usage: Usage::default(),
        }
    }
}

/// Structured-output request forwarded to the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub name: String,
    pub schema: Value,
}

/// Incremental piece of a streamed completion.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionChunk {
    TextDelta(String),
    Done(ModelCompletion),
}

pub type CompletionStream = BoxStream<'static, Result<CompletionChunk>>;

/// Minimal abstraction around a chat completion provider.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
        output: Option<&OutputSpec>,
    ) -> Result<ModelCompletion>;

    /// Streams the completion. The default implementation performs a single
    /// non-streaming call and replays it as one delta.
    async fn stream_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
        output: Option<&OutputSpec>,
    ) -> Result<CompletionStream> {
        let completion = self.complete_chat(messages, tools, output).await?;
        let mut chunks = Vec::new();
        if let Some(content) = completion.content.clone() {
            chunks.push(Ok(CompletionChunk::TextDelta(content)));
        }
        chunks.push(Ok(CompletionChunk::Done(completion)));
        Ok(stream::iter(chunks).boxed())
    }
}

fn coalesce_error(status: reqwest::StatusCode, body: &str, provider: &str) -> AgentError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return AgentError::LanguageModel(format!("{provider} rate limit exceeded: {body}"));
    }
    AgentError::LanguageModel(format!("{provider} request failed with {status}: {body}"))
}

fn serialize_tool_arguments(args: &Value) -> String {
    serde_json::to_string(args).unwrap_or_else(|_| args.to_string())
}

fn parse_tool_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct OpenAIClient {
    http: reqwest::Client,
    model: String,
    api_key: String,
    base_url: String,
    organization: Option<String>,
}

impl std::fmt::Debug for OpenAIClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIClient")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl OpenAIClient {
    /// Builds a client from configuration. Fails before any network activity when
    /// the credential cannot be resolved.
    pub fn from_config(cfg: &ModelConfig) -> Result<Self> {
        if cfg.provider != "openai" {
            return Err(AgentError::Config(format!(
                "unsupported provider `{}`; only OpenAI-compatible endpoints are available",
                cfg.provider
            )));
        }
        let api_key = cfg.api_key()?;
        let mut client = Self::new(api_key, cfg.model.clone())?;
        if let Some(base_url) = &cfg.base_url {
            client = client.with_base_url(base_url.as_str());
        }
        client.organization = cfg.organization.clone();
        Ok(client)
    }

    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(AgentError::MissingCredential {
                var: "api_key".into(),
            });
        }
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .map_err(|err| AgentError::LanguageModel(format!("http client error: {err}")))?,
            model: model.into(),
            api_key,
            base_url: OPENAI_BASE_URL.to_string(),
            organization: None,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn to_openai_messages(messages: &[Message]) -> Vec<OpenAiMessage> {
        messages
            .iter()
            .map(|message| {
                let role = match message.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                }
                .to_string();

                let tool_calls = message.tool_call.as_ref().map(|call| {
                    vec![OpenAiToolCall {
                        id: call.id.clone(),
                        r#type: "function".to_string(),
                        function: OpenAiFunctionCall {
                            name: call.name.clone(),
                            arguments: serialize_tool_arguments(&call.arguments),
                        },
                    }]
                });

                let content = if tool_calls.is_some() {
                    None
                } else if let Some(result) = &message.tool_result {
                    Some(serialize_tool_arguments(&result.output))
                } else {
                    Some(message.content.clone())
                };

                OpenAiMessage {
                    role,
                    content,
                    tool_call_id: message
                        .tool_result
                        .as_ref()
                        .and_then(|result| result.tool_call_id.clone()),
                    tool_calls,
                }
            })
            .collect()
    }

    fn to_openai_tools(tools: &[ToolDescription]) -> Option<Vec<OpenAiTool>> {
        if tools.is_empty() {
            return None;
        }
        Some(
            tools
                .iter()
                .map(|tool| OpenAiTool {
                    r#type: "function".to_string(),
                    function: OpenAiFunction {
                        name: tool.name.clone(),
                        description: Some(tool.description.clone()),
                        parameters: Some(
                            tool.parameters
                                .clone()
                                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                        ),
                    },
                })
                .collect(),
        )
    }

    fn build_payload(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
        output: Option<&OutputSpec>,
        stream: bool,
    ) -> OpenAiRequest {
        OpenAiRequest {
            model: self.model.clone(),
            messages: Self::to_openai_messages(messages),
            tools: Self::to_openai_tools(tools),
            tool_choice: (!tools.is_empty()).then(|| "auto".to_string()),
            response_format: output.map(|spec| {
                json!({
                    "type": "json_schema",
                    "json_schema": {
                        "name": spec.name,
                        "schema": spec.schema,
                        "strict": false,
                    }
                })
            }),
            stream,
            stream_options: stream.then(|| json!({"include_usage": true})),
        }
    }

    async fn send(&self, payload: &OpenAiRequest) -> Result<reqwest::Response> {
        tracing::debug!(
            model = %self.model,
            messages = payload.messages.len(),
            tools = payload.tools.as_ref().map_or(0, Vec::len),
            stream = payload.stream,
            "sending chat completion request"
        );
        let mut builder = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key);
        if let Some(org) = &self.organization {
            builder = builder.header("OpenAI-Organization", org);
        }
        let resp = builder
            .json(payload)
            .send()
            .await
            .map_err(|err| AgentError::LanguageModel(format!("OpenAI request error: {err}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            tracing::error!(%status, body = %body, "OpenAI API error");
            return Err(coalesce_error(status, &body, "openai"));
        }
        Ok(resp)
    }
}

#[async_trait]
impl LanguageModel for OpenAIClient {
    async fn complete_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
        output: Option<&OutputSpec>,
    ) -> Result<ModelCompletion> {
        let payload = self.build_payload(messages, tools, output, false);
        let resp = self.send(&payload).await?;
        let body: OpenAiResponse = resp.json().await.map_err(|err| {
            AgentError::LanguageModel(format!("OpenAI response parse error: {err}"))
        })?;
        body.into_completion()
    }

    async fn stream_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
        output: Option<&OutputSpec>,
    ) -> Result<CompletionStream> {
        let payload = self.build_payload(messages, tools, output, true);
        let resp = self.send(&payload).await?;
        let mut bytes = resp.bytes_stream();

        let chunks = async_stream::try_stream! {
            let mut acc = SseAccumulator::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|err| {
                    AgentError::LanguageModel(format!("OpenAI stream error: {err}"))
                })?;
                for delta in acc.feed(&chunk)? {
                    yield CompletionChunk::TextDelta(delta);
                }
            }
            yield CompletionChunk::Done(acc.finish()?);
        };
        Ok(chunks.boxed())
    }
}

/// Reassembles an OpenAI server-sent-event stream into a [`ModelCompletion`].
#[derive(Default)]
struct SseAccumulator {
    buffer: Vec<u8>,
    content: String,
    tool_calls: BTreeMap<u32, OpenAiToolCallState>,
    usage: Option<Usage>,
}

#[derive(Default)]
struct OpenAiToolCallState {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl SseAccumulator {
    /// Consumes raw body bytes and returns the content deltas found in complete lines.
    /// Lines are decoded only once complete, so a character split across network
    /// chunks survives intact.
    fn feed(&mut self, bytes: impl AsRef<[u8]>) -> Result<Vec<String>> {
        self.buffer.extend_from_slice(bytes.as_ref());
        let mut deltas = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = decode_line(line)?;
            if let Some(delta) = self.handle_line(line.trim())? {
                deltas.push(delta);
            }
        }
        Ok(deltas)
    }

    fn handle_line(&mut self, line: &str) -> Result<Option<String>> {
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(None);
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            return Ok(None);
        }
        let parsed: OpenAiStreamChunk = serde_json::from_str(data).map_err(|err| {
            AgentError::LanguageModel(format!("OpenAI stream parse error `{data}`: {err}"))
        })?;
        if let Some(error) = parsed.error {
            tracing::error!(%error, "OpenAI stream error");
            return Err(AgentError::LanguageModel(format!("openai stream error: {error}")));
        }

        if let Some(usage) = parsed.usage {
            self.usage = Some(usage.into_usage());
        }

        let mut text = String::new();
        for choice in parsed.choices {
            if let Some(delta_content) = choice.delta.content {
                text.push_str(&delta_content);
            }
            for delta_call in choice.delta.tool_calls.unwrap_or_default() {
                let state = self.tool_calls.entry(delta_call.index).or_default();
                if delta_call.id.is_some() {
                    state.id = delta_call.id;
                }
                if let Some(function) = delta_call.function {
                    if let Some(name) = function.name {
                        state.name = Some(name);
                    }
                    if let Some(args) = function.arguments {
                        state.arguments.push_str(&args);
                    }
                }
            }
        }

        if text.is_empty() {
            return Ok(None);
        }
        self.content.push_str(&text);
        Ok(Some(text))
    }

    fn finish(mut self) -> Result<ModelCompletion> {
        let rest = decode_line(std::mem::take(&mut self.buffer))?;
        self.handle_line(rest.trim())?;

        let tool_calls = self
            .tool_calls
            .into_values()
            .filter_map(|state| {
                Some(ToolCall {
                    id: state.id,
                    name: state.name?,
                    arguments: parse_tool_arguments(&state.arguments),
                })
            })
            .collect();

        let mut usage = self.usage.unwrap_or_default();
        usage.requests = 1;
        Ok(ModelCompletion {
            content: (!self.content.is_empty()).then_some(self.content),
            tool_calls,
            usage,
        })
    }
}

fn decode_line(line: Vec<u8>) -> Result<String> {
    String::from_utf8(line)
        .map_err(|err| AgentError::LanguageModel(format!("OpenAI stream is not valid UTF-8: {err}")))
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> AgentError {
    AgentError::LanguageModel("stub model poisoned".into())
}

/// A deterministic model used for tests and demos.
///
/// Each call pops the next scripted completion. Every request is recorded so tests
/// can assert on what would have been sent to a provider.
pub struct StubModel {
    responses: Mutex<VecDeque<ModelCompletion>>,
    requests: Mutex<Vec<Vec<Message>>>,
    outputs: Mutex<Vec<Option<OutputSpec>>>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum StubDirective {
    Respond { content: String },
    CallTool { name: String, arguments: Value },
}

impl StubModel {
    /// Scripts the model with raw strings. A string shaped like
    /// `{"action":"call_tool","name":..,"arguments":..}` becomes a tool call,
    /// `{"action":"respond","content":..}` a text answer, anything else is returned verbatim.
    pub fn new(responses: Vec<String>) -> Arc<Self> {
        let completions = responses
            .into_iter()
            .map(|raw| match serde_json::from_str::<StubDirective>(&raw) {
                Ok(StubDirective::Respond { content }) => ModelCompletion::text(content),
                Ok(StubDirective::CallTool { name, arguments }) => {
                    ModelCompletion::tool_call(name, arguments)
                }
                Err(_) => ModelCompletion::text(raw),
            })
            .collect();
        Self::from_completions(completions)
    }

    pub fn from_completions(completions: Vec<ModelCompletion>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(completions.into()),
            requests: Mutex::new(Vec::new()),
            outputs: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }

    /// Messages of every request received so far.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Output specs of every request received so far.
    pub fn output_specs(&self) -> Vec<Option<OutputSpec>> {
        self.outputs.lock().map(|o| o.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LanguageModel for StubModel {
    async fn complete_chat(
        &self,
        messages: &[Message],
        _tools: &[ToolDescription],
        output: Option<&OutputSpec>,
    ) -> Result<ModelCompletion> {
        self.requests.lock().map_err(poisoned)?.push(messages.to_vec());
        self.outputs.lock().map_err(poisoned)?.push(output.cloned());

        let mut completion = self
            .responses
            .lock()
            .map_err(poisoned)?
            .pop_front()
            .ok_or_else(|| {
                AgentError::LanguageModel("StubModel ran out of scripted responses".into())
            })?;
        completion.usage.requests = 1;
        Ok(completion)
    }

    async fn stream_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
        output: Option<&OutputSpec>,
    ) -> Result<CompletionStream> {
        let completion = self.complete_chat(messages, tools, output).await?;
        let mut chunks: Vec<Result<CompletionChunk>> = completion
            .content
            .as_deref()
            .unwrap_or_default()
            .split_inclusive(' ')
            .map(|piece| Ok(CompletionChunk::TextDelta(piece.to_string())))
            .collect();
        chunks.push(Ok(CompletionChunk::Done(completion)));
        Ok(stream::iter(chunks).boxed())
    }
}

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiToolCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    r#type: String,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiTool {
    r#type: String,
    function: OpenAiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

impl OpenAiResponse {
    fn into_completion(self) -> Result<ModelCompletion> {
        let mut usage = self.usage.map(OpenAiUsage::into_usage).unwrap_or_default();
        usage.requests = 1;

        let first = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::LanguageModel("OpenAI returned no choices".into()))?;

        let tool_calls = first
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: parse_tool_arguments(&call.function.arguments),
            })
            .collect();

        Ok(ModelCompletion {
            content: first.message.content,
            tool_calls,
            usage,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

impl OpenAiUsage {
    fn into_usage(self) -> Usage {
        Usage {
            requests: 0,
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiDeltaChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDeltaChoice {
    delta: OpenAiDelta,
}

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCallDelta {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
