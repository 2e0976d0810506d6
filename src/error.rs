use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("missing credential: environment variable `{var}` is unset or empty")]
    MissingCredential { var: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("language model error: {0}")]
    LanguageModel(String),

    #[error("invalid message history at index {index}: {reason}")]
    InvalidHistory { index: usize, reason: String },

    #[error("model output does not match `{type_name}`: {reason}")]
    OutputValidation { type_name: String, reason: String },

    #[error("tool `{0}` not found")]
    ToolNotFound(String),

    #[error("tool `{name}` invocation failed: {source}")]
    ToolInvocation {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("agent reached the step limit ({0}) without a final response")]
    StepLimit(usize),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}
