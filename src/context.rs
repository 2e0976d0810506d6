use crate::llm::Usage;

/// Per-run state handed to tools and dynamic system prompts.
///
/// `deps` is the dependency value supplied to [`crate::Agent::run`]. Its type is
/// fixed by the agent definition, so tools read it without downcasting.
#[derive(Debug, Clone)]
pub struct RunContext<D> {
    pub deps: D,
    pub prompt: String,
    pub model: String,
    pub usage: Usage,
    pub step: usize,
}

impl<D> RunContext<D> {
    pub fn new(deps: D, prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            deps,
            prompt: prompt.into(),
            model: model.into(),
            usage: Usage::default(),
            step: 0,
        }
    }
}
