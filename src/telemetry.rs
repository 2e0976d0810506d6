use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{AgentError, Result};

/// Builds the filter from `RUST_LOG` when set, otherwise from the config.
pub fn env_filter(cfg: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&cfg.filter)
            .map_err(|err| AgentError::Config(format!("invalid log filter `{}`: {err}", cfg.filter))),
    }
}

/// Installs the global `tracing` subscriber. Logs go to stderr so program output
/// on stdout stays clean.
pub fn init_tracing(cfg: &LoggingConfig) -> Result<()> {
    let filter = env_filter(cfg)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = match cfg.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|err| AgentError::Config(format!("failed to install tracing subscriber: {err}")))
}
