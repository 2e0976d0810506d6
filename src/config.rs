use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: String,
    pub model: String,
    /// Environment variable holding the credential.
    pub api_key_env: String,
    /// Explicit credential; takes precedence over `api_key_env`.
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub organization: Option<String>,
    pub stream: bool,
    pub max_steps: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            api_key_env: DEFAULT_API_KEY_ENV.into(),
            api_key: None,
            base_url: None,
            organization: None,
            stream: false,
            max_steps: 6,
        }
    }
}

impl ModelConfig {
    /// Resolves the provider credential, failing if it is absent or blank.
    pub fn api_key(&self) -> Result<String> {
        if let Some(key) = self.api_key.as_deref().map(str::trim) {
            if !key.is_empty() {
                return Ok(key.to_string());
            }
        }
        match env::var(&self.api_key_env) {
            Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
            _ => Err(AgentError::MissingCredential {
                var: self.api_key_env.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn from_env_or_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = Self::from_file(path)?;
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(model) = env::var("AGENT_MODEL") {
            self.model.model = model;
        }
        if let Ok(provider) = env::var("AGENT_PROVIDER") {
            self.model.provider = provider.to_ascii_lowercase();
        }
        if let Ok(base_url) = env::var("AGENT_BASE_URL") {
            self.model.base_url = Some(base_url);
        }
        if let Ok(stream) = env::var("AGENT_STREAMING") {
            self.model.stream = stream.parse::<bool>().map_err(|_| {
                AgentError::Config(format!("AGENT_STREAMING must be true or false, got `{stream}`"))
            })?;
        }
        if let Ok(filter) = env::var("AGENT_LOG") {
            self.logging.filter = filter;
        }
        Ok(())
    }
}

/// Loads variables from a `.env` file in the working directory or its parents.
/// A missing file is not an error.
pub fn load_dotenv() -> Result<()> {
    match dotenvy::dotenv() {
        Ok(path) => {
            tracing::debug!(path = %path.display(), "loaded .env file");
            Ok(())
        }
        Err(err) if err.not_found() => Ok(()),
        Err(err) => Err(AgentError::Config(format!("failed to read .env file: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    #[serial]
    fn loads_and_overrides() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[model]\nprovider='openai'\nmodel='gpt-4o'\nmax_steps=3\n[logging]\nformat='json'"
        )
        .unwrap();

        env::set_var("AGENT_MODEL", "gpt-4o-mini");
        let cfg = AppConfig::from_env_or_file(file.path()).unwrap();
        env::remove_var("AGENT_MODEL");

        assert_eq!(cfg.model.model, "gpt-4o-mini");
        assert_eq!(cfg.model.max_steps, 3);
        assert_eq!(cfg.model.api_key_env, DEFAULT_API_KEY_ENV);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.logging.filter, "info");
    }

    #[test]
    #[serial]
    fn rejects_malformed_streaming_flag() {
        env::set_var("AGENT_STREAMING", "sometimes");
        let result = AppConfig::from_env();
        env::remove_var("AGENT_STREAMING");

        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[test]
    fn rejects_malformed_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[model\nmodel=").unwrap();
        assert!(matches!(
            AppConfig::from_file(file.path()),
            Err(AgentError::Toml(_))
        ));
    }

    #[test]
    #[serial]
    fn missing_credential_fails() {
        let cfg = ModelConfig {
            api_key_env: "STRUCTURED_AGENT_TEST_UNSET_KEY".into(),
            ..ModelConfig::default()
        };
        env::remove_var("STRUCTURED_AGENT_TEST_UNSET_KEY");

        match cfg.api_key() {
            Err(AgentError::MissingCredential { var }) => {
                assert_eq!(var, "STRUCTURED_AGENT_TEST_UNSET_KEY")
            }
            other => panic!("expected missing credential, got {other:?}"),
        }
    }

    #[test]
    #[serial]
    fn empty_credential_fails() {
        let cfg = ModelConfig {
            api_key_env: "STRUCTURED_AGENT_TEST_EMPTY_KEY".into(),
            api_key: Some("  ".into()),
            ..ModelConfig::default()
        };
        env::set_var("STRUCTURED_AGENT_TEST_EMPTY_KEY", "   ");
        let result = cfg.api_key();
        env::remove_var("STRUCTURED_AGENT_TEST_EMPTY_KEY");

        assert!(matches!(result, Err(AgentError::MissingCredential { .. })));
    }

    #[test]
    #[serial]
    fn explicit_key_wins_over_env() {
        let cfg = ModelConfig {
            api_key_env: "STRUCTURED_AGENT_TEST_SET_KEY".into(),
            api_key: Some("sk-explicit".into()),
            ..ModelConfig::default()
        };
        env::set_var("STRUCTURED_AGENT_TEST_SET_KEY", "sk-env");
        let key = cfg.api_key().unwrap();
        env::remove_var("STRUCTURED_AGENT_TEST_SET_KEY");

        assert_eq!(key, "sk-explicit");
    }
}
