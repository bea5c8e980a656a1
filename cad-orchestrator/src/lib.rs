//! CadAgent - text-to-CAD generation pipeline
//!
//! This crate provides:
//! - Prompt compilation with engineering heuristics
//! - LLM provider backends (Anthropic Messages, OpenAI-compatible)
//! - A fail-soft parser and validator for plan + script completions
//! - Out-of-process CadQuery execution with export normalization
//! - A deterministic fallback generator
//! - REST API for the web front end

pub mod api;
pub mod executor;
pub mod fallback;
pub mod parser;
pub mod pipeline;
pub mod plan;
pub mod prompt;
pub mod provider;
pub mod validator;

pub use executor::{ExecutionError, ExportArtifact, SandboxedExecutor};
pub use pipeline::{CadPipeline, PipelineResult};
pub use plan::GeometryPlan;
pub use provider::{LlmProvider, LlmRequest, LlmResponse};

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid PORT value: {0}")]
    InvalidPort(String),
}

/// Configuration for the CadAgent system
#[derive(Debug, Clone, Deserialize)]
pub struct CadAgentConfig {
    /// LLM attempts per request before falling back
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

fn default_max_attempts() -> usize { 2 }

impl Default for CadAgentConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            llm: LlmConfig::default(),
            executor: ExecutorConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl CadAgentConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Read `path`, or start from defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let contents =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                        path: path.to_path_buf(),
                        source,
                    })?;
                Self::from_toml_str(&contents)
            }
            None => Ok(Self::default()),
        }
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `*_API_KEY` and `PORT` overrides from `lookup`
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let key_var = match self.llm.provider_type.as_str() {
            "openai" => "OPENAI_API_KEY",
            _ => "ANTHROPIC_API_KEY",
        };
        if let Some(key) = lookup(key_var).filter(|k| !k.trim().is_empty()) {
            self.llm.api_key = Some(key);
        }

        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPort(port))?;
        }

        Ok(())
    }
}

/// Completion endpoint configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    /// Provider type: "anthropic" or "openai"
    #[serde(default = "default_provider_type")]
    pub provider_type: String,

    /// Base URL; defaults per provider type
    pub base_url: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Per-call timeout
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Normally supplied by the environment
    pub api_key: Option<String>,
}

fn default_provider_type() -> String { "anthropic".to_string() }
fn default_model() -> String { "claude-3-5-sonnet-20241022".to_string() }
fn default_temperature() -> f32 { 0.3 }
fn default_max_tokens() -> u32 { 2000 }
fn default_llm_timeout() -> u64 { 30 }

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider_type: default_provider_type(),
            base_url: None,
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout(),
            api_key: None,
        }
    }
}

impl LlmConfig {
    pub fn base_url(&self) -> &str {
        match (&self.base_url, self.provider_type.as_str()) {
            (Some(url), _) => url,
            (None, "openai") => "https://api.openai.com/v1",
            (None, _) => "https://api.anthropic.com",
        }
    }

    pub fn has_credential(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }
}

/// Script execution configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Interpreter with CadQuery installed
    #[serde(default = "default_python")]
    pub python: String,

    /// Hard limit per script run; the process is killed when exceeded
    #[serde(default = "default_executor_timeout")]
    pub timeout_secs: u64,

    /// Variables copied into the otherwise empty script environment
    #[serde(default = "default_env_passthrough")]
    pub env_passthrough: Vec<String>,

    /// Variables set for the script process, e.g. a `PYTHONPATH` pointing at
    /// a CadQuery install
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_python() -> String { "python3".to_string() }
fn default_executor_timeout() -> u64 { 60 }
fn default_env_passthrough() -> Vec<String> {
    ["PATH", "PYTHONPATH", "LD_LIBRARY_PATH", "CONDA_PREFIX", "HOME"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            python: default_python(),
            timeout_secs: default_executor_timeout(),
            env_passthrough: default_env_passthrough(),
            env: BTreeMap::new(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory served for `/` and other static paths
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,

    /// Max tracing level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_static_dir() -> PathBuf { PathBuf::from("static") }
fn default_log_level() -> String { "info".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            static_dir: default_static_dir(),
            log_level: default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = CadAgentConfig::from_toml_str("").unwrap();
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.llm.provider_type, "anthropic");
        assert_eq!(config.llm.base_url(), "https://api.anthropic.com");
        assert_eq!(config.llm.timeout_secs, 30);
        assert_eq!(config.executor.timeout_secs, 60);
        assert_eq!(config.server.port, 8080);
        assert!(!config.llm.has_credential());
    }

    #[test]
    fn test_partial_sections() {
        let config = CadAgentConfig::from_toml_str(
            r#"
max_attempts = 3

[llm]
provider_type = "openai"
model = "gpt-4o"

[executor]
python = "/opt/conda/bin/python"

[executor.env]
PYTHONPATH = "/opt/cad/site-packages"
"#,
        )
        .unwrap();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.llm.base_url(), "https://api.openai.com/v1");
        assert_eq!(config.llm.temperature, 0.3);
        assert_eq!(config.executor.python, "/opt/conda/bin/python");
        assert_eq!(config.executor.timeout_secs, 60);
        assert!(config.executor.env_passthrough.contains(&"PATH".to_string()));
        assert_eq!(
            config.executor.env.get("PYTHONPATH").map(String::as_str),
            Some("/opt/cad/site-packages")
        );
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(matches!(
            CadAgentConfig::from_toml_str("max_attempts = \"two\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = CadAgentConfig::load(Some(Path::new("/nonexistent/cadagent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(CadAgentConfig::load(None).is_ok());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("ANTHROPIC_API_KEY", "sk-ant"),
            ("OPENAI_API_KEY", "sk-oai"),
            ("PORT", "9000"),
        ]
        .into_iter()
        .collect();
        let lookup = |key: &str| env.get(key).map(|v| v.to_string());

        let mut config = CadAgentConfig::default();
        config.apply_overrides(lookup).unwrap();
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-ant"));
        assert_eq!(config.server.port, 9000);

        let mut config = CadAgentConfig::default();
        config.llm.provider_type = "openai".to_string();
        config.apply_overrides(lookup).unwrap();
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-oai"));
    }

    #[test]
    fn test_bad_port_is_rejected() {
        let mut config = CadAgentConfig::default();
        let result = config.apply_overrides(|key| (key == "PORT").then(|| "eighty".to_string()));
        assert!(matches!(result, Err(ConfigError::InvalidPort(_))));
    }
}
