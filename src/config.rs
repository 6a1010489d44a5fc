//! Configuration & Bootstrap (C13): environment-first configuration with a
//! thin `clap` CLI overlay, matching the `dotenvy` + `clap derive` layering
//! convention used for process entry points elsewhere in the pack.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {0} must be a valid {1}")]
    InvalidValue(String, &'static str),
    #[error("OPENROUTER_API_KEY is required unless MOCK_MODE is set")]
    MissingApiKey,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}

/// Log output format, selectable via `--log-format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Compact,
    Json,
}

/// Process-wide configuration, assembled once at startup and shared behind
/// an `Arc` through [`crate::engine::context::WorkflowServices`].
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub mock_mode: bool,

    pub openrouter_api_key: Option<String>,
    pub openrouter_api_url: String,
    pub ollama_base_url: String,
    pub chairman_model: String,
    pub council_models: Vec<String>,

    pub api_timeout_ms: u64,
    pub title_generation_timeout_ms: u64,
    pub default_max_tokens: u32,
    pub chairman_max_tokens: Option<u32>,

    pub http_request_timeout_ms: u64,
    pub http_max_request_size_bytes: usize,
    pub http_keepalive_timeout_ms: u64,
    pub http_max_connections: usize,

    pub rate_limit_enabled: bool,
    pub rate_limit_window_ms: u64,
    pub rate_limit_max_requests: u32,
    pub rate_limit_max_workflow_executions: u32,

    pub log_level: String,
    pub log_format: LogFormat,
}

impl AppConfig {
    /// Loads configuration from the process environment. Callers typically
    /// invoke `dotenvy::dotenv().ok()` before this so a local `.env` file
    /// populates the environment first.
    pub fn from_env() -> Result<Self, ConfigError> {
        let council_models = env_or("COUNCIL_MODELS", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        let mock_mode = env_parsed("MOCK_MODE", false)?;
        let openrouter_api_key = std::env::var("OPENROUTER_API_KEY").ok();
        if openrouter_api_key.is_none() && !mock_mode {
            return Err(ConfigError::MissingApiKey);
        }

        Ok(Self {
            host: env_or("HOST", "0.0.0.0"),
            port: env_parsed("PORT", 8001u16)?,
            data_dir: PathBuf::from(env_or("DATA_DIR", "data/conversations")),
            mock_mode,

            openrouter_api_key,
            openrouter_api_url: env_or("OPENROUTER_API_URL", "https://openrouter.ai/api/v1"),
            ollama_base_url: env_or("OLLAMA_BASE_URL", "http://localhost:11434"),
            chairman_model: env_or("CHAIRMAN_MODEL", "openai/gpt-4o"),
            council_models,

            api_timeout_ms: env_parsed("API_TIMEOUT_MS", 120_000u64)?,
            title_generation_timeout_ms: env_parsed("TITLE_GENERATION_TIMEOUT_MS", 30_000u64)?,
            default_max_tokens: env_parsed("DEFAULT_MAX_TOKENS", 2048u32)?,
            chairman_max_tokens: std::env::var("CHAIRMAN_MAX_TOKENS")
                .ok()
                .map(|v| v.parse())
                .transpose()
                .map_err(|_| ConfigError::InvalidValue("CHAIRMAN_MAX_TOKENS".to_string(), "u32"))?,

            http_request_timeout_ms: env_parsed("HTTP_REQUEST_TIMEOUT_MS", 150_000u64)?,
            http_max_request_size_bytes: env_parsed("HTTP_MAX_REQUEST_SIZE_BYTES", 1_048_576usize)?,
            http_keepalive_timeout_ms: env_parsed("HTTP_KEEPALIVE_TIMEOUT_MS", 75_000u64)?,
            http_max_connections: env_parsed("HTTP_MAX_CONNECTIONS", 1024usize)?,

            rate_limit_enabled: env_parsed("RATE_LIMIT_ENABLED", true)?,
            rate_limit_window_ms: env_parsed("RATE_LIMIT_WINDOW_MS", 60_000u64)?,
            rate_limit_max_requests: env_parsed("RATE_LIMIT_MAX_REQUESTS", 60u32)?,
            rate_limit_max_workflow_executions: env_parsed(
                "RATE_LIMIT_MAX_WORKFLOW_EXECUTIONS",
                10u32,
            )?,

            log_level: env_or("RUST_LOG", "info"),
            log_format: LogFormat::Compact,
        })
    }

    /// Minimal config for unit tests that never hit the filesystem or a real
    /// upstream provider.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            data_dir: std::env::temp_dir(),
            mock_mode: true,
            openrouter_api_key: None,
            openrouter_api_url: "http://mock".to_string(),
            ollama_base_url: "http://mock".to_string(),
            chairman_model: "mock-chairman".to_string(),
            council_models: vec!["mock-a".to_string(), "mock-b".to_string()],
            api_timeout_ms: 5_000,
            title_generation_timeout_ms: 5_000,
            default_max_tokens: 2048,
            chairman_max_tokens: None,
            http_request_timeout_ms: 5_000,
            http_max_request_size_bytes: 1_048_576,
            http_keepalive_timeout_ms: 5_000,
            http_max_connections: 64,
            rate_limit_enabled: false,
            rate_limit_window_ms: 60_000,
            rate_limit_max_requests: 60,
            rate_limit_max_workflow_executions: 10,
            log_level: "debug".to_string(),
            log_format: LogFormat::Compact,
        }
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(host) = &cli.host {
            self.host = host.clone();
        }
        if let Some(dir) = &cli.data_dir {
            self.data_dir = dir.clone();
        }
        if cli.mock_mode {
            self.mock_mode = true;
        }
        if cli.no_rate_limit {
            self.rate_limit_enabled = false;
        }
        self.log_format = cli.log_format;
    }
}

/// CLI overlay for `AppConfig`. Anything left unset here falls back to the
/// environment-derived default.
#[derive(Debug, Parser)]
#[command(name = "llm-council-server", about = "Multi-model LLM deliberation service")]
pub struct Cli {
    /// Listen port (overrides PORT).
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Listen host (overrides HOST).
    #[arg(long, env = "HOST")]
    pub host: Option<String>,

    /// Conversation storage directory (overrides DATA_DIR).
    #[arg(long = "data-dir", env = "DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Use the mock backend instead of calling real upstream providers.
    #[arg(long)]
    pub mock_mode: bool,

    /// Disable rate limiting entirely, regardless of RATE_LIMIT_ENABLED.
    #[arg(long)]
    pub no_rate_limit: bool,

    /// Log output format.
    #[arg(long = "log-format", value_enum, default_value = "compact")]
    pub log_format: LogFormat,
}
