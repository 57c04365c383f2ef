use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

const DEFAULT_API_BASE: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

/// Default cap on the audio of one utterance, streamed or uploaded.
pub const DEFAULT_MAX_AUDIO_BYTES: usize = 32 * 1024 * 1024;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Which capability providers answer recognition and generation requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
    /// An OpenAI-compatible HTTP API.
    OpenAI,
    /// Deterministic local providers (echo generation, fixed transcript).
    Scripted,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub provider: Provider,
    pub llm_api_key: Option<String>,
    pub llm_api_base: String,
    /// Generation model used when a session does not name one.
    pub chat_model: String,
    /// Model for single-shot transcription.
    pub stt_model: String,
    pub log_level: Level,
    /// Upper bound on one streaming exchange.
    pub stream_deadline: Duration,
    /// Largest utterance accepted, buffered over a stream or uploaded for transcription.
    pub max_audio_bytes: usize,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:50051".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let provider_str = std::env::var("PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let provider = match provider_str.to_lowercase().as_str() {
            "openai" => Provider::OpenAI,
            "scripted" => Provider::Scripted,
            other => {
                return Err(ConfigError::InvalidValue(
                    "PROVIDER".to_string(),
                    format!("'{}' is not one of openai, scripted", other),
                ));
            }
        };

        let llm_api_key = std::env::var("LLM_API_KEY").ok().filter(|k| !k.is_empty());
        let llm_api_base =
            std::env::var("LLM_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());
        let chat_model = std::env::var("CHAT_MODEL")
            .unwrap_or_else(|_| omni_agent_core::config::DEFAULT_MODEL.to_string());
        let stt_model = std::env::var("STT_MODEL").unwrap_or_else(|_| "whisper-1".to_string());

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let deadline_str =
            std::env::var("STREAM_DEADLINE_SECS").unwrap_or_else(|_| "300".to_string());
        let stream_deadline = deadline_str
            .parse::<u64>()
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .ok_or_else(|| {
                ConfigError::InvalidValue(
                    "STREAM_DEADLINE_SECS".to_string(),
                    format!("'{}' is not a positive number of seconds", deadline_str),
                )
            })?;

        let max_audio_bytes = match std::env::var("MAX_AUDIO_BYTES") {
            Ok(raw) => raw.parse::<usize>().ok().filter(|n| *n > 0).ok_or_else(|| {
                ConfigError::InvalidValue(
                    "MAX_AUDIO_BYTES".to_string(),
                    format!("'{}' is not a positive number of bytes", raw),
                )
            })?,
            Err(_) => DEFAULT_MAX_AUDIO_BYTES,
        };

        if provider == Provider::OpenAI && llm_api_key.is_none() {
            return Err(ConfigError::MissingVar(
                "LLM_API_KEY must be set for 'openai' provider".to_string(),
            ));
        }

        Ok(Self {
            bind_address,
            provider,
            llm_api_key,
            llm_api_base,
            chat_model,
            stt_model,
            log_level,
            stream_deadline,
            max_audio_bytes,
        })
    }

    /// A configuration for tests and local runs with the scripted providers.
    pub fn scripted(bind_address: SocketAddr) -> Self {
        Self {
            bind_address,
            provider: Provider::Scripted,
            llm_api_key: None,
            llm_api_base: DEFAULT_API_BASE.to_string(),
            chat_model: omni_agent_core::config::DEFAULT_MODEL.to_string(),
            stt_model: "whisper-1".to_string(),
            log_level: Level::INFO,
            stream_deadline: Duration::from_secs(300),
            max_audio_bytes: DEFAULT_MAX_AUDIO_BYTES,
        }
    }
}
