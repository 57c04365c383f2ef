//! Session and processing configuration.
//!
//! Callers describe what they want with [`ConfigOverrides`], where every field
//! is optional. Overrides are turned into a fully-populated [`SessionConfig`]
//! by [`ConfigOverrides::resolve`], which is the only place defaults are
//! applied. Once resolved, a config has no "unset" fields left to confuse with
//! explicitly chosen values.

use crate::frame::FrameError;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL: &str = "qwen-turbo";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 2048;
pub const DEFAULT_STT_MODEL: &str = "paraformer-realtime-v2";
pub const DEFAULT_LANGUAGE: &str = "zh-CN";
pub const DEFAULT_SAMPLE_RATE: u32 = 16000;

const MAX_TEMPERATURE: f32 = 2.0;

/// A resolved configuration for a session or a single streaming exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Generation model name.
    pub model: String,
    pub temperature: f32,
    /// Maximum number of generated tokens.
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Recognition model name.
    pub stt_model: String,
    /// BCP-47 language tag passed to the recognizer.
    pub language: String,
    /// Sample rate of the PCM audio the caller will push, in Hz.
    pub sample_rate: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            system_prompt: None,
            stt_model: DEFAULT_STT_MODEL.to_string(),
            language: DEFAULT_LANGUAGE.to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}

impl SessionConfig {
    /// Resolves caller overrides against the documented defaults.
    pub fn from_overrides(overrides: ConfigOverrides) -> Result<Self, FrameError> {
        overrides.resolve(&SessionConfig::default())
    }
}

/// Caller-supplied configuration where any field may be left unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stt_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
}

impl ConfigOverrides {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn stt_model(mut self, model: impl Into<String>) -> Self {
        self.stt_model = Some(model.into());
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }

    /// Fills every unset field from `base` and validates the result.
    ///
    /// This is the single point where defaults enter a configuration.
    pub fn resolve(self, base: &SessionConfig) -> Result<SessionConfig, FrameError> {
        let config = SessionConfig {
            model: self.model.unwrap_or_else(|| base.model.clone()),
            temperature: self.temperature.unwrap_or(base.temperature),
            max_tokens: self.max_tokens.unwrap_or(base.max_tokens),
            system_prompt: self.system_prompt.or_else(|| base.system_prompt.clone()),
            stt_model: self.stt_model.unwrap_or_else(|| base.stt_model.clone()),
            language: self.language.unwrap_or_else(|| base.language.clone()),
            sample_rate: self.sample_rate.unwrap_or(base.sample_rate),
        };
        validate(&config)?;
        Ok(config)
    }
}

fn validate(config: &SessionConfig) -> Result<(), FrameError> {
    let invalid = |param: &str, reason: String| FrameError::InvalidConfig {
        param: param.to_string(),
        reason,
    };

    if config.model.trim().is_empty() {
        return Err(invalid("model", "must not be empty".into()));
    }
    if !config.temperature.is_finite() || !(0.0..=MAX_TEMPERATURE).contains(&config.temperature) {
        return Err(invalid(
            "temperature",
            format!("{} is outside [0, {}]", config.temperature, MAX_TEMPERATURE),
        ));
    }
    if config.max_tokens == 0 {
        return Err(invalid("max_tokens", "must be greater than zero".into()));
    }
    if config.stt_model.trim().is_empty() {
        return Err(invalid("stt_model", "must not be empty".into()));
    }
    if config.language.trim().is_empty() {
        return Err(invalid("language", "must not be empty".into()));
    }
    if config.sample_rate == 0 {
        return Err(invalid("sample_rate", "must be greater than zero".into()));
    }
    Ok(())
}
