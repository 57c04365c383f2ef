//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the session
//! registry and the capability providers every handler talks to.

use crate::config::{Config, Provider};
use crate::store::SessionStore;
use anyhow::Context;
use async_openai::config::OpenAIConfig;
use omni_agent_core::{
    SessionConfig,
    openai::OpenAICompatibleClient,
    provider::{EchoGenerator, GenerationProvider, ScriptedRecognizer, SpeechRecognizer},
};
use std::sync::Arc;
use tracing::info;

/// Transcript returned by the scripted recognizer for any non-empty audio.
pub const SCRIPTED_TRANSCRIPT: &str = "你好";

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionStore>,
    pub generator: Arc<dyn GenerationProvider>,
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        config: Config,
        generator: Arc<dyn GenerationProvider>,
        recognizer: Arc<dyn SpeechRecognizer>,
    ) -> Self {
        Self {
            sessions: Arc::new(SessionStore::new()),
            generator,
            recognizer,
            config: Arc::new(config),
        }
    }

    /// Builds the providers named by `config.provider`.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        match config.provider {
            Provider::OpenAI => {
                let api_key = config
                    .llm_api_key
                    .clone()
                    .context("LLM_API_KEY is required for the openai provider")?;
                info!(api_base = %config.llm_api_base, "Using OpenAI-compatible providers.");
                let openai_config = OpenAIConfig::new()
                    .with_api_key(api_key)
                    .with_api_base(config.llm_api_base.clone());
                let client = Arc::new(OpenAICompatibleClient::new(
                    openai_config,
                    config.stt_model.clone(),
                ));
                Ok(Self::new(config, client.clone(), client))
            }
            Provider::Scripted => {
                info!("Using scripted providers.");
                Ok(Self::new(
                    config,
                    Arc::new(EchoGenerator::default()),
                    Arc::new(ScriptedRecognizer::new(SCRIPTED_TRANSCRIPT)),
                ))
            }
        }
    }

    /// The config new sessions start from before caller overrides apply.
    pub fn base_session_config(&self) -> SessionConfig {
        SessionConfig {
            model: self.config.chat_model.clone(),
            ..SessionConfig::default()
        }
    }
}
