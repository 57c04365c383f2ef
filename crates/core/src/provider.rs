//! Capability providers invoked by the far side of a stream.
//!
//! The server depends only on these traits; which implementation answers is
//! decided at startup.

use crate::{
    config::SessionConfig,
    message::{Message, Role},
};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;

/// One event of a streamed generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    Delta(String),
    Finished { finish_reason: String },
}

pub type GenerationStream = BoxStream<'static, Result<GenerationEvent>>;

/// A fully materialized generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatReply {
    pub content: String,
    pub finish_reason: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Streams a reply to `messages`.
    async fn generate(
        &self,
        messages: Vec<Message>,
        config: &SessionConfig,
    ) -> Result<GenerationStream>;

    /// Generates a reply and waits for all of it.
    async fn complete(&self, messages: Vec<Message>, config: &SessionConfig) -> Result<ChatReply> {
        let mut stream = self.generate(messages, config).await?;
        let mut content = String::new();
        let mut finish_reason = String::from("stop");
        while let Some(event) = stream.next().await {
            match event? {
                GenerationEvent::Delta(text) => content.push_str(&text),
                GenerationEvent::Finished { finish_reason: reason } => {
                    finish_reason = reason;
                    break;
                }
            }
        }
        Ok(ChatReply {
            content,
            finish_reason,
        })
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Transcribes 16-bit little-endian mono PCM sampled at `config.sample_rate`.
    async fn transcribe(&self, audio: Bytes, config: &SessionConfig) -> Result<String>;
}

/// Replies by repeating the last user message, a few characters at a time.
#[derive(Debug, Clone)]
pub struct EchoGenerator {
    prefix: String,
    chunk_chars: usize,
}

impl Default for EchoGenerator {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            chunk_chars: 4,
        }
    }
}

impl EchoGenerator {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl GenerationProvider for EchoGenerator {
    async fn generate(
        &self,
        messages: Vec<Message>,
        _config: &SessionConfig,
    ) -> Result<GenerationStream> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let reply: Vec<char> = format!("{}{}", self.prefix, last_user).chars().collect();

        let mut events: Vec<Result<GenerationEvent>> = reply
            .chunks(self.chunk_chars.max(1))
            .map(|chunk| Ok(GenerationEvent::Delta(chunk.iter().collect())))
            .collect();
        events.push(Ok(GenerationEvent::Finished {
            finish_reason: "stop".into(),
        }));
        Ok(stream::iter(events).boxed())
    }
}

/// Returns a fixed transcript for any non-empty audio.
#[derive(Debug, Clone)]
pub struct ScriptedRecognizer {
    transcript: String,
}

impl ScriptedRecognizer {
    pub fn new(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
        }
    }
}

#[async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    async fn transcribe(&self, audio: Bytes, _config: &SessionConfig) -> Result<String> {
        if audio.is_empty() {
            return Ok(String::new());
        }
        Ok(self.transcript.clone())
    }
}
