use crate::{
    config::SessionConfig,
    message::{Message, Role},
    provider::{GenerationEvent, GenerationProvider, GenerationStream, SpeechRecognizer},
};
use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        AudioInput, ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, CreateTranscriptionRequestArgs, FinishReason,
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::io::Cursor;
use tracing::debug;

/// Generation and transcription against any OpenAI-compatible API, such as
/// DashScope's compatible mode.
pub struct OpenAICompatibleClient {
    client: Client<OpenAIConfig>,
    /// Transcription model. The recognition model named in a session config is
    /// a streaming model the compatible endpoints do not serve.
    stt_model: String,
}

impl OpenAICompatibleClient {
    /// # Arguments
    ///
    /// * `config` - API key and base URL of the service.
    /// * `stt_model` - The model used for single-shot transcription (e.g. "whisper-1").
    pub fn new(config: OpenAIConfig, stt_model: impl Into<String>) -> Self {
        Self {
            client: Client::with_config(config),
            stt_model: stt_model.into(),
        }
    }
}

fn to_request_message(message: &Message) -> Result<ChatCompletionRequestMessage> {
    let content = message.content.clone();
    Ok(match message.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(content)
            .build()?
            .into(),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(content)
            .build()?
            .into(),
        Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(content)
            .build()?
            .into(),
    })
}

fn finish_reason_name(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Stop => "stop",
        FinishReason::Length => "length",
        FinishReason::ToolCalls => "tool_calls",
        FinishReason::ContentFilter => "content_filter",
        FinishReason::FunctionCall => "function_call",
    }
}

/// Wraps raw 16-bit little-endian mono PCM in a WAV container.
pub fn pcm16_to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).context("Failed to create WAV writer")?;
        for sample in pcm.chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([sample[0], sample[1]]))?;
        }
        writer.finalize().context("Failed to finalize WAV data")?;
    }
    Ok(cursor.into_inner())
}

#[async_trait]
impl GenerationProvider for OpenAICompatibleClient {
    async fn generate(
        &self,
        messages: Vec<Message>,
        config: &SessionConfig,
    ) -> Result<GenerationStream> {
        let messages = messages
            .iter()
            .map(to_request_message)
            .collect::<Result<Vec<_>>>()?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(&config.model)
            .messages(messages)
            .temperature(config.temperature)
            .max_completion_tokens(config.max_tokens)
            .stream(true)
            .build()?;
        debug!(model = %config.model, "Requesting streamed completion");

        let stream = self.client.chat().create_stream(request).await?;

        Ok(Box::pin(stream.filter_map(|result| async move {
            match result {
                Ok(response) => {
                    let choice = response.choices.into_iter().next()?;
                    if let Some(reason) = choice.finish_reason {
                        return Some(Ok(GenerationEvent::Finished {
                            finish_reason: finish_reason_name(reason).to_string(),
                        }));
                    }
                    match choice.delta.content {
                        Some(content) if !content.is_empty() => {
                            Some(Ok(GenerationEvent::Delta(content)))
                        }
                        _ => None,
                    }
                }
                Err(e) => Some(Err(e.into())),
            }
        })))
    }
}

#[async_trait]
impl SpeechRecognizer for OpenAICompatibleClient {
    async fn transcribe(&self, audio: Bytes, config: &SessionConfig) -> Result<String> {
        if audio.is_empty() {
            return Ok(String::new());
        }
        let wav = pcm16_to_wav(&audio, config.sample_rate)?;
        // "zh-CN" -> "zh": the transcription API takes ISO-639-1 codes.
        let language = config
            .language
            .split(['-', '_'])
            .next()
            .unwrap_or_default()
            .to_lowercase();

        let request = CreateTranscriptionRequestArgs::default()
            .file(AudioInput::from_vec_u8("audio.wav".to_string(), wav))
            .model(&self.stt_model)
            .language(language)
            .build()?;
        let response = self
            .client
            .audio()
            .transcribe(request)
            .await
            .context("Transcription request failed")?;
        Ok(response.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_is_wrapped_as_mono_16_bit_wav() {
        let pcm: Vec<u8> = [0i16, 1000, -1000, i16::MAX]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let wav = pcm16_to_wav(&pcm, 16000).unwrap();

        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 16000);
        assert_eq!(spec.bits_per_sample, 16);
        let samples: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0, 1000, -1000, i16::MAX]);
    }

    #[test]
    fn test_trailing_odd_byte_is_dropped() {
        let wav = pcm16_to_wav(&[1, 0, 7], 8000).unwrap();
        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.len(), 1);
    }

    #[test]
    fn test_history_maps_to_request_roles() {
        let mapped = to_request_message(&Message::assistant("hi")).unwrap();
        assert!(matches!(mapped, ChatCompletionRequestMessage::Assistant(_)));
        let mapped = to_request_message(&Message::system("rules")).unwrap();
        assert!(matches!(mapped, ChatCompletionRequestMessage::System(_)));
    }
}
