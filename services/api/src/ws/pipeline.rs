//! Recognition and generation for one finished utterance.

use super::session::{SharedSink, send_frame};
use crate::state::AppState;
use anyhow::Result;
use bytes::Bytes;
use futures_util::StreamExt;
use omni_agent_core::{
    InitialInput, Message as ChatMessage, Role, ServerFrame, StartFrame, TransportCode,
    provider::GenerationEvent,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Assembles the conversation sent to the generator.
///
/// The configured system prompt leads unless the history already carries one.
/// History follows, then the initial text inputs, then the transcript as the
/// newest user turn.
pub(crate) fn build_messages(start: &StartFrame, transcript: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(start.history.len() + start.initial_inputs.len() + 2);

    let history_has_system = start.history.iter().any(|m| m.role == Role::System);
    if let Some(prompt) = start.config.system_prompt.as_deref() {
        if !history_has_system && !prompt.trim().is_empty() {
            messages.push(ChatMessage::system(prompt));
        }
    }
    messages.extend(start.history.iter().cloned());

    for input in &start.initial_inputs {
        match input {
            InitialInput::Text { content, role } => {
                messages.push(ChatMessage::new(*role, content.clone()));
            }
            InitialInput::Image { format, prompt, .. } => {
                // Only the caption reaches the text-only generator.
                debug!(%format, "Image input forwarded as its prompt only");
                if let Some(prompt) = prompt.as_deref().filter(|p| !p.trim().is_empty()) {
                    messages.push(ChatMessage::user(prompt));
                }
            }
        }
    }

    if !transcript.trim().is_empty() {
        messages.push(ChatMessage::user(transcript));
    }
    messages
}

/// Transcribes `audio`, then streams the generated reply to the client.
///
/// Always ends with exactly one terminal frame unless the socket itself fails,
/// which is the only error returned.
pub(crate) async fn respond(
    state: Arc<AppState>,
    start: Arc<StartFrame>,
    audio: Bytes,
    socket_tx: SharedSink,
) -> Result<()> {
    let transcript = if audio.is_empty() {
        String::new()
    } else {
        match state.recognizer.transcribe(audio, &start.config).await {
            Ok(text) => text,
            Err(e) => return fail(&socket_tx, "Speech recognition failed", e).await,
        }
    };
    if !transcript.is_empty() {
        send_frame(
            &socket_tx,
            &ServerFrame::SttPartial {
                text: transcript.clone(),
                is_final: true,
            },
        )
        .await?;
    }

    let messages = build_messages(&start, &transcript);
    if !messages.iter().any(|m| m.role == Role::User) {
        warn!("No recognized speech and no user text; nothing to answer.");
        let param = if start.initial_inputs.is_empty() {
            "audio"
        } else {
            "initial_inputs"
        };
        let frame = ServerFrame::error(
            TransportCode::InvalidArgument.as_str(),
            "no speech was recognized and no text input was given",
        )
        .with_param(param);
        return send_frame(&socket_tx, &frame).await;
    }

    info!(messages = messages.len(), model = %start.config.model, "Generating reply");
    let mut stream = match state.generator.generate(messages, &start.config).await {
        Ok(stream) => stream,
        Err(e) => return fail(&socket_tx, "Generation failed", e).await,
    };

    let mut finish_reason = String::from("stop");
    while let Some(event) = stream.next().await {
        match event {
            Ok(GenerationEvent::Delta(text)) if text.is_empty() => {}
            Ok(GenerationEvent::Delta(text)) => {
                send_frame(&socket_tx, &ServerFrame::LlmDelta { text }).await?;
            }
            Ok(GenerationEvent::Finished { finish_reason: reason }) => {
                finish_reason = reason;
                break;
            }
            Err(e) => return fail(&socket_tx, "Generation failed", e).await,
        }
    }
    send_frame(&socket_tx, &ServerFrame::Complete { finish_reason }).await
}

async fn fail(socket_tx: &SharedSink, context: &str, err: anyhow::Error) -> Result<()> {
    warn!(error = ?err, "{}", context);
    send_frame(
        socket_tx,
        &ServerFrame::error(
            TransportCode::Unavailable.as_str(),
            format!("{context}: {err}"),
        ),
    )
    .await
}
