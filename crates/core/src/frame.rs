//! The frame vocabulary exchanged over a streaming channel.
//!
//! [`ClientFrame`]s travel from the caller to the agent, [`ServerFrame`]s travel
//! back. Shape rules (non-empty session id, no audio among the initial inputs,
//! well-formed image descriptors) are checked when a frame is constructed, so a
//! frame that exists is a frame that may be put on the wire.

use crate::{config::SessionConfig, message::Message, message::Role};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A construction-time violation of the frame shapes.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("start frame requires a non-empty session id")]
    EmptySessionId,
    #[error("initial text input #{0} is empty")]
    EmptyText(usize),
    #[error("initial image input #{index} is invalid: {reason}")]
    InvalidImage { index: usize, reason: String },
    #[error("invalid config parameter '{param}': {reason}")]
    InvalidConfig { param: String, reason: String },
}

impl FrameError {
    /// The name of the offending parameter, for callers that branch on it.
    pub fn param(&self) -> &str {
        match self {
            FrameError::EmptySessionId => "session_id",
            FrameError::EmptyText(_) | FrameError::InvalidImage { .. } => "initial_inputs",
            FrameError::InvalidConfig { param, .. } => param,
        }
    }
}

/// Non-streamed input that seeds an exchange. Audio is never an initial input;
/// it only travels in [`ClientFrame::Audio`] after the start frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InitialInput {
    Text {
        content: String,
        #[serde(default = "default_text_role")]
        role: Role,
    },
    Image {
        #[serde(with = "base64_bytes")]
        data: Bytes,
        format: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },
}

fn default_text_role() -> Role {
    Role::User
}

impl InitialInput {
    pub fn text(content: impl Into<String>) -> Self {
        InitialInput::Text {
            content: content.into(),
            role: Role::User,
        }
    }

    pub fn image(data: impl Into<Bytes>, format: impl Into<String>, prompt: Option<String>) -> Self {
        InitialInput::Image {
            data: data.into(),
            format: format.into(),
            prompt,
        }
    }

    /// Returns the text content when this is a user text input.
    pub fn user_text(&self) -> Option<&str> {
        match self {
            InitialInput::Text {
                content,
                role: Role::User,
            } => Some(content),
            _ => None,
        }
    }
}

/// The first frame of every stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartFrame {
    pub session_id: String,
    pub config: SessionConfig,
    #[serde(default)]
    pub initial_inputs: Vec<InitialInput>,
    /// Session history as it stood when the exchange began.
    #[serde(default)]
    pub history: Vec<Message>,
}

impl StartFrame {
    pub fn new(
        session_id: impl Into<String>,
        config: SessionConfig,
        initial_inputs: Vec<InitialInput>,
        history: Vec<Message>,
    ) -> Result<Self, FrameError> {
        let frame = Self {
            session_id: session_id.into(),
            config,
            initial_inputs,
            history,
        };
        frame.validate()?;
        Ok(frame)
    }

    /// Checks the shape rules. Also used on frames that arrive off the wire.
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.session_id.trim().is_empty() {
            return Err(FrameError::EmptySessionId);
        }
        validate_inputs(&self.initial_inputs)
    }

    /// Concatenated user text of the initial inputs, if any was supplied.
    pub fn user_text(&self) -> Option<String> {
        joined_user_text(&self.initial_inputs)
    }
}

pub(crate) fn validate_inputs(inputs: &[InitialInput]) -> Result<(), FrameError> {
    for (index, input) in inputs.iter().enumerate() {
        match input {
            InitialInput::Text { content, .. } if content.trim().is_empty() => {
                return Err(FrameError::EmptyText(index));
            }
            InitialInput::Image { data, .. } if data.is_empty() => {
                return Err(FrameError::InvalidImage {
                    index,
                    reason: "image data is empty".into(),
                });
            }
            InitialInput::Image { format, .. } if format.trim().is_empty() => {
                return Err(FrameError::InvalidImage {
                    index,
                    reason: "image format is missing".into(),
                });
            }
            _ => {}
        }
    }
    Ok(())
}

pub(crate) fn joined_user_text(inputs: &[InitialInput]) -> Option<String> {
    let parts: Vec<&str> = inputs.iter().filter_map(InitialInput::user_text).collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

/// Commands carried by a control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    /// Emit a best-effort partial transcript for the audio buffered so far.
    Flush,
    /// No further audio will be sent.
    EndAudio,
    /// Abandon the exchange.
    Cancel,
}

/// Frames sent from the caller to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Start(StartFrame),
    Audio {
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },
    Control { command: ControlCommand },
}

impl ClientFrame {
    pub fn kind(&self) -> OutboundKind {
        match self {
            ClientFrame::Start(_) => OutboundKind::Start,
            ClientFrame::Audio { .. } => OutboundKind::Audio,
            ClientFrame::Control { command } => match command {
                ControlCommand::Flush => OutboundKind::Flush,
                ControlCommand::EndAudio => OutboundKind::EndAudio,
                ControlCommand::Cancel => OutboundKind::Cancel,
            },
        }
    }

    pub fn control(command: ControlCommand) -> Self {
        ClientFrame::Control { command }
    }
}

/// The kind of an outbound frame, as seen by the stream state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundKind {
    Start,
    Audio,
    Flush,
    EndAudio,
    Cancel,
}

impl fmt::Display for OutboundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutboundKind::Start => "start",
            OutboundKind::Audio => "audio",
            OutboundKind::Flush => "flush",
            OutboundKind::EndAudio => "end_audio",
            OutboundKind::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

/// Frames sent from the agent back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// The agent accepted the start frame.
    Ready { session_id: String },
    /// Incremental speech-to-text output.
    SttPartial {
        text: String,
        #[serde(default)]
        is_final: bool,
    },
    /// Incremental generation output.
    LlmDelta { text: String },
    /// Terminal: the exchange finished normally.
    Complete { finish_reason: String },
    /// Terminal: the exchange failed on the far side.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        message: String,
        /// The offending parameter of an `invalid_argument` error.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        param: Option<String>,
    },
}

impl ServerFrame {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerFrame::Complete { .. } | ServerFrame::Error { .. })
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code: Some(code.into()),
            message: message.into(),
            param: None,
        }
    }

    /// Names the offending parameter. No effect on non-error frames.
    pub fn with_param(mut self, name: impl Into<String>) -> Self {
        if let ServerFrame::Error { param, .. } = &mut self {
            *param = Some(name.into());
        }
        self
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_frame_rejects_blank_session_id() {
        let err = StartFrame::new(" ", SessionConfig::default(), vec![], vec![]).unwrap_err();
        assert_eq!(err, FrameError::EmptySessionId);
        assert_eq!(err.param(), "session_id");
    }

    #[test]
    fn test_start_frame_rejects_malformed_inputs() {
        let err = StartFrame::new(
            "s1",
            SessionConfig::default(),
            vec![InitialInput::text("hi"), InitialInput::text("")],
            vec![],
        )
        .unwrap_err();
        assert_eq!(err, FrameError::EmptyText(1));

        let err = StartFrame::new(
            "s1",
            SessionConfig::default(),
            vec![InitialInput::image(Bytes::new(), "png", None)],
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, FrameError::InvalidImage { index: 0, .. }));
    }

    #[test]
    fn test_user_text_joins_only_user_text_inputs() {
        let frame = StartFrame::new(
            "s1",
            SessionConfig::default(),
            vec![
                InitialInput::text("first"),
                InitialInput::Text {
                    content: "ignored".into(),
                    role: Role::System,
                },
                InitialInput::image(vec![1u8, 2, 3], "png", Some("what is this".into())),
                InitialInput::text("second"),
            ],
            vec![],
        )
        .unwrap();
        assert_eq!(frame.user_text().as_deref(), Some("first\nsecond"));

        let audio_only = StartFrame::new("s1", SessionConfig::default(), vec![], vec![]).unwrap();
        assert_eq!(audio_only.user_text(), None);
    }

    #[test]
    fn test_client_frame_kinds() {
        assert_eq!(
            ClientFrame::control(ControlCommand::EndAudio).kind(),
            OutboundKind::EndAudio
        );
        assert_eq!(
            ClientFrame::Audio {
                data: Bytes::from_static(b"\x00\x01")
            }
            .kind(),
            OutboundKind::Audio
        );
    }

    #[test]
    fn test_only_complete_and_error_are_terminal() {
        assert!(
            ServerFrame::Complete {
                finish_reason: "stop".into()
            }
            .is_terminal()
        );
        assert!(ServerFrame::error("unavailable", "down").is_terminal());
        assert!(
            !ServerFrame::LlmDelta {
                text: "x".into()
            }
            .is_terminal()
        );
        assert!(
            !ServerFrame::Ready {
                session_id: "s1".into()
            }
            .is_terminal()
        );
    }

    #[test]
    fn test_server_frame_json_shape() {
        let json = serde_json::to_string(&ServerFrame::SttPartial {
            text: "你好".into(),
            is_final: false,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"stt_partial","text":"你好","is_final":false}"#);

        let frame: ServerFrame =
            serde_json::from_str(r#"{"type":"error","message":"boom"}"#).unwrap();
        assert_eq!(
            frame,
            ServerFrame::Error {
                code: None,
                message: "boom".into(),
                param: None,
            }
        );

        let frame = ServerFrame::error("invalid_argument", "blank").with_param("session_id");
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(
            json,
            r#"{"type":"error","code":"invalid_argument","message":"blank","param":"session_id"}"#
        );
        assert_eq!(serde_json::from_str::<ServerFrame>(&json).unwrap(), frame);
    }
}
