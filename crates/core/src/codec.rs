//! Maps frames to and from WebSocket-style messages.
//!
//! Control-plane frames are JSON text; audio is sent as raw binary so PCM
//! chunks are not inflated by base64 on the hot path.

use crate::frame::{ClientFrame, ServerFrame};
use bytes::Bytes;

/// A transport-neutral message: either UTF-8 text or raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("binary messages are only valid for audio frames")]
    UnexpectedBinary,
}

pub fn encode_client(frame: &ClientFrame) -> Result<WireMessage, CodecError> {
    match frame {
        ClientFrame::Audio { data } => Ok(WireMessage::Binary(data.clone())),
        other => Ok(WireMessage::Text(serde_json::to_string(other)?)),
    }
}

pub fn decode_client(message: WireMessage) -> Result<ClientFrame, CodecError> {
    match message {
        WireMessage::Binary(data) => Ok(ClientFrame::Audio { data }),
        WireMessage::Text(text) => Ok(serde_json::from_str(&text)?),
    }
}

pub fn encode_server(frame: &ServerFrame) -> Result<String, CodecError> {
    Ok(serde_json::to_string(frame)?)
}

pub fn decode_server(message: WireMessage) -> Result<ServerFrame, CodecError> {
    match message {
        WireMessage::Text(text) => Ok(serde_json::from_str(&text)?),
        WireMessage::Binary(_) => Err(CodecError::UnexpectedBinary),
    }
}
