use crate::{fault::Fault, frame::FrameError, session::SessionError, state::ProtocolViolation};

/// Everything a [`Stream`](crate::stream::Stream) operation can fail with.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    /// The exchange failed; the stream has already been released.
    #[error(transparent)]
    Fault(#[from] Fault),
    /// The frame is not allowed in the current phase and was not sent.
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl StreamError {
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            StreamError::Fault(fault) => Some(fault),
            _ => None,
        }
    }
}
