use omni_agent_core::{Fault, SessionError, StreamError};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// A classified failure from the server or the network.
    #[error(transparent)]
    Fault(#[from] Fault),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("invalid client configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// The fault behind this error, when there is one to branch on.
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            ClientError::Fault(fault) => Some(fault),
            ClientError::Stream(error) => error.fault(),
            _ => None,
        }
    }
}
