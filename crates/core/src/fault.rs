//! Fault taxonomy and the transport-failure mapper.
//!
//! Every failure a transport can report is described by a [`TransportFailure`]
//! and converted into exactly one [`Fault`] by [`Fault::from_transport`]. The
//! mapping is total and pure: it never fails and the same input always yields
//! the same fault.

use std::fmt;

/// A raw failure code as reported by the channel or an RPC.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportCode {
    Unavailable,
    NotFound,
    DeadlineExceeded,
    InvalidArgument,
    Cancelled,
    Internal,
    /// An HTTP status with no more specific meaning.
    Http(u16),
    /// A WebSocket close code with no more specific meaning.
    WsClose(u16),
    Other(String),
}

impl TransportCode {
    pub fn from_http_status(status: u16) -> Self {
        match status {
            502 | 503 | 429 => TransportCode::Unavailable,
            404 => TransportCode::NotFound,
            408 | 504 => TransportCode::DeadlineExceeded,
            400 | 422 => TransportCode::InvalidArgument,
            500 => TransportCode::Internal,
            other => TransportCode::Http(other),
        }
    }

    pub fn from_ws_close(code: u16) -> Self {
        match code {
            1001 | 1012 | 1013 => TransportCode::Unavailable,
            1008 => TransportCode::InvalidArgument,
            1011 => TransportCode::Internal,
            other => TransportCode::WsClose(other),
        }
    }

    /// Parses the code string carried by a remote error frame.
    pub fn parse(code: &str) -> Self {
        match code.trim().to_ascii_lowercase().as_str() {
            "unavailable" => TransportCode::Unavailable,
            "not_found" => TransportCode::NotFound,
            "deadline_exceeded" | "timeout" => TransportCode::DeadlineExceeded,
            "invalid_argument" | "invalid_param" => TransportCode::InvalidArgument,
            "cancelled" => TransportCode::Cancelled,
            "internal" => TransportCode::Internal,
            _ => TransportCode::Other(code.to_string()),
        }
    }

    pub fn as_str(&self) -> String {
        match self {
            TransportCode::Unavailable => "unavailable".into(),
            TransportCode::NotFound => "not_found".into(),
            TransportCode::DeadlineExceeded => "deadline_exceeded".into(),
            TransportCode::InvalidArgument => "invalid_argument".into(),
            TransportCode::Cancelled => "cancelled".into(),
            TransportCode::Internal => "internal".into(),
            TransportCode::Http(status) => format!("http_{status}"),
            TransportCode::WsClose(code) => format!("ws_close_{code}"),
            TransportCode::Other(code) => code.clone(),
        }
    }
}

impl fmt::Display for TransportCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

/// A failure reported by a transport, with whatever context the caller knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    pub code: TransportCode,
    pub message: String,
    /// The session the failing call was about, when known.
    pub session_id: Option<String>,
    /// The offending parameter, when the far side named one.
    pub param: Option<String>,
}

impl TransportFailure {
    pub fn new(code: TransportCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            session_id: None,
            param: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    Unavailable,
    NotFound,
    Timeout,
    InvalidParameter,
    Unknown,
}

/// What a caller may do after a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Retry the same call after a backoff.
    WithBackoff,
    /// Retry only after fixing the call (re-create the session, fix the argument).
    AfterCorrection,
    Never,
}

/// A classified failure surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    #[error("service unavailable: {message}")]
    Unavailable { message: String },
    #[error("session not found: {session_id}")]
    NotFound { session_id: String, message: String },
    #[error("request timed out: {message}")]
    Timeout { message: String },
    #[error("invalid parameter '{param}': {message}")]
    InvalidParameter { param: String, message: String },
    #[error("unexpected failure ({code}): {message}")]
    Unknown { code: String, message: String },
}

impl Fault {
    /// Maps a transport failure onto exactly one fault kind.
    pub fn from_transport(failure: &TransportFailure) -> Self {
        let message = failure.message.clone();
        match &failure.code {
            TransportCode::Unavailable => Fault::Unavailable { message },
            TransportCode::NotFound => {
                let session_id = failure
                    .session_id
                    .clone()
                    .filter(|id| !id.is_empty())
                    .or_else(|| Some(message.clone()).filter(|m| !m.is_empty()))
                    .unwrap_or_else(|| "unknown".to_string());
                Fault::NotFound {
                    session_id,
                    message,
                }
            }
            TransportCode::DeadlineExceeded => Fault::Timeout { message },
            TransportCode::InvalidArgument => Fault::InvalidParameter {
                param: failure
                    .param
                    .clone()
                    .filter(|p| !p.is_empty())
                    .unwrap_or_else(|| "unknown".to_string()),
                message,
            },
            code => Fault::Unknown {
                code: code.as_str(),
                message,
            },
        }
    }

    /// Maps the payload of a remote error frame.
    pub fn from_remote(
        code: Option<&str>,
        param: Option<&str>,
        message: &str,
        session_id: &str,
    ) -> Self {
        let code = code.map(TransportCode::parse).unwrap_or(TransportCode::Internal);
        let mut failure = TransportFailure::new(code, message).with_session(session_id);
        if let Some(param) = param {
            failure = failure.with_param(param);
        }
        Fault::from_transport(&failure)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Fault::from_transport(&TransportFailure::new(
            TransportCode::DeadlineExceeded,
            message,
        ))
    }

    pub fn kind(&self) -> FaultKind {
        match self {
            Fault::Unavailable { .. } => FaultKind::Unavailable,
            Fault::NotFound { .. } => FaultKind::NotFound,
            Fault::Timeout { .. } => FaultKind::Timeout,
            Fault::InvalidParameter { .. } => FaultKind::InvalidParameter,
            Fault::Unknown { .. } => FaultKind::Unknown,
        }
    }

    pub fn retry(&self) -> Retry {
        match self.kind() {
            FaultKind::Unavailable | FaultKind::Timeout => Retry::WithBackoff,
            FaultKind::NotFound | FaultKind::InvalidParameter => Retry::AfterCorrection,
            FaultKind::Unknown => Retry::Never,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retry() == Retry::WithBackoff
    }
}

impl From<TransportFailure> for Fault {
    fn from(failure: TransportFailure) -> Self {
        Fault::from_transport(&failure)
    }
}
