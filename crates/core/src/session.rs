//! Session identity, configuration and the conversation log.
//!
//! A [`Session`] is a cheap, clonable handle. History is read by streaming
//! exchanges when they start and written once they complete; while an
//! [`Exchange`] is open every other mutation of the log is rejected.

use crate::{
    config::SessionConfig,
    message::{Message, Role},
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session id must not be empty")]
    EmptySessionId,
    #[error("session {0} is closed")]
    Closed(String),
    #[error("session {0} already has an exchange in flight")]
    ExchangeInFlight(String),
}

#[derive(Debug)]
struct SessionInner {
    id: String,
    config: SessionConfig,
    history: RwLock<Vec<Message>>,
    closed: AtomicBool,
    exchange_in_flight: AtomicBool,
}

#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Creates a session. A system prompt in `config` seeds the history.
    pub fn new(id: impl Into<String>, config: SessionConfig) -> Result<Self, SessionError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(SessionError::EmptySessionId);
        }
        let history = config
            .system_prompt
            .as_ref()
            .map(|prompt| vec![Message::system(prompt.clone())])
            .unwrap_or_default();
        Ok(Self {
            inner: Arc::new(SessionInner {
                id,
                config,
                history: RwLock::new(history),
                closed: AtomicBool::new(false),
                exchange_in_flight: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// A snapshot of the history.
    pub fn messages(&self) -> Vec<Message> {
        self.inner.history.read().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn has_exchange_in_flight(&self) -> bool {
        self.inner.exchange_in_flight.load(Ordering::Acquire)
    }

    /// Ends the session. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        let first = !self.inner.closed.swap(true, Ordering::AcqRel);
        if first {
            debug!(session_id = %self.inner.id, "Session closed");
        }
        first
    }

    /// Appends a message. A system message replaces the system prompt instead,
    /// so the log never holds more than one and it always sits first.
    pub fn add_message(&self, message: Message) -> Result<(), SessionError> {
        self.ensure_mutable()?;
        if message.role == Role::System {
            put_system_prompt(&mut self.inner.history.write(), message.content);
        } else {
            self.inner.history.write().push(message);
        }
        Ok(())
    }

    pub fn set_system_prompt(&self, prompt: impl Into<String>) -> Result<(), SessionError> {
        self.ensure_mutable()?;
        put_system_prompt(&mut self.inner.history.write(), prompt.into());
        Ok(())
    }

    /// Drops every message, including the system prompt.
    pub fn clear_history(&self) -> Result<(), SessionError> {
        self.ensure_mutable()?;
        self.inner.history.write().clear();
        Ok(())
    }

    /// Opens an exchange against this session's history.
    ///
    /// The outgoing history is captured before anything is appended. When
    /// `remember` is set and `user_text` is non-empty, the user turn is appended
    /// right away so the text sent equals the history at send time.
    pub fn begin_exchange(
        &self,
        user_text: Option<&str>,
        remember: bool,
    ) -> Result<Exchange, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.inner.id.clone()));
        }
        if self
            .inner
            .exchange_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::ExchangeInFlight(self.inner.id.clone()));
        }

        let outgoing = {
            let mut history = self.inner.history.write();
            let snapshot = history.clone();
            if remember {
                if let Some(text) = user_text.filter(|t| !t.is_empty()) {
                    history.push(Message::user(text));
                }
            }
            snapshot
        };
        debug!(session_id = %self.inner.id, remember, "Exchange opened");

        Ok(Exchange {
            session: self.clone(),
            outgoing,
            remember,
            completed: false,
        })
    }

    fn ensure_mutable(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.inner.id.clone()));
        }
        if self.has_exchange_in_flight() {
            return Err(SessionError::ExchangeInFlight(self.inner.id.clone()));
        }
        Ok(())
    }
}

fn put_system_prompt(history: &mut Vec<Message>, prompt: String) {
    match history.first_mut() {
        Some(first) if first.role == Role::System => first.content = prompt,
        _ => history.insert(0, Message::system(prompt)),
    }
}

/// An open exchange on a session. Dropping it ends the exchange.
#[derive(Debug)]
pub struct Exchange {
    session: Session,
    outgoing: Vec<Message>,
    remember: bool,
    completed: bool,
}

impl Exchange {
    /// History as it stood when the exchange began.
    pub fn outgoing_history(&self) -> &[Message] {
        &self.outgoing
    }

    pub fn remembers(&self) -> bool {
        self.remember
    }

    /// Records the assistant turn. Only the first call has any effect.
    pub fn complete(&mut self, assistant_text: &str) {
        if self.completed {
            return;
        }
        self.completed = true;
        if self.remember {
            self.session
                .inner
                .history
                .write()
                .push(Message::assistant(assistant_text));
        }
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.session
            .inner
            .exchange_in_flight
            .store(false, Ordering::Release);
    }
}
