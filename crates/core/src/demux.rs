//! Routes inbound frames to observer callbacks.

use crate::{fault::Fault, frame::ServerFrame};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// The final result of a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub finish_reason: String,
    /// All generation deltas, concatenated in delivery order.
    pub text: String,
}

/// Receives stream events. Callbacks run on the stream's receive task, so
/// they must return quickly and hand heavier work off elsewhere.
pub trait StreamObserver: Send + Sync {
    fn on_ready(&self, _session_id: &str) {}
    fn on_stt_partial(&self, _text: &str, _is_final: bool) {}
    fn on_llm_delta(&self, _text: &str) {}
    fn on_complete(&self, _completion: &Completion) {}
    fn on_error(&self, _fault: &Fault) {}
}

/// Ignores every event.
pub struct NoopObserver;

impl StreamObserver for NoopObserver {}

/// What the stream should do after a frame has been dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Completed(Completion),
    Failed(Fault),
}

/// Per-stream dispatch state: the generation buffer and the ready flag.
#[derive(Debug)]
pub struct Demultiplexer {
    session_id: String,
    buffer: String,
    ready: bool,
}

impl Demultiplexer {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            buffer: String::new(),
            ready: false,
        }
    }

    /// Generation text received so far.
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    /// Delivers non-terminal frames to `observer` and reports terminal ones.
    ///
    /// Terminal frames are returned rather than delivered so the owner can
    /// finish its own bookkeeping before the caller hears about them.
    pub fn dispatch(&mut self, frame: ServerFrame, observer: &dyn StreamObserver) -> Dispatch {
        match frame {
            ServerFrame::Ready { session_id } => {
                if self.ready {
                    warn!(session_id = %session_id, "Ignoring duplicate ready frame");
                } else {
                    self.ready = true;
                    observer.on_ready(&session_id);
                }
                Dispatch::Continue
            }
            ServerFrame::SttPartial { text, is_final } => {
                observer.on_stt_partial(&text, is_final);
                Dispatch::Continue
            }
            ServerFrame::LlmDelta { text } => {
                self.buffer.push_str(&text);
                observer.on_llm_delta(&text);
                Dispatch::Continue
            }
            ServerFrame::Complete { finish_reason } => {
                debug!(session_id = %self.session_id, %finish_reason, "Exchange complete");
                Dispatch::Completed(Completion {
                    finish_reason,
                    text: std::mem::take(&mut self.buffer),
                })
            }
            ServerFrame::Error {
                code,
                message,
                param,
            } => Dispatch::Failed(Fault::from_remote(
                code.as_deref(),
                param.as_deref(),
                &message,
                &self.session_id,
            )),
        }
    }
}

/// A stream event, as delivered by [`ChannelObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Ready { session_id: String },
    SttPartial { text: String, is_final: bool },
    LlmDelta { text: String },
    Complete(Completion),
    Error(Fault),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete(_) | StreamEvent::Error(_))
    }
}

/// Forwards every callback into an unbounded channel for async consumers.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: StreamEvent) {
        // The consumer may have stopped listening; the stream carries on.
        let _ = self.tx.send(event);
    }
}

impl StreamObserver for ChannelObserver {
    fn on_ready(&self, session_id: &str) {
        self.forward(StreamEvent::Ready {
            session_id: session_id.to_string(),
        });
    }

    fn on_stt_partial(&self, text: &str, is_final: bool) {
        self.forward(StreamEvent::SttPartial {
            text: text.to_string(),
            is_final,
        });
    }

    fn on_llm_delta(&self, text: &str) {
        self.forward(StreamEvent::LlmDelta {
            text: text.to_string(),
        });
    }

    fn on_complete(&self, completion: &Completion) {
        self.forward(StreamEvent::Complete(completion.clone()));
    }

    fn on_error(&self, fault: &Fault) {
        self.forward(StreamEvent::Error(fault.clone()));
    }
}

/// Adapts a single closure into an observer.
pub struct FnObserver<F>(pub F);

impl<F> StreamObserver for FnObserver<F>
where
    F: Fn(StreamEvent) + Send + Sync,
{
    fn on_ready(&self, session_id: &str) {
        (self.0)(StreamEvent::Ready {
            session_id: session_id.to_string(),
        });
    }

    fn on_stt_partial(&self, text: &str, is_final: bool) {
        (self.0)(StreamEvent::SttPartial {
            text: text.to_string(),
            is_final,
        });
    }

    fn on_llm_delta(&self, text: &str) {
        (self.0)(StreamEvent::LlmDelta {
            text: text.to_string(),
        });
    }

    fn on_complete(&self, completion: &Completion) {
        (self.0)(StreamEvent::Complete(completion.clone()));
    }

    fn on_error(&self, fault: &Fault) {
        (self.0)(StreamEvent::Error(fault.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultKind;
    use std::sync::Mutex;

    fn delta(text: &str) -> ServerFrame {
        ServerFrame::LlmDelta { text: text.into() }
    }

    #[test]
    fn test_frames_are_delivered_in_order_and_deltas_accumulate() {
        let seen = Mutex::new(Vec::new());
        let observer = FnObserver(|event| seen.lock().unwrap().push(event));
        let mut demux = Demultiplexer::new("s1");

        let frames = [
            ServerFrame::Ready {
                session_id: "s1".into(),
            },
            delta("你"),
            ServerFrame::SttPartial {
                text: "你好".into(),
                is_final: false,
            },
            delta("好呀"),
        ];
        for frame in frames {
            assert_eq!(demux.dispatch(frame, &observer), Dispatch::Continue);
        }
        assert_eq!(demux.buffered(), "你好呀");

        let outcome = demux.dispatch(
            ServerFrame::Complete {
                finish_reason: "stop".into(),
            },
            &observer,
        );
        assert_eq!(
            outcome,
            Dispatch::Completed(Completion {
                finish_reason: "stop".into(),
                text: "你好呀".into()
            })
        );

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 4);
        assert!(matches!(seen[1], StreamEvent::LlmDelta { ref text } if text == "你"));
        assert!(matches!(seen[2], StreamEvent::SttPartial { .. }));
    }

    #[test]
    fn test_duplicate_ready_is_delivered_once() {
        let (observer, mut rx) = ChannelObserver::new();
        let mut demux = Demultiplexer::new("s1");
        for _ in 0..3 {
            demux.dispatch(
                ServerFrame::Ready {
                    session_id: "s1".into(),
                },
                &observer,
            );
        }
        assert!(matches!(rx.try_recv(), Ok(StreamEvent::Ready { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_error_frame_becomes_a_fault() {
        let mut demux = Demultiplexer::new("s7");
        match demux.dispatch(ServerFrame::error("not_found", "no such session"), &NoopObserver) {
            Dispatch::Failed(fault) => {
                assert_eq!(fault.kind(), FaultKind::NotFound);
                assert!(matches!(fault, Fault::NotFound { ref session_id, .. } if session_id == "s7"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_error_frame_keeps_the_parameter_name() {
        let mut demux = Demultiplexer::new("s7");
        let frame = ServerFrame::error("invalid_argument", "start frame requires a non-empty session id")
            .with_param("session_id");
        match demux.dispatch(frame, &NoopObserver) {
            Dispatch::Failed(Fault::InvalidParameter { param, .. }) => assert_eq!(param, "session_id"),
            other => panic!("expected invalid parameter, got {other:?}"),
        }

        let mut demux = Demultiplexer::new("s7");
        match demux.dispatch(ServerFrame::error("invalid_argument", "bad"), &NoopObserver) {
            Dispatch::Failed(Fault::InvalidParameter { param, .. }) => assert_eq!(param, "unknown"),
            other => panic!("expected invalid parameter, got {other:?}"),
        }
    }
}
