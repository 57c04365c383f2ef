//! Stream lifecycle: which frames may be sent in which phase, and the single
//! authority over open/closing/closed status.

use crate::frame::OutboundKind;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Nothing has been sent yet.
    Init,
    Started,
    AudioEnded,
    Completed,
    Cancelled,
    Errored,
    Closed,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamState::Completed | StreamState::Cancelled | StreamState::Errored
        )
    }

    /// Terminal or closed: no frame of either direction is processed any more.
    pub fn is_finished(self) -> bool {
        self.is_terminal() || self == StreamState::Closed
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Init => "init",
            StreamState::Started => "started",
            StreamState::AudioEnded => "audio_ended",
            StreamState::Completed => "completed",
            StreamState::Cancelled => "cancelled",
            StreamState::Errored => "errored",
            StreamState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// An outbound frame that the current lifecycle phase does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot send {frame} frame while stream is {state}")]
pub struct ProtocolViolation {
    pub frame: OutboundKind,
    pub state: StreamState,
}

/// The outcome of asking the machine to send a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDecision {
    /// Put the frame on the wire.
    Send,
    /// The frame is redundant and must not be sent (a second start).
    Skip,
}

/// Lifecycle state machine. Not synchronized; the owner wraps it in a lock.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: StreamState,
    outcome: Option<StreamState>,
    trail: Vec<StreamState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: StreamState::Init,
            outcome: None,
            trail: vec![StreamState::Init],
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// The terminal state the stream reached, if it has finished.
    pub fn outcome(&self) -> Option<StreamState> {
        self.outcome
    }

    /// Every state entered so far, in order.
    pub fn transitions(&self) -> &[StreamState] {
        &self.trail
    }

    fn enter(&mut self, next: StreamState) {
        self.state = next;
        self.trail.push(next);
    }

    /// Validates an outbound frame against the current phase and applies the
    /// transition it causes.
    pub fn on_send(&mut self, frame: OutboundKind) -> Result<SendDecision, ProtocolViolation> {
        let violation = ProtocolViolation {
            frame,
            state: self.state,
        };
        match (frame, self.state) {
            (OutboundKind::Start, StreamState::Init) => {
                self.enter(StreamState::Started);
                Ok(SendDecision::Send)
            }
            (OutboundKind::Start, StreamState::Started | StreamState::AudioEnded) => {
                Ok(SendDecision::Skip)
            }
            (OutboundKind::Audio | OutboundKind::Flush, StreamState::Started) => {
                Ok(SendDecision::Send)
            }
            (OutboundKind::EndAudio, StreamState::Started) => {
                self.enter(StreamState::AudioEnded);
                Ok(SendDecision::Send)
            }
            (OutboundKind::Cancel, StreamState::Started | StreamState::AudioEnded) => {
                self.finish(StreamState::Cancelled);
                Ok(SendDecision::Send)
            }
            // Nothing reached the far side yet, so there is nothing to tell it.
            (OutboundKind::Cancel, StreamState::Init) => {
                self.finish(StreamState::Cancelled);
                Ok(SendDecision::Skip)
            }
            _ => Err(violation),
        }
    }

    /// Moves into a terminal state. Returns `false` if the stream had already
    /// finished, in which case nothing changes.
    pub fn finish(&mut self, terminal: StreamState) -> bool {
        debug_assert!(terminal.is_terminal());
        if self.state.is_finished() {
            return false;
        }
        self.outcome = Some(terminal);
        self.enter(terminal);
        true
    }

    /// Records that the channel was released. Idempotent.
    pub fn close(&mut self) -> bool {
        if self.state == StreamState::Closed {
            return false;
        }
        if !self.state.is_terminal() {
            self.finish(StreamState::Cancelled);
        }
        self.enter(StreamState::Closed);
        true
    }
}

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Tri-state close flag. Exactly one caller wins [`CloseGuard::begin`]; every
/// other trigger observes the same final state.
#[derive(Debug, Default)]
pub struct CloseGuard(AtomicU8);

impl CloseGuard {
    pub fn new() -> Self {
        Self(AtomicU8::new(OPEN))
    }

    /// Claims the right to release the channel.
    pub fn begin(&self) -> bool {
        self.0
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn complete(&self) {
        self.0.store(CLOSED, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::Acquire) == OPEN
    }

    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::Acquire) == CLOSED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_happy_path_transitions() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.on_send(OutboundKind::Start), Ok(SendDecision::Send));
        assert_eq!(sm.on_send(OutboundKind::Audio), Ok(SendDecision::Send));
        assert_eq!(sm.on_send(OutboundKind::Flush), Ok(SendDecision::Send));
        assert_eq!(sm.state(), StreamState::Started);
        assert_eq!(sm.on_send(OutboundKind::EndAudio), Ok(SendDecision::Send));
        assert!(sm.finish(StreamState::Completed));
        assert!(sm.close());
        assert_eq!(
            sm.transitions(),
            &[
                StreamState::Init,
                StreamState::Started,
                StreamState::AudioEnded,
                StreamState::Completed,
                StreamState::Closed
            ]
        );
        assert_eq!(sm.outcome(), Some(StreamState::Completed));
    }

    #[test]
    fn test_second_start_is_skipped() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.on_send(OutboundKind::Start), Ok(SendDecision::Send));
        assert_eq!(sm.on_send(OutboundKind::Start), Ok(SendDecision::Skip));
        let started = sm
            .transitions()
            .iter()
            .filter(|s| **s == StreamState::Started)
            .count();
        assert_eq!(started, 1);
    }

    #[test]
    fn test_audio_after_end_audio_is_a_violation() {
        let mut sm = StateMachine::new();
        sm.on_send(OutboundKind::Start).unwrap();
        sm.on_send(OutboundKind::EndAudio).unwrap();
        assert_eq!(
            sm.on_send(OutboundKind::Audio),
            Err(ProtocolViolation {
                frame: OutboundKind::Audio,
                state: StreamState::AudioEnded
            })
        );
        assert!(sm.on_send(OutboundKind::EndAudio).is_err());
        assert!(sm.on_send(OutboundKind::Flush).is_err());
    }

    #[test]
    fn test_audio_before_start_is_a_violation() {
        let mut sm = StateMachine::new();
        assert!(sm.on_send(OutboundKind::Audio).is_err());
        assert!(sm.on_send(OutboundKind::EndAudio).is_err());
    }

    #[test]
    fn test_nothing_is_sendable_after_cancel() {
        let mut sm = StateMachine::new();
        sm.on_send(OutboundKind::Start).unwrap();
        assert_eq!(sm.on_send(OutboundKind::Cancel), Ok(SendDecision::Send));
        for kind in [
            OutboundKind::Start,
            OutboundKind::Audio,
            OutboundKind::Flush,
            OutboundKind::EndAudio,
            OutboundKind::Cancel,
        ] {
            assert!(sm.on_send(kind).is_err(), "{kind} accepted after cancel");
        }
    }

    #[test]
    fn test_first_terminal_wins() {
        let mut sm = StateMachine::new();
        sm.on_send(OutboundKind::Start).unwrap();
        assert!(sm.finish(StreamState::Errored));
        assert!(!sm.finish(StreamState::Completed));
        assert!(sm.close());
        assert!(!sm.close());
        assert_eq!(sm.outcome(), Some(StreamState::Errored));
        assert_eq!(sm.state(), StreamState::Closed);
    }

    #[test]
    fn test_close_without_terminal_records_cancellation() {
        let mut sm = StateMachine::new();
        sm.on_send(OutboundKind::Start).unwrap();
        sm.close();
        assert_eq!(sm.outcome(), Some(StreamState::Cancelled));
        assert_eq!(
            sm.transitions(),
            &[
                StreamState::Init,
                StreamState::Started,
                StreamState::Cancelled,
                StreamState::Closed
            ]
        );
    }

    #[test]
    fn test_close_guard_has_a_single_winner() {
        let guard = Arc::new(CloseGuard::new());
        let winners = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = guard.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    if guard.begin() {
                        winners.fetch_add(1, Ordering::SeqCst);
                        guard.complete();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert!(guard.is_closed());
        assert!(!guard.begin());
    }
}
