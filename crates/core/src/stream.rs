//! One bidirectional streaming exchange bound to a [`Session`].
//!
//! Sends are serialized through the sink lock and validated by the
//! [`StateMachine`] before anything reaches the wire. Inbound frames are read
//! by a dedicated task and routed through the [`Demultiplexer`], so neither
//! direction waits on the other. Every way a stream can end (completion, remote
//! error, transport failure, deadline, cancel, explicit close, drop) funnels
//! into [`StreamInner::release`], which the [`CloseGuard`] lets run once.

use crate::{
    config::{ConfigOverrides, SessionConfig},
    demux::{Completion, Demultiplexer, Dispatch, StreamObserver},
    error::StreamError,
    fault::{Fault, TransportFailure},
    frame::{ClientFrame, ControlCommand, InitialInput, OutboundKind, StartFrame, validate_inputs},
    session::{Exchange, Session, SessionError},
    state::{CloseGuard, SendDecision, StateMachine, StreamState},
    transport::{FrameSink, FrameSource, Transport},
};
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Per-exchange options.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Overrides applied on top of the session's configuration.
    pub config: ConfigOverrides,
    pub initial_inputs: Vec<InitialInput>,
    /// Whether the exchange is recorded in the session history.
    pub remember: bool,
    /// Deadline for the whole exchange, counted from construction.
    pub deadline: Option<Duration>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            config: ConfigOverrides::default(),
            initial_inputs: Vec::new(),
            remember: true,
            deadline: None,
        }
    }
}

impl StreamOptions {
    pub fn config(mut self, config: ConfigOverrides) -> Self {
        self.config = config;
        self
    }

    pub fn input(mut self, input: InitialInput) -> Self {
        self.initial_inputs.push(input);
        self
    }

    pub fn remember(mut self, remember: bool) -> Self {
        self.remember = remember;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

enum Outcome {
    Completed(Completion),
    Failed(Fault),
}

struct StreamInner {
    session: Session,
    config: SessionConfig,
    initial_inputs: Vec<InitialInput>,
    remember: bool,
    machine: parking_lot::Mutex<StateMachine>,
    guard: CloseGuard,
    sink: tokio::sync::Mutex<Box<dyn FrameSink>>,
    exchange: parking_lot::Mutex<Option<Exchange>>,
    observer: Arc<dyn StreamObserver>,
    shutdown: Notify,
    closed: watch::Sender<bool>,
}

impl StreamInner {
    fn id(&self) -> &str {
        self.session.id()
    }

    /// Moves the stream into its terminal state and tells the observer.
    /// Returns `false` if another trigger finished the stream first.
    async fn finish(&self, outcome: Outcome) -> bool {
        let terminal = match outcome {
            Outcome::Completed(_) => StreamState::Completed,
            Outcome::Failed(_) => StreamState::Errored,
        };
        if !self.machine.lock().finish(terminal) {
            return false;
        }

        if let Outcome::Completed(completion) = &outcome {
            if let Some(exchange) = self.exchange.lock().as_mut() {
                exchange.complete(&completion.text);
            }
        }
        self.release().await;

        match outcome {
            Outcome::Completed(completion) => {
                info!(
                    session_id = %self.id(),
                    finish_reason = %completion.finish_reason,
                    chars = completion.text.chars().count(),
                    "Stream completed"
                );
                self.observer.on_complete(&completion);
            }
            Outcome::Failed(fault) => {
                error!(session_id = %self.id(), kind = ?fault.kind(), "Stream failed: {fault}");
                self.observer.on_error(&fault);
            }
        }
        true
    }

    /// Releases the channel. Only the first caller does any work.
    async fn release(&self) {
        if !self.guard.begin() {
            return;
        }
        {
            let mut sink = self.sink.lock().await;
            if let Err(failure) = sink.close().await {
                warn!(session_id = %self.id(), "Error closing channel: {failure}");
            }
        }
        self.machine.lock().close();
        // Ends the exchange so the session accepts mutations again.
        self.exchange.lock().take();
        self.guard.complete();
        self.shutdown.notify_one();
        self.closed.send_replace(true);
        debug!(session_id = %self.id(), "Channel released");
    }

    fn tag(&self, mut failure: TransportFailure) -> TransportFailure {
        failure
            .session_id
            .get_or_insert_with(|| self.session.id().to_string());
        failure
    }
}

/// A streaming exchange. Methods take `&self`; wrap it in an `Arc` to drive it
/// from several tasks. Dropping the last handle releases the channel.
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    /// Builds a stream in the `Init` state and starts reading from `transport`.
    ///
    /// The configuration is resolved against the session's here, once.
    pub fn new(
        session: Session,
        transport: Transport,
        options: StreamOptions,
        observer: impl StreamObserver + 'static,
    ) -> Result<Self, StreamError> {
        if session.is_closed() {
            return Err(SessionError::Closed(session.id().to_string()).into());
        }
        let config = options.config.resolve(session.config())?;
        validate_inputs(&options.initial_inputs)?;

        let deadline = options.deadline.map(|d| Instant::now() + d);
        let (closed, _) = watch::channel(false);
        let inner = Arc::new(StreamInner {
            session,
            config,
            initial_inputs: options.initial_inputs,
            remember: options.remember,
            machine: parking_lot::Mutex::new(StateMachine::new()),
            guard: CloseGuard::new(),
            sink: tokio::sync::Mutex::new(transport.sink),
            exchange: parking_lot::Mutex::new(None),
            observer: Arc::new(observer),
            shutdown: Notify::new(),
            closed,
        });

        let span = info_span!("stream", session_id = %inner.id());
        tokio::spawn(receive(inner.clone(), transport.source, deadline).instrument(span));

        Ok(Self { inner })
    }

    /// Builds a stream and sends the start frame.
    pub async fn open(
        session: Session,
        transport: Transport,
        options: StreamOptions,
        observer: impl StreamObserver + 'static,
    ) -> Result<Self, StreamError> {
        let stream = Self::new(session, transport, options, observer)?;
        stream.start().await?;
        Ok(stream)
    }

    pub fn session_id(&self) -> &str {
        self.inner.id()
    }

    /// The configuration this exchange runs with.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> StreamState {
        self.inner.machine.lock().state()
    }

    /// The terminal state reached, once the stream has finished.
    pub fn outcome(&self) -> Option<StreamState> {
        self.inner.machine.lock().outcome()
    }

    pub fn transitions(&self) -> Vec<StreamState> {
        self.inner.machine.lock().transitions().to_vec()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.guard.is_closed()
    }

    /// Resolves once the channel has been released.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        // The sender lives in `inner`, which outlives this borrow.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Sends the start frame. A second call is a no-op.
    ///
    /// The exchange is opened on the session first, so a remembered user turn
    /// is in the history before the frame leaves.
    pub async fn start(&self) -> Result<(), StreamError> {
        let mut sink = self.inner.sink.lock().await;
        if self.state() != StreamState::Init {
            self.inner.machine.lock().on_send(OutboundKind::Start)?;
            return Ok(());
        }

        let user_text = crate::frame::joined_user_text(&self.inner.initial_inputs);
        let exchange = self
            .inner
            .session
            .begin_exchange(user_text.as_deref(), self.inner.remember)?;
        let frame = StartFrame::new(
            self.inner.id(),
            self.inner.config.clone(),
            self.inner.initial_inputs.clone(),
            exchange.outgoing_history().to_vec(),
        )?;

        self.inner.machine.lock().on_send(OutboundKind::Start)?;
        *self.inner.exchange.lock() = Some(exchange);

        info!(
            session_id = %self.inner.id(),
            inputs = self.inner.initial_inputs.len(),
            remember = self.inner.remember,
            "Starting stream"
        );
        let result = sink.send(ClientFrame::Start(frame)).await;
        drop(sink);
        self.after_send(result).await
    }

    pub async fn send_audio(&self, data: impl Into<Bytes>) -> Result<(), StreamError> {
        self.send(ClientFrame::Audio { data: data.into() }).await
    }

    /// Asks the far side for a best-effort transcript of the audio so far.
    pub async fn flush(&self) -> Result<(), StreamError> {
        self.send(ClientFrame::control(ControlCommand::Flush)).await
    }

    /// Signals that no more audio follows.
    pub async fn end_audio(&self) -> Result<(), StreamError> {
        self.send(ClientFrame::control(ControlCommand::EndAudio)).await
    }

    /// Abandons the exchange. The cancel frame is only sent if the far side
    /// has seen a start frame; the channel is released either way.
    pub async fn cancel(&self) -> Result<(), StreamError> {
        {
            let mut sink = self.inner.sink.lock().await;
            let decision = self.inner.machine.lock().on_send(OutboundKind::Cancel)?;
            if decision == SendDecision::Send {
                if let Err(failure) = sink.send(ClientFrame::control(ControlCommand::Cancel)).await
                {
                    warn!(session_id = %self.inner.id(), "Cancel frame not delivered: {failure}");
                }
            }
        }
        info!(session_id = %self.inner.id(), "Stream cancelled");
        self.inner.release().await;
        Ok(())
    }

    /// Releases the channel and waits until that has happened. Closing a
    /// stream that has not finished records it as cancelled. Idempotent.
    pub async fn close(&self) {
        if self.inner.machine.lock().finish(StreamState::Cancelled) {
            debug!(session_id = %self.inner.id(), "Closing stream before a terminal event");
        }
        self.inner.release().await;
        self.closed().await;
    }

    async fn send(&self, frame: ClientFrame) -> Result<(), StreamError> {
        let mut sink = self.inner.sink.lock().await;
        let decision = self.inner.machine.lock().on_send(frame.kind())?;
        if decision == SendDecision::Skip {
            return Ok(());
        }
        let result = sink.send(frame).await;
        drop(sink);
        self.after_send(result).await
    }

    async fn after_send(&self, result: Result<(), TransportFailure>) -> Result<(), StreamError> {
        let Err(failure) = result else {
            return Ok(());
        };
        let fault = Fault::from_transport(&self.inner.tag(failure));
        self.inner.finish(Outcome::Failed(fault.clone())).await;
        Err(fault.into())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.inner.guard.is_open() {
            self.inner.shutdown.notify_one();
        }
    }
}

async fn receive(inner: Arc<StreamInner>, mut source: FrameSource, deadline: Option<Instant>) {
    let mut demux = Demultiplexer::new(inner.id());
    let expiry = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(expiry);

    loop {
        tokio::select! {
            biased;

            _ = inner.shutdown.notified() => {
                // Either the channel was released or every handle was dropped.
                if inner.machine.lock().finish(StreamState::Cancelled) {
                    debug!("Stream abandoned");
                }
                inner.release().await;
                break;
            }
            _ = &mut expiry => {
                inner.finish(Outcome::Failed(Fault::timeout("stream deadline exceeded"))).await;
                break;
            }
            item = source.next() => {
                let frame = match item {
                    Some(Ok(frame)) => frame,
                    Some(Err(failure)) => {
                        let fault = Fault::from_transport(&inner.tag(failure));
                        inner.finish(Outcome::Failed(fault)).await;
                        break;
                    }
                    None => {
                        let fault = Fault::Unavailable {
                            message: "channel ended before a terminal frame".into(),
                        };
                        inner.finish(Outcome::Failed(fault)).await;
                        break;
                    }
                };

                if inner.machine.lock().state().is_finished() {
                    debug!("Dropping inbound frame after stream finished");
                    break;
                }
                match demux.dispatch(frame, inner.observer.as_ref()) {
                    Dispatch::Continue => {}
                    Dispatch::Completed(completion) => {
                        inner.finish(Outcome::Completed(completion)).await;
                        break;
                    }
                    Dispatch::Failed(fault) => {
                        inner.finish(Outcome::Failed(fault)).await;
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        demux::{ChannelObserver, NoopObserver, StreamEvent},
        fault::{FaultKind, TransportCode},
        frame::ServerFrame,
        message::Message,
        transport::{MemoryTransport, RemoteEnd},
    };
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn session() -> Session {
        Session::new("s1", SessionConfig::default()).unwrap()
    }

    async fn next_terminal(rx: &mut UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        loop {
            let event = timeout(WAIT, rx.recv())
                .await
                .expect("timed out waiting for stream events")
                .expect("observer channel closed");
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                return events;
            }
        }
    }

    fn reply(remote: &RemoteEnd, deltas: &[&str]) {
        remote.emit(ServerFrame::Ready {
            session_id: "s1".into(),
        });
        remote.emit(ServerFrame::SttPartial {
            text: "你好".into(),
            is_final: true,
        });
        for delta in deltas {
            remote.emit(ServerFrame::LlmDelta {
                text: delta.to_string(),
            });
        }
        remote.emit(ServerFrame::Complete {
            finish_reason: "stop".into(),
        });
    }

    #[tokio::test]
    async fn test_audio_exchange_completes_and_closes() {
        let session = session();
        let (transport, mut remote) = MemoryTransport::pair();
        let (observer, mut events) = ChannelObserver::new();
        let stream = Stream::open(session.clone(), transport, StreamOptions::default(), observer)
            .await
            .unwrap();

        stream.send_audio(vec![1u8, 2]).await.unwrap();
        stream.send_audio(vec![3u8, 4]).await.unwrap();
        stream.end_audio().await.unwrap();
        reply(&remote, &["你", "好呀"]);

        let events = next_terminal(&mut events).await;
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Complete(Completion {
                finish_reason: "stop".into(),
                text: "你好呀".into()
            }))
        );
        assert_eq!(stream.state(), StreamState::Closed);
        assert_eq!(stream.outcome(), Some(StreamState::Completed));
        assert_eq!(
            stream.transitions(),
            vec![
                StreamState::Init,
                StreamState::Started,
                StreamState::AudioEnded,
                StreamState::Completed,
                StreamState::Closed
            ]
        );
        assert_eq!(remote.close_count(), 1);

        let kinds: Vec<_> = remote.sent_frames().iter().map(ClientFrame::kind).collect();
        assert_eq!(
            kinds,
            vec![
                OutboundKind::Start,
                OutboundKind::Audio,
                OutboundKind::Audio,
                OutboundKind::EndAudio
            ]
        );
        // No text input was given, so only the assistant turn is logged.
        assert_eq!(session.messages(), vec![Message::assistant("你好呀")]);
    }

    #[tokio::test]
    async fn test_remembered_exchange_logs_user_then_assistant() {
        let session = session();
        session.add_message(Message::user("earlier")).unwrap();
        let (transport, mut remote) = MemoryTransport::pair();
        let (observer, mut events) = ChannelObserver::new();
        let options = StreamOptions::default().input(InitialInput::text("介绍一下自己"));
        let stream = Stream::open(session.clone(), transport, options, observer)
            .await
            .unwrap();

        match remote.frames.recv().await {
            Some(ClientFrame::Start(start)) => {
                // The outgoing history is the snapshot from before the user turn.
                assert_eq!(start.history, vec![Message::user("earlier")]);
                assert_eq!(start.user_text().as_deref(), Some("介绍一下自己"));
            }
            other => panic!("expected start frame, got {other:?}"),
        }
        stream.end_audio().await.unwrap();
        reply(&remote, &["我是", "助手"]);
        next_terminal(&mut events).await;

        assert_eq!(
            session.messages(),
            vec![
                Message::user("earlier"),
                Message::user("介绍一下自己"),
                Message::assistant("我是助手"),
            ]
        );
    }

    #[tokio::test]
    async fn test_unremembered_exchange_leaves_history_untouched() {
        let session = session();
        let (transport, remote) = MemoryTransport::pair();
        let (observer, mut events) = ChannelObserver::new();
        let options = StreamOptions::default()
            .input(InitialInput::text("q"))
            .remember(false);
        let stream = Stream::open(session.clone(), transport, options, observer)
            .await
            .unwrap();
        stream.end_audio().await.unwrap();
        reply(&remote, &["a"]);
        next_terminal(&mut events).await;
        assert!(session.messages().is_empty());
    }

    #[tokio::test]
    async fn test_second_start_sends_nothing() {
        let (transport, mut remote) = MemoryTransport::pair();
        let stream = Stream::new(session(), transport, StreamOptions::default(), NoopObserver)
            .unwrap();
        stream.start().await.unwrap();
        stream.start().await.unwrap();
        let starts = remote
            .sent_frames()
            .iter()
            .filter(|f| f.kind() == OutboundKind::Start)
            .count();
        assert_eq!(starts, 1);
        let started = stream
            .transitions()
            .into_iter()
            .filter(|s| *s == StreamState::Started)
            .count();
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn test_audio_after_end_audio_is_rejected_and_not_forwarded() {
        let (transport, mut remote) = MemoryTransport::pair();
        let stream = Stream::open(session(), transport, StreamOptions::default(), NoopObserver)
            .await
            .unwrap();
        stream.end_audio().await.unwrap();
        let err = stream.send_audio(vec![9u8]).await.unwrap_err();
        assert!(matches!(
            err,
            StreamError::Protocol(v) if v.frame == OutboundKind::Audio && v.state == StreamState::AudioEnded
        ));
        assert!(stream.flush().await.is_err());
        let audio = remote
            .sent_frames()
            .iter()
            .filter(|f| f.kind() == OutboundKind::Audio)
            .count();
        assert_eq!(audio, 0);
    }

    #[tokio::test]
    async fn test_audio_before_start_is_rejected() {
        let (transport, _remote) = MemoryTransport::pair();
        let stream = Stream::new(session(), transport, StreamOptions::default(), NoopObserver)
            .unwrap();
        assert!(matches!(
            stream.send_audio(vec![1u8]).await,
            Err(StreamError::Protocol(_))
        ));
        assert_eq!(stream.state(), StreamState::Init);
    }

    #[tokio::test]
    async fn test_cancel_right_after_start() {
        let session = session();
        let (transport, mut remote) = MemoryTransport::pair();
        let stream = Stream::open(session.clone(), transport, StreamOptions::default(), NoopObserver)
            .await
            .unwrap();
        stream.cancel().await.unwrap();

        assert_eq!(
            stream.transitions(),
            vec![
                StreamState::Init,
                StreamState::Started,
                StreamState::Cancelled,
                StreamState::Closed
            ]
        );
        assert!(stream.send_audio(vec![1u8]).await.is_err());
        assert!(stream.end_audio().await.is_err());
        assert!(stream.cancel().await.is_err());
        assert!(session.messages().is_empty());
        assert!(!session.has_exchange_in_flight());

        let kinds: Vec<_> = remote.sent_frames().iter().map(ClientFrame::kind).collect();
        assert_eq!(kinds, vec![OutboundKind::Start, OutboundKind::Cancel]);
        assert_eq!(remote.close_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_start_sends_nothing() {
        let (transport, mut remote) = MemoryTransport::pair();
        let stream = Stream::new(session(), transport, StreamOptions::default(), NoopObserver)
            .unwrap();
        stream.cancel().await.unwrap();
        assert!(remote.sent_frames().is_empty());
        assert_eq!(stream.outcome(), Some(StreamState::Cancelled));
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn test_racing_close_triggers_release_once() {
        let session = session();
        let (transport, remote) = MemoryTransport::pair();
        let (observer, _events) = ChannelObserver::new();
        let stream = Arc::new(
            Stream::open(session.clone(), transport, StreamOptions::default(), observer)
                .await
                .unwrap(),
        );
        stream.end_audio().await.unwrap();

        let closers: Vec<_> = (0..8)
            .map(|_| {
                let stream = stream.clone();
                tokio::spawn(async move { stream.close().await })
            })
            .collect();
        reply(&remote, &["x"]);
        let cancel = stream.cancel().await;
        for closer in closers {
            closer.await.unwrap();
        }
        stream.close().await;
        stream.close().await;

        assert_eq!(remote.close_count(), 1);
        assert_eq!(stream.state(), StreamState::Closed);
        let outcome = stream.outcome().unwrap();
        assert!(outcome.is_terminal());
        // Whichever trigger won, every observer sees the same final state.
        assert!(cancel.is_err() || outcome == StreamState::Cancelled);
        let closed = stream
            .transitions()
            .into_iter()
            .filter(|s| *s == StreamState::Closed)
            .count();
        assert_eq!(closed, 1);
    }

    #[tokio::test]
    async fn test_explicit_close_records_cancellation_without_cancel_frame() {
        let (transport, mut remote) = MemoryTransport::pair();
        let stream = Stream::open(session(), transport, StreamOptions::default(), NoopObserver)
            .await
            .unwrap();
        stream.close().await;
        assert_eq!(stream.outcome(), Some(StreamState::Cancelled));
        let kinds: Vec<_> = remote.sent_frames().iter().map(ClientFrame::kind).collect();
        assert_eq!(kinds, vec![OutboundKind::Start]);
        assert_eq!(remote.close_count(), 1);
    }

    #[tokio::test]
    async fn test_transport_deadline_failure_is_a_retryable_timeout() {
        let (transport, remote) = MemoryTransport::pair();
        let (observer, mut events) = ChannelObserver::new();
        let stream = Stream::open(session(), transport, StreamOptions::default(), observer)
            .await
            .unwrap();
        stream.send_audio(vec![0u8; 320]).await.unwrap();
        remote.fail(TransportFailure::new(
            TransportCode::DeadlineExceeded,
            "deadline exceeded",
        ));

        let events = next_terminal(&mut events).await;
        match events.last() {
            Some(StreamEvent::Error(fault)) => {
                assert_eq!(fault.kind(), FaultKind::Timeout);
                assert!(fault.is_retryable());
            }
            other => panic!("expected error event, got {other:?}"),
        }
        assert_eq!(
            stream.transitions(),
            vec![
                StreamState::Init,
                StreamState::Started,
                StreamState::Errored,
                StreamState::Closed
            ]
        );
        assert!(stream.send_audio(vec![0u8]).await.is_err());
        assert_eq!(remote.close_count(), 1);
    }

    #[tokio::test]
    async fn test_exchange_deadline_forces_closure() {
        let (transport, _remote) = MemoryTransport::pair();
        let (observer, mut events) = ChannelObserver::new();
        let options = StreamOptions::default().deadline(Duration::from_millis(50));
        let stream = Stream::open(session(), transport, options, observer)
            .await
            .unwrap();

        let events = next_terminal(&mut events).await;
        assert!(matches!(events.last(), Some(StreamEvent::Error(Fault::Timeout { .. }))));
        assert_eq!(stream.outcome(), Some(StreamState::Errored));
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn test_remote_error_frame_is_surfaced() {
        let session = session();
        let (transport, remote) = MemoryTransport::pair();
        let (observer, mut events) = ChannelObserver::new();
        let options = StreamOptions::default().input(InitialInput::text("q"));
        let stream = Stream::open(session.clone(), transport, options, observer)
            .await
            .unwrap();
        remote.emit(ServerFrame::LlmDelta { text: "half".into() });
        remote.emit(ServerFrame::error("unavailable", "provider down"));

        let events = next_terminal(&mut events).await;
        assert!(matches!(events.last(), Some(StreamEvent::Error(Fault::Unavailable { .. }))));
        assert_eq!(stream.outcome(), Some(StreamState::Errored));
        // The user turn went in before sending; no assistant turn follows a failure.
        assert_eq!(session.messages(), vec![Message::user("q")]);
    }

    #[tokio::test]
    async fn test_source_ending_early_is_unavailable() {
        let (transport, mut remote) = MemoryTransport::pair();
        let (observer, mut events) = ChannelObserver::new();
        let _stream = Stream::open(session(), transport, StreamOptions::default(), observer)
            .await
            .unwrap();
        remote.disconnect();
        let events = next_terminal(&mut events).await;
        assert!(matches!(events.last(), Some(StreamEvent::Error(f)) if f.kind() == FaultKind::Unavailable));
    }

    #[tokio::test]
    async fn test_send_failure_errors_the_stream() {
        let (transport, mut remote) = MemoryTransport::pair();
        let (observer, mut events) = ChannelObserver::new();
        let stream = Stream::open(session(), transport, StreamOptions::default(), observer)
            .await
            .unwrap();
        remote.frames.close();

        let err = stream.send_audio(vec![1u8]).await.unwrap_err();
        assert_eq!(err.fault().map(Fault::kind), Some(FaultKind::Unavailable));
        let events = next_terminal(&mut events).await;
        assert!(matches!(events.last(), Some(StreamEvent::Error(_))));
        assert_eq!(stream.outcome(), Some(StreamState::Errored));
        assert_eq!(remote.close_count(), 1);
    }

    #[tokio::test]
    async fn test_one_exchange_per_session_at_a_time() {
        let session = session();
        let (first, _r1) = MemoryTransport::pair();
        let (second, _r2) = MemoryTransport::pair();
        let a = Stream::open(session.clone(), first, StreamOptions::default(), NoopObserver)
            .await
            .unwrap();
        let b = Stream::new(session.clone(), second, StreamOptions::default(), NoopObserver)
            .unwrap();
        assert!(matches!(
            b.start().await,
            Err(StreamError::Session(SessionError::ExchangeInFlight(_)))
        ));
        assert_eq!(b.state(), StreamState::Init);

        a.close().await;
        b.start().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_overrides_fail_construction() {
        let (transport, _remote) = MemoryTransport::pair();
        let options = StreamOptions::default().config(ConfigOverrides::default().temperature(9.0));
        assert!(matches!(
            Stream::new(session(), transport, options, NoopObserver),
            Err(StreamError::Frame(_))
        ));
    }

    #[tokio::test]
    async fn test_dropping_the_stream_releases_the_channel() {
        let session = session();
        let (transport, remote) = MemoryTransport::pair();
        let stream = Stream::open(session.clone(), transport, StreamOptions::default(), NoopObserver)
            .await
            .unwrap();
        drop(stream);
        timeout(WAIT, async {
            while remote.close_count() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(!session.has_exchange_in_flight());
    }
}
