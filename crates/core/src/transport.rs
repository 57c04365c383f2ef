//! The seam between a [`Stream`](crate::stream::Stream) and the physical
//! channel it runs over.

use crate::fault::{TransportCode, TransportFailure};
use crate::frame::{ClientFrame, ServerFrame};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// The write half of a channel. Writes must not be interleaved, so callers
/// hold exclusive access while sending.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), TransportFailure>;

    /// Releases the channel. Implementations may assume a single call.
    async fn close(&mut self) -> Result<(), TransportFailure>;
}

/// The read half of a channel, yielding frames in the order the far side sent them.
pub type FrameSource = BoxStream<'static, Result<ServerFrame, TransportFailure>>;

/// One physical channel, split into its halves.
pub struct Transport {
    pub sink: Box<dyn FrameSink>,
    pub source: FrameSource,
}

impl Transport {
    pub fn new(sink: impl FrameSink + 'static, source: FrameSource) -> Self {
        Self {
            sink: Box::new(sink),
            source,
        }
    }
}

/// An in-process channel. The returned [`RemoteEnd`] plays the far side.
pub struct MemoryTransport;

impl MemoryTransport {
    pub fn pair() -> (Transport, RemoteEnd) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));
        let sink = MemorySink {
            frames: Some(frames_tx),
            closes: closes.clone(),
        };
        let source = UnboundedReceiverStream::new(events_rx).boxed();
        (
            Transport::new(sink, source),
            RemoteEnd {
                frames: frames_rx,
                events: Some(events_tx),
                closes,
            },
        )
    }
}

struct MemorySink {
    frames: Option<mpsc::UnboundedSender<ClientFrame>>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), TransportFailure> {
        let Some(frames) = &self.frames else {
            return Err(TransportFailure::new(
                TransportCode::Unavailable,
                "channel already closed",
            ));
        };
        frames
            .send(frame)
            .map_err(|_| TransportFailure::new(TransportCode::Unavailable, "remote end dropped"))
    }

    async fn close(&mut self) -> Result<(), TransportFailure> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.frames = None;
        Ok(())
    }
}

/// The far side of a [`MemoryTransport`].
pub struct RemoteEnd {
    /// Frames the stream put on the wire.
    pub frames: mpsc::UnboundedReceiver<ClientFrame>,
    events: Option<mpsc::UnboundedSender<Result<ServerFrame, TransportFailure>>>,
    closes: Arc<AtomicUsize>,
}

impl RemoteEnd {
    /// Delivers a frame to the stream. Returns `false` once the stream stopped reading.
    pub fn emit(&self, frame: ServerFrame) -> bool {
        self.deliver(Ok(frame))
    }

    /// Injects a transport failure into the stream's read path.
    pub fn fail(&self, failure: TransportFailure) -> bool {
        self.deliver(Err(failure))
    }

    /// Ends the stream's read path without a terminal frame.
    pub fn disconnect(&mut self) {
        self.events = None;
    }

    fn deliver(&self, item: Result<ServerFrame, TransportFailure>) -> bool {
        self.events
            .as_ref()
            .is_some_and(|events| events.send(item).is_ok())
    }

    /// How many times the stream released its channel.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Drains the frames sent so far without waiting.
    pub fn sent_frames(&mut self) -> Vec<ClientFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            frames.push(frame);
        }
        frames
    }
}
