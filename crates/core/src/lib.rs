pub mod codec;
pub mod config;
pub mod demux;
pub mod error;
pub mod fault;
pub mod frame;
pub mod message;
pub mod openai;
pub mod provider;
pub mod session;
pub mod state;
pub mod stream;
pub mod transport;

pub use config::{ConfigOverrides, SessionConfig};
pub use demux::{ChannelObserver, Completion, FnObserver, NoopObserver, StreamEvent, StreamObserver};
pub use error::StreamError;
pub use fault::{Fault, FaultKind, Retry, TransportCode, TransportFailure};
pub use frame::{ClientFrame, ControlCommand, InitialInput, ServerFrame, StartFrame};
pub use message::{Message, Role};
pub use session::{Exchange, Session, SessionError};
pub use state::StreamState;
pub use stream::{Stream, StreamOptions};
pub use transport::{FrameSink, FrameSource, MemoryTransport, Transport};
