//! Streaming WebSocket Endpoint
//!
//! One connection carries one exchange: a start frame, pushed audio and
//! control commands in, then recognition and generation frames out until a
//! single terminal frame.
//!
//! - `session`: connection lifecycle, from the start frame to the terminal frame.
//! - `pipeline`: turns a finished utterance into a streamed reply.
//! - `buffer`: the capped audio of the utterance in progress.

mod buffer;
mod pipeline;
pub mod session;

pub use session::ws_handler;
