//! Omni-Agent API Library Crate
//!
//! This library contains the server side of the Omni-Agent protocol: the
//! session registry, REST handlers, the streaming WebSocket endpoint, and
//! routing. The `api` binary is a thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod store;
pub mod ws;
