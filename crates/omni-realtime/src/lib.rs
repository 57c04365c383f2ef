//! Caller-side client for an Omni-Agent server.
//!
//! ```no_run
//! use omni_realtime::OmniAgentClient;
//! use omni_agent_core::{ChannelObserver, ConfigOverrides, StreamOptions};
//!
//! # async fn run() -> Result<(), omni_realtime::ClientError> {
//! let client = OmniAgentClient::builder().target("localhost:50051").build()?;
//! let session = client.create_session(ConfigOverrides::default()).await?;
//! let (observer, mut events) = ChannelObserver::new();
//! let stream = client
//!     .open_stream(&session, StreamOptions::default(), observer)
//!     .await?;
//! stream.send_audio(vec![0u8; 3200]).await?;
//! stream.end_audio().await?;
//! while let Some(event) = events.recv().await {
//!     if event.is_terminal() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod transport;

pub use client::{ClientBuilder, HealthStatus, OmniAgentClient};
pub use error::ClientError;
