//! Duplex frame transport used by the connection state machine.
//!
//! The client only needs something that can be dialed and then yields a
//! [`Sink`] of outbound frames and a [`Stream`] of inbound ones. The stream
//! ending (or yielding an error) is how connection loss is reported.

mod memory;
mod websocket;

pub use memory::{DialBehavior, MemoryServerConnection, MemoryTransport};
pub use websocket::WebSocketTransport;

use crate::types::{ProtocolMessage, RealtimeError, Result};
use async_trait::async_trait;
use futures::{Sink, Stream};
use std::pin::Pin;
use url::Url;

pub type FrameSink = Pin<Box<dyn Sink<ProtocolMessage, Error = RealtimeError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<ProtocolMessage>> + Send>>;

/// An open transport, already split into its write and read halves.
pub struct TransportConnection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl std::fmt::Debug for TransportConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConnection").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a connection to `url` speaking `protocol` (e.g. `application/json`).
    async fn dial(&self, protocol: &str, url: &Url) -> Result<TransportConnection>;
}
