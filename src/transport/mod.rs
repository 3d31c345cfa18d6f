//! Transport abstraction.
//!
//! BLIP runs over any reliable transport that delivers whole binary frames
//! in order. The connection driver owns the transport exclusively; it sends
//! one frame at a time and pulls events between sends. Adapters translate
//! their medium's message types (e.g. WebSocket text/ping/pong) by ignoring
//! everything that is not a whole binary frame.

mod mem;
pub mod ws;

pub use mem::MemoryTransport;
pub use ws::WsTransport;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Something the transport reported to the connection.
#[derive(Debug)]
pub enum TransportEvent {
    /// A whole binary frame arrived.
    Frame(Bytes),
    /// The transport closed. `clean` distinguishes an orderly shutdown from
    /// a dropped or failed link.
    Closed {
        clean: bool,
        reason: Option<String>,
    },
}

/// A reliable, message-framed byte transport.
///
/// `next_event` must be cancel-safe: the driver polls it inside a select
/// and may drop the future between frames.
#[async_trait]
pub trait Transport: Send + 'static {
    /// True while frames can be sent.
    fn is_open(&self) -> bool;

    /// Send one whole binary frame. The buffer is transferred to the
    /// transport, which owns it until it is on the wire.
    async fn send_frame(&mut self, frame: Bytes) -> Result<()>;

    /// Wait for the next transport event. After `Closed` has been
    /// delivered, further calls keep returning `Closed`.
    async fn next_event(&mut self) -> TransportEvent;

    /// Close the transport in an orderly way.
    async fn close(&mut self) -> Result<()>;
}
