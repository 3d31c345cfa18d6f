//! # blip
//!
//! Bidirectional, message-oriented RPC over any reliable, message-framed
//! byte transport (typically a WebSocket negotiating the `BLIP`
//! subprotocol).
//!
//! Both peers may send requests concurrently; each request may receive one
//! reply. Messages carry a string property map plus a binary body, may be
//! deflate-compressed, and are split into interleaved frames so large
//! transfers do not starve short urgent traffic. A per-message ack loop
//! keeps at most 128 kB in flight per message.
//!
//! ## Architecture
//!
//! - **Driver task**: owns the transport and every piece of scheduler
//!   state (outbox, icebox, pending tables, counters). All mutation
//!   happens on this one task; everything else talks to it over channels.
//! - **Actions**: inbound requests are dispatched by their `Profile`
//!   property to registered actions, each running in its own spawned task.
//!
//! ## Example
//!
//! ```ignore
//! use blip::{Connection, MemoryTransport, Request};
//!
//! #[tokio::main]
//! async fn main() -> blip::Result<()> {
//!     let (client_end, server_end) = MemoryTransport::pair();
//!
//!     let _server = Connection::builder()
//!         .action("echo", |req: blip::InboundRequest| async move {
//!             req.respond(req.body().to_vec(), Some("text/plain; charset=UTF-8"))
//!         })
//!         .connect(server_end);
//!
//!     let client = Connection::connect(client_end);
//!     let pending = client
//!         .send(Request::new().with_profile("echo").with_body("hello"))
//!         .await?
//!         .unwrap();
//!     let response = pending.await?;
//!     assert_eq!(response.body(), b"hello");
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod error;
pub mod handler;
pub mod message;
pub mod protocol;
pub mod transport;

pub use connection::{Connection, ConnectionBuilder, ResponseHandle};
pub use error::{BlipError, ErrorCode, Result};
pub use handler::{Action, InboundRequest};
pub use message::{Request, Response, ResponseError};
pub use protocol::Properties;
pub use transport::{MemoryTransport, Transport, TransportEvent, WsTransport};
