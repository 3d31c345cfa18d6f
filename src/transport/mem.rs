//! In-process paired transport.
//!
//! Two halves connected by channels, used by the integration tests and for
//! wiring two connections inside one process. Frames arrive whole and in
//! order, like any message-framed link.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{BlipError, Result};

use super::{Transport, TransportEvent};

#[derive(Debug)]
enum Item {
    Frame(Bytes),
    /// Orderly goodbye; dropping the sender without one is an unclean close.
    Goodbye,
}

/// One half of an in-process transport pair.
#[derive(Debug)]
pub struct MemoryTransport {
    tx: Option<mpsc::UnboundedSender<Item>>,
    rx: mpsc::UnboundedReceiver<Item>,
    peer_closed: bool,
}

impl MemoryTransport {
    /// Create two connected halves.
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            MemoryTransport {
                tx: Some(a_tx),
                rx: b_rx,
                peer_closed: false,
            },
            MemoryTransport {
                tx: Some(b_tx),
                rx: a_rx,
                peer_closed: false,
            },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn is_open(&self) -> bool {
        !self.peer_closed && self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    async fn send_frame(&mut self, frame: Bytes) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(BlipError::Disconnected)?;
        tx.send(Item::Frame(frame))
            .map_err(|_| BlipError::Disconnected)
    }

    async fn next_event(&mut self) -> TransportEvent {
        if self.peer_closed {
            return TransportEvent::Closed {
                clean: true,
                reason: None,
            };
        }
        match self.rx.recv().await {
            Some(Item::Frame(frame)) => TransportEvent::Frame(frame),
            Some(Item::Goodbye) => {
                self.peer_closed = true;
                TransportEvent::Closed {
                    clean: true,
                    reason: None,
                }
            }
            None => {
                self.peer_closed = true;
                TransportEvent::Closed {
                    clean: false,
                    reason: Some("peer transport dropped".to_string()),
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Item::Goodbye);
        }
        Ok(())
    }
}
