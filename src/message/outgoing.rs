//! Outgoing message state machine.
//!
//! An outgoing message is frozen at construction: the property block is
//! encoded, the body is deflated when the Compressed flag is set, and from
//! then on the message is a readable payload stream drained frame by frame
//! by the connection's send scheduler. `bytes_written` counts property plus
//! payload bytes already emitted; the peer acks the same count from its
//! side, and the difference drives the back-pressure window.

use std::io::Write;

use bytes::{Bytes, BytesMut};
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::error::{BlipError, Result};
use crate::protocol::frame::FrameHeader;
use crate::protocol::properties::Properties;
use crate::protocol::{varint, DEFAULT_FRAME_SIZE, MAX_UNACKED_BYTES};

use super::{flags, MessageType, Request};

/// An outgoing message being drained into frames.
#[derive(Debug)]
pub(crate) struct OutgoingMessage {
    number: u32,
    flags: u8,
    /// Encoded property block, emitted at the front of the first frame.
    properties: Bytes,
    /// Frozen payload: the body, deflated when Compressed is set.
    payload: Bytes,
    /// Payload bytes already emitted.
    offset: usize,
    /// Property block still pending (no frame produced yet).
    first_frame: bool,
    bytes_written: u64,
    bytes_acked: u64,
}

impl OutgoingMessage {
    /// Freeze a request into its streaming form, with its assigned number.
    pub fn request(number: u32, request: Request) -> Result<Self> {
        let word = request.flag_word();
        let (properties, body) = request.into_parts();
        Self::new(number, word, &properties, body)
    }

    /// Freeze a reply (RPY or ERR) under the originating request's number.
    pub fn reply(
        number: u32,
        ty: MessageType,
        properties: &Properties,
        body: Bytes,
        urgent: bool,
        compressed: bool,
    ) -> Result<Self> {
        debug_assert!(ty.is_reply());
        let mut word = ty.bits();
        if urgent {
            word |= flags::URGENT;
        }
        if compressed {
            word |= flags::COMPRESSED;
        }
        Self::new(number, word, properties, body)
    }

    fn new(number: u32, word: u8, properties: &Properties, body: Bytes) -> Result<Self> {
        let mut props = BytesMut::with_capacity(properties.encoded_len());
        properties.encode(&mut props);
        // The whole property block must fit in the first frame.
        if props.len() > DEFAULT_FRAME_SIZE - 16 {
            return Err(BlipError::InvalidState(format!(
                "property block of {} bytes exceeds the initial frame",
                props.len()
            )));
        }
        let payload = if flags::has(word, flags::COMPRESSED) {
            deflate(&body)?
        } else {
            body
        };
        Ok(Self {
            number,
            flags: word,
            properties: props.freeze(),
            payload,
            offset: 0,
            first_frame: true,
            bytes_written: 0,
            bytes_acked: 0,
        })
    }

    #[inline]
    pub fn number(&self) -> u32 {
        self.number
    }

    /// The message type (Request, Response or Error).
    pub fn message_type(&self) -> MessageType {
        MessageType::from_flags(self.flags).expect("outgoing messages have a known type")
    }

    #[inline]
    pub fn is_reply(&self) -> bool {
        self.message_type().is_reply()
    }

    #[inline]
    pub fn is_urgent(&self) -> bool {
        flags::has(self.flags, flags::URGENT)
    }

    #[inline]
    pub fn is_no_reply(&self) -> bool {
        flags::has(self.flags, flags::NO_REPLY)
    }

    /// True while no frame has been produced yet. New messages must keep
    /// their queue order relative to other new messages so that first
    /// frames hit the wire in number order.
    #[inline]
    pub fn is_unsent(&self) -> bool {
        self.bytes_written == 0 && self.first_frame
    }

    #[inline]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// The sender must pause (icebox) until the peer acks more bytes.
    #[inline]
    pub fn needs_ack(&self) -> bool {
        self.bytes_written - self.bytes_acked >= MAX_UNACKED_BYTES
    }

    /// Produce the next wire frame, at most `max_size` bytes.
    ///
    /// The first call prepends the property block; every call appends up to
    /// the remaining budget from the payload stream. The returned flag is
    /// MoreComing: true iff payload bytes remain after this frame.
    pub fn next_frame(&mut self, max_size: usize) -> (Bytes, bool) {
        let mut word = self.flags & !flags::MORE_COMING;
        // Budget the header at its worst case before deciding the chunk.
        let header_len = FrameHeader::new(self.number, word | flags::MORE_COMING).encoded_len();
        let props_len = if self.first_frame {
            self.properties.len()
        } else {
            0
        };
        let budget = max_size.saturating_sub(header_len + props_len);
        let chunk = budget.min(self.payload.len() - self.offset);
        let more = self.offset + chunk < self.payload.len();
        if more {
            word |= flags::MORE_COMING;
        }

        let mut buf = BytesMut::with_capacity(header_len + props_len + chunk);
        FrameHeader::new(self.number, word).encode_into(&mut buf);
        if self.first_frame {
            buf.extend_from_slice(&self.properties);
            self.bytes_written += self.properties.len() as u64;
            self.first_frame = false;
        }
        buf.extend_from_slice(&self.payload[self.offset..self.offset + chunk]);
        self.offset += chunk;
        self.bytes_written += chunk as u64;
        (buf.freeze(), more)
    }

    /// Apply an ack from the peer. Acks must be strictly increasing and can
    /// never exceed what was actually written.
    pub fn received_ack(&mut self, bytes_acked: u64) -> Result<()> {
        if bytes_acked <= self.bytes_acked || bytes_acked > self.bytes_written {
            return Err(BlipError::BadFrame(format!(
                "ack of {bytes_acked} for message #{} outside ({}, {}]",
                self.number, self.bytes_acked, self.bytes_written
            )));
        }
        self.bytes_acked = bytes_acked;
        Ok(())
    }

    /// Encode a standalone ack frame for a message the peer is sending us.
    pub fn encode_ack_frame(number: u32, ack_type: MessageType, bytes_received: u64) -> Bytes {
        debug_assert!(ack_type.is_ack());
        let word = ack_type.bits() | flags::URGENT | flags::NO_REPLY;
        let mut buf = BytesMut::with_capacity(16);
        FrameHeader::new(number, word).encode_into(&mut buf);
        varint::write(&mut buf, bytes_received);
        buf.freeze()
    }
}

fn deflate(body: &[u8]) -> Result<Bytes> {
    let mut encoder = DeflateEncoder::new(
        Vec::with_capacity(body.len() / 2 + 16),
        Compression::default(),
    );
    encoder
        .write_all(body)
        .and_then(|_| encoder.finish())
        .map(Bytes::from)
        .map_err(|e| BlipError::BadData(format!("deflate failed: {e}")))
}
