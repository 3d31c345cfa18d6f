//! Incoming message state machine.
//!
//! Frames are appended as they arrive. The property block is decoded
//! exactly once, from the prefix of the accumulated buffer; once it parses,
//! every remaining byte is body and is routed through an inflate stream
//! when the message is compressed. The receiver also decides here when a
//! flow-control ack is due.

use std::io::Write;

use bytes::{Bytes, BytesMut};
use flate2::write::DeflateDecoder;

use crate::error::{BlipError, Result};
use crate::protocol::properties::Properties;
use crate::protocol::ACK_INTERVAL;

use super::{flags, MessageType};

/// Body destination once the property block has been parsed.
enum Sink {
    Plain(BytesMut),
    Inflate(DeflateDecoder<Vec<u8>>),
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sink::Plain(buf) => f.debug_tuple("Plain").field(&buf.len()).finish(),
            Sink::Inflate(_) => f.write_str("Inflate"),
        }
    }
}

impl Sink {
    fn write(&mut self, chunk: &[u8]) -> Result<()> {
        match self {
            Sink::Plain(buf) => {
                buf.extend_from_slice(chunk);
                Ok(())
            }
            Sink::Inflate(decoder) => decoder
                .write_all(chunk)
                .map_err(|e| BlipError::BadData(format!("inflate failed: {e}"))),
        }
    }

    fn finish(self) -> Result<Bytes> {
        match self {
            Sink::Plain(buf) => Ok(buf.freeze()),
            Sink::Inflate(decoder) => decoder
                .finish()
                .map(Bytes::from)
                .map_err(|e| BlipError::BadData(format!("inflate truncated: {e}"))),
        }
    }
}

/// An incoming message accumulating frames.
#[derive(Debug)]
pub(crate) struct IncomingMessage {
    number: u32,
    flags: u8,
    /// Bytes received before the property block has parsed.
    pending: BytesMut,
    properties: Option<Properties>,
    sink: Option<Sink>,
    body: Option<Bytes>,
    bytes_received: u64,
    complete: bool,
}

impl IncomingMessage {
    /// Create from the first frame's header; the frame's payload is then
    /// fed through [`received_frame`](Self::received_frame) like any other.
    pub fn new(number: u32, first_flags: u8) -> Self {
        Self {
            number,
            flags: first_flags & !flags::MORE_COMING,
            pending: BytesMut::new(),
            properties: None,
            sink: None,
            body: None,
            bytes_received: 0,
            complete: false,
        }
    }

    #[inline]
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Current flag word. MoreComing is OR'd in from every frame and
    /// cleared again when the message completes, so observers always see
    /// whether more frames are expected.
    #[inline]
    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_flags(self.flags)
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    #[inline]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Append one frame.
    ///
    /// Returns the cumulative byte count to ack when this frame crossed an
    /// ack boundary, or `None` when no ack is due. Errors (malformed
    /// property block, failed decompression) are fatal to the session.
    pub fn received_frame(&mut self, frame_flags: u8, payload: &[u8]) -> Result<Option<u64>> {
        if self.complete {
            return Err(BlipError::BadFrame(format!(
                "frame for already-complete message #{}",
                self.number
            )));
        }

        let before = self.bytes_received;
        self.bytes_received += payload.len() as u64;

        if frame_flags & flags::MORE_COMING != 0 {
            self.flags |= flags::MORE_COMING;
        }

        if self.properties.is_none() {
            self.pending.extend_from_slice(payload);
            match Properties::decode(&self.pending)? {
                Some((properties, consumed)) => {
                    self.properties = Some(properties);
                    let mut sink = if flags::has(self.flags, flags::COMPRESSED) {
                        Sink::Inflate(DeflateDecoder::new(Vec::new()))
                    } else {
                        Sink::Plain(BytesMut::new())
                    };
                    sink.write(&self.pending[consumed..])?;
                    self.sink = Some(sink);
                    self.pending.clear();
                }
                None => {} // property block spans into the next frame
            }
        } else {
            self.sink
                .as_mut()
                .expect("sink exists once properties parsed")
                .write(payload)?;
        }

        if frame_flags & flags::MORE_COMING == 0 {
            self.finish()?;
            return Ok(None);
        }

        let due = self.bytes_received > 0 && before / ACK_INTERVAL < self.bytes_received / ACK_INTERVAL;
        Ok(due.then_some(self.bytes_received))
    }

    fn finish(&mut self) -> Result<()> {
        if self.properties.is_none() {
            return Err(BlipError::BadData(format!(
                "message #{} ended before its property block",
                self.number
            )));
        }
        let sink = self.sink.take().expect("sink exists once properties parsed");
        self.body = Some(sink.finish()?);
        self.flags &= !flags::MORE_COMING;
        self.complete = true;
        Ok(())
    }

    /// Decompose a completed message into `(properties, body, flags)`.
    pub fn into_parts(self) -> (Properties, Bytes, u8) {
        debug_assert!(self.complete);
        (
            self.properties.unwrap_or_default(),
            self.body.unwrap_or_default(),
            self.flags,
        )
    }
}
