//! Frame header codec.
//!
//! A frame is one whole binary transport message:
//!
//! ```text
//! varint(message_number) || varint(flags) || payload_bytes
//! ```
//!
//! The flags varint is decoded as up to 64 bits for forward compatibility
//! but any value above [`MAX_FLAG`] is rejected as `BadFrame`.

use bytes::{Bytes, BytesMut};

use super::varint;
use crate::error::{BlipError, Result};

/// Highest flag word the decoder accepts; the defined flag space is 8 bits.
pub const MAX_FLAG: u64 = 0xff;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Message number, assigned sequentially per direction by the sender.
    pub number: u32,
    /// Flag word (type bits plus modifier bits, see [`crate::message::flags`]).
    pub flags: u8,
}

impl FrameHeader {
    /// Create a new frame header.
    pub fn new(number: u32, flags: u8) -> Self {
        Self { number, flags }
    }

    /// Encoded size of this header in bytes.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        varint::encoded_len(self.number as u64) + varint::encoded_len(self.flags as u64)
    }

    /// Append the encoded header to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        varint::write(buf, self.number as u64);
        varint::write(buf, self.flags as u64);
    }

    /// Decode a header from the front of `buf`.
    ///
    /// Returns the header and the number of bytes consumed. A truncated or
    /// malformed varint, a message number above `u32::MAX` or a flag word
    /// above [`MAX_FLAG`] is a `BadFrame` error: frames arrive whole, so
    /// there is never a "wait for more" case here.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (number, n) = varint::read(buf)
            .map_err(|_| BlipError::BadFrame("malformed message number".to_string()))?
            .ok_or_else(|| BlipError::BadFrame("truncated message number".to_string()))?;
        if number > u32::MAX as u64 {
            return Err(BlipError::BadFrame(format!(
                "message number {number} out of range"
            )));
        }
        let (flags, m) = varint::read(&buf[n..])
            .map_err(|_| BlipError::BadFrame("malformed flags".to_string()))?
            .ok_or_else(|| BlipError::BadFrame("truncated flags".to_string()))?;
        if flags > MAX_FLAG {
            return Err(BlipError::BadFrame(format!("flags {flags:#x} out of range")));
        }
        Ok((
            Self {
                number: number as u32,
                flags: flags as u8,
            },
            n + m,
        ))
    }
}

/// A decoded frame: header plus the payload bytes that followed it.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: FrameHeader,
    /// Payload bytes (zero-copy slice of the transport message).
    pub payload: Bytes,
}

impl Frame {
    /// Decode a whole transport message into a frame.
    pub fn decode(mut bytes: Bytes) -> Result<Self> {
        let (header, consumed) = FrameHeader::decode(&bytes)?;
        let payload = bytes.split_off(consumed);
        Ok(Self { header, payload })
    }

    /// Message number shorthand.
    #[inline]
    pub fn number(&self) -> u32 {
        self.header.number
    }

    /// Flags shorthand.
    #[inline]
    pub fn flags(&self) -> u8 {
        self.header.flags
    }
}
