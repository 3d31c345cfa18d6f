//! Property block codec.
//!
//! The first frame of every message begins with a dictionary of UTF-8
//! key/value pairs:
//!
//! ```text
//! varint(length) || repeated( string(key) NUL string(value) NUL )
//! ```
//!
//! Frequently-used strings are abbreviated: a single byte `i` in `1..=14`
//! (followed by the terminating NUL) stands for the i-th entry of a fixed
//! table. The table is part of the wire contract; compatibility depends on
//! positional indexing.
//!
//! The leading length varint makes partial parsing possible: when the
//! buffer holds fewer bytes than `length`, [`Properties::decode`] reports
//! "not yet complete" and leaves the buffer untouched.

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};

use super::varint;
use crate::error::{BlipError, Result};

/// Well-known property keys.
pub const PROFILE: &str = "Profile";
pub const ERROR_CODE: &str = "Error-Code";
pub const ERROR_DOMAIN: &str = "Error-Domain";
pub const CONTENT_TYPE: &str = "Content-Type";

/// Fixed abbreviation table. Byte-for-byte identical on both peers;
/// index 1 maps to the first entry.
const ABBREVIATIONS: [&str; 14] = [
    "Profile",
    "Error-Code",
    "Error-Domain",
    "Content-Type",
    "application/json",
    "application/octet-stream",
    "text/plain; charset=UTF-8",
    "text/xml",
    "Accept",
    "Cache-Control",
    "must-revalidate",
    "If-Match",
    "If-None-Match",
    "Location",
];

/// String key/value map carried at the front of every message.
///
/// Order is irrelevant on the wire; two property maps are equal when their
/// entries are equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: HashMap<String, String>,
}

impl Properties {
    /// Create an empty property map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a property value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|v| v.as_str())
    }

    /// Insert or replace a property.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no properties are set.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(key, value)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Encoded size of the block, including the leading length varint.
    pub fn encoded_len(&self) -> usize {
        let inner = self.inner_len();
        varint::encoded_len(inner as u64) + inner
    }

    fn inner_len(&self) -> usize {
        self.entries
            .iter()
            .map(|(k, v)| token_len(k) + 1 + token_len(v) + 1)
            .sum()
    }

    /// Append the encoded block to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        let inner = self.inner_len();
        buf.reserve(varint::encoded_len(inner as u64) + inner);
        varint::write(buf, inner as u64);
        for (key, value) in &self.entries {
            write_token(buf, key);
            write_token(buf, value);
        }
    }

    /// Decode a block from the front of `buf`.
    ///
    /// Returns `Ok(Some((properties, consumed)))` when the block is whole,
    /// `Ok(None)` when `buf` does not yet hold `length` bytes, and
    /// `Err(BadData)` on a malformed block.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let Some((length, header)) = varint::read(buf)? else {
            return Ok(None);
        };
        let end = usize::try_from(length)
            .ok()
            .and_then(|len| header.checked_add(len))
            .ok_or_else(|| BlipError::BadData(format!("property block of {length} bytes")))?;
        let Some(block) = buf.get(header..end) else {
            return Ok(None);
        };
        let mut entries = HashMap::new();
        let mut tokens = TokenIter { block };
        while let Some(key) = tokens.next_token()? {
            let value = tokens.next_token()?.ok_or_else(|| {
                BlipError::BadData(format!("property {key:?} has no value"))
            })?;
            entries.insert(key, value);
        }
        Ok(Some((Self { entries }, end)))
    }
}

fn abbreviation_index(s: &str) -> Option<u8> {
    ABBREVIATIONS
        .iter()
        .position(|&a| a == s)
        .map(|i| (i + 1) as u8)
}

fn token_len(s: &str) -> usize {
    if abbreviation_index(s).is_some() {
        1
    } else {
        s.len()
    }
}

fn write_token(buf: &mut BytesMut, s: &str) {
    match abbreviation_index(s) {
        Some(index) => buf.put_u8(index),
        None => buf.put_slice(s.as_bytes()),
    }
    buf.put_u8(0);
}

struct TokenIter<'a> {
    block: &'a [u8],
}

impl TokenIter<'_> {
    fn next_token(&mut self) -> Result<Option<String>> {
        if self.block.is_empty() {
            return Ok(None);
        }
        let end = self
            .block
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| BlipError::BadData("unterminated property string".to_string()))?;
        let raw = &self.block[..end];
        self.block = &self.block[end + 1..];
        // Single control byte = abbreviation table index.
        if raw.len() == 1 && raw[0] < 0x20 {
            let index = raw[0] as usize;
            return match index.checked_sub(1).and_then(|i| ABBREVIATIONS.get(i)) {
                Some(&s) => Ok(Some(s.to_string())),
                None => Err(BlipError::BadData(format!(
                    "property abbreviation {index} out of table"
                ))),
            };
        }
        let s = std::str::from_utf8(raw)
            .map_err(|_| BlipError::BadData("property string is not UTF-8".to_string()))?;
        Ok(Some(s.to_string()))
    }
}
