//! Message model: flags, types, and the public Request/Response values.
//!
//! A message is a logical request or response spanning one or more frames.
//! Outgoing messages are built as plain [`Request`] values and frozen into
//! the streaming state machine in [`outgoing`] when the connection admits
//! them; inbound frames accumulate in [`incoming`] until complete.

pub mod incoming;
pub mod outgoing;

use bytes::Bytes;

use crate::error::ErrorCode;
use crate::protocol::properties::{self, Properties};

/// Flag bits of the on-wire flag word.
pub mod flags {
    /// Mask over the three type bits (see [`MessageType`](super::MessageType)).
    pub const TYPE_MASK: u8 = 0x07;
    /// Payload (after the property block in frame 1) is deflate-compressed.
    pub const COMPRESSED: u8 = 0x08;
    /// Scheduled with higher priority.
    pub const URGENT: u8 = 0x10;
    /// Sender does not expect and will ignore any reply.
    pub const NO_REPLY: u8 = 0x20;
    /// This frame is not the last for this message.
    pub const MORE_COMING: u8 = 0x40;
    /// Control/administrative request (reserved).
    pub const META: u8 = 0x80;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has(word: u8, flag: u8) -> bool {
        word & flag != 0
    }
}

/// Message type, carried in the low three flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// MSG: a request.
    Request = 0,
    /// RPY: a successful reply.
    Response = 1,
    /// ERR: an error reply.
    Error = 2,
    /// ACK for an in-flight request.
    AckRequest = 4,
    /// ACK for an in-flight reply.
    AckResponse = 5,
}

impl MessageType {
    /// Decode the type bits of a flag word. Unknown type values (3, 6, 7)
    /// yield `None` and are ignored by the dispatcher for forward
    /// compatibility.
    pub fn from_flags(word: u8) -> Option<Self> {
        match word & flags::TYPE_MASK {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::Error),
            4 => Some(Self::AckRequest),
            5 => Some(Self::AckResponse),
            _ => None,
        }
    }

    /// The type bits of this type.
    #[inline]
    pub fn bits(self) -> u8 {
        self as u8
    }

    /// True for RPY and ERR.
    #[inline]
    pub fn is_reply(self) -> bool {
        matches!(self, Self::Response | Self::Error)
    }

    /// True for the two ack types.
    #[inline]
    pub fn is_ack(self) -> bool {
        matches!(self, Self::AckRequest | Self::AckResponse)
    }

    /// The ack type acknowledging a message of this type.
    pub fn ack_type(self) -> Option<Self> {
        match self {
            Self::Request => Some(Self::AckRequest),
            Self::Response | Self::Error => Some(Self::AckResponse),
            _ => None,
        }
    }
}

/// An outgoing request under construction.
///
/// A `Request` is a plain value: it can be cloned to resend the same
/// logical request on another connection, and it is consumed by
/// [`Connection::send`](crate::Connection::send), so a sent request can
/// never be mutated or sent twice.
///
/// # Example
///
/// ```
/// use blip::Request;
///
/// let req = Request::new()
///     .with_profile("echo")
///     .with_body("hello")
///     .with_urgent(true);
/// assert_eq!(req.profile(), Some("echo"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Request {
    properties: Properties,
    body: Bytes,
    compressed: bool,
    urgent: bool,
    no_reply: bool,
}

impl Request {
    /// Create an empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `Profile` property, which selects the peer's handler.
    pub fn with_profile(mut self, profile: &str) -> Self {
        self.properties.insert(properties::PROFILE, profile);
        self
    }

    /// Set an arbitrary property.
    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key, value);
        self
    }

    /// Set the `Content-Type` property.
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.properties.insert(properties::CONTENT_TYPE, content_type);
        self
    }

    /// Replace the whole property map.
    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Deflate-compress the payload on the wire.
    pub fn with_compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    /// Schedule with higher priority.
    pub fn with_urgent(mut self, urgent: bool) -> Self {
        self.urgent = urgent;
        self
    }

    /// Do not expect a reply; the peer will not send one.
    pub fn with_no_reply(mut self, no_reply: bool) -> Self {
        self.no_reply = no_reply;
        self
    }

    /// The `Profile` property, if set.
    pub fn profile(&self) -> Option<&str> {
        self.properties.get(properties::PROFILE)
    }

    /// The property map.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// The body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Whether the payload will be compressed.
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Whether the request is urgent.
    pub fn is_urgent(&self) -> bool {
        self.urgent
    }

    /// Whether the request declines a reply.
    pub fn is_no_reply(&self) -> bool {
        self.no_reply
    }

    /// The flag word this request will carry (MoreComing is per-frame).
    pub(crate) fn flag_word(&self) -> u8 {
        let mut word = MessageType::Request.bits();
        if self.compressed {
            word |= flags::COMPRESSED;
        }
        if self.urgent {
            word |= flags::URGENT;
        }
        if self.no_reply {
            word |= flags::NO_REPLY;
        }
        word
    }

    pub(crate) fn into_parts(self) -> (Properties, Bytes) {
        (self.properties, self.body)
    }
}

/// A completed reply from the peer.
#[derive(Debug, Clone)]
pub struct Response {
    properties: Properties,
    body: Bytes,
    error: Option<ResponseError>,
}

impl Response {
    pub(crate) fn new(properties: Properties, body: Bytes) -> Self {
        Self {
            properties,
            body,
            error: None,
        }
    }

    /// Build a response from a completed ERR message: `Error-Code` and
    /// `Error-Domain` come from the properties, the message text is the
    /// body. A missing or unparseable code becomes [`ErrorCode::Unspecified`].
    pub(crate) fn from_error_message(properties: Properties, body: Bytes) -> Self {
        let code = properties
            .get(properties::ERROR_CODE)
            .and_then(|c| c.parse::<u16>().ok())
            .unwrap_or(ErrorCode::Unspecified.code());
        let domain = properties
            .get(properties::ERROR_DOMAIN)
            .map(|d| d.to_string());
        let message = String::from_utf8_lossy(&body).into_owned();
        Self {
            properties,
            body,
            error: Some(ResponseError {
                domain,
                code,
                message,
            }),
        }
    }

    /// The property map of the reply.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// The body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Take ownership of the body.
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// The error carried by an ERR reply, if any.
    pub fn error(&self) -> Option<&ResponseError> {
        self.error.as_ref()
    }

    /// True when the reply is an ERR.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// The error payload of an ERR reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseError {
    /// Optional `Error-Domain` property.
    pub domain: Option<String>,
    /// Numeric `Error-Code` property; [`ErrorCode::Unspecified`] when
    /// missing or unparseable.
    pub code: u16,
    /// Human-readable message (the reply body).
    pub message: String,
}

impl std::fmt::Display for ResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.domain {
            Some(domain) => write!(f, "{} {}: {}", domain, self.code, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_bits_roundtrip() {
        for ty in [
            MessageType::Request,
            MessageType::Response,
            MessageType::Error,
            MessageType::AckRequest,
            MessageType::AckResponse,
        ] {
            assert_eq!(MessageType::from_flags(ty.bits() | flags::URGENT), Some(ty));
        }
    }

    #[test]
    fn test_unknown_types_are_none() {
        assert_eq!(MessageType::from_flags(3), None);
        assert_eq!(MessageType::from_flags(6), None);
        assert_eq!(MessageType::from_flags(7), None);
    }

    #[test]
    fn test_ack_types() {
        assert_eq!(
            MessageType::Request.ack_type(),
            Some(MessageType::AckRequest)
        );
        assert_eq!(
            MessageType::Response.ack_type(),
            Some(MessageType::AckResponse)
        );
        assert_eq!(MessageType::Error.ack_type(), Some(MessageType::AckResponse));
        assert_eq!(MessageType::AckRequest.ack_type(), None);
    }

    #[test]
    fn test_request_builder() {
        let req = Request::new()
            .with_profile("echo")
            .with_body("hello")
            .with_urgent(true)
            .with_no_reply(true)
            .with_compressed(true);
        assert_eq!(req.profile(), Some("echo"));
        assert_eq!(req.body(), b"hello");
        let word = req.flag_word();
        assert!(flags::has(word, flags::URGENT));
        assert!(flags::has(word, flags::NO_REPLY));
        assert!(flags::has(word, flags::COMPRESSED));
        assert_eq!(MessageType::from_flags(word), Some(MessageType::Request));
    }

    #[test]
    fn test_request_clone_is_fresh() {
        let req = Request::new().with_profile("p").with_body("b");
        let clone = req.clone();
        assert_eq!(clone.profile(), req.profile());
        assert_eq!(clone.body(), req.body());
    }

    #[test]
    fn test_error_response_decoding() {
        let mut props = Properties::new();
        props.insert(properties::ERROR_CODE, "404");
        props.insert(properties::ERROR_DOMAIN, "HTTP");
        let resp = Response::from_error_message(props, Bytes::from_static(b"not here"));
        let err = resp.error().unwrap();
        assert_eq!(err.code, 404);
        assert_eq!(err.domain.as_deref(), Some("HTTP"));
        assert_eq!(err.message, "not here");
    }

    #[test]
    fn test_error_response_unparseable_code() {
        let mut props = Properties::new();
        props.insert(properties::ERROR_CODE, "many");
        let resp = Response::from_error_message(props, Bytes::new());
        assert_eq!(resp.error().unwrap().code, ErrorCode::Unspecified.code());

        let resp = Response::from_error_message(Properties::new(), Bytes::new());
        assert_eq!(resp.error().unwrap().code, ErrorCode::Unspecified.code());
    }
}
