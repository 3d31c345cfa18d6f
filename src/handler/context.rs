//! The request wrapper handed to actions, with its reply surface.
//!
//! Replies go back through the connection's command channel, so an action
//! can respond from any task. Each request accepts at most one reply; a
//! NoReply request accepts none. When an action finishes without replying
//! the connection sends the automatic empty RPY (or the `HandlerFailed`
//! ERR when the action returned an error).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::connection::Command;
use crate::error::{BlipError, ErrorCode, Result};
use crate::message::{flags, MessageType};
use crate::protocol::properties::{self, Properties};

/// Reply channel for one inbound request.
#[derive(Clone)]
pub(crate) struct Responder {
    commands: mpsc::UnboundedSender<Command>,
    number: u32,
    urgent: bool,
    no_reply: bool,
    replied: Arc<AtomicBool>,
}

impl Responder {
    pub fn new(
        commands: mpsc::UnboundedSender<Command>,
        number: u32,
        urgent: bool,
        no_reply: bool,
    ) -> Self {
        Self {
            commands,
            number,
            urgent,
            no_reply,
            replied: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Claim the single reply slot.
    fn claim(&self) -> Result<()> {
        if self.no_reply {
            return Err(BlipError::InvalidState(
                "request has NoReply set".to_string(),
            ));
        }
        if self.replied.swap(true, Ordering::AcqRel) {
            return Err(BlipError::InvalidState("request already replied".to_string()));
        }
        Ok(())
    }

    pub fn send_reply(
        &self,
        ty: MessageType,
        properties: Properties,
        body: Bytes,
        compressed: bool,
    ) -> Result<()> {
        self.claim()?;
        self.enqueue(ty, properties, body, compressed)
    }

    fn enqueue(
        &self,
        ty: MessageType,
        properties: Properties,
        body: Bytes,
        compressed: bool,
    ) -> Result<()> {
        self.commands
            .send(Command::SendReply {
                number: self.number,
                ty,
                properties,
                body,
                urgent: self.urgent,
                compressed,
            })
            .map_err(|_| BlipError::Disconnected)
    }

    /// Automatic empty RPY for a handled-but-unreplied request.
    pub fn finish(&self) {
        if !self.no_reply && !self.replied.swap(true, Ordering::AcqRel) {
            let _ = self.enqueue(MessageType::Response, Properties::new(), Bytes::new(), false);
        }
    }

    /// ERR reply for an action that returned an error.
    pub fn finish_error(&self, message: &str) {
        if !self.no_reply && !self.replied.swap(true, Ordering::AcqRel) {
            let _ = self.enqueue(
                MessageType::Error,
                error_properties(ErrorCode::HandlerFailed.code()),
                Bytes::copy_from_slice(message.as_bytes()),
                false,
            );
        }
    }

    /// ERR reply with an explicit code, used by the dispatcher itself
    /// (unknown profile, reserved meta requests).
    pub fn error(&self, code: u16, message: &str) {
        if !self.no_reply && !self.replied.swap(true, Ordering::AcqRel) {
            let _ = self.enqueue(
                MessageType::Error,
                error_properties(code),
                Bytes::copy_from_slice(message.as_bytes()),
                false,
            );
        }
    }
}

fn error_properties(code: u16) -> Properties {
    let mut props = Properties::new();
    props.insert(properties::ERROR_CODE, code.to_string());
    props
}

/// An inbound request delivered to an action.
pub struct InboundRequest {
    flags: u8,
    properties: Properties,
    body: Bytes,
    responder: Responder,
}

impl InboundRequest {
    pub(crate) fn new(
        flags: u8,
        properties: Properties,
        body: Bytes,
        responder: Responder,
    ) -> Self {
        Self {
            flags,
            properties,
            body,
            responder,
        }
    }

    /// The request's property map.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// The request body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The `Profile` property, if set.
    pub fn profile(&self) -> Option<&str> {
        self.properties.get(properties::PROFILE)
    }

    /// The `Content-Type` property, if set.
    pub fn content_type(&self) -> Option<&str> {
        self.properties.get(properties::CONTENT_TYPE)
    }

    /// True when the sender declines a reply.
    pub fn no_reply(&self) -> bool {
        flags::has(self.flags, flags::NO_REPLY)
    }

    /// True when the request was urgent; the reply inherits this.
    pub fn is_urgent(&self) -> bool {
        flags::has(self.flags, flags::URGENT)
    }

    /// Send a successful reply with the given body.
    pub fn respond(&self, body: impl Into<Bytes>, content_type: Option<&str>) -> Result<()> {
        let mut props = Properties::new();
        if let Some(ct) = content_type {
            props.insert(properties::CONTENT_TYPE, ct);
        }
        self.responder
            .send_reply(MessageType::Response, props, body.into(), false)
    }

    /// Send a successful reply with explicit properties, optionally
    /// compressing the payload.
    pub fn respond_with(
        &self,
        properties: Properties,
        body: impl Into<Bytes>,
        compressed: bool,
    ) -> Result<()> {
        self.responder
            .send_reply(MessageType::Response, properties, body.into(), compressed)
    }

    /// Send an ERR reply: `Error-Code` set to `code`, the message as body.
    pub fn respond_error(&self, code: impl Into<u16>, message: &str) -> Result<()> {
        self.responder.send_reply(
            MessageType::Error,
            error_properties(code.into()),
            Bytes::copy_from_slice(message.as_bytes()),
            false,
        )
    }

    pub(crate) fn responder(&self) -> Responder {
        self.responder.clone()
    }
}
