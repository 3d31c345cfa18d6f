//! Connection multiplexer.
//!
//! The driver is a single task owning all scheduler state: the outbox of
//! runnable outgoing messages, the icebox of messages paused awaiting an
//! ack, the pending tables for both directions, the sequence counters and
//! the transport itself. Everything reaches it through its command channel,
//! so no state is ever shared under a lock. Inbound requests are handed off
//! to actions in spawned tasks, which reply back through the same channel.
//!
//! # Example
//!
//! ```ignore
//! let (client_end, server_end) = MemoryTransport::pair();
//! let server = Connection::builder()
//!     .action("echo", |req: InboundRequest| async move {
//!         req.respond(req.body().to_vec(), None)
//!     })
//!     .connect(server_end);
//! let client = Connection::connect(client_end);
//!
//! let pending = client
//!     .send(Request::new().with_profile("echo").with_body("hi"))
//!     .await?
//!     .unwrap();
//! let response = pending.await?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{BlipError, ErrorCode, Result};
use crate::handler::{Action, ActionRegistry, InboundRequest, Responder};
use crate::message::incoming::IncomingMessage;
use crate::message::outgoing::OutgoingMessage;
use crate::message::{flags, MessageType, Request, Response};
use crate::protocol::frame::Frame;
use crate::protocol::properties::{Properties, PROFILE};
use crate::protocol::{varint, BIG_FRAME_FACTOR, DEFAULT_FRAME_SIZE};
use crate::transport::{Transport, TransportEvent};

/// Commands sent to the driver task.
pub(crate) enum Command {
    SendRequest {
        request: Request,
        waiter: Option<oneshot::Sender<Result<Response>>>,
        admitted: oneshot::Sender<Result<u32>>,
    },
    SendReply {
        number: u32,
        ty: MessageType,
        properties: Properties,
        body: Bytes,
        urgent: bool,
        compressed: bool,
    },
    RegisterAction {
        profile: String,
        action: Arc<dyn Action>,
    },
    Close,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SendRequest { request, .. } => f
                .debug_struct("SendRequest")
                .field("profile", &request.profile())
                .finish_non_exhaustive(),
            Command::SendReply { number, ty, .. } => f
                .debug_struct("SendReply")
                .field("number", number)
                .field("ty", ty)
                .finish_non_exhaustive(),
            Command::RegisterAction { profile, .. } => f
                .debug_struct("RegisterAction")
                .field("profile", profile)
                .finish_non_exhaustive(),
            Command::Close => f.write_str("Close"),
        }
    }
}

/// Lifecycle state observable through [`Connection::closed`].
#[derive(Debug, Clone)]
enum ConnectionState {
    Open,
    Closed(Option<BlipError>),
}

/// Handle to a running BLIP connection.
///
/// Cheap to clone; the driver task shuts down cleanly when every handle
/// (and every in-flight action) is gone.
#[derive(Clone)]
pub struct Connection {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    active: Arc<AtomicBool>,
}

impl Connection {
    /// Start building a connection with pre-registered actions.
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    /// Run a connection over `transport` with no actions registered.
    pub fn connect<T: Transport>(transport: T) -> Connection {
        Self::builder().connect(transport)
    }

    /// Register an action for a Profile after the connection started.
    pub fn register_action(&self, profile: &str, action: impl Action) -> Result<()> {
        self.commands
            .send(Command::RegisterAction {
                profile: profile.to_string(),
                action: Arc::new(action),
            })
            .map_err(|_| BlipError::Disconnected)
    }

    /// Send a request.
    ///
    /// Waits for the driver to admit the message (assign its number), so
    /// scheduler rejections surface here. Returns `Ok(None)` for a NoReply
    /// request, otherwise a [`ResponseHandle`] resolving to the peer's
    /// reply.
    pub async fn send(&self, request: Request) -> Result<Option<ResponseHandle>> {
        let (waiter, handle) = if request.is_no_reply() {
            (None, None)
        } else {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(ResponseHandle { inner: rx }))
        };
        let (admitted_tx, admitted_rx) = oneshot::channel();
        self.commands
            .send(Command::SendRequest {
                request,
                waiter,
                admitted: admitted_tx,
            })
            .map_err(|_| BlipError::Disconnected)?;
        admitted_rx.await.map_err(|_| BlipError::Disconnected)??;
        Ok(handle)
    }

    /// Close the connection and wait until it has shut down.
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close);
        let _ = self.closed().await;
    }

    /// Wait for the connection to close; returns the fatal error, if any.
    pub async fn closed(&self) -> Option<BlipError> {
        let mut state = self.state.clone();
        let result = match state
            .wait_for(|s| matches!(s, ConnectionState::Closed(_)))
            .await
        {
            Ok(state) => match &*state {
                ConnectionState::Closed(error) => error.clone(),
                ConnectionState::Open => None,
            },
            Err(_) => Some(BlipError::Disconnected),
        };
        result
    }

    /// True while the transport is open.
    pub fn is_open(&self) -> bool {
        matches!(&*self.state.borrow(), ConnectionState::Open)
    }

    /// True while messages or replies are outstanding in either direction.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }
}

/// Builder registering actions before the driver starts.
#[derive(Default)]
pub struct ConnectionBuilder {
    registry: ActionRegistry,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action for a Profile.
    pub fn action(mut self, profile: &str, action: impl Action) -> Self {
        self.registry.register(profile, Arc::new(action));
        self
    }

    /// Spawn the driver over `transport` and return the handle.
    pub fn connect<T: Transport>(self, transport: T) -> Connection {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Open);
        let active = Arc::new(AtomicBool::new(false));
        let driver = Driver {
            transport,
            commands: commands_rx,
            // The driver must not keep its own strong sender or it would
            // never observe the channel closing.
            commands_weak: commands_tx.downgrade(),
            registry: self.registry,
            outbox: VecDeque::new(),
            icebox: HashMap::new(),
            pending_requests: HashMap::new(),
            pending_responses: HashMap::new(),
            next_request_number: 1,
            next_expected_request: 1,
            state: state_tx,
            active: active.clone(),
        };
        tokio::spawn(driver.run());
        Connection {
            commands: commands_tx,
            state: state_rx,
            active,
        }
    }
}

/// Future resolving to the peer's reply for a sent request.
///
/// Yields `Err(Disconnected)` when the connection closes before the reply
/// completes. Dropping the handle abandons interest; the reply is then
/// silently discarded when it arrives.
pub struct ResponseHandle {
    inner: oneshot::Receiver<Result<Response>>,
}

impl Future for ResponseHandle {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx).map(|r| match r {
            Ok(result) => result,
            Err(_) => Err(BlipError::Disconnected),
        })
    }
}

/// An outgoing-side reply still accumulating RPY/ERR frames.
struct PendingResponse {
    message: Option<IncomingMessage>,
    waiter: oneshot::Sender<Result<Response>>,
}

enum Step {
    Command(Option<Command>),
    Transport(TransportEvent),
    Pump,
}

struct Driver<T: Transport> {
    transport: T,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_weak: mpsc::WeakUnboundedSender<Command>,
    registry: ActionRegistry,
    /// Runnable outgoing messages, in send order.
    outbox: VecDeque<OutgoingMessage>,
    /// Paused outgoing messages awaiting an ack, keyed by (number, is_reply).
    icebox: HashMap<(u32, bool), OutgoingMessage>,
    /// Incoming requests still accumulating frames.
    pending_requests: HashMap<u32, IncomingMessage>,
    /// Replies we are waiting for, keyed by our request number.
    pending_responses: HashMap<u32, PendingResponse>,
    /// Number for the next locally originated request.
    next_request_number: u32,
    /// Number the next new incoming request must carry.
    next_expected_request: u32,
    state: watch::Sender<ConnectionState>,
    active: Arc<AtomicBool>,
}

impl<T: Transport> Driver<T> {
    async fn run(mut self) {
        loop {
            let can_pump = !self.outbox.is_empty() && self.transport.is_open();
            let step = tokio::select! {
                biased;
                command = self.commands.recv() => Step::Command(command),
                event = self.transport.next_event() => Step::Transport(event),
                _ = std::future::ready(()), if can_pump => Step::Pump,
            };
            let result = match step {
                Step::Command(None) | Step::Command(Some(Command::Close)) => {
                    self.shutdown(None).await;
                    return;
                }
                Step::Command(Some(command)) => self.handle_command(command),
                Step::Transport(TransportEvent::Closed { clean, reason }) => {
                    let error = if clean {
                        None
                    } else {
                        tracing::warn!("transport closed uncleanly: {reason:?}");
                        Some(BlipError::Disconnected)
                    };
                    self.shutdown(error).await;
                    return;
                }
                Step::Transport(TransportEvent::Frame(bytes)) => self.received_frame(bytes).await,
                Step::Pump => self.pump_one().await,
            };
            if let Err(error) = result {
                tracing::error!("fatal protocol error: {error}");
                self.shutdown(Some(error)).await;
                return;
            }
            self.update_active();
        }
    }

    fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::SendRequest {
                request,
                waiter,
                admitted,
            } => {
                if !self.transport.is_open() {
                    let _ = admitted.send(Err(BlipError::Disconnected));
                    return Ok(());
                }
                let number = self.next_request_number;
                match OutgoingMessage::request(number, request) {
                    Ok(message) => {
                        self.next_request_number += 1;
                        if let Some(waiter) = waiter {
                            self.pending_responses.insert(
                                number,
                                PendingResponse {
                                    message: None,
                                    waiter,
                                },
                            );
                        }
                        self.enqueue(message);
                        let _ = admitted.send(Ok(number));
                    }
                    Err(error) => {
                        let _ = admitted.send(Err(error));
                    }
                }
            }
            Command::SendReply {
                number,
                ty,
                properties,
                body,
                urgent,
                compressed,
            } => {
                if !self.transport.is_open() {
                    tracing::debug!("dropping reply #{number}: transport closed");
                    return Ok(());
                }
                match OutgoingMessage::reply(number, ty, &properties, body, urgent, compressed) {
                    Ok(message) => self.enqueue(message),
                    Err(error) => tracing::warn!("dropping reply #{number}: {error}"),
                }
            }
            Command::RegisterAction { profile, action } => {
                self.registry.register(profile, action);
            }
            // Handled by the run loop before it gets here.
            Command::Close => {}
        }
        Ok(())
    }

    /// Queue a message using the priority insertion rule.
    fn enqueue(&mut self, message: OutgoingMessage) {
        let index = insertion_index(&self.outbox, &message);
        tracing::trace!(
            "queueing #{} at {index}/{} (urgent={})",
            message.number(),
            self.outbox.len(),
            message.is_urgent()
        );
        self.outbox.insert(index, message);
    }

    /// Send the next frame of the message at the head of the outbox.
    async fn pump_one(&mut self) -> Result<()> {
        let Some(mut message) = self.outbox.pop_front() else {
            return Ok(());
        };
        // Bigger frames when no non-urgent traffic is waiting to interleave.
        let mut frame_size = DEFAULT_FRAME_SIZE;
        if message.is_urgent() || self.outbox.front().map_or(true, |next| next.is_urgent()) {
            frame_size *= BIG_FRAME_FACTOR;
        }
        let (frame, more) = message.next_frame(frame_size);
        self.transport.send_frame(frame).await?;
        if more {
            if message.needs_ack() {
                tracing::trace!("pausing #{} awaiting ack", message.number());
                self.icebox
                    .insert((message.number(), message.is_reply()), message);
            } else {
                self.enqueue(message);
            }
        } else {
            tracing::trace!("finished sending #{}", message.number());
        }
        Ok(())
    }

    async fn received_frame(&mut self, bytes: Bytes) -> Result<()> {
        let frame = Frame::decode(bytes)?;
        let Some(ty) = MessageType::from_flags(frame.flags()) else {
            tracing::debug!("ignoring frame with unknown type bits {:#04x}", frame.flags());
            return Ok(());
        };
        match ty {
            MessageType::Request => self.received_request(frame).await,
            MessageType::Response | MessageType::Error => self.received_reply(frame).await,
            MessageType::AckRequest | MessageType::AckResponse => self.received_ack(frame, ty),
        }
    }

    async fn received_request(&mut self, frame: Frame) -> Result<()> {
        let number = frame.number();
        let mut message = match self.pending_requests.remove(&number) {
            Some(message) => message,
            None if number == self.next_expected_request => {
                self.next_expected_request += 1;
                IncomingMessage::new(number, frame.flags())
            }
            None => {
                return Err(BlipError::BadFrame(format!(
                    "request #{number} out of sequence (expected #{})",
                    self.next_expected_request
                )));
            }
        };
        if let Some(acked) = message.received_frame(frame.flags(), &frame.payload)? {
            self.send_ack(number, MessageType::AckRequest, acked).await?;
        }
        if message.is_complete() {
            self.dispatch_request(message);
        } else {
            self.pending_requests.insert(number, message);
        }
        Ok(())
    }

    fn dispatch_request(&mut self, message: IncomingMessage) {
        let number = message.number();
        let (properties, body, word) = message.into_parts();
        let no_reply = flags::has(word, flags::NO_REPLY);
        let urgent = flags::has(word, flags::URGENT);
        let Some(commands) = self.commands_weak.upgrade() else {
            return;
        };
        let responder = Responder::new(commands, number, urgent, no_reply);

        // Reserved control path: nothing is defined on it yet.
        if flags::has(word, flags::META) {
            tracing::debug!("unknown meta request #{number}");
            responder.error(ErrorCode::NotFound.code(), "Unknown meta request");
            return;
        }

        let action = properties.get(PROFILE).and_then(|p| self.registry.get(p));
        match action {
            Some(action) => {
                let request = InboundRequest::new(word, properties, body, responder);
                let responder = request.responder();
                tokio::spawn(async move {
                    match action.call(request).await {
                        Ok(()) => responder.finish(),
                        Err(error) => {
                            tracing::warn!("action for request #{number} failed: {error}");
                            responder.finish_error(&error.to_string());
                        }
                    }
                });
            }
            None => {
                tracing::warn!(
                    "no handler for profile {:?} (request #{number})",
                    properties.get(PROFILE)
                );
                responder.error(ErrorCode::NotFound.code(), "No handler was found");
            }
        }
    }

    async fn received_reply(&mut self, frame: Frame) -> Result<()> {
        let number = frame.number();
        let Some(mut pending) = self.pending_responses.remove(&number) else {
            // A reply for a request we once assigned is a benign race
            // (abandoned NoReply number, cancelled wait); anything beyond
            // the counter was never sent at all.
            if number < self.next_request_number {
                tracing::debug!("dropping reply for unknown request #{number}");
                return Ok(());
            }
            return Err(BlipError::BadFrame(format!(
                "reply for never-sent request #{number}"
            )));
        };
        let mut message = pending
            .message
            .take()
            .unwrap_or_else(|| IncomingMessage::new(number, frame.flags()));
        if let Some(acked) = message.received_frame(frame.flags(), &frame.payload)? {
            self.send_ack(number, MessageType::AckResponse, acked).await?;
        }
        if message.is_complete() {
            let is_error = message.message_type() == Some(MessageType::Error);
            let (properties, body, _) = message.into_parts();
            let response = if is_error {
                Response::from_error_message(properties, body)
            } else {
                Response::new(properties, body)
            };
            let _ = pending.waiter.send(Ok(response));
        } else {
            pending.message = Some(message);
            self.pending_responses.insert(number, pending);
        }
        Ok(())
    }

    fn received_ack(&mut self, frame: Frame, ty: MessageType) -> Result<()> {
        let number = frame.number();
        let for_reply = ty == MessageType::AckResponse;
        let (acked, _) = varint::read(&frame.payload)
            .map_err(|_| BlipError::BadFrame("malformed ack payload".to_string()))?
            .ok_or_else(|| BlipError::BadFrame("truncated ack payload".to_string()))?;
        if let Some(mut message) = self.icebox.remove(&(number, for_reply)) {
            message.received_ack(acked)?;
            tracing::trace!("resuming #{number} at {acked} acked bytes");
            self.enqueue(message);
        } else if let Some(message) = self
            .outbox
            .iter_mut()
            .find(|m| m.number() == number && m.is_reply() == for_reply)
        {
            message.received_ack(acked)?;
        } else {
            // Raced with completion of the send; nothing left to resume.
            tracing::trace!("ack for unknown message #{number}");
        }
        Ok(())
    }

    async fn send_ack(&mut self, number: u32, ty: MessageType, received: u64) -> Result<()> {
        if !self.transport.is_open() {
            return Ok(());
        }
        let frame = OutgoingMessage::encode_ack_frame(number, ty, received);
        self.transport.send_frame(frame).await
    }

    async fn shutdown(&mut self, error: Option<BlipError>) {
        let _ = self.transport.close().await;
        let unsent = self.outbox.len() + self.icebox.len();
        if unsent > 0 {
            tracing::debug!("discarding {unsent} unsent messages");
        }
        self.outbox.clear();
        self.icebox.clear();
        self.pending_requests.clear();
        // Response waiters observe completion instead of hanging.
        for (_, pending) in self.pending_responses.drain() {
            let _ = pending.waiter.send(Err(BlipError::Disconnected));
        }
        self.update_active();
        match &error {
            Some(e) => tracing::warn!("connection closed: {e}"),
            None => tracing::debug!("connection closed"),
        }
        let _ = self.state.send(ConnectionState::Closed(error));
    }

    fn update_active(&self) {
        let active = !self.outbox.is_empty()
            || !self.icebox.is_empty()
            || !self.pending_requests.is_empty()
            || !self.pending_responses.is_empty();
        self.active.store(active, Ordering::Relaxed);
    }
}

/// Where a message belongs in the outbox.
///
/// Non-urgent messages append. An urgent message goes right after the last
/// urgent one already queued, leaving at most one non-urgent message behind
/// it so regular traffic is not starved; with no urgent message queued it
/// goes right behind the head (which may be mid-frame). A message that has
/// not produced its first frame yet never passes another such message, so
/// first frames reach the wire in number order.
fn insertion_index(outbox: &VecDeque<OutgoingMessage>, message: &OutgoingMessage) -> usize {
    let n = outbox.len();
    if !message.is_urgent() {
        return n;
    }
    let mut index = match outbox.iter().rposition(|m| m.is_urgent()) {
        Some(i) => (i + 2).min(n),
        None => 1.min(n),
    };
    if message.is_unsent() {
        if let Some(j) = outbox.iter().rposition(|m| m.is_unsent()) {
            index = index.max(j + 1);
        }
    }
    index
}
