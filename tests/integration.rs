//! End-to-end tests running two connections over the paired in-process
//! transport. A tapping wrapper records raw frames, in the order the
//! connection saw them, so scheduler behavior (ack cadence, flow-control
//! window, urgent interleaving) can be asserted from the wire.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use blip::message::MessageType;
use blip::protocol::frame::Frame;
use blip::protocol::{varint, MAX_UNACKED_BYTES};
use blip::{
    BlipError, Connection, ErrorCode, InboundRequest, MemoryTransport, Properties, Request,
    Transport, TransportEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    Sent,
    Received,
}

/// Ordered log of frames as one endpoint's driver observed them.
type WireLog = Arc<Mutex<Vec<(Dir, Bytes)>>>;

/// Transport wrapper recording every frame in both directions.
struct Tap {
    inner: MemoryTransport,
    log: WireLog,
}

impl Tap {
    fn new(inner: MemoryTransport) -> (Self, WireLog) {
        let log: WireLog = Arc::default();
        (
            Self {
                inner,
                log: log.clone(),
            },
            log,
        )
    }
}

#[async_trait]
impl Transport for Tap {
    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    async fn send_frame(&mut self, frame: Bytes) -> blip::Result<()> {
        self.log.lock().unwrap().push((Dir::Sent, frame.clone()));
        self.inner.send_frame(frame).await
    }

    async fn next_event(&mut self) -> TransportEvent {
        let event = self.inner.next_event().await;
        if let TransportEvent::Frame(frame) = &event {
            self.log.lock().unwrap().push((Dir::Received, frame.clone()));
        }
        event
    }

    async fn close(&mut self) -> blip::Result<()> {
        self.inner.close().await
    }
}

fn decoded(log: &WireLog, dir: Dir) -> Vec<Frame> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|(d, _)| *d == dir)
        .map(|(_, bytes)| Frame::decode(bytes.clone()).expect("tapped frame decodes"))
        .collect()
}

fn is_type(frame: &Frame, ty: MessageType) -> bool {
    MessageType::from_flags(frame.flags()) == Some(ty)
}

fn echo_server(end: MemoryTransport) -> Connection {
    Connection::builder()
        .action("echo", |req: InboundRequest| async move {
            req.respond(req.body().to_vec(), Some("text/plain; charset=UTF-8"))
        })
        .connect(end)
}

#[tokio::test]
async fn simple_echo() {
    let (client_end, server_end) = MemoryTransport::pair();
    let _server = echo_server(server_end);
    let client = Connection::connect(client_end);

    let pending = client
        .send(Request::new().with_profile("echo").with_body("hello"))
        .await
        .unwrap()
        .unwrap();
    let response = pending.await.unwrap();

    assert_eq!(response.body(), b"hello");
    assert!(response.error().is_none());
    assert_eq!(
        response.properties().get("Content-Type"),
        Some("text/plain; charset=UTF-8")
    );
    client.close().await;
}

#[tokio::test]
async fn no_reply_request_gets_no_reply_frame() {
    let (client_end, server_end) = MemoryTransport::pair();
    let (server_tap, server_log) = Tap::new(server_end);

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let server = Connection::builder()
        .action("notify", move |req: InboundRequest| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(req.body().to_vec());
                Ok(())
            }
        })
        .connect(server_tap);
    server
        .register_action("echo", |req: InboundRequest| async move {
            req.respond(req.body().to_vec(), None)
        })
        .unwrap();
    let client = Connection::connect(client_end);

    let handle = client
        .send(
            Request::new()
                .with_profile("notify")
                .with_body("fire and forget")
                .with_no_reply(true),
        )
        .await
        .unwrap();
    assert!(handle.is_none(), "NoReply allocates no response");

    assert_eq!(seen_rx.recv().await.unwrap(), b"fire and forget");

    // A later request still works, and the wire carries no reply for #1.
    let pending = client
        .send(Request::new().with_profile("echo").with_body("still alive"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pending.await.unwrap().body(), b"still alive");

    let replies_to_one = decoded(&server_log, Dir::Sent)
        .into_iter()
        .filter(|f| {
            f.number() == 1
                && (is_type(f, MessageType::Response) || is_type(f, MessageType::Error))
        })
        .count();
    assert_eq!(replies_to_one, 0);
    client.close().await;
}

#[tokio::test]
async fn compressed_large_body_roundtrips() {
    let (client_end, server_end) = MemoryTransport::pair();
    let server = Connection::builder()
        .action("echo-z", |req: InboundRequest| async move {
            let mut props = Properties::new();
            props.insert("Content-Type", "application/octet-stream");
            req.respond_with(props, req.body().to_vec(), true)
        })
        .connect(server_end);
    let client = Connection::connect(client_end);

    let body = Bytes::from(b"the quick brown fox jumps over the lazy dog. ".repeat(24_000));
    assert!(body.len() > 1 << 20);

    let pending = client
        .send(
            Request::new()
                .with_profile("echo-z")
                .with_body(body.clone())
                .with_compressed(true),
        )
        .await
        .unwrap()
        .unwrap();
    let response = pending.await.unwrap();

    assert!(response.error().is_none());
    assert_eq!(response.body().len(), body.len());
    assert_eq!(response.body(), &body[..]);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn ack_pacing_on_large_upload() {
    let (client_end, server_end) = MemoryTransport::pair();
    let (client_tap, client_log) = Tap::new(client_end);

    let _server = Connection::builder()
        .action("drain", |req: InboundRequest| async move { req.respond("", None) })
        .connect(server_end);
    let client = Connection::connect(client_tap);

    let body: Vec<u8> = (0..400_000u32).map(|i| (i * 31 + 7) as u8).collect();
    let pending = client
        .send(Request::new().with_profile("drain").with_body(body))
        .await
        .unwrap()
        .unwrap();
    let response = pending.await.unwrap();
    assert!(response.error().is_none());

    // 400 kB crosses the 50 kB ack boundary at least seven times before the
    // final frame.
    let acks: Vec<u64> = decoded(&client_log, Dir::Received)
        .into_iter()
        .filter(|f| f.number() == 1 && is_type(f, MessageType::AckRequest))
        .map(|f| varint::read(&f.payload).unwrap().unwrap().0)
        .collect();
    assert!(acks.len() >= 7, "expected at least 7 acks, got {}", acks.len());
    assert!(acks.windows(2).all(|w| w[0] < w[1]), "acks are monotonic");

    // Replay the tap in driver order: the unacked window never exceeds the
    // limit by more than the frame in flight when the limit was reached.
    let mut sent = 0u64;
    let mut acked = 0u64;
    let mut max_frame = 0u64;
    for (dir, bytes) in client_log.lock().unwrap().iter() {
        let frame = Frame::decode(bytes.clone()).unwrap();
        if frame.number() != 1 {
            continue;
        }
        match dir {
            Dir::Sent if is_type(&frame, MessageType::Request) => {
                sent += frame.payload.len() as u64;
                max_frame = max_frame.max(frame.payload.len() as u64);
                assert!(
                    sent - acked <= MAX_UNACKED_BYTES + max_frame,
                    "window blown: {sent} sent vs {acked} acked"
                );
            }
            Dir::Received if is_type(&frame, MessageType::AckRequest) => {
                acked = varint::read(&frame.payload).unwrap().unwrap().0;
            }
            _ => {}
        }
    }
    assert_eq!(sent, 400_000 + decoded_props_len(&client_log));
    client.close().await;
}

/// Size of the property block of request #1, read back from the wire.
fn decoded_props_len(log: &WireLog) -> u64 {
    let frames = decoded(log, Dir::Sent);
    let first = frames
        .iter()
        .find(|f| f.number() == 1 && is_type(f, MessageType::Request))
        .expect("first frame of request #1");
    let (_, consumed) = Properties::decode(&first.payload).unwrap().unwrap();
    consumed as u64
}

#[tokio::test]
async fn urgent_request_interleaves_and_finishes_first() {
    let (client_end, server_end) = MemoryTransport::pair();
    let (client_tap, client_log) = Tap::new(client_end);

    let _server = Connection::builder()
        .action("drain", |req: InboundRequest| async move { req.respond("", None) })
        .action("ping", |req: InboundRequest| async move { req.respond("pong", None) })
        .connect(server_end);
    let client = Connection::connect(client_tap);

    let bulk: Vec<u8> = (0..(1u32 << 20)).map(|i| (i * 131 + 3) as u8).collect();
    // Enqueue B right behind A, before A's send gets going.
    let (pending_a, pending_b) = tokio::join!(
        client.send(Request::new().with_profile("drain").with_body(bulk)),
        client.send(
            Request::new()
                .with_profile("ping")
                .with_body("now")
                .with_urgent(true),
        ),
    );
    let pending_a = pending_a.unwrap().unwrap();
    let pending_b = pending_b.unwrap().unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let (order_a, order_b) = (order.clone(), order.clone());
    let (response_a, response_b) = tokio::join!(
        async move {
            let r = pending_a.await;
            order_a.lock().unwrap().push('A');
            r
        },
        async move {
            let r = pending_b.await;
            order_b.lock().unwrap().push('B');
            r
        },
    );
    assert_eq!(response_b.unwrap().body(), b"pong");
    assert!(response_a.unwrap().error().is_none());
    assert_eq!(*order.lock().unwrap(), ['B', 'A'], "urgent reply lands first");

    // B's first frame hits the wire within a couple of frame slots of being
    // queued, not after the 1 MiB bulk message.
    let request_numbers: Vec<u32> = decoded(&client_log, Dir::Sent)
        .into_iter()
        .filter(|f| is_type(f, MessageType::Request))
        .map(|f| f.number())
        .collect();
    let first_b = request_numbers.iter().position(|&n| n == 2).unwrap();
    assert!(
        first_b <= 3,
        "urgent frame appeared only at slot {first_b} of {request_numbers:?}"
    );
    let last_a = request_numbers.iter().rposition(|&n| n == 1).unwrap();
    assert!(first_b < last_a, "urgent message interleaved into the bulk send");
    client.close().await;
}

#[tokio::test]
async fn unknown_profile_yields_not_found() {
    let (client_end, server_end) = MemoryTransport::pair();
    let _server = echo_server(server_end);
    let client = Connection::connect(client_end);

    let pending = client
        .send(Request::new().with_profile("nonesuch").with_body("?"))
        .await
        .unwrap()
        .unwrap();
    let response = pending.await.unwrap();

    let error = response.error().expect("ERR reply expected");
    assert_eq!(error.code, ErrorCode::NotFound.code());
    assert_eq!(error.message, "No handler was found");
    client.close().await;
}

#[tokio::test]
async fn handler_error_becomes_handler_failed() {
    let (client_end, server_end) = MemoryTransport::pair();
    let _server = Connection::builder()
        .action("explode", |_req: InboundRequest| async move {
            Err(BlipError::Misc("boom".to_string()))
        })
        .connect(server_end);
    let client = Connection::connect(client_end);

    let pending = client
        .send(Request::new().with_profile("explode"))
        .await
        .unwrap()
        .unwrap();
    let response = pending.await.unwrap();

    let error = response.error().expect("ERR reply expected");
    assert_eq!(error.code, ErrorCode::HandlerFailed.code());
    assert!(error.message.contains("boom"));
    client.close().await;
}

#[tokio::test]
async fn unanswered_request_resolves_on_disconnect() {
    let (client_end, mut server_end) = MemoryTransport::pair();
    let client = Connection::connect(client_end);

    let pending = client
        .send(Request::new().with_profile("void").with_body("anyone there?"))
        .await
        .unwrap()
        .unwrap();

    // The peer takes the request and then the link dies.
    match server_end.next_event().await {
        TransportEvent::Frame(_) => {}
        other => panic!("unexpected event: {other:?}"),
    }
    drop(server_end);

    assert!(matches!(pending.await, Err(BlipError::Disconnected)));
    assert!(matches!(
        client.closed().await,
        Some(BlipError::Disconnected)
    ));
}

#[tokio::test]
async fn concurrent_requests_in_both_directions() {
    let (client_end, server_end) = MemoryTransport::pair();
    let server = echo_server(server_end);
    server
        .register_action("sum", |req: InboundRequest| async move {
            let total: u32 = req.body().iter().map(|&b| b as u32).sum();
            req.respond(total.to_string(), None)
        })
        .unwrap();
    let client = echo_server(client_end);

    // Client-to-server and server-to-client traffic at the same time.
    let client_side = async {
        for i in 0..20u8 {
            let pending = client
                .send(Request::new().with_profile("sum").with_body(vec![i, i, i]))
                .await
                .unwrap()
                .unwrap();
            let response = pending.await.unwrap();
            assert_eq!(response.body(), (3 * i as u32).to_string().as_bytes());
        }
    };
    let server_side = async {
        for i in 0..20u8 {
            let body = vec![i; 100];
            let pending = server
                .send(Request::new().with_profile("echo").with_body(body.clone()))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(pending.await.unwrap().body(), &body[..]);
        }
    };
    tokio::join!(client_side, server_side);
    client.close().await;
}
