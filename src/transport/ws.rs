//! WebSocket transport adapter.
//!
//! Binds the connection to a `tokio-tungstenite` WebSocket. The handshake
//! negotiates the `BLIP` subprotocol on both ends; a peer that does not
//! speak it is refused. Each WebSocket binary message carries exactly one
//! BLIP frame; text, ping and pong messages are ignored.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HsRequest, Response as HsResponse,
};
use tokio_tungstenite::tungstenite::http::header::{SEC_WEBSOCKET_PROTOCOL, USER_AGENT};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message};
use tokio_tungstenite::{accept_hdr_async, MaybeTlsStream, WebSocketStream};

use crate::error::{BlipError, Result};

use super::{Transport, TransportEvent};

/// The WebSocket subprotocol every BLIP endpoint must negotiate.
pub const BLIP_SUBPROTOCOL: &str = "BLIP";

const USER_AGENT_STRING: &str = concat!(
    "blip.rs/",
    env!("CARGO_PKG_VERSION"),
    " (tokio-tungstenite)"
);

/// A BLIP transport over a WebSocket stream.
pub struct WsTransport<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    stream: SplitStream<WebSocketStream<S>>,
    open: bool,
    closed: Option<(bool, Option<String>)>,
}

impl WsTransport<MaybeTlsStream<TcpStream>> {
    /// Connect to `url` (`ws://` or `wss://`), negotiating the BLIP
    /// subprotocol.
    pub async fn connect(url: &str) -> Result<Self> {
        let mut request = url
            .into_client_request()
            .map_err(|e| BlipError::Transport(format!("bad url {url:?}: {e}")))?;
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(BLIP_SUBPROTOCOL),
        );
        request
            .headers_mut()
            .insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_STRING));

        let (socket, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| BlipError::Transport(format!("websocket connect failed: {e}")))?;

        let negotiated = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case(BLIP_SUBPROTOCOL))
            .unwrap_or(false);
        if !negotiated {
            tracing::warn!("server did not negotiate the {BLIP_SUBPROTOCOL} subprotocol");
            return Err(BlipError::PeerNotAllowed);
        }
        Ok(Self::new(socket))
    }
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an already-established WebSocket.
    pub fn new(socket: WebSocketStream<S>) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink,
            stream,
            open: true,
            closed: None,
        }
    }

    /// Accept an inbound WebSocket handshake, requiring the BLIP
    /// subprotocol.
    pub async fn accept(stream: S) -> Result<Self> {
        let socket = accept_hdr_async(stream, subprotocol_callback)
            .await
            .map_err(|e| BlipError::Transport(format!("websocket accept failed: {e}")))?;
        Ok(Self::new(socket))
    }
}

fn subprotocol_callback(
    request: &HsRequest,
    mut response: HsResponse,
) -> std::result::Result<HsResponse, ErrorResponse> {
    let offered = request
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|p| p.trim().eq_ignore_ascii_case(BLIP_SUBPROTOCOL))
        })
        .unwrap_or(false);
    if offered {
        response.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(BLIP_SUBPROTOCOL),
        );
        Ok(response)
    } else {
        tracing::warn!("rejecting websocket client without the BLIP subprotocol");
        let mut error = ErrorResponse::new(Some("BLIP subprotocol required".to_string()));
        *error.status_mut() = StatusCode::BAD_REQUEST;
        Err(error)
    }
}

#[async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn is_open(&self) -> bool {
        self.open
    }

    async fn send_frame(&mut self, frame: Bytes) -> Result<()> {
        self.sink
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|e| {
                self.open = false;
                BlipError::Transport(format!("websocket send failed: {e}"))
            })
    }

    async fn next_event(&mut self) -> TransportEvent {
        if let Some((clean, reason)) = &self.closed {
            return TransportEvent::Closed {
                clean: *clean,
                reason: reason.clone(),
            };
        }
        loop {
            let (clean, reason) = match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    return TransportEvent::Frame(Bytes::from(data));
                }
                Some(Ok(Message::Close(frame))) => {
                    let clean = frame
                        .as_ref()
                        .map(|f| f.code == CloseCode::Normal)
                        .unwrap_or(true);
                    let reason = frame
                        .filter(|f| !f.reason.is_empty())
                        .map(|f| f.reason.into_owned());
                    (clean, reason)
                }
                Some(Ok(other)) => {
                    tracing::trace!("ignoring non-binary websocket message: {other:?}");
                    continue;
                }
                Some(Err(e)) => (false, Some(e.to_string())),
                None => (false, None),
            };
            self.open = false;
            self.closed = Some((clean, reason.clone()));
            return TransportEvent::Closed { clean, reason };
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            let _ = self.sink.send(Message::Close(None)).await;
            let _ = self.sink.close().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{Frame, FrameHeader};
    use bytes::BytesMut;
    use tokio::net::TcpListener;

    async fn ws_pair() -> (
        WsTransport<MaybeTlsStream<TcpStream>>,
        WsTransport<TcpStream>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            WsTransport::accept(stream).await.unwrap()
        });
        let client = WsTransport::connect(&format!("ws://{addr}")).await.unwrap();
        (client, server.await.unwrap())
    }

    #[tokio::test]
    async fn test_handshake_and_frame_roundtrip() {
        let (mut client, mut server) = ws_pair().await;

        let mut buf = BytesMut::new();
        FrameHeader::new(1, 0x10).encode_into(&mut buf);
        buf.extend_from_slice(b"payload");
        client.send_frame(buf.freeze()).await.unwrap();

        match server.next_event().await {
            TransportEvent::Frame(bytes) => {
                let frame = Frame::decode(bytes).unwrap();
                assert_eq!(frame.number(), 1);
                assert_eq!(&frame.payload[..], b"payload");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_clean_close_propagates() {
        let (mut client, mut server) = ws_pair().await;
        client.close().await.unwrap();
        match server.next_event().await {
            TransportEvent::Closed { clean: true, .. } => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_client_without_subprotocol_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            WsTransport::accept(stream).await
        });
        // Plain handshake with no Sec-WebSocket-Protocol offer.
        let result = tokio_tungstenite::connect_async(format!("ws://{addr}")).await;
        assert!(result.is_err());
        assert!(server.await.unwrap().is_err());
    }
}
