//! WebSocket transport implementation.
//!
//! The subprotocol picks the serialization: `wamp.2.json` travels in text
//! frames and `wamp.2.msgpack` in binary frames.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use junction_core::{ChannelPeer, Peer, PeerIo, DEFAULT_PEER_CAPACITY};
use junction_protocol::{codec, Message, Serialization};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    accept_hdr_async_with_config,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::HeaderValue,
        protocol::WebSocketConfig as TungsteniteConfig,
        Message as WsMessage,
    },
    WebSocketStream,
};
use tracing::{debug, info, trace, warn};

use crate::telemetry;
use crate::traits::{Transport, TransportError};

const TRANSPORT: &str = "websocket";

const PROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_message_size: codec::MAX_MESSAGE_SIZE,
        }
    }
}

/// WebSocket transport.
pub struct WebSocketTransport {
    listener: TcpListener,
    config: WebSocketConfig,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: WebSocketConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr).await?;

        info!("WebSocket transport listening on {}", config.bind_addr);

        Ok(Self { listener, config })
    }

    /// Create a new WebSocket transport with default config.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::new(WebSocketConfig {
            bind_addr: addr,
            ..Default::default()
        })
        .await
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn accept(&self) -> Result<Box<dyn Peer>, TransportError> {
        let (stream, addr) = self.listener.accept().await?;

        debug!("Accepted TCP connection from {}", addr);

        let peer = accept_stream(stream, self.config.max_message_size).await?;
        Ok(Box::new(peer.with_remote_addr(addr.to_string())))
    }

    fn name(&self) -> &'static str {
        TRANSPORT
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

/// Pick the serialization for a `Sec-WebSocket-Protocol` offer.
///
/// The first supported protocol in the client's list wins. `None` means
/// nothing usable was offered and JSON is used without echoing a protocol.
#[must_use]
pub fn negotiate(offered: Option<&str>) -> Option<Serialization> {
    offered?.split(',').find_map(Serialization::from_subprotocol)
}

/// Run the WebSocket handshake on a stream and start pumping it.
///
/// # Errors
///
/// Returns an error if the WebSocket handshake fails.
pub async fn accept_stream<S>(stream: S, max_message_size: usize) -> Result<ChannelPeer, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut chosen = None;
    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let offered = request
            .headers()
            .get(PROTOCOL_HEADER)
            .and_then(|value| value.to_str().ok());
        chosen = negotiate(offered);
        if let Some(serialization) = chosen {
            response.headers_mut().insert(
                PROTOCOL_HEADER,
                HeaderValue::from_static(serialization.subprotocol()),
            );
        }
        Ok(response)
    };

    let mut config = TungsteniteConfig::default();
    config.max_message_size = Some(max_message_size);

    let ws = accept_hdr_async_with_config(stream, callback, Some(config))
        .await
        .map_err(|e| TransportError::Handshake(format!("WebSocket handshake failed: {}", e)))?;

    let serialization = chosen.unwrap_or_default();
    debug!(protocol = serialization.subprotocol(), "WebSocket handshake completed");

    let (peer, io) = ChannelPeer::new(DEFAULT_PEER_CAPACITY);
    spawn_pump(ws, serialization, io);
    Ok(peer)
}

/// Encode a message into the frame type its serialization travels in.
fn to_frame(message: &Message, serialization: Serialization) -> Result<WsMessage, TransportError> {
    let payload = codec::encode(message, serialization)?;
    Ok(match serialization {
        Serialization::Json => WsMessage::Text(
            String::from_utf8(payload.to_vec()).map_err(|e| TransportError::Other(e.to_string()))?,
        ),
        Serialization::MsgPack => WsMessage::Binary(payload.to_vec()),
    })
}

/// Move messages between the socket and the peer's queues.
///
/// Reading and writing run on separate tasks so a full inbound queue never
/// stops outbound traffic.
fn spawn_pump<S>(ws: WebSocketStream<S>, serialization: Serialization, io: PeerIo)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let PeerIo {
        mut outgoing,
        incoming,
        mut shutdown,
    } = io;
    let mut read_shutdown = shutdown.clone();
    let (mut sink, mut stream) = ws.split();
    let (pong_tx, mut pong_rx) = mpsc::channel::<Vec<u8>>(8);

    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                frame = stream.next() => frame,
                _ = read_shutdown.changed() => break,
            };

            let decoded = match frame {
                Some(Ok(WsMessage::Text(text))) => codec::decode(text.as_bytes(), Serialization::Json),
                Some(Ok(WsMessage::Binary(data))) => codec::decode(&data, Serialization::MsgPack),
                Some(Ok(WsMessage::Ping(data))) => {
                    let _ = pong_tx.send(data).await;
                    continue;
                }
                Some(Ok(WsMessage::Pong(_) | WsMessage::Frame(_))) => continue,
                Some(Ok(WsMessage::Close(_))) => {
                    debug!("Received close frame");
                    break;
                }
                Some(Err(e)) => {
                    debug!(error = %e, "WebSocket error");
                    break;
                }
                None => {
                    debug!("WebSocket stream ended");
                    break;
                }
            };

            match decoded {
                Ok(message) => {
                    telemetry::record_inbound(TRANSPORT);
                    if incoming.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    telemetry::record_decode_error(TRANSPORT);
                    warn!(error = %e, "Dropping undecodable message");
                }
            }
        }
    });

    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                biased;

                message = outgoing.recv() => match message {
                    Some(message) => match to_frame(&message, serialization) {
                        Ok(frame) => {
                            telemetry::record_outbound(TRANSPORT);
                            frame
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to encode message");
                            continue;
                        }
                    },
                    None => break,
                },
                Some(data) = pong_rx.recv() => WsMessage::Pong(data),
                _ = shutdown.changed() => break,
            };

            if let Err(e) = sink.send(frame).await {
                debug!(error = %e, "WebSocket send failed");
                break;
            }
        }
        let _ = sink.close().await;
        trace!("WebSocket writer finished");
    });
}
