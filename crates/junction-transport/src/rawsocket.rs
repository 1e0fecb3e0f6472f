//! Raw socket transport implementation.
//!
//! Messages travel over a plain stream behind a 4-byte handshake and a
//! 4-byte frame header:
//!
//! ```text
//! handshake: 0x7F | length exponent << 4 | serializer | 0x00 | 0x00
//! frame:     type (low 3 bits) | length (24-bit big endian) | payload
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use junction_core::{ChannelPeer, Peer, PeerIo, DEFAULT_PEER_CAPACITY};
use junction_protocol::{codec, Message, Serialization};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::telemetry;
use crate::traits::{Transport, TransportError};

const TRANSPORT: &str = "rawsocket";

/// First byte of every raw socket handshake.
pub const MAGIC: u8 = 0x7F;

/// Largest length exponent a handshake can carry.
const MAX_EXPONENT: u8 = 0xF;

/// Largest payload the 24-bit frame length can describe.
pub const MAX_FRAME_LENGTH: usize = (1 << 24) - 1;

/// Maximum payload length announced by a length exponent (2^9 up to the
/// frame limit; exponent 15 announces 2^24, which a frame cannot carry).
#[must_use]
pub fn max_length(exponent: u8) -> usize {
    (512usize << exponent.min(MAX_EXPONENT)).min(MAX_FRAME_LENGTH)
}

/// Frame types carried in the low bits of a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Serialized message.
    Message,
    /// Keepalive request, answered with a pong carrying the same payload.
    Ping,
    /// Keepalive reply.
    Pong,
}

impl FrameType {
    fn code(self) -> u8 {
        match self {
            FrameType::Message => 0,
            FrameType::Ping => 1,
            FrameType::Pong => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code & 0x7 {
            0 => Some(FrameType::Message),
            1 => Some(FrameType::Ping),
            2 => Some(FrameType::Pong),
            _ => None,
        }
    }
}

/// Build a frame header.
///
/// Returns `None` when `len` does not fit the 24-bit length field.
#[must_use]
pub fn frame_header(kind: FrameType, len: usize) -> Option<[u8; 4]> {
    if len > MAX_FRAME_LENGTH {
        return None;
    }
    let [_, high, mid, low] = u32::try_from(len).ok()?.to_be_bytes();
    Some([kind.code(), high, mid, low])
}

/// Split a frame header into its type code and payload length.
#[must_use]
pub fn parse_frame_header(header: [u8; 4]) -> (u8, usize) {
    let len = (usize::from(header[1]) << 16) | (usize::from(header[2]) << 8) | usize::from(header[3]);
    (header[0] & 0x7, len)
}

/// What a client asked for in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// Negotiated serialization.
    pub serialization: Serialization,
    /// Largest frame payload the client accepts.
    pub max_length: usize,
    /// Raw second byte, echoed back on success.
    header: u8,
}

impl Handshake {
    /// Server reply accepting this handshake.
    #[must_use]
    pub fn reply(&self) -> [u8; 4] {
        [MAGIC, self.header, 0, 0]
    }
}

/// Server reply refusing a serializer (error code 0).
pub const UNSUPPORTED_SERIALIZER: [u8; 4] = [MAGIC, 0x00, 0, 0];

/// Parse a client handshake.
///
/// # Errors
///
/// Returns [`TransportError::Handshake`] for a wrong magic byte or an
/// unsupported serializer.
pub fn parse_handshake(bytes: [u8; 4]) -> Result<Handshake, TransportError> {
    if bytes[0] != MAGIC {
        return Err(TransportError::Handshake(format!(
            "unknown protocol: first byte {:#04x} is not the magic value",
            bytes[0]
        )));
    }

    let exponent = (bytes[1] >> 4).min(MAX_EXPONENT);
    let code = bytes[1] & 0x0F;
    let serialization = Serialization::from_raw_socket_code(code)
        .ok_or_else(|| TransportError::Handshake(format!("serializer {} unsupported", code)))?;

    Ok(Handshake {
        serialization,
        max_length: max_length(exponent),
        header: bytes[1],
    })
}

/// Raw socket transport configuration.
#[derive(Debug, Clone)]
pub struct RawSocketConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum message size in bytes, on top of what each client announces.
    pub max_message_size: usize,
}

impl Default for RawSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            max_message_size: codec::MAX_MESSAGE_SIZE,
        }
    }
}

/// Raw socket transport.
pub struct RawSocketTransport {
    listener: TcpListener,
    config: RawSocketConfig,
}

impl RawSocketTransport {
    /// Create a new raw socket transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: RawSocketConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr).await?;

        info!("Raw socket transport listening on {}", config.bind_addr);

        Ok(Self { listener, config })
    }

    /// Create a new raw socket transport with default config.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::new(RawSocketConfig {
            bind_addr: addr,
            ..Default::default()
        })
        .await
    }
}

#[async_trait]
impl Transport for RawSocketTransport {
    async fn accept(&self) -> Result<Box<dyn Peer>, TransportError> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;

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

/// Run the server side of the raw socket handshake and start pumping.
///
/// A bad magic byte closes the stream without a reply. An unsupported
/// serializer is refused with error code 0 before closing. Frames in both
/// directions are bounded by the smaller of the client's announced length
/// and `max_message_size`.
///
/// # Errors
///
/// Returns an error if the handshake is rejected or the stream fails.
pub async fn accept_stream<S>(mut stream: S, max_message_size: usize) -> Result<ChannelPeer, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;

    let mut handshake = match parse_handshake(request) {
        Ok(handshake) => handshake,
        Err(e) => {
            if request[0] == MAGIC {
                stream.write_all(&UNSUPPORTED_SERIALIZER).await?;
            }
            let _ = stream.shutdown().await;
            return Err(e);
        }
    };

    stream.write_all(&handshake.reply()).await?;
    stream.flush().await?;
    handshake.max_length = handshake.max_length.min(max_message_size);

    debug!(
        protocol = handshake.serialization.subprotocol(),
        max_length = handshake.max_length,
        "Raw socket handshake completed"
    );

    let (peer, io) = ChannelPeer::new(DEFAULT_PEER_CAPACITY);
    spawn_pump(stream, handshake, io);
    Ok(peer)
}

async fn write_frame<W>(writer: &mut W, kind: FrameType, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = frame_header(kind, payload.len()).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("frame payload of {} bytes exceeds the length field", payload.len()),
        )
    })?;
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

fn spawn_pump<S>(stream: S, handshake: Handshake, io: PeerIo)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let PeerIo {
        mut outgoing,
        incoming,
        mut shutdown,
    } = io;
    let mut read_shutdown = shutdown.clone();
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (pong_tx, mut pong_rx) = mpsc::channel::<Bytes>(8);
    let Handshake {
        serialization,
        max_length,
        ..
    } = handshake;

    tokio::spawn(async move {
        loop {
            let mut header = [0u8; 4];
            let read = tokio::select! {
                read = reader.read_exact(&mut header) => read,
                _ = read_shutdown.changed() => break,
            };
            if let Err(e) = read {
                debug!(error = %e, "Raw socket stream ended");
                break;
            }

            let (code, len) = parse_frame_header(header);
            if len > max_length {
                warn!(len, max_length, "Frame exceeds negotiated length, closing");
                break;
            }

            let mut payload = vec![0u8; len];
            if let Err(e) = reader.read_exact(&mut payload).await {
                debug!(error = %e, "Raw socket stream ended mid-frame");
                break;
            }

            match FrameType::from_code(code) {
                Some(FrameType::Message) => match codec::decode(&payload, serialization) {
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
                },
                Some(FrameType::Ping) => {
                    let _ = pong_tx.send(Bytes::from(payload)).await;
                }
                Some(FrameType::Pong) => {}
                None => trace!(code, "Ignoring frame of unknown type"),
            }
        }
    });

    tokio::spawn(async move {
        loop {
            let written = tokio::select! {
                biased;

                message = outgoing.recv() => match message {
                    Some(message) => write_message(&mut writer, &message, serialization, max_length).await,
                    None => break,
                },
                Some(payload) = pong_rx.recv() => write_frame(&mut writer, FrameType::Pong, &payload).await,
                _ = shutdown.changed() => break,
            };

            if let Err(e) = written {
                debug!(error = %e, "Raw socket send failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
        trace!("Raw socket writer finished");
    });
}

async fn write_message<W>(
    writer: &mut W,
    message: &Message,
    serialization: Serialization,
    max_length: usize,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = match codec::encode(message, serialization) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Failed to encode message");
            return Ok(());
        }
    };
    if payload.len() > max_length.min(MAX_FRAME_LENGTH) {
        warn!(
            message_type = %message.message_type(),
            len = payload.len(),
            max_length,
            "Dropping message larger than the peer accepts"
        );
        return Ok(());
    }
    write_frame(writer, FrameType::Message, &payload).await?;
    telemetry::record_outbound(TRANSPORT);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use junction_protocol::Dict;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    async fn read_frame(client: &mut DuplexStream) -> (u8, Vec<u8>) {
        let mut header = [0u8; 4];
        client.read_exact(&mut header).await.unwrap();
        let (code, len) = parse_frame_header(header);
        let mut payload = vec![0u8; len];
        client.read_exact(&mut payload).await.unwrap();
        (code, payload)
    }

    async fn connect(serializer: u8) -> (DuplexStream, ChannelPeer) {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let accept = tokio::spawn(accept_stream(server, codec::MAX_MESSAGE_SIZE));

        client.write_all(&[MAGIC, 0xF0 | serializer, 0, 0]).await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [MAGIC, 0xF0 | serializer, 0, 0]);

        (client, accept.await.unwrap().unwrap())
    }

    #[test]
    fn test_max_length() {
        assert_eq!(max_length(0), 512);
        assert_eq!(max_length(0xE), 8 * 1024 * 1024);
        assert_eq!(max_length(0xF), MAX_FRAME_LENGTH);

        let handshake = parse_handshake([MAGIC, 0xF1, 0, 0]).unwrap();
        assert_eq!(handshake.max_length, (1 << 24) - 1);
    }

    #[test]
    fn test_frame_header() {
        assert_eq!(frame_header(FrameType::Message, 0x01_02_03), Some([0, 1, 2, 3]));
        assert_eq!(frame_header(FrameType::Pong, 3), Some([2, 0, 0, 3]));
        assert_eq!(
            frame_header(FrameType::Message, MAX_FRAME_LENGTH),
            Some([0, 0xFF, 0xFF, 0xFF])
        );
        assert_eq!(frame_header(FrameType::Message, 1 << 24), None);
        assert_eq!(parse_frame_header([0x09, 0, 1, 0]), (1, 256));
    }

    #[test]
    fn test_parse_handshake() {
        let handshake = parse_handshake([MAGIC, 0x21, 0, 0]).unwrap();
        assert_eq!(handshake.serialization, Serialization::Json);
        assert_eq!(handshake.max_length, 2048);
        assert_eq!(handshake.reply(), [MAGIC, 0x21, 0, 0]);

        assert!(parse_handshake([0x00, 0x21, 0, 0]).is_err());
        assert!(parse_handshake([MAGIC, 0x23, 0, 0]).is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_refused_not_truncated() {
        let mut out = Vec::new();
        let payload = vec![b'x'; 1 << 24];

        let err = write_frame(&mut out, FrameType::Message, &payload)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_message_over_negotiated_length_is_dropped() {
        let mut out = Vec::new();
        let message = Message::goodbye_and_out();

        write_message(&mut out, &message, Serialization::Json, 8)
            .await
            .unwrap();
        assert!(out.is_empty());

        write_message(&mut out, &message, Serialization::Json, MAX_FRAME_LENGTH)
            .await
            .unwrap();
        let (code, len) = parse_frame_header([out[0], out[1], out[2], out[3]]);
        assert_eq!(code, 0);
        assert_eq!(len, out.len() - 4);
    }

    #[tokio::test]
    async fn test_configured_limit_bounds_inbound_frames() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let accept = tokio::spawn(accept_stream(server, 64));

        client.write_all(&[MAGIC, 0xF1, 0, 0]).await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        let mut peer = accept.await.unwrap().unwrap();

        client.write_all(&[0, 0, 0, 100]).await.unwrap();
        client.write_all(&[b' '; 100]).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), peer.recv())
            .await
            .unwrap();
        assert_eq!(received, None);
    }

    #[tokio::test]
    async fn test_unsupported_serializer_is_refused() {
        let (mut client, server) = tokio::io::duplex(1024);
        let accept = tokio::spawn(accept_stream(server, codec::MAX_MESSAGE_SIZE));

        client.write_all(&[MAGIC, 0xF7, 0, 0]).await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, UNSUPPORTED_SERIALIZER);
        assert!(matches!(accept.await.unwrap(), Err(TransportError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_bad_magic_closes_without_reply() {
        let (mut client, server) = tokio::io::duplex(1024);
        let accept = tokio::spawn(accept_stream(server, codec::MAX_MESSAGE_SIZE));

        client.write_all(&[0x16, 0x03, 0x01, 0x00]).await.unwrap();
        assert!(accept.await.unwrap().is_err());

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_message_exchange() {
        let (mut client, mut peer) = connect(1).await;

        let hello = Message::hello("realm1", Dict::new());
        let payload = codec::encode(&hello, Serialization::Json).unwrap();
        client
            .write_all(&frame_header(FrameType::Message, payload.len()).unwrap())
            .await
            .unwrap();
        client.write_all(&payload).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), peer.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(hello));

        peer.send(Message::goodbye_and_out()).await.unwrap();
        let (code, payload) = read_frame(&mut client).await;
        assert_eq!(code, 0);
        assert_eq!(
            codec::decode(&payload, Serialization::Json).unwrap(),
            Message::goodbye_and_out()
        );
    }

    #[tokio::test]
    async fn test_msgpack_message_exchange() {
        let (mut client, mut peer) = connect(2).await;

        peer.send(Message::goodbye_and_out()).await.unwrap();
        let (code, payload) = read_frame(&mut client).await;
        assert_eq!(code, 0);
        assert_eq!(
            codec::decode(&payload, Serialization::MsgPack).unwrap(),
            Message::goodbye_and_out()
        );
    }

    #[tokio::test]
    async fn test_ping_is_answered_with_pong() {
        let (mut client, _peer) = connect(1).await;

        client.write_all(&[1, 0, 0, 3]).await.unwrap();
        client.write_all(b"abc").await.unwrap();

        let (code, payload) = read_frame(&mut client).await;
        assert_eq!(code, FrameType::Pong.code());
        assert_eq!(payload, b"abc");
    }

    #[tokio::test]
    async fn test_peer_close_ends_stream() {
        let (mut client, mut peer) = connect(1).await;

        peer.close().await.unwrap();

        let mut buf = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut buf))
            .await
            .unwrap();
        assert!(read.is_ok());
        assert!(buf.is_empty());
    }
}
