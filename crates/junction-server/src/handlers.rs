//! Connection handlers for Junction server.
//!
//! This module wires the transports to the router: the axum WebSocket
//! endpoint, the optional raw socket listener and the health check.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use junction_core::{ChannelPeer, Peer, PeerIo, Router as JunctionRouter, RouterError, DEFAULT_PEER_CAPACITY};
use junction_protocol::{codec, Message, Serialization};
use junction_transport::{telemetry, RawSocketTransport, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Subprotocols offered on the WebSocket endpoint, in preference order.
const SUBPROTOCOLS: [&str; 2] = ["wamp.2.json", "wamp.2.msgpack"];

const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Shared server state.
pub struct AppState {
    /// The WAMP router.
    pub router: Arc<JunctionRouter>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state with every configured realm registered.
    ///
    /// # Errors
    ///
    /// Returns an error if a realm cannot be registered.
    pub fn new(config: Config) -> Result<Self> {
        let router = JunctionRouter::with_config(config.router_config());
        for realm in &config.realms {
            router
                .register_realm(realm.build())
                .with_context(|| format!("Failed to register realm {}", realm.uri))?;
            info!(realm = %realm.uri, tickets = !realm.tickets.is_empty(), "Realm registered");
        }

        Ok(Self {
            router: Arc::new(router),
            config,
        })
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    config.validate()?;
    let state = Arc::new(AppState::new(config.clone())?);

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
        tokio::spawn(report_stats(state.router.clone()));
    }

    if config.transport.rawsocket {
        let transport = RawSocketTransport::new(config.rawsocket_config()?).await?;
        tokio::spawn(accept_loop(transport, state.router.clone()));
    }

    // Build router
    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state.clone());

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Junction server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.router.clone()))
        .await?;

    Ok(())
}

/// Wait for Ctrl-C, then say goodbye to every session.
async fn shutdown_signal(router: Arc<JunctionRouter>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }

    info!("Shutdown requested");
    router.close();
}

/// Keep the session and realm gauges current.
async fn report_stats(router: Arc<JunctionRouter>) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    loop {
        interval.tick().await;
        metrics::set_router_stats(router.stats());
    }
}

/// Accept connections from a transport until it fails.
async fn accept_loop<T: Transport + 'static>(transport: T, router: Arc<JunctionRouter>) {
    let name = transport.name();
    if let Some(addr) = transport.local_addr() {
        info!("{} endpoint: tcp://{}", name, addr);
    }

    loop {
        match transport.accept().await {
            Ok(peer) => {
                tokio::spawn(serve_peer(router.clone(), peer, name));
            }
            Err(e) => {
                // A failed handshake only loses that connection
                debug!(transport = name, error = %e, "Connection rejected");
                metrics::record_handshake_failure("transport");
            }
        }
    }
}

/// Hand a peer to the router and track the connection until it ends.
async fn serve_peer(router: Arc<JunctionRouter>, peer: Box<dyn Peer>, transport: &'static str) {
    let guard = ConnectionMetricsGuard::new(transport);
    let sender = peer.sender();
    let remote = peer.remote_addr();

    match router.accept(peer).await {
        Ok(session) => debug!(session, transport, remote = ?remote, "Session welcomed"),
        Err(e) => {
            debug!(transport, remote = ?remote, error = %e, "Handshake failed");
            metrics::record_handshake_failure(failure_reason(&e));
        }
    }

    // The transport drops its outbound queue once the connection is gone
    sender.closed().await;
    drop(guard);
}

fn failure_reason(err: &RouterError) -> &'static str {
    match err {
        RouterError::Closing => "closing",
        RouterError::Timeout(_) => "timeout",
        RouterError::HandshakeClosed => "disconnected",
        RouterError::UnexpectedMessage { .. } => "unexpected_message",
        RouterError::NoSuchRealm(_) => "no_such_realm",
        RouterError::Authentication(_) => "authentication",
        _ => "other",
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.router.stats();
    axum::Json(serde_json::json!({
        "status": if state.router.is_closing() { "closing" } else { "ok" },
        "version": env!("CARGO_PKG_VERSION"),
        "realms": stats.realm_count,
        "sessions": stats.session_count,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.protocols(SUBPROTOCOLS)
        .max_message_size(state.config.transport.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let serialization = socket
        .protocol()
        .and_then(|protocol| protocol.to_str().ok())
        .and_then(Serialization::from_subprotocol)
        .unwrap_or_default();

    debug!(protocol = serialization.subprotocol(), "WebSocket connected");

    let (peer, io) = ChannelPeer::new(DEFAULT_PEER_CAPACITY);
    pump_websocket(socket, serialization, io);
    serve_peer(state.router.clone(), Box::new(peer), "websocket").await;

    debug!("WebSocket disconnected");
}

fn to_ws_message(message: &Message, serialization: Serialization) -> Result<WsMessage> {
    let payload = codec::encode(message, serialization)?;
    Ok(match serialization {
        Serialization::Json => WsMessage::Text(String::from_utf8(payload.to_vec())?),
        Serialization::MsgPack => WsMessage::Binary(payload.to_vec()),
    })
}

/// Move messages between an axum WebSocket and a peer's queues.
fn pump_websocket(socket: WebSocket, serialization: Serialization, io: PeerIo) {
    let PeerIo {
        mut outgoing,
        incoming,
        mut shutdown,
    } = io;
    let mut read_shutdown = shutdown.clone();
    let (mut sender, mut receiver) = socket.split();
    let (pong_tx, mut pong_rx) = mpsc::channel::<Vec<u8>>(8);

    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                msg = receiver.next() => msg,
                _ = read_shutdown.changed() => break,
            };

            let decoded = match msg {
                Some(Ok(WsMessage::Text(text))) => codec::decode(text.as_bytes(), Serialization::Json),
                Some(Ok(WsMessage::Binary(data))) => codec::decode(&data, Serialization::MsgPack),
                Some(Ok(WsMessage::Ping(data))) => {
                    let _ = pong_tx.send(data).await;
                    continue;
                }
                Some(Ok(WsMessage::Pong(_))) => continue,
                Some(Ok(WsMessage::Close(_))) => {
                    debug!("Received close frame");
                    break;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    break;
                }
                None => {
                    debug!("WebSocket stream ended");
                    break;
                }
            };

            match decoded {
                Ok(message) => {
                    telemetry::record_inbound("websocket");
                    if incoming.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    telemetry::record_decode_error("websocket");
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
                    Some(message) => match to_ws_message(&message, serialization) {
                        Ok(frame) => {
                            telemetry::record_outbound("websocket");
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

            if sender.send(frame).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });
}
