//! Connection acceptance and socket plumbing.
//!
//! `/ws` is the rover endpoint: every upgraded socket gets its own task that
//! feeds frames to a `Session` and enforces the connect and idle deadlines.
//! `/ws/dashboard` forwards registry change events to dashboards.

use crate::codec;
use crate::config::SessionConfig;
use crate::metrics::{self, ACTIVE_SESSIONS};
use crate::registry::SharedRegistry;
use crate::rest;
use crate::session::Session;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Clone)]
pub struct HubState {
    pub registry: SharedRegistry,
    pub session: Arc<SessionConfig>,
    pub shutdown: CancellationToken,
}

impl HubState {
    pub fn new(registry: SharedRegistry, session: SessionConfig, shutdown: CancellationToken) -> Self {
        Self {
            registry,
            session: Arc::new(session),
            shutdown,
        }
    }
}

/// Full HTTP surface: rover and dashboard sockets, REST read API, health and metrics
pub fn build_app(state: HubState) -> Router {
    let registry = state.registry.clone();

    Router::new()
        .route("/ws", get(rover_ws))
        .route("/ws/dashboard", get(dashboard_ws))
        .with_state(state)
        .route("/health", get(|| async { "ok" }))
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(registry))
}

/// Serves `app` until `shutdown` fires
pub async fn serve(
    listener: tokio::net::TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

async fn rover_ws(
    ws: WebSocketUpgrade,
    peer: Option<ConnectInfo<SocketAddr>>,
    State(state): State<HubState>,
) -> Response {
    let peer = peer.map(|ConnectInfo(addr)| addr);
    debug!("Rover connection from {:?}", peer);
    ws.on_upgrade(move |socket| handle_rover(socket, peer, state))
}

async fn handle_rover(socket: WebSocket, peer: Option<SocketAddr>, state: HubState) {
    let session = Session::new(
        state.registry.clone(),
        state.session.as_ref().clone(),
        peer.map(|addr| addr.ip().to_string()),
    );
    let span = info_span!(
        "session",
        id = %session.id(),
        peer = %peer.map(|a| a.to_string()).unwrap_or_default()
    );

    ACTIVE_SESSIONS.inc();
    run_session(socket, session, state).instrument(span).await;
    ACTIVE_SESSIONS.dec();
}

async fn run_session(mut socket: WebSocket, mut session: Session, state: HubState) {
    info!("Rover socket opened");
    let config = state.session.clone();

    let connect_deadline = Instant::now() + config.connect_timeout;
    let mut last_frame = Instant::now();
    let mut ping = time::interval_at(Instant::now() + config.ping_interval, config.ping_interval);

    loop {
        let deadline = if session.is_bound() {
            last_frame + config.idle_timeout
        } else {
            connect_deadline
        };

        let raw = tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            _ = time::sleep_until(deadline) => {
                if session.is_bound() {
                    info!("Rover {:?} idle for {:?}, closing", session.rover_id(), config.idle_timeout);
                } else {
                    warn!("No CONNECT within {:?}, closing", config.connect_timeout);
                }
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            _ = ping.tick() => {
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                continue;
            }
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Binary(data))) => data,
                // Control frames keep the socket open but do not count as traffic
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => {
                    info!("Rover closed the connection");
                    break;
                }
                Some(Err(e)) => {
                    warn!("Socket error: {}", e);
                    break;
                }
            },
        };

        last_frame = Instant::now();
        if let Some(reply) = session.handle_frame(&raw).await {
            if socket.send(Message::Text(codec::encode_text(&reply))).await.is_err() {
                info!("Rover disconnected before reply was sent");
                break;
            }
        }
    }

    session.close();
}

async fn dashboard_ws(ws: WebSocketUpgrade, State(state): State<HubState>) -> Response {
    ws.on_upgrade(move |socket| handle_dashboard(socket, state))
}

async fn handle_dashboard(mut socket: WebSocket, state: HubState) {
    info!("Dashboard subscribed");
    let mut events = state.registry.subscribe();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to serialize rover event: {}", e);
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Missed events are picked up by the next REST poll
                    warn!("Dashboard lagged {} events, skipping ahead", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    info!("Dashboard unsubscribed");
}
