// WebSocket server and main event loop for the lobby relay.
//
// Architecture: one owner task with a central `mpsc` channel.
//
// - **axum server** (`axum::serve`): accepts HTTP on one port. A middleware
//   in front of the router upgrades any request carrying a WebSocket
//   handshake, whatever its path; everything else falls through to the
//   status routes in `status.rs`.
// - **Connection tasks** (one per socket): the socket is split into a
//   reader and a writer. The reader forwards every data frame as
//   `RelayEvent::Frame`. The writer drains the connection's `Outbox`
//   receiver, turning `Outbound::Close` into a close frame. When either side
//   ends the task sends `RelayEvent::Closed`.
// - **Relay task**: owns the `Relay`, receives events from the channel and
//   ticks on a `tokio::time::interval`, all inside one `select!`. This is
//   the only code that touches sessions or lobbies, so events and ticks
//   never interleave.
//
// Status queries go through the same channel with a `oneshot` reply, so the
// HTTP handlers never see relay state directly.
//
// Shutdown: `RelayHandle::stop` cancels a `CancellationToken`. The relay task
// exits its loop and drops every session, which closes each outbox and ends
// the writer tasks; the HTTP server stops accepting.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, trace, warn};

use crate::relay::{Inbound, LivenessConfig, LobbyListing, Relay, RelayStats, SessionListing, now_ms};
use crate::session::{ConnId, Outbound, Outbox};
use crate::status;

/// How long a connection task waits for the client's close reply after the
/// relay asked to close.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Events sent from connection tasks and HTTP handlers to the relay task.
pub(crate) enum RelayEvent {
    Opened {
        conn: ConnId,
        outbox: Outbox,
    },
    Frame {
        conn: ConnId,
        frame: Inbound,
    },
    Closed {
        conn: ConnId,
    },
    Stats {
        reply: oneshot::Sender<RelayStats>,
    },
    Lobbies {
        reply: oneshot::Sender<Vec<LobbyListing>>,
    },
    Sessions {
        reply: oneshot::Sender<Vec<SessionListing>>,
    },
}

/// Handle returned by `start_relay` to control the running server.
pub struct RelayHandle {
    cancel: CancellationToken,
    relay: JoinHandle<()>,
    server: JoinHandle<()>,
}

impl RelayHandle {
    /// Signal the relay to stop and wait for it to shut down.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.relay.await;
        self.server.abort();
        let _ = self.server.await;
    }
}

/// Configuration for starting a relay server.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub bind: IpAddr,
    /// Listen port. 0 lets the OS pick one.
    pub port: u16,
    /// Period of the liveness + snapshot tick.
    pub tick_interval_ms: u64,
    /// Largest inbound WebSocket message accepted.
    pub max_frame_bytes: usize,
    pub liveness: LivenessConfig,
    /// Serve `/lobbies` and `/sessions`.
    pub debug_endpoints: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 6969,
            tick_interval_ms: 500,
            max_frame_bytes: 64,
            liveness: LivenessConfig::default(),
            debug_endpoints: false,
        }
    }
}

/// Shared state passed to axum handlers.
#[derive(Clone)]
pub(crate) struct AppState {
    events: mpsc::UnboundedSender<RelayEvent>,
    next_conn: Arc<AtomicU64>,
    max_frame_bytes: usize,
    pub(crate) debug_endpoints: bool,
}

impl AppState {
    fn next_conn(&self) -> ConnId {
        ConnId(self.next_conn.fetch_add(1, Ordering::Relaxed))
    }

    /// Ask the relay task a question. `None` if it has shut down.
    pub(crate) async fn query<T>(
        &self,
        event: impl FnOnce(oneshot::Sender<T>) -> RelayEvent,
    ) -> Option<T> {
        let (reply, answer) = oneshot::channel();
        self.events.send(event(reply)).ok()?;
        answer.await.ok()
    }
}

/// Bind the listener and start the relay and HTTP tasks. Returns a handle for
/// stopping them and the actual bound address (useful when port 0 is used).
pub async fn start_relay(config: RelayConfig) -> io::Result<(RelayHandle, SocketAddr)> {
    let listener = tokio::net::TcpListener::bind(SocketAddr::new(config.bind, config.port)).await?;
    let addr = listener.local_addr()?;

    let cancel = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let tick = Duration::from_millis(config.tick_interval_ms.max(1));
    let relay = tokio::spawn(run_relay(events_rx, tick, config.liveness, cancel.clone()));

    let router = build_router(AppState {
        events: events_tx,
        next_conn: Arc::new(AtomicU64::new(1)),
        max_frame_bytes: config.max_frame_bytes,
        debug_endpoints: config.debug_endpoints,
    });
    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        let shutdown = async move { server_cancel.cancelled().await };
        if let Err(err) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            warn!(error = %err, "http server stopped with error");
        }
    });

    info!(
        %addr,
        tick_ms = tick.as_millis() as u64,
        max_frame_bytes = config.max_frame_bytes,
        debug_endpoints = config.debug_endpoints,
        "relay listening"
    );

    Ok((
        RelayHandle {
            cancel,
            relay,
            server,
        },
        addr,
    ))
}

/// Build the axum router: WebSocket upgrade on any path, status routes
/// otherwise.
pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/count", get(status::count))
        .route("/lobbies", get(status::lobbies))
        .route("/sessions", get(status::sessions))
        .fallback(status::fallback)
        .layer(middleware::from_fn_with_state(state.clone(), accept_upgrade))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Main relay loop. Runs until the token is cancelled.
async fn run_relay(
    mut events: mpsc::UnboundedReceiver<RelayEvent>,
    tick: Duration,
    liveness: LivenessConfig,
    cancel: CancellationToken,
) {
    let mut relay = Relay::new(liveness);
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => handle_event(&mut relay, event),
                None => break,
            },
            _ = ticker.tick() => relay.tick(now_ms()),
        }
    }

    let stats = relay.stats();
    info!(sockets = stats.sockets, lobbies = stats.lobbies, "relay stopped");
}

/// Dispatch a single event to the relay.
fn handle_event(relay: &mut Relay, event: RelayEvent) {
    match event {
        RelayEvent::Opened { conn, outbox } => relay.open(conn, outbox, now_ms()),
        RelayEvent::Frame { conn, frame } => relay.handle_frame(conn, frame, now_ms()),
        RelayEvent::Closed { conn } => relay.close(conn),
        RelayEvent::Stats { reply } => {
            let _ = reply.send(relay.stats());
        }
        RelayEvent::Lobbies { reply } => {
            let _ = reply.send(relay.lobby_listing(now_ms()));
        }
        RelayEvent::Sessions { reply } => {
            let _ = reply.send(relay.session_listing(now_ms()));
        }
    }
}

/// Upgrade WebSocket handshakes on any path; pass everything else through.
async fn accept_upgrade(
    State(state): State<AppState>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    request: Request,
    next: Next,
) -> Response {
    match upgrade {
        Ok(ws) => {
            let conn = state.next_conn();
            ws.max_message_size(state.max_frame_bytes)
                .on_upgrade(move |socket| handle_socket(socket, conn, state))
        }
        Err(_) => next.run(request).await,
    }
}

/// Drive one WebSocket connection until either side ends it.
async fn handle_socket(socket: WebSocket, conn: ConnId, state: AppState) {
    let (outbox, mut outbound) = Outbox::channel();
    if state.events.send(RelayEvent::Opened { conn, outbox }).is_err() {
        return;
    }
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: drain the outbox into the socket.
    let mut writer = tokio::spawn(async move {
        while let Some(item) = outbound.recv().await {
            match item {
                Outbound::Frame(bytes) => {
                    if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(reason) => {
                    let frame = CloseFrame {
                        code: reason.code(),
                        reason: Utf8Bytes::from_static(reason.message()),
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    // Reader task: forward data frames to the relay.
    let events = state.events.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            let frame = match msg {
                Message::Binary(bytes) => Inbound::Binary(bytes),
                Message::Text(_) => Inbound::Text,
                Message::Close(_) => break,
                // Control frames are answered by the socket and are not activity.
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if events.send(RelayEvent::Frame { conn, frame }).is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut writer => {
            // Relay-initiated close: give the client a moment to answer.
            if tokio::time::timeout(CLOSE_GRACE, &mut reader).await.is_err() {
                trace!(%conn, "no close reply from client");
                reader.abort();
            }
        }
        _ = &mut reader => writer.abort(),
    }

    debug!(%conn, "connection task finished");
    let _ = state.events.send(RelayEvent::Closed { conn });
}
