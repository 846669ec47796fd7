use std::{borrow::Cow, collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{net::TcpListener, signal, time::timeout};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ServerConfig;
use crate::connection::{Delivery, Disconnect, Outbound};
use crate::handle::{spawn_engine, PeerLink, PierHandle};
use crate::namespace::{Identity, Namespace};

/// Upper bound on writing a close frame to a peer that may have stopped
/// reading.
const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct AppState {
    pier: PierHandle,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(pier: PierHandle, metrics: Option<PrometheusHandle>) -> Self {
        Self { pier, metrics }
    }
}

/// Query string of an upgrade request. `role` and `id` are optional and
/// taken as-is; repeated or unknown keys never reject the upgrade.
pub type PeerQuery = HashMap<String, String>;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/debug/stats", get(stats_handler))
        .route(Namespace::Control.path(), get(control_handler))
        .route(Namespace::Signal.path(), get(signal_handler))
        .with_state(state)
}

/// Bind, serve until Ctrl-C, then wait out the grace period.
pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("beach-pier listening on {}", config.listen_addr);

    let (pier, engine_task) = spawn_engine(config.heartbeat_interval);
    let app = router(Arc::new(AppState::new(pier, metrics)));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    engine_task.abort();
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain")], "OK")
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.pier.snapshot().await {
        Ok(rooms) => Json(rooms).into_response(),
        Err(err) => {
            warn!(error = %err, "stats requested while engine is down");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn control_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PeerQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade(Namespace::Control, state, query, ws)
}

async fn signal_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PeerQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade(Namespace::Signal, state, query, ws)
}

fn upgrade(
    namespace: Namespace,
    state: Arc<AppState>,
    query: PeerQuery,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    let identity = Identity::from_request(
        namespace,
        query.get("role").map(String::as_str),
        query.get("id").map(String::as_str),
    );
    let pier = state.pier.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, pier, identity))
}

async fn handle_socket(socket: WebSocket, pier: PierHandle, identity: Identity) {
    let link = match pier.admit(identity) {
        Ok(link) => link,
        Err(err) => {
            warn!(error = %err, "dropping connection: engine unavailable");
            return;
        }
    };
    let span = info_span!(
        "peer",
        namespace = %link.identity().namespace,
        role = link.identity().role.as_str(),
        room_id = %link.identity().room_id,
        connection_id = %link.id(),
    );

    async move {
        drive(socket, link).await;
        debug!("socket task finished");
    }
    .instrument(span)
    .await;
}

/// Pump frames between the socket and the engine until either side ends
/// the connection. Returning drops the link, which reports the close.
async fn drive(socket: WebSocket, mut link: PeerLink) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let disconnect = loop {
        tokio::select! {
            inbound = ws_rx.next() => {
                let submitted = match inbound {
                    Some(Ok(Message::Text(text))) => link.inbound(text),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => link.inbound(text),
                        Err(_) => {
                            debug!("dropping non-UTF-8 binary frame");
                            Ok(())
                        }
                    },
                    Some(Ok(Message::Pong(_))) => link.probe_ack(),
                    Some(Ok(Message::Ping(_))) => Ok(()),
                    Some(Ok(Message::Close(frame))) => {
                        debug!(
                            reason = ?frame.map(|f| f.reason.to_string()),
                            "peer closed websocket"
                        );
                        break None;
                    }
                    Some(Err(err)) => {
                        debug!(error = %err, "websocket receive failed");
                        break None;
                    }
                    None => break None,
                };
                if submitted.is_err() {
                    break None;
                }
            }
            delivery = link.next_delivery() => {
                let frame = match delivery {
                    Delivery::Frame(Outbound::Text(text)) => Message::Text(text),
                    Delivery::Frame(Outbound::Ping) => Message::Ping(Vec::new()),
                    Delivery::Disconnect(disconnect) => break Some(disconnect),
                };
                // A peer that stops reading blocks the write; the engine can
                // still end the connection underneath it.
                tokio::select! {
                    biased;
                    disconnect = link.disconnected() => break Some(disconnect),
                    sent = ws_tx.send(frame) => {
                        if sent.is_err() {
                            break None;
                        }
                    }
                }
            }
        }
    };

    match disconnect {
        Some(Disconnect::Close { code, reason }) => {
            let frame = Message::Close(Some(CloseFrame {
                code,
                reason: Cow::Borrowed(reason),
            }));
            if timeout(CLOSE_WRITE_TIMEOUT, ws_tx.send(frame)).await.is_err() {
                debug!(code, "close frame not written before timeout");
            }
        }
        Some(Disconnect::Terminate) => debug!("connection terminated by relay"),
        None => {}
    }
}
