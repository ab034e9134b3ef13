//! Local control socket.
//!
//! A WebSocket endpoint on the loopback interface for the operator UI. Each
//! connection becomes a hub observer with a bounded outbound queue; commands
//! read from the socket go to the hub. A client that falls behind is evicted
//! by the hub, which closes its queue and with it the socket.

use crate::actors::{HubActorHandle, Observer};
use crate::config::Config;
use crate::wire::LocalCommand;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use common::types::ObserverId;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Outbound frames buffered per local client before it is evicted.
pub const OBSERVER_QUEUE: usize = 64;

#[derive(Clone)]
pub struct LocalState {
    hub: HubActorHandle,
    config: Arc<Config>,
}

impl LocalState {
    pub fn new(hub: HubActorHandle, config: Arc<Config>) -> Self {
        Self { hub, config }
    }
}

/// Router serving the socket at `/local`.
pub fn local_router(state: LocalState) -> Router {
    Router::new()
        .route("/local", get(upgrade_handler))
        .with_state(state)
}

/// Browsers must come from a local page or from the control server itself.
/// Clients that send no `Origin` are not browsers and are accepted.
pub fn origin_allowed(origin: Option<&str>, server_host: &str) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    if origin == "null" || origin.starts_with("file://") {
        return true;
    }

    let host = origin
        .split_once("://")
        .map_or(origin, |(_, rest)| rest)
        .trim_end_matches('/');
    let hostname = host
        .rsplit_once(':')
        .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
        .map_or(host, |(name, _)| name);

    matches!(hostname, "localhost" | "127.0.0.1" | "[::1]") || host == server_host
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<LocalState>,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());

    if !origin_allowed(origin, state.config.server_host()) {
        warn!(target: "gw.local", origin = ?origin, "Rejected local socket from foreign origin");
        return StatusCode::FORBIDDEN.into_response();
    }

    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

#[instrument(skip_all, name = "gw.local", fields(observer_id))]
async fn serve_socket(socket: WebSocket, state: LocalState) {
    let observer_id = ObserverId::new();
    tracing::Span::current().record("observer_id", tracing::field::display(observer_id));

    let (sender, receiver) = mpsc::channel(OBSERVER_QUEUE);
    let observer = Observer {
        id: observer_id,
        sender,
    };
    if let Err(e) = state.hub.add_observer(observer).await {
        warn!(target: "gw.local", error = %e, "Hub gone, dropping local client");
        return;
    }
    info!(target: "gw.local", observer_id = %observer_id, "Local client connected");

    let (ws_write, mut ws_read) = socket.split();
    let quit = CancellationToken::new();
    let writer = tokio::spawn(run_writer(
        ws_write,
        receiver,
        quit.clone(),
        state.config.ping_period,
    ));

    loop {
        let message = tokio::select! {
            () = quit.cancelled() => break,
            message = ws_read.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => match LocalCommand::parse(&text) {
                Ok(command) => {
                    if state.hub.local_command(observer_id, command).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(target: "gw.local", error = %e, "Bad local command, closing");
                    break;
                }
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                debug!(target: "gw.local", error = %e, "Local socket failed");
                break;
            }
            Some(Ok(_)) => {}
        }
    }

    if let Err(e) = state.hub.remove_observer(observer_id).await {
        debug!(target: "gw.local", error = %e, "Hub gone");
    }
    quit.cancel();
    let _ = writer.await;
    info!(target: "gw.local", observer_id = %observer_id, "Local client disconnected");
}

/// Drain the observer queue into the socket until the hub drops the queue,
/// a write fails, or the reader quits.
async fn run_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    quit: CancellationToken,
    ping_period: Duration,
) {
    let mut ping = interval_at(Instant::now() + ping_period, ping_period);

    loop {
        tokio::select! {
            () = quit.cancelled() => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
    quit.cancel();
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_absent_is_allowed() {
        assert!(origin_allowed(None, "server.example:8443"));
    }

    #[test]
    fn test_local_origins_are_allowed() {
        for origin in [
            "file://",
            "null",
            "http://localhost",
            "http://localhost:3000",
            "http://127.0.0.1:12301",
            "http://[::1]:8080",
        ] {
            assert!(origin_allowed(Some(origin), "server.example"), "{origin}");
        }
    }

    #[test]
    fn test_server_origin_is_allowed() {
        assert!(origin_allowed(
            Some("https://server.example:8443"),
            "server.example:8443"
        ));
    }

    #[test]
    fn test_foreign_origin_is_rejected() {
        assert!(!origin_allowed(Some("https://evil.example"), "server.example"));
        assert!(!origin_allowed(
            Some("http://localhost.evil.example"),
            "server.example"
        ));
    }
}
