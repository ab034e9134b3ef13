//! WebSocket dialer built on tokio-tungstenite.

use super::{Connection, Dialer, Link, LINK_RECV_BUFFER, LINK_SEND_BUFFER};
use crate::errors::GatewayError;
use async_trait::async_trait;
use common::types::LinkId;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Dials `ws://` / `wss://` URLs and runs a reader and a writer task per
/// socket. The writer pings every `ping_period`.
#[derive(Debug, Clone)]
pub struct WsDialer {
    ping_period: Duration,
}

impl WsDialer {
    pub fn new(ping_period: Duration) -> Self {
        Self { ping_period }
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, url: &str) -> Result<Connection, GatewayError> {
        let (ws_stream, _) =
            tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|_| GatewayError::Transport(format!("connect to {url} timed out")))?
                .map_err(|e| GatewayError::Transport(format!("connect to {url}: {e}")))?;

        let (ws_write, ws_read) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(LINK_SEND_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel(LINK_RECV_BUFFER);
        let quit = CancellationToken::new();
        let link = Link::new(outbound_tx, quit.clone());

        debug!(target: "gw.transport", link_id = %link.id(), url, "Link established");

        tokio::spawn(run_writer(
            link.id(),
            ws_write,
            outbound_rx,
            quit.clone(),
            self.ping_period,
        ));
        tokio::spawn(run_reader(link.id(), ws_read, inbound_tx, quit));

        Ok(Connection {
            link,
            inbound: inbound_rx,
        })
    }
}

/// Drain the outbound queue into the socket, pinging periodically. Any write
/// failure or the quit signal closes the socket.
async fn run_writer<S>(
    link_id: LinkId,
    mut sink: S,
    mut outbound: mpsc::Receiver<String>,
    quit: CancellationToken,
    ping_period: Duration,
) where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let mut ping = interval_at(Instant::now() + ping_period, ping_period);

    loop {
        tokio::select! {
            () = quit.cancelled() => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(Message::Text(frame.into())).await {
                    warn!(target: "gw.transport", %link_id, error = %e, "Write failed");
                    break;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                    warn!(target: "gw.transport", %link_id, error = %e, "Ping failed");
                    break;
                }
            }
        }
    }

    // Frames queued before the quit signal still go out
    while let Ok(frame) = outbound.try_recv() {
        if sink.send(Message::Text(frame.into())).await.is_err() {
            break;
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
    quit.cancel();
    debug!(target: "gw.transport", %link_id, "Writer stopped");
}

/// Forward text frames (one per line) to the inbound queue until the socket
/// closes, fails, or the quit signal fires.
async fn run_reader<S>(
    link_id: LinkId,
    mut stream: S,
    inbound: mpsc::Sender<Result<String, GatewayError>>,
    quit: CancellationToken,
) where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let message = tokio::select! {
            () = quit.cancelled() => break,
            message = stream.next() => message,
        };

        let text = match message {
            Some(Ok(Message::Text(text))) => text.as_str().to_string(),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    let _ = inbound
                        .send(Err(GatewayError::Protocol("binary frame is not UTF-8".to_string())))
                        .await;
                    break;
                }
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                let _ = inbound
                    .send(Err(GatewayError::Transport(e.to_string())))
                    .await;
                break;
            }
        };

        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            if inbound.send(Ok(line.to_string())).await.is_err() {
                quit.cancel();
                return;
            }
        }
    }

    quit.cancel();
    debug!(target: "gw.transport", %link_id, "Reader stopped");
}
