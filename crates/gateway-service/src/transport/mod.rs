//! Outbound socket plumbing shared by the control link and signaling.
//!
//! A dialed socket is split into a [`Link`] (the write side: a bounded
//! outbound queue drained by a writer task, plus a quit signal) and an
//! [`Inbound`] receiver fed by a reader task.

mod ws;

pub use ws::WsDialer;

use crate::errors::GatewayError;
use async_trait::async_trait;
use common::types::LinkId;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Outbound queue size per link.
pub const LINK_SEND_BUFFER: usize = 64;

/// Inbound queue size per link.
pub const LINK_RECV_BUFFER: usize = 64;

/// How long [`Link::send_wait`] waits for queue space before giving up on
/// the link.
pub const LINK_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames read from a link. `Err` is delivered once before the stream ends
/// when the socket failed rather than closed cleanly.
pub type Inbound = mpsc::Receiver<Result<String, GatewayError>>;

/// Write side of a dialed socket. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Link {
    id: LinkId,
    outbound: mpsc::Sender<String>,
    quit: CancellationToken,
}

impl Link {
    pub fn new(outbound: mpsc::Sender<String>, quit: CancellationToken) -> Self {
        Self {
            id: LinkId::new(),
            outbound,
            quit,
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Queue a frame without waiting. A link whose queue is full is treated
    /// as dead: it is closed and the frame is dropped.
    pub fn send(&self, frame: String) -> Result<(), GatewayError> {
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(target: "gw.transport", link_id = %self.id, "Outbound queue full, closing link");
                self.close();
                Err(GatewayError::Transport("outbound queue full".to_string()))
            }
            Err(TrySendError::Closed(_)) => {
                Err(GatewayError::Transport("link closed".to_string()))
            }
        }
    }

    /// Queue a frame, waiting for space while the writer drains. A link that
    /// stays full for [`LINK_SEND_TIMEOUT`] is closed.
    pub async fn send_wait(&self, frame: String) -> Result<(), GatewayError> {
        if self.quit.is_cancelled() {
            return Err(GatewayError::Transport("link closed".to_string()));
        }
        let sent = tokio::select! {
            () = self.quit.cancelled() => {
                return Err(GatewayError::Transport("link closed".to_string()));
            }
            sent = tokio::time::timeout(LINK_SEND_TIMEOUT, self.outbound.send(frame)) => sent,
        };
        match sent {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(GatewayError::Transport("link closed".to_string())),
            Err(_) => {
                warn!(target: "gw.transport", link_id = %self.id, "Outbound queue stalled, closing link");
                self.close();
                Err(GatewayError::Transport("outbound queue stalled".to_string()))
            }
        }
    }

    /// Sender handed to the media engine so it can write signaling frames.
    pub fn outbound(&self) -> mpsc::Sender<String> {
        self.outbound.clone()
    }

    /// Fire the quit signal; the writer closes the socket.
    pub fn close(&self) {
        self.quit.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.quit.is_cancelled() || self.outbound.is_closed()
    }

    pub fn quit_token(&self) -> CancellationToken {
        self.quit.clone()
    }
}

/// A freshly dialed socket.
#[derive(Debug)]
pub struct Connection {
    pub link: Link,
    pub inbound: Inbound,
}

/// Dials outbound sockets.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, url: &str) -> Result<Connection, GatewayError>;
}
