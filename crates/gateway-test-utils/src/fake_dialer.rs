//! In-process [`Dialer`] standing in for the control server.
//!
//! Every successful dial hands the test a [`FakeSocket`]: the server end of
//! the link. Frames the gateway writes arrive on it; frames the test pushes
//! into it are read by the gateway.

use async_trait::async_trait;
use gateway_service::errors::GatewayError;
use gateway_service::transport::{Connection, Dialer, Link};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long [`FakeSocket::recv_frame`] and [`FakeDialer::next_socket`] wait.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// The server end of one dialed link.
pub struct FakeSocket {
    pub url: String,
    from_gateway: mpsc::Receiver<String>,
    to_gateway: Option<mpsc::Sender<Result<String, GatewayError>>>,
    quit: CancellationToken,
}

impl FakeSocket {
    /// Deliver a text frame to the gateway.
    pub async fn send_frame(&self, frame: &str) {
        if let Some(tx) = &self.to_gateway {
            tx.send(Ok(frame.to_string())).await.unwrap();
        }
    }

    /// Deliver a socket failure to the gateway.
    pub async fn fail(&self, message: &str) {
        if let Some(tx) = &self.to_gateway {
            tx.send(Err(GatewayError::Transport(message.to_string())))
                .await
                .unwrap();
        }
    }

    /// Next frame written by the gateway, or `None` after a timeout.
    pub async fn recv_frame(&mut self) -> Option<String> {
        tokio::time::timeout(RECV_TIMEOUT, self.from_gateway.recv())
            .await
            .ok()
            .flatten()
    }

    /// Skip frames until one satisfies `predicate`.
    pub async fn recv_until(&mut self, predicate: impl Fn(&str) -> bool) -> Option<String> {
        loop {
            let frame = self.recv_frame().await?;
            if predicate(&frame) {
                return Some(frame);
            }
        }
    }

    /// Frames already written by the gateway, without waiting.
    pub fn drain(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_gateway.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Close the server side: the gateway's reader ends.
    pub fn hang_up(&mut self) {
        self.to_gateway = None;
    }

    /// True once the gateway closed the link.
    pub fn is_closed_by_gateway(&self) -> bool {
        self.quit.is_cancelled()
    }

    /// Wait until the gateway closes the link.
    pub async fn closed_by_gateway(&self) -> bool {
        tokio::time::timeout(RECV_TIMEOUT, self.quit.cancelled())
            .await
            .is_ok()
    }
}

/// Dialer that connects to in-process [`FakeSocket`]s.
pub struct FakeDialer {
    refuse: AtomicBool,
    attempts: AtomicUsize,
    urls: Mutex<Vec<String>>,
    sockets_tx: mpsc::UnboundedSender<FakeSocket>,
    sockets_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakeSocket>>,
}

impl Default for FakeDialer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDialer {
    #[must_use]
    pub fn new() -> Self {
        let (sockets_tx, sockets_rx) = mpsc::unbounded_channel();
        Self {
            refuse: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
            sockets_tx,
            sockets_rx: tokio::sync::Mutex::new(sockets_rx),
        }
    }

    /// Make every dial fail as if the server were unreachable.
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    /// The server end of the next successful dial.
    pub async fn next_socket(&self) -> Option<FakeSocket> {
        let mut rx = self.sockets_rx.lock().await;
        tokio::time::timeout(RECV_TIMEOUT, rx.recv())
            .await
            .ok()
            .flatten()
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(&self, url: &str) -> Result<Connection, GatewayError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());

        if self.refuse.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport(format!("connect to {url}: refused")));
        }

        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        let quit = CancellationToken::new();

        let socket = FakeSocket {
            url: url.to_string(),
            from_gateway: out_rx,
            to_gateway: Some(in_tx),
            quit: quit.clone(),
        };
        self.sockets_tx
            .send(socket)
            .map_err(|_| GatewayError::Transport("test dropped the dialer".to_string()))?;

        Ok(Connection {
            link: Link::new(out_tx, quit),
            inbound: in_rx,
        })
    }
}
