//! Control-link manager.
//!
//! Keeps one authenticated control link to the server: dial, log in with the
//! room token, hand the link to the hub once the server accepts, then forward
//! every command until the socket ends. Any failure waits the fixed
//! reconnect delay (or a hub kick) and starts over. Only shutdown stops it.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Authenticating -> Ready
//!       ^             |                           |              |
//!       |         Unreachable                 AuthFailed         |
//!       +-------------+---------------------------+--------------+
//! ```

use crate::actors::HubActorHandle;
use crate::context::GatewayContext;
use crate::errors::GatewayError;
use crate::observability::metrics as prom;
use crate::storage::ROOM_TOKEN_KEY;
use crate::transport::{Connection, Inbound, Link};
use crate::wire::{self, ServerCommand, ServerCommandKind, Status};

use common::secret::{is_compact_token, ExposeSecret, SecretString};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Connection state of the control link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Ready,
    Unreachable,
    AuthFailed,
}

impl LinkState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Authenticating => "authenticating",
            LinkState::Ready => "ready",
            LinkState::Unreachable => "unreachable",
            LinkState::AuthFailed => "auth_failed",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The login credential: the stored room token, or the configured seed when
/// storage has none.
pub fn room_token(ctx: &GatewayContext) -> Result<Option<SecretString>, GatewayError> {
    match ctx.store.get_scalar(ROOM_TOKEN_KEY)? {
        Some(bytes) => String::from_utf8(bytes)
            .map(|token| Some(SecretString::from(token)))
            .map_err(|_| GatewayError::Protocol("stored room token is not UTF-8".to_string())),
        None => Ok(ctx.config.room_token.clone()),
    }
}

/// Owns the dial/login/read cycle of the control link.
pub struct ControlLinkManager {
    ctx: GatewayContext,
    hub: HubActorHandle,
    reconnect: Arc<Notify>,
    cancel_token: CancellationToken,
    state: LinkState,
}

impl ControlLinkManager {
    pub fn new(
        ctx: GatewayContext,
        hub: HubActorHandle,
        reconnect: Arc<Notify>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            hub,
            reconnect,
            cancel_token,
            state: LinkState::Disconnected,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    #[instrument(skip_all, name = "gw.control_link")]
    pub async fn run(mut self) {
        info!(
            target: "gw.control_link",
            url = %self.ctx.config.control_url(),
            "Control-link manager started"
        );

        loop {
            let outcome = self.attempt().await;
            if self.cancel_token.is_cancelled() {
                break;
            }
            self.transition(outcome);

            if !self.wait_before_retry().await {
                break;
            }
            self.transition(LinkState::Disconnected);
        }

        self.transition(LinkState::Disconnected);
        info!(target: "gw.control_link", "Control-link manager stopped");
    }

    fn transition(&mut self, next: LinkState) {
        if self.state != next {
            debug!(target: "gw.control_link", from = %self.state, to = %next, "Link state");
            self.state = next;
        }
    }

    async fn publish(&self, status: Status) {
        if let Err(e) = self.hub.change_status(Some(status)).await {
            debug!(target: "gw.control_link", error = %e, "Hub gone, status dropped");
        }
    }

    /// One dial/login/read cycle. Returns the state to rest in before the
    /// retry delay.
    async fn attempt(&mut self) -> LinkState {
        self.transition(LinkState::Connecting);
        self.publish(Status::Connecting).await;

        let url = self.ctx.config.control_url();
        let dialed = tokio::select! {
            () = self.cancel_token.cancelled() => return LinkState::Disconnected,
            dialed = self.ctx.dialer.dial(&url) => dialed,
        };

        let Connection { link, mut inbound } = match dialed {
            Ok(connection) => connection,
            Err(e) => {
                warn!(target: "gw.control_link", error = %e, "Control server unreachable");
                prom::record_control_link_attempt("unreachable");
                self.publish(Status::Unreachable).await;
                return LinkState::Unreachable;
            }
        };
        self.transition(LinkState::Connected);

        let token = match room_token(&self.ctx) {
            Ok(Some(token)) if is_compact_token(&token) => token,
            Ok(_) => {
                warn!(target: "gw.control_link", "Room token missing or malformed");
                return self.reject_locally(&link).await;
            }
            Err(e) => {
                warn!(target: "gw.control_link", error = %e, "Cannot read room token");
                return self.reject_locally(&link).await;
            }
        };

        if let Err(e) = link.send(wire::login_frame(token.expose_secret())) {
            warn!(target: "gw.control_link", error = %e, "Login send failed");
            link.close();
            prom::record_control_link_attempt("disconnected");
            self.publish(Status::Disconnected).await;
            return LinkState::Disconnected;
        }
        self.transition(LinkState::Authenticating);
        self.publish(Status::LoggingIn).await;

        let outcome = self.read_loop(&link, &mut inbound).await;

        link.close();
        if self.state == LinkState::Ready {
            if let Err(e) = self.hub.clear_control_link(link.id()).await {
                debug!(target: "gw.control_link", error = %e, "Hub gone");
            }
        }
        outcome
    }

    async fn reject_locally(&self, link: &Link) -> LinkState {
        link.close();
        prom::record_control_link_attempt("bad_room_token");
        self.publish(Status::BadRoomToken).await;
        LinkState::AuthFailed
    }

    async fn read_loop(&mut self, link: &Link, inbound: &mut Inbound) -> LinkState {
        loop {
            let frame = tokio::select! {
                () = self.cancel_token.cancelled() => return LinkState::Disconnected,
                frame = inbound.recv() => frame,
            };

            let text = match frame {
                Some(Ok(text)) => text,
                Some(Err(e)) => {
                    warn!(target: "gw.control_link", error = %e, "Control link failed");
                    self.publish(Status::Disconnected).await;
                    return LinkState::Disconnected;
                }
                None => {
                    info!(target: "gw.control_link", "Control link closed");
                    self.publish(Status::Disconnected).await;
                    return LinkState::Disconnected;
                }
            };

            let command = match ServerCommand::parse(&text) {
                Ok(command) => command,
                Err(e) => {
                    warn!(target: "gw.control_link", error = %e, "Bad server message");
                    prom::record_control_link_attempt("bad_server_msg");
                    self.publish(Status::BadServerMsg).await;
                    return LinkState::Disconnected;
                }
            };

            // A rejection ends the link in any state, including a re-login
            // after `SetRoomToken`.
            match command.kind() {
                ServerCommandKind::LoginFailed => {
                    warn!(target: "gw.control_link", reason = %command.name, "Login rejected");
                    prom::record_control_link_attempt("auth_failed");
                    let status = if command.name == "BadRoomToken" {
                        Status::BadRoomToken
                    } else {
                        Status::AuthFailed
                    };
                    self.publish(status).await;
                    return LinkState::AuthFailed;
                }
                _ if self.state == LinkState::Ready => {
                    if let Err(e) = self.hub.server_command(command).await {
                        debug!(target: "gw.control_link", error = %e, "Hub gone");
                        return LinkState::Disconnected;
                    }
                }
                ServerCommandKind::LoginOk => {
                    info!(target: "gw.control_link", "Logged in");
                    prom::record_control_link_attempt("ready");
                    self.transition(LinkState::Ready);
                    let handed_over = self.hub.set_control_link(link.clone()).await.is_ok()
                        && self.hub.change_status(Some(Status::Ready)).await.is_ok()
                        && self.hub.push_device_list().await.is_ok();
                    if !handed_over {
                        return LinkState::Disconnected;
                    }
                }
                _ => {
                    debug!(
                        target: "gw.control_link",
                        name = %command.name,
                        "Ignoring command before login completes"
                    );
                }
            }
        }
    }

    /// Sleep the reconnect delay, cut short by a hub kick. False on shutdown.
    async fn wait_before_retry(&self) -> bool {
        let delay = self.ctx.config.reconnect_delay;
        debug!(
            target: "gw.control_link",
            delay_secs = delay.as_secs(),
            "Waiting before reconnect"
        );
        tokio::select! {
            () = self.cancel_token.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
            () = self.reconnect.notified() => {
                debug!(target: "gw.control_link", "Reconnect requested");
                true
            }
        }
    }
}
