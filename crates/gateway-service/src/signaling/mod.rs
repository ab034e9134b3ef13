//! Signaling relay.
//!
//! One session per `CreateSignalingConnection`: a dedicated socket towards
//! the server on which a remote viewer sends offers, ICE candidates and
//! byes. Each offer creates a media-engine peer for the named camera; the
//! engine's answers and local candidates flow back on the same socket. The
//! first error is reported on the socket and ends the session.

use crate::actors::{DeviceDirectory, HubActorHandle};
use crate::context::GatewayContext;
use crate::errors::GatewayError;
use crate::media::{Conductor, PeerConnection};
use crate::transport::Connection;
use crate::wire::{self, RequestRef};

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// One message received on a signaling socket.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Signal {
    #[serde(default)]
    pub camera: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub sdp: String,
    #[serde(default)]
    pub candidate: String,
    #[serde(default, rename = "sdpMid", alias = "id")]
    pub mid: String,
    #[serde(default, rename = "sdpMLineIndex", alias = "label")]
    pub line: u32,
}

impl Signal {
    pub fn parse(frame: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(frame)
            .map_err(|e| GatewayError::Protocol(format!("malformed signal: {e}")))
    }
}

/// Per-socket peer bookkeeping, keyed by camera id.
///
/// Dropping the session deletes every peer it still holds.
pub struct SignalingSession {
    conductor: Arc<dyn Conductor>,
    directory: DeviceDirectory,
    outbound: mpsc::Sender<String>,
    peers: HashMap<String, Box<dyn PeerConnection>>,
}

impl SignalingSession {
    pub fn new(
        conductor: Arc<dyn Conductor>,
        directory: DeviceDirectory,
        outbound: mpsc::Sender<String>,
    ) -> Self {
        Self {
            conductor,
            directory,
            outbound,
            peers: HashMap::new(),
        }
    }

    pub async fn handle(&mut self, signal: Signal) -> Result<(), GatewayError> {
        match signal.kind.as_str() {
            "offer" => self.offer(signal).await,

            "candidate" => {
                let peer = self.peers.get_mut(&signal.camera).ok_or_else(|| {
                    GatewayError::Protocol(format!("No peer for camera: {}", signal.camera))
                })?;
                peer.add_candidate(&signal.candidate, &signal.mid, signal.line)
            }

            "bye" => {
                match self.peers.remove(&signal.camera) {
                    Some(peer) => {
                        debug!(target: "gw.signaling", camera = %signal.camera, "Peer closed by viewer");
                        self.conductor.delete_peer(peer);
                    }
                    None => {
                        debug!(target: "gw.signaling", camera = %signal.camera, "Bye for unknown peer");
                    }
                }
                Ok(())
            }

            other => {
                warn!(target: "gw.signaling", kind = %other, "Ignoring unknown signal type");
                Ok(())
            }
        }
    }

    async fn offer(&mut self, signal: Signal) -> Result<(), GatewayError> {
        if self.peers.contains_key(&signal.camera) {
            return Err(GatewayError::Protocol(format!(
                "Duplicate offer for camera: {}",
                signal.camera
            )));
        }

        let record = self
            .directory
            .copy_of(&signal.camera)
            .await
            .ok_or_else(|| GatewayError::NotFound(signal.camera.clone()))?;

        if record.disabled || !record.online {
            return Err(GatewayError::Protocol(format!(
                "Camera not online: {}",
                signal.camera
            )));
        }

        let mut peer = self.conductor.create_peer(&record.id, self.outbound.clone())?;
        if let Err(e) = peer.create_answer(&signal.sdp) {
            self.conductor.delete_peer(peer);
            return Err(e);
        }

        debug!(target: "gw.signaling", camera = %signal.camera, "Peer created");
        self.peers.insert(signal.camera, peer);
        Ok(())
    }

    /// Delete every peer.
    pub fn close(&mut self) {
        for (camera, peer) in self.peers.drain() {
            debug!(target: "gw.signaling", camera = %camera, "Deleting peer");
            self.conductor.delete_peer(peer);
        }
    }
}

impl Drop for SignalingSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Dial the signaling socket for `receiver` and relay until it ends.
#[instrument(skip_all, name = "gw.signaling", fields(receiver = %receiver))]
pub async fn run_session(
    ctx: GatewayContext,
    directory: DeviceDirectory,
    hub: HubActorHandle,
    request: RequestRef,
    receiver: String,
) {
    let url = ctx.config.signaling_url(&receiver);

    let Connection { link, mut inbound } = match ctx.dialer.dial(&url).await {
        Ok(connection) => connection,
        Err(e) => {
            warn!(target: "gw.signaling", error = %e, "Dial signaling failed");
            if let Err(e) = hub
                .send_control(wire::info_frame(request.from, "Dial signaling failed"))
                .await
            {
                debug!(target: "gw.signaling", error = %e, "Hub gone");
            }
            return;
        }
    };

    ctx.metrics.signaling_opened();
    info!(target: "gw.signaling", link_id = %link.id(), "Signaling session opened");

    let mut session = SignalingSession::new(Arc::clone(&ctx.conductor), directory, link.outbound());
    let quit = link.quit_token();

    loop {
        let frame = tokio::select! {
            () = quit.cancelled() => break,
            frame = inbound.recv() => frame,
        };

        let text = match frame {
            Some(Ok(text)) => text,
            Some(Err(e)) => {
                debug!(target: "gw.signaling", error = %e, "Signaling socket failed");
                break;
            }
            None => break,
        };

        let result = match Signal::parse(&text) {
            Ok(signal) => session.handle(signal).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!(
                target: "gw.signaling",
                error = %e,
                error_code = e.error_code(),
                "Signaling error, closing session"
            );
            if let Err(e) = link.send(wire::signaling_error(&e.client_message())) {
                debug!(target: "gw.signaling", error = %e, "Error frame not delivered");
            }
            break;
        }
    }

    session.close();
    link.close();
    ctx.metrics.signaling_closed();
    info!(target: "gw.signaling", "Signaling session closed");
}
