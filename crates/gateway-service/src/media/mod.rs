//! Media engine interface.
//!
//! The engine creates and tears down peer connections, probes devices and
//! reports liveness. Everything on [`Conductor`] is synchronous and may block
//! on device I/O; callers that must stay responsive run it on a blocking
//! thread.

mod rtsp;

pub use rtsp::RtspProbeConductor;

use crate::errors::GatewayError;
use crate::models::ProbeReport;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Arguments of one registration probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub id: String,
    pub url: String,
    pub record_prefix: PathBuf,
    pub recording_enabled: bool,
    pub audio_disabled: bool,
}

/// Receives asynchronous liveness changes from the engine.
///
/// Implementations must not do the work inline; they hand it to the owning
/// actor's mailbox.
pub trait LivenessObserver: Send + Sync {
    fn on_liveness_changed(&self, id: &str, alive: bool);
}

/// One live peer connection towards a viewer.
pub trait PeerConnection: Send {
    fn create_answer(&mut self, sdp: &str) -> Result<(), GatewayError>;

    fn add_candidate(&mut self, candidate: &str, mid: &str, line: u32)
        -> Result<(), GatewayError>;
}

/// Media engine surface used by the gateway.
pub trait Conductor: Send + Sync {
    fn add_ice_server(&self, uri: &str, username: &str, password: &str);

    /// Blocking probe: connect to the device and measure what it offers.
    fn register(&self, registration: &Registration) -> ProbeReport;

    /// Drop probe/session bookkeeping for a device.
    fn unregister(&self, id: &str);

    fn set_recording_enabled(&self, id: &str, enabled: bool);

    /// Create a peer for device `id`. Answers and local candidates produced by
    /// the engine are written to `outbound` as signaling frames.
    fn create_peer(
        &self,
        id: &str,
        outbound: mpsc::Sender<String>,
    ) -> Result<Box<dyn PeerConnection>, GatewayError>;

    fn delete_peer(&self, peer: Box<dyn PeerConnection>);

    /// Install the receiver of liveness callbacks. Engines without push
    /// liveness ignore it.
    fn subscribe_liveness(&self, observer: Arc<dyn LivenessObserver>) {
        let _ = observer;
    }
}
