//! Scriptable media engine.
//!
//! Probes return a per-device [`ProbeReport`] (offline by default). A gated
//! conductor blocks every probe until the test releases it, which lets tests
//! hold a registration in flight while they queue other operations.
//!
//! # Example
//!
//! ```rust,ignore
//! let conductor = MockConductor::gated().with_report("cam1", online_report());
//! // ... trigger a registration ...
//! wait_until("probe in flight", || conductor.in_flight("cam1") == 1).await;
//! conductor.release_probe();
//! ```
//!
//! Always call [`MockConductor::open_gate`] before a test returns: a probe
//! still blocked when the runtime shuts down keeps a blocking thread alive.

use gateway_service::errors::GatewayError;
use gateway_service::media::{Conductor, LivenessObserver, PeerConnection, Registration};
use gateway_service::models::ProbeReport;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Mock media engine for gateway tests.
#[derive(Clone, Default)]
pub struct MockConductor {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    gate: Condvar,
}

#[derive(Default)]
struct State {
    reports: HashMap<String, ProbeReport>,
    gated: bool,
    permits: usize,
    registrations: Vec<Registration>,
    unregistered: Vec<String>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
    recording: Vec<(String, bool)>,
    ice_servers: Vec<String>,
    peers_created: Vec<String>,
    live_peers: usize,
    candidates: Vec<(String, String)>,
    fail_create_peer: bool,
    fail_answer: bool,
    liveness: Option<Arc<dyn LivenessObserver>>,
}

impl MockConductor {
    /// Conductor whose probes return immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Conductor whose probes block until [`release_probe`](Self::release_probe).
    #[must_use]
    pub fn gated() -> Self {
        let conductor = Self::default();
        conductor.lock().gated = true;
        conductor
    }

    #[must_use]
    pub fn with_report(self, id: &str, report: ProbeReport) -> Self {
        self.set_report(id, report);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap()
    }

    pub fn set_report(&self, id: &str, report: ProbeReport) {
        self.lock().reports.insert(id.to_string(), report);
    }

    /// Let one blocked (or future) probe finish.
    pub fn release_probe(&self) {
        self.lock().permits += 1;
        self.inner.gate.notify_all();
    }

    /// Stop gating; every blocked probe finishes.
    pub fn open_gate(&self) {
        self.lock().gated = false;
        self.inner.gate.notify_all();
    }

    pub fn fail_create_peer(&self, fail: bool) {
        self.lock().fail_create_peer = fail;
    }

    pub fn fail_answer(&self, fail: bool) {
        self.lock().fail_answer = fail;
    }

    /// Number of probes started for `id`.
    pub fn register_calls(&self, id: &str) -> usize {
        self.lock()
            .registrations
            .iter()
            .filter(|r| r.id == id)
            .count()
    }

    /// Every registration, in call order.
    pub fn registrations(&self) -> Vec<Registration> {
        self.lock().registrations.clone()
    }

    pub fn unregister_calls(&self, id: &str) -> usize {
        self.lock().unregistered.iter().filter(|u| *u == id).count()
    }

    /// Probes for `id` currently blocked or running.
    pub fn in_flight(&self, id: &str) -> usize {
        self.lock().in_flight.get(id).copied().unwrap_or(0)
    }

    /// Highest number of concurrent probes ever observed for `id`.
    pub fn max_in_flight(&self, id: &str) -> usize {
        self.lock().max_in_flight.get(id).copied().unwrap_or(0)
    }

    pub fn recording_calls(&self) -> Vec<(String, bool)> {
        self.lock().recording.clone()
    }

    pub fn ice_servers(&self) -> Vec<String> {
        self.lock().ice_servers.clone()
    }

    pub fn peers_created(&self) -> Vec<String> {
        self.lock().peers_created.clone()
    }

    pub fn live_peers(&self) -> usize {
        self.lock().live_peers
    }

    pub fn candidates(&self) -> Vec<(String, String)> {
        self.lock().candidates.clone()
    }

    /// Push a liveness change as the engine would.
    pub fn emit_liveness(&self, id: &str, alive: bool) {
        let observer = self.lock().liveness.clone();
        if let Some(observer) = observer {
            observer.on_liveness_changed(id, alive);
        }
    }
}

impl Conductor for MockConductor {
    fn add_ice_server(&self, uri: &str, _username: &str, _password: &str) {
        self.lock().ice_servers.push(uri.to_string());
    }

    fn register(&self, registration: &Registration) -> ProbeReport {
        let id = registration.id.clone();
        let mut state = self.lock();
        state.registrations.push(registration.clone());

        let current = {
            let count = state.in_flight.entry(id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let peak = state.max_in_flight.entry(id.clone()).or_insert(0);
        *peak = (*peak).max(current);

        while state.gated && state.permits == 0 {
            state = self.inner.gate.wait(state).unwrap();
        }
        if state.gated {
            state.permits -= 1;
        }

        if let Some(count) = state.in_flight.get_mut(&id) {
            *count -= 1;
        }
        state.reports.get(&id).copied().unwrap_or_default()
    }

    fn unregister(&self, id: &str) {
        self.lock().unregistered.push(id.to_string());
    }

    fn set_recording_enabled(&self, id: &str, enabled: bool) {
        self.lock().recording.push((id.to_string(), enabled));
    }

    fn create_peer(
        &self,
        id: &str,
        outbound: mpsc::Sender<String>,
    ) -> Result<Box<dyn PeerConnection>, GatewayError> {
        let mut state = self.lock();
        if state.fail_create_peer {
            return Err(GatewayError::Internal("peer creation failed".to_string()));
        }
        state.peers_created.push(id.to_string());
        state.live_peers += 1;
        Ok(Box::new(MockPeer {
            camera: id.to_string(),
            outbound,
            conductor: self.clone(),
        }))
    }

    fn delete_peer(&self, peer: Box<dyn PeerConnection>) {
        drop(peer);
        let mut state = self.lock();
        state.live_peers = state.live_peers.saturating_sub(1);
    }

    fn subscribe_liveness(&self, observer: Arc<dyn LivenessObserver>) {
        self.lock().liveness = Some(observer);
    }
}

/// Peer that answers every offer with a canned SDP.
pub struct MockPeer {
    camera: String,
    outbound: mpsc::Sender<String>,
    conductor: MockConductor,
}

impl PeerConnection for MockPeer {
    fn create_answer(&mut self, sdp: &str) -> Result<(), GatewayError> {
        if self.conductor.lock().fail_answer {
            return Err(GatewayError::Internal("answer failed".to_string()));
        }
        let answer = json!({
            "camera": self.camera,
            "type": "answer",
            "sdp": format!("answer-to:{sdp}"),
        });
        self.outbound
            .try_send(answer.to_string())
            .map_err(|e| GatewayError::Transport(e.to_string()))
    }

    fn add_candidate(&mut self, candidate: &str, _mid: &str, _line: u32) -> Result<(), GatewayError> {
        self.conductor
            .lock()
            .candidates
            .push((self.camera.clone(), candidate.to_string()));
        Ok(())
    }
}
