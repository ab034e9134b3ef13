//! Connectivity-only engine used when no WebRTC engine is linked in.
//!
//! `register` opens a TCP connection to the device and sends an RTSP
//! `OPTIONS` request; a `200` answer marks the device online with video.
//! Audio is never reported, since `OPTIONS` does not describe tracks.
//! Peer creation is refused.

use super::{Conductor, PeerConnection, Registration};
use crate::config::IceServer;
use crate::errors::GatewayError;
use crate::models::ProbeReport;
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const DEFAULT_RTSP_PORT: u16 = 554;

#[derive(Default)]
struct EngineState {
    ice_servers: Vec<IceServer>,
    registered: HashSet<String>,
    recording: HashMap<String, bool>,
}

pub struct RtspProbeConductor {
    timeout: Duration,
    state: Mutex<EngineState>,
}

impl RtspProbeConductor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Mutex::new(EngineState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ice_server_count(&self) -> usize {
        self.lock().ice_servers.len()
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.lock().registered.contains(id)
    }

    fn probe(&self, url: &str) -> Result<bool, GatewayError> {
        let addr = resolve(url)?;
        let mut stream = TcpStream::connect_timeout(&addr, self.timeout)
            .map_err(|e| GatewayError::Transport(format!("connect {addr}: {e}")))?;
        stream
            .set_read_timeout(Some(self.timeout))
            .and_then(|()| stream.set_write_timeout(Some(self.timeout)))
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let request = format!(
            "OPTIONS {} RTSP/1.0\r\nCSeq: 1\r\nUser-Agent: camera-gateway/{}\r\n\r\n",
            strip_credentials(url),
            env!("CARGO_PKG_VERSION")
        );
        stream
            .write_all(request.as_bytes())
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let mut buf = [0u8; 1024];
        let n = stream
            .read(&mut buf)
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        let response = String::from_utf8_lossy(buf.get(..n).unwrap_or_default());
        Ok(is_ok_response(&response))
    }
}

impl Conductor for RtspProbeConductor {
    fn add_ice_server(&self, uri: &str, username: &str, password: &str) {
        self.lock().ice_servers.push(IceServer {
            uri: uri.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        });
    }

    fn register(&self, registration: &Registration) -> ProbeReport {
        let online = match self.probe(&registration.url) {
            Ok(online) => online,
            Err(e) => {
                debug!(
                    target: "gw.media",
                    device_id = %registration.id,
                    error = %e,
                    "Probe failed"
                );
                false
            }
        };

        let previously_online = {
            let mut state = self.lock();
            state
                .recording
                .insert(registration.id.clone(), registration.recording_enabled);
            let was = state.registered.contains(&registration.id);
            if online {
                state.registered.insert(registration.id.clone());
            } else {
                state.registered.remove(&registration.id);
            }
            was
        };

        if previously_online != online {
            info!(
                target: "gw.media",
                device_id = %registration.id,
                online,
                "Device probe changed state"
            );
        }

        ProbeReport {
            online,
            has_video: online,
            has_audio: false,
            width: 0,
            height: 0,
        }
    }

    fn unregister(&self, id: &str) {
        let mut state = self.lock();
        state.registered.remove(id);
        state.recording.remove(id);
    }

    fn set_recording_enabled(&self, id: &str, enabled: bool) {
        self.lock().recording.insert(id.to_string(), enabled);
    }

    fn create_peer(
        &self,
        id: &str,
        _outbound: mpsc::Sender<String>,
    ) -> Result<Box<dyn PeerConnection>, GatewayError> {
        warn!(target: "gw.media", device_id = %id, "Peer requested but no WebRTC engine is linked");
        Err(GatewayError::Internal(
            "peer connections are not supported by the probe engine".to_string(),
        ))
    }

    fn delete_peer(&self, _peer: Box<dyn PeerConnection>) {}
}

/// `rtsp://user:pw@host:port/path` → socket address of `host:port`.
fn resolve(url: &str) -> Result<SocketAddr, GatewayError> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| GatewayError::Protocol(format!("device url without scheme: {url}")))?;
    let authority = rest.split('/').next().unwrap_or(rest);
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);

    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => DEFAULT_RTSP_PORT,
    };
    let target = if has_port(host_port) {
        host_port.to_string()
    } else {
        format!("{host_port}:{default_port}")
    };

    target
        .to_socket_addrs()
        .map_err(|e| GatewayError::Transport(format!("resolve {target}: {e}")))?
        .next()
        .ok_or_else(|| GatewayError::Transport(format!("no address for {target}")))
}

fn has_port(host_port: &str) -> bool {
    if let Some(rest) = host_port.strip_prefix('[') {
        // [v6]:port
        return rest.contains("]:");
    }
    host_port.matches(':').count() == 1
}

fn strip_credentials(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) => {
            let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
            let host = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
            if path.is_empty() {
                format!("{scheme}://{host}")
            } else {
                format!("{scheme}://{host}/{path}")
            }
        }
        None => url.to_string(),
    }
}

fn is_ok_response(response: &str) -> bool {
    response
        .lines()
        .next()
        .is_some_and(|status| status.starts_with("RTSP/1.0 200") || status.contains(" 200 "))
}
