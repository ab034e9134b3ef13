//! Health endpoints for the gateway.
//!
//! - `GET /health` - 200 until shutdown begins
//! - `GET /ready` - 200 while the control link is logged in, with the
//!   connectivity status in the body either way
//!
//! `/metrics` is mounted next to these by `main`.

use crate::wire::Status;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// What the probes report. The hub records every status change and every
/// loss of the control link here.
#[derive(Debug)]
pub struct HealthState {
    stopping: AtomicBool,
    link_up: AtomicBool,
    status: RwLock<Status>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stopping: AtomicBool::new(false),
            link_up: AtomicBool::new(false),
            status: RwLock::new(Status::Connecting),
        }
    }

    /// Record a connectivity status. Only `ready` marks the link as up.
    pub fn record_status(&self, status: Status) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
        self.link_up.store(status == Status::Ready, Ordering::SeqCst);
    }

    /// The control link went away without a status change.
    pub fn link_lost(&self) {
        self.link_up.store(false, Ordering::SeqCst);
    }

    pub fn begin_shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.link_up.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn status(&self) -> Status {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.stopping.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }
}

pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<Value>) {
    let code = if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": state.status().as_str(),
        "control_link": state.is_ready(),
    });
    (code, Json(body))
}
