//! Shared dependencies handed to every actor and background task.

use crate::actors::metrics::ActorMetrics;
use crate::config::Config;
use crate::media::Conductor;
use crate::observability::HealthState;
use crate::storage::DeviceStore;
use crate::transport::Dialer;
use std::sync::Arc;

/// Cheap to clone; every field is shared.
#[derive(Clone)]
pub struct GatewayContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn DeviceStore>,
    pub conductor: Arc<dyn Conductor>,
    pub dialer: Arc<dyn Dialer>,
    pub metrics: Arc<ActorMetrics>,
    pub health: Arc<HealthState>,
}

impl GatewayContext {
    pub fn new(
        config: Config,
        store: Arc<dyn DeviceStore>,
        conductor: Arc<dyn Conductor>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            conductor,
            dialer,
            metrics: ActorMetrics::new(),
            health: Arc::new(HealthState::new()),
        }
    }
}
