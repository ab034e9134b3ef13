//! Wiring of the actor system.
//!
//! Startup order:
//! 1. hub mailbox (so devices can report before the hub runs)
//! 2. directory, one device actor per stored record
//! 3. liveness subscription on the media engine
//! 4. hub actor
//! 5. forced registration of every device
//! 6. control-link manager

use crate::actors::{self, DeviceDirectory, HubActor, HubActorHandle};
use crate::context::GatewayContext;
use crate::control_link::ControlLinkManager;
use crate::errors::GatewayError;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A running gateway. Cancelling `shutdown` (or a local `Exit`) stops it.
pub struct Gateway {
    pub hub: HubActorHandle,
    pub directory: DeviceDirectory,
    pub shutdown: CancellationToken,
    hub_task: JoinHandle<()>,
    control_task: JoinHandle<()>,
}

impl Gateway {
    pub async fn start(
        ctx: GatewayContext,
        shutdown: CancellationToken,
    ) -> Result<Self, GatewayError> {
        let (hub, hub_mailbox) = actors::mailbox();
        let directory = DeviceDirectory::load(ctx.clone(), hub.clone(), shutdown.child_token())?;

        ctx.conductor
            .subscribe_liveness(Arc::new(directory.clone()));

        let reconnect = Arc::new(Notify::new());
        let hub_task = HubActor::spawn(
            hub_mailbox,
            hub.clone(),
            ctx.clone(),
            directory.clone(),
            Arc::clone(&reconnect),
            shutdown.clone(),
        );

        directory.start().await;

        let control_task = ControlLinkManager::new(
            ctx.clone(),
            hub.clone(),
            reconnect,
            shutdown.child_token(),
        )
        .spawn();

        info!(
            target: "gw.gateway",
            devices = directory.len(),
            gateway_id = %ctx.config.gateway_id,
            "Gateway started"
        );

        Ok(Self {
            hub,
            directory,
            shutdown,
            hub_task,
            control_task,
        })
    }

    /// Cancel everything and wait up to `timeout` for the hub and the
    /// control-link manager to stop.
    pub async fn stop(self, timeout: Duration) {
        self.shutdown.cancel();
        self.directory.shutdown();

        let joined = tokio::time::timeout(timeout, async {
            let _ = self.hub_task.await;
            let _ = self.control_task.await;
        })
        .await;

        if joined.is_err() {
            warn!(target: "gw.gateway", "Gateway did not stop within timeout");
        } else {
            info!(target: "gw.gateway", "Gateway stopped");
        }
    }
}
