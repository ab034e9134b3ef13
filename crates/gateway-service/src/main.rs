//! Camera Gateway
//!
//! Connects local IP cameras to a remote control server.
//!
//! # Servers
//!
//! - Local control socket for the operator UI (default: 127.0.0.1:12301)
//! - HTTP server for health endpoints and metrics (default: 127.0.0.1:12302)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing and the Prometheus metrics recorder
//! 3. Open storage and seed the room token
//! 4. Create the media engine and register ICE servers
//! 5. Start the actor system and the control-link manager
//! 6. Start the local control socket and the health server
//! 7. Wait for a shutdown signal or a local `Exit`

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use common::secret::ExposeSecret;
use gateway_service::config::Config;
use gateway_service::local::{local_router, LocalState};
use gateway_service::media::{Conductor, RtspProbeConductor};
use gateway_service::observability::{health_router, init_metrics_recorder};
use gateway_service::storage::{DeviceStore, SqliteStore, ROOM_TOKEN_KEY};
use gateway_service::transport::WsDialer;
use gateway_service::{Gateway, GatewayContext};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Grace period for actors to stop after shutdown is requested.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    config.observability.init_tracing();

    info!("Starting Camera Gateway");
    info!(
        server_url = %config.server_url,
        db_path = %config.db_path.display(),
        rec_dir = %config.rec_dir.display(),
        local_bind_address = %config.local_bind_address,
        health_bind_address = %config.health_bind_address,
        gateway_id = %config.gateway_id,
        ice_servers = config.ice_servers.len(),
        "Configuration loaded successfully"
    );

    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        anyhow::anyhow!(e)
    })?;

    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))?;
    if let Some(seed) = &config.room_token {
        if store.get_scalar(ROOM_TOKEN_KEY)?.is_none() {
            store.put_scalar(ROOM_TOKEN_KEY, seed.expose_secret().as_bytes())?;
            info!("Room token seeded from configuration");
        }
    }

    let conductor = RtspProbeConductor::new(config.probe_timeout);
    for server in &config.ice_servers {
        conductor.add_ice_server(&server.uri, &server.username, &server.password);
    }

    let dialer = WsDialer::new(config.ping_period);

    let local_addr: SocketAddr = config
        .local_bind_address
        .parse()
        .with_context(|| format!("Invalid local bind address {}", config.local_bind_address))?;
    let health_addr: SocketAddr = config
        .health_bind_address
        .parse()
        .with_context(|| format!("Invalid health bind address {}", config.health_bind_address))?;

    let ctx = GatewayContext::new(
        config,
        Arc::new(store),
        Arc::new(conductor),
        Arc::new(dialer),
    );

    let shutdown_token = CancellationToken::new();
    let gateway = Gateway::start(ctx.clone(), shutdown_token.clone()).await?;

    // Bind listeners before spawning to fail fast on bind errors
    let local_listener = tokio::net::TcpListener::bind(local_addr)
        .await
        .with_context(|| format!("Failed to bind local socket to {local_addr}"))?;
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .with_context(|| format!("Failed to bind health server to {health_addr}"))?;

    let local_app = local_router(LocalState::new(gateway.hub.clone(), Arc::clone(&ctx.config)))
        .layer(TraceLayer::new_for_http());
    let local_shutdown = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %local_addr, "Local control socket starting");
        let server = axum::serve(local_listener, local_app).with_graceful_shutdown(async move {
            local_shutdown.cancelled().await;
        });
        if let Err(e) = server.await {
            error!(error = %e, "Local control socket failed");
        }
    });

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&ctx.health)).merge(metrics_router);
    let health_shutdown = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown.cancelled().await;
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    info!("Camera Gateway running - press Ctrl+C to shutdown");

    tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
        }
        () = shutdown_token.cancelled() => {
            info!("Exit requested, initiating graceful shutdown...");
        }
    }

    ctx.health.begin_shutdown();
    gateway.stop(SHUTDOWN_TIMEOUT).await;

    if ctx.metrics.device_count() > 0 {
        warn!(
            remaining = ctx.metrics.device_count(),
            "Device actors still running at exit"
        );
    }

    info!("Camera Gateway shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
