//! SFU Service
//!
//! Selective-forwarding unit: room registry, peer sessions and WebSocket
//! signaling in front of a media engine.
//!
//! # Servers
//!
//! - HTTP/WebSocket server for client signaling (default: 0.0.0.0:4000, path `/sfu`)
//! - HTTP server for health endpoints and `/metrics` (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing (fmt or JSON)
//! 3. Initialize Prometheus metrics recorder
//! 4. Start the media engine and watch for its death
//! 5. Initialize actor system (`RoomRegistryActorHandle`)
//! 6. Start health HTTP server
//! 7. Start signaling server, mark ready
//! 8. Wait for shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use common::config::ObservabilityConfig;
use sfu_service::actors::{ActorMetrics, RoomRegistryActorHandle};
use sfu_service::config::Config;
use sfu_service::engine::{LocalEngineConfig, LocalMediaEngine, MediaEngine};
use sfu_service::observability::{health_router, init_metrics_recorder, HealthState};
use sfu_service::signaling::{signaling_router, SignalingState};
use signaling_protocol::default_media_codecs;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Delay between engine death and process exit, so the last logs flush.
const ENGINE_DEATH_EXIT_DELAY: Duration = Duration::from_secs(2);

/// Deadline handed to the registry on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

fn init_tracing(observability: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| observability.log_filter.clone().into());
    let json = observability.json_logs;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    init_tracing(&config.observability);

    info!("Starting SFU service");
    info!(
        sfu_id = %config.sfu_id,
        signaling_bind_address = %config.signaling_bind_address,
        signaling_path = %config.signaling_path,
        health_bind_address = %config.health_bind_address,
        client_origin = %config.client_origin,
        listen_ip = %config.listen_ip,
        announced_ip = %config.announced_ip,
        single_port_mode = config.single_port_mode(),
        max_rooms = config.max_rooms,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    let engine = Arc::new(LocalMediaEngine::new(LocalEngineConfig::from(&config)));
    spawn_engine_watchdog(engine.subscribe_fatal(), Arc::clone(&health_state));
    info!("Media engine started");

    let actor_metrics = ActorMetrics::new();
    let registry = RoomRegistryActorHandle::new(
        config.sfu_id.clone(),
        engine,
        default_media_codecs(),
        config.max_rooms,
        Arc::clone(&actor_metrics),
    );
    info!("Actor system initialized");

    let shutdown_token = registry.child_token();

    // Health server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Signaling server
    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.signaling_bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;

    let signaling_app = signaling_router(
        &config.signaling_path,
        SignalingState {
            registry: registry.clone(),
            metrics: Arc::clone(&actor_metrics),
        },
        &config.client_origin,
    )?;

    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;

    let signaling_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    health_state.set_ready();
    info!("SFU service running - press Ctrl+C to shutdown");

    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so the load balancer stops sending traffic
    health_state.set_not_ready();

    if let Err(e) = registry.shutdown(SHUTDOWN_DEADLINE).await {
        warn!(error = %e, "Actor system shutdown error");
    }

    // Give servers time to drain
    tokio::time::sleep(Duration::from_secs(2)).await;

    info!("SFU service shutdown complete");
    Ok(())
}

/// Exit the process once the media engine reports itself dead.
fn spawn_engine_watchdog(
    mut fatal: tokio::sync::watch::Receiver<Option<String>>,
    health_state: Arc<HealthState>,
) {
    tokio::spawn(async move {
        loop {
            if fatal.changed().await.is_err() {
                return;
            }
            let reason = fatal.borrow_and_update().clone();
            if let Some(reason) = reason {
                error!(
                    reason = %reason,
                    exit_in_secs = ENGINE_DEATH_EXIT_DELAY.as_secs(),
                    "Media engine died, exiting"
                );
                health_state.set_not_ready();
                tokio::time::sleep(ENGINE_DEATH_EXIT_DELAY).await;
                std::process::exit(1);
            }
        }
    });
}

/// Wait for shutdown signal (SIGTERM or Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation failure is unrecoverable at startup"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation failure is unrecoverable at startup"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
