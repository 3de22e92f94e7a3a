//! SFU harnesses for integration tests.
//!
//! - [`TestSfu`] - registry over a [`MockEngine`], no network
//! - [`TestSfuServer`] - the real signaling router served on `127.0.0.1:0`

use crate::mock_engine::MockEngine;

use sfu_service::actors::{ActorMetrics, RoomRegistryActorHandle};
use sfu_service::signaling::{signaling_router, SignalingState};
use signaling_protocol::default_media_codecs;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Path the test server serves signaling on.
pub const TEST_SIGNALING_PATH: &str = "/sfu";

/// Origin allowed by the test server.
pub const TEST_CLIENT_ORIGIN: &str = "http://localhost:5173";

/// In-process SFU: a registry with its own engine and metrics.
#[derive(Clone)]
pub struct TestSfu {
    pub registry: RoomRegistryActorHandle,
    pub engine: MockEngine,
    pub metrics: Arc<ActorMetrics>,
}

impl Default for TestSfu {
    fn default() -> Self {
        Self::new()
    }
}

impl TestSfu {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_rooms(64)
    }

    #[must_use]
    pub fn with_max_rooms(max_rooms: usize) -> Self {
        let engine = MockEngine::new();
        let metrics = ActorMetrics::new();
        let registry = RoomRegistryActorHandle::new(
            "sfu-test".to_string(),
            Arc::new(engine.clone()),
            default_media_codecs(),
            max_rooms,
            Arc::clone(&metrics),
        );
        Self {
            registry,
            engine,
            metrics,
        }
    }

    /// Stop the registry and every room.
    pub fn shutdown(&self) {
        self.registry.cancel();
    }
}

/// Test harness serving the signaling router over real WebSockets.
///
/// # Example
/// ```rust,ignore
/// let server = TestSfuServer::spawn().await?;
/// let (socket, _) = tokio_tungstenite::connect_async(server.ws_url()).await?;
/// ```
pub struct TestSfuServer {
    pub sfu: TestSfu,
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl TestSfuServer {
    /// Bind a random local port and serve signaling on it.
    ///
    /// # Errors
    ///
    /// Fails if the router cannot be built or the port cannot be bound.
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        let sfu = TestSfu::new();
        let app = signaling_router(
            TEST_SIGNALING_PATH,
            SignalingState {
                registry: sfu.registry.clone(),
                metrics: Arc::clone(&sfu.metrics),
            },
            TEST_CLIENT_ORIGIN,
        )
        .map_err(|e| anyhow::anyhow!("Failed to build signaling router: {e}"))?;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {e}"))?;
        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {e}"))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {e}");
            }
        });

        Ok(Self {
            sfu,
            addr,
            handle,
        })
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL for `ClientConfig::with_url`.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Full signaling endpoint.
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}{TEST_SIGNALING_PATH}", self.addr)
    }
}

impl Drop for TestSfuServer {
    fn drop(&mut self) {
        self.handle.abort();
        self.sfu.shutdown();
    }
}
