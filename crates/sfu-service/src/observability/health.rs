//! Health endpoints for the SFU.
//!
//! - `GET /health` and `GET /healthz` - liveness (process running)
//! - `GET /ready` - readiness (engine up, accepting rooms)
//!
//! `/metrics` is rendered by the Prometheus exporter and merged into this
//! router by the binary.
//!
//! Readiness flips to false when the media engine dies or shutdown begins.

use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Liveness and readiness flags.
#[derive(Debug)]
pub struct HealthState {
    /// Always true after startup.
    live: AtomicBool,
    /// True while the SFU accepts new joins.
    ready: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (live=true, ready=false).
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Build the health router.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/healthz", get(liveness_handler))
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

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    async fn status_of(app: Router, uri: &str) -> StatusCode {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("Failed to build request");
        app.oneshot(request)
            .await
            .expect("Failed to execute request")
            .status()
    }

    #[test]
    fn test_health_state_default() {
        let state = HealthState::new();
        assert!(state.is_live());
        assert!(!state.is_ready());
    }

    #[test]
    fn test_health_state_toggle() {
        let state = HealthState::new();
        state.set_ready();
        assert!(state.is_ready());
        state.set_not_ready();
        assert!(!state.is_ready());
    }

    #[tokio::test]
    async fn test_liveness_endpoints() {
        let state = Arc::new(HealthState::new());
        assert_eq!(status_of(health_router(Arc::clone(&state)), "/health").await, StatusCode::OK);
        assert_eq!(status_of(health_router(state), "/healthz").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_follows_state() {
        let state = Arc::new(HealthState::new());
        assert_eq!(
            status_of(health_router(Arc::clone(&state)), "/ready").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.set_ready();
        assert_eq!(
            status_of(health_router(Arc::clone(&state)), "/ready").await,
            StatusCode::OK
        );

        state.set_not_ready();
        assert_eq!(
            status_of(health_router(state), "/ready").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_unknown_path_returns_404() {
        let state = Arc::new(HealthState::new());
        assert_eq!(status_of(health_router(state), "/unknown").await, StatusCode::NOT_FOUND);
    }
}
