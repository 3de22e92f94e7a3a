//! Common configuration types for SFU components.

use serde::{Deserialize, Serialize};

/// Default tracing filter when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "sfu_service=debug,tower_http=info";

/// Observability configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing filter directive used when `RUST_LOG` is unset
    pub log_filter: String,
    /// Enable JSON-formatted logs
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            json_logs: false,
        }
    }
}
