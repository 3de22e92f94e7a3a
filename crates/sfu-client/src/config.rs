//! Client configuration.

use crate::errors::ClientError;

use common::RoomCode;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::time::Duration;

/// Default SFU base URL.
pub const DEFAULT_URL: &str = "ws://127.0.0.1:4000";

/// Default signaling path.
pub const DEFAULT_PATH: &str = "/sfu";

/// Default bound on waiting for the signaling channel in `join`.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default cap on the reconnect backoff.
pub const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(3);

/// Session controller settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub room_code: RoomCode,
    pub display_name: String,
    /// Base URL of the SFU (`ws://` or `wss://`).
    pub url: String,
    pub path: String,
    pub connect_timeout: Duration,
    pub reconnect_max_delay: Duration,
    /// Consume every `new-producer` push instead of surfacing it.
    pub auto_consume: bool,
    /// Pause/resume the local sink when the remote producer is paused/resumed.
    pub mirror_remote_pause: bool,
}

fn random_display_name() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("user-{suffix}")
}

impl ClientConfig {
    /// Configuration for `room_code` with defaults for everything else.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if `room_code` is empty.
    pub fn new(room_code: impl Into<String>) -> Result<Self, ClientError> {
        let room_code = RoomCode::new(room_code);
        if room_code.is_empty() {
            return Err(ClientError::Config("room code is required".to_string()));
        }

        Ok(Self {
            room_code,
            display_name: random_display_name(),
            url: DEFAULT_URL.to_string(),
            path: DEFAULT_PATH.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_max_delay: DEFAULT_RECONNECT_MAX_DELAY,
            auto_consume: false,
            mirror_remote_pause: true,
        })
    }

    /// Blank names keep the generated default.
    #[must_use]
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        let display_name = display_name.into();
        if !display_name.trim().is_empty() {
            self.display_name = display_name;
        }
        self
    }

    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_reconnect_max_delay(mut self, delay: Duration) -> Self {
        self.reconnect_max_delay = delay;
        self
    }

    #[must_use]
    pub fn with_auto_consume(mut self, enabled: bool) -> Self {
        self.auto_consume = enabled;
        self
    }

    #[must_use]
    pub fn with_mirror_remote_pause(mut self, enabled: bool) -> Self {
        self.mirror_remote_pause = enabled;
        self
    }

    /// Full WebSocket endpoint, e.g. `ws://127.0.0.1:4000/sfu`.
    #[must_use]
    pub fn endpoint(&self) -> String {
        let base = self.url.trim_end_matches('/');
        if self.path.starts_with('/') {
            format!("{base}{}", self.path)
        } else {
            format!("{base}/{}", self.path)
        }
    }
}
