//! SFU configuration.
//!
//! Configuration is loaded from environment variables. Every variable has a
//! default suitable for local development; malformed values are rejected
//! rather than silently replaced.

use common::config::{ObservabilityConfig, DEFAULT_LOG_FILTER};
use std::collections::HashMap;
use std::env;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// Default signaling (HTTP + WebSocket) bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:4000";

/// Default WebSocket upgrade path.
pub const DEFAULT_SIGNALING_PATH: &str = "/sfu";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default allowed browser origin for CORS.
pub const DEFAULT_CLIENT_ORIGIN: &str = "http://localhost:5173";

/// Default IP the media engine listens on.
pub const DEFAULT_LISTEN_IP: &str = "127.0.0.1";

/// Default RTC port range.
pub const DEFAULT_RTC_MIN_PORT: u16 = 40000;
pub const DEFAULT_RTC_MAX_PORT: u16 = 49999;

/// Default initial outgoing bitrate for new transports (bits per second).
pub const DEFAULT_INITIAL_OUTGOING_BITRATE: u32 = 600_000;

/// Default maximum number of concurrent rooms.
pub const DEFAULT_MAX_ROOMS: usize = 1000;

/// Default SFU instance ID prefix.
pub const DEFAULT_SFU_ID_PREFIX: &str = "sfu";

/// SFU configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this SFU instance.
    pub sfu_id: String,

    /// Signaling server bind address (default: "0.0.0.0:4000").
    pub signaling_bind_address: String,

    /// Path the WebSocket endpoint is mounted on (default: "/sfu").
    pub signaling_path: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Allowed browser origin for the signaling router.
    pub client_origin: String,

    /// IP the media engine listens on.
    pub listen_ip: IpAddr,

    /// IP advertised in ICE candidates (defaults to `listen_ip`).
    pub announced_ip: IpAddr,

    /// Single RTC port shared by every transport. Zero selects port-range mode.
    pub webrtc_port: u16,

    /// Lowest port of the per-transport range.
    pub rtc_min_port: u16,

    /// Highest port of the per-transport range.
    pub rtc_max_port: u16,

    /// Initial outgoing bitrate for transports (bps).
    pub initial_outgoing_bitrate: u32,

    /// Maximum concurrent rooms.
    pub max_rooms: usize,

    /// Logging setup.
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

fn string_var(vars: &HashMap<String, String>, key: &str, default: &str) -> String {
    vars.get(key).cloned().unwrap_or_else(|| default.to_string())
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}"))),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for malformed numbers, addresses
    /// or port ranges.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// See [`Config::from_env`].
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signaling_bind_address = string_var(
            vars,
            "SFU_SIGNALING_BIND_ADDRESS",
            DEFAULT_SIGNALING_BIND_ADDRESS,
        );
        let health_bind_address =
            string_var(vars, "SFU_HEALTH_BIND_ADDRESS", DEFAULT_HEALTH_BIND_ADDRESS);
        let client_origin = string_var(vars, "SFU_CLIENT_ORIGIN", DEFAULT_CLIENT_ORIGIN);

        let signaling_path = string_var(vars, "SFU_SIGNALING_PATH", DEFAULT_SIGNALING_PATH);
        if !signaling_path.starts_with('/') {
            return Err(ConfigError::InvalidValue(format!(
                "SFU_SIGNALING_PATH={signaling_path} (must start with '/')"
            )));
        }

        let default_listen_ip = IpAddr::from([127, 0, 0, 1]);
        let listen_ip = parse_var(vars, "SFU_LISTEN_IP", default_listen_ip)?;
        let announced_ip = parse_var(vars, "SFU_ANNOUNCED_IP", listen_ip)?;

        let webrtc_port = parse_var(vars, "SFU_WEBRTC_PORT", 0u16)?;
        let rtc_min_port = parse_var(vars, "SFU_RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port = parse_var(vars, "SFU_RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "SFU_RTC_MIN_PORT ({rtc_min_port}) > SFU_RTC_MAX_PORT ({rtc_max_port})"
            )));
        }

        let initial_outgoing_bitrate = parse_var(
            vars,
            "SFU_INITIAL_OUTGOING_BITRATE",
            DEFAULT_INITIAL_OUTGOING_BITRATE,
        )?;

        let max_rooms = parse_var(vars, "SFU_MAX_ROOMS", DEFAULT_MAX_ROOMS)?;
        if max_rooms == 0 {
            return Err(ConfigError::InvalidValue("SFU_MAX_ROOMS=0".to_string()));
        }

        let json_logs = parse_var(vars, "SFU_LOG_JSON", false)?;
        let observability = ObservabilityConfig {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            json_logs,
        };

        let sfu_id = vars.get("SFU_ID").cloned().unwrap_or_else(|| {
            let hostname = env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_SFU_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            sfu_id,
            signaling_bind_address,
            signaling_path,
            health_bind_address,
            client_origin,
            listen_ip,
            announced_ip,
            webrtc_port,
            rtc_min_port,
            rtc_max_port,
            initial_outgoing_bitrate,
            max_rooms,
            observability,
        })
    }

    /// Whether every transport shares one RTC port.
    #[must_use]
    pub fn single_port_mode(&self) -> bool {
        self.webrtc_port != 0
    }
}
