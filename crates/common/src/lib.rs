//! Common utilities and types shared across the SFU components.

#![warn(clippy::pedantic)]

/// Module for common identifier types
pub mod types;

/// Module for common configuration
pub mod config;

pub use types::{ConsumerId, PeerId, ProducerId, RoomCode, TransportId};
