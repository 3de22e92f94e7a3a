//! SFU Service Library
//!
//! Server side of the selective-forwarding unit:
//!
//! - Room registry and per-room actors owning peer sessions
//! - Transport / producer / consumer lifecycle with cascading close
//! - WebSocket signaling (request/ack plus ordered pushes)
//! - Media engine seam, with an in-process engine for development and tests
//! - Prometheus metrics and health endpoints
//!
//! # Architecture
//!
//! ```text
//! RoomRegistryActor (singleton per SFU instance)
//! └── RoomActor (one per live room)
//!     ├── RoutingContext (media engine)
//!     └── PeerSession (one per joined connection)
//!         └── ConnectionActor (one per signaling channel)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Actor model implementation
//! - [`engine`] - Media engine seam and the local engine
//! - [`signaling`] - Signaling session dispatch and WebSocket endpoint
//! - [`observability`] - Metrics and health endpoints
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with signaling error codes

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod actors;
pub mod config;
pub mod engine;
pub mod errors;
pub mod observability;
pub mod signaling;
