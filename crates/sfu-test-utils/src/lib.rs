//! # SFU Test Utilities
//!
//! Shared test utilities for the SFU service and client.
//!
//! ## Modules
//!
//! - `mock_engine` - Media engine with fault injection and call counting
//! - `loopback` - In-process signaling channel with simulated drops
//! - `fake_device` - Client media stack without media
//! - `server` - In-process SFU and a real WebSocket test server
//! - `fixtures` - RTP parameters, DTLS parameters, capability sets
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let sfu = TestSfu::new();
//!     let (channel, events) = LoopbackChannel::connect(&sfu);
//!     let config = ClientConfig::new(unique_room_code())?;
//!     let (controller, session_events) =
//!         SessionController::start(config, channel, events, Arc::new(FakeDevice::new()));
//!
//!     controller.join().await?;
//! }
//! ```

pub mod fake_device;
pub mod fixtures;
pub mod loopback;
pub mod mock_engine;
pub mod server;

pub use fake_device::*;
pub use fixtures::*;
pub use loopback::*;
pub use mock_engine::*;
pub use server::*;
