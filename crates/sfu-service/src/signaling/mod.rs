//! Client signaling: per-connection request dispatch and the WebSocket
//! endpoint that carries it.

pub mod handler;
pub mod ws;

pub use handler::SignalingSession;
pub use ws::{signaling_router, SignalingState};
