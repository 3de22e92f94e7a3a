//! SFU error types.
//!
//! Error types map to signaling `ErrorCode` values for client acks.
//! Internal details are logged server-side but not exposed to clients.

use crate::engine::EngineError;
use signaling_protocol::ErrorCode;
use thiserror::Error;

/// SFU service error type.
///
/// Maps to signaling `ErrorCode` values:
/// - Lookup failures: the matching `*_NOT_FOUND` code
/// - `IncompatibleCapabilities`, `DuplicateJoin`, `InvalidRequest`: same-named codes
/// - `Engine`: `ENGINE_ERROR`, `EngineFatal`: `ENGINE_FATAL`
/// - `Draining`, `CapacityExceeded`: `UNAVAILABLE`
/// - `ChannelClosed`, `Config`, `Internal`: `INTERNAL`
#[derive(Debug, Error)]
pub enum SfuError {
    /// Room does not exist (or vanished).
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// The connection is not registered in the room.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Transport id unknown or stale.
    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    /// Producer id unknown or not owned by the caller.
    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    /// Consumer id unknown or not owned by the caller.
    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    /// Receive capabilities cannot decode the producer's media.
    #[error("Incompatible capabilities for producer {0}")]
    IncompatibleCapabilities(String),

    /// The connection already joined this room.
    #[error("Already joined room {0}")]
    DuplicateJoin(String),

    /// Request is well-formed but not valid in the current state.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Non-fatal media engine failure.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// The media engine died. Process-fatal.
    #[error("Engine fatal: {0}")]
    EngineFatal(String),

    /// The room actor shut down while the request was in flight.
    ///
    /// Join retries against a fresh room; other requests surface it as
    /// `ROOM_NOT_FOUND`.
    #[error("Room closed")]
    RoomClosed,

    /// An actor mailbox or outbound channel is gone.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// The SFU is shutting down.
    #[error("SFU is draining")]
    Draining,

    /// Room limit reached.
    #[error("SFU at capacity")]
    CapacityExceeded,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SfuError {
    /// Returns the signaling `ErrorCode` for this error.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            SfuError::RoomNotFound(_) | SfuError::RoomClosed => ErrorCode::RoomNotFound,
            SfuError::PeerNotFound(_) => ErrorCode::PeerNotFound,
            SfuError::TransportNotFound(_) => ErrorCode::TransportNotFound,
            SfuError::ProducerNotFound(_) => ErrorCode::ProducerNotFound,
            SfuError::ConsumerNotFound(_) => ErrorCode::ConsumerNotFound,
            SfuError::IncompatibleCapabilities(_) => ErrorCode::IncompatibleCapabilities,
            SfuError::DuplicateJoin(_) => ErrorCode::DuplicateJoin,
            SfuError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            SfuError::Engine(EngineError::Fatal(_)) | SfuError::EngineFatal(_) => {
                ErrorCode::EngineFatal
            }
            SfuError::Engine(_) => ErrorCode::EngineError,
            SfuError::Draining | SfuError::CapacityExceeded => ErrorCode::Unavailable,
            SfuError::ChannelClosed(_) | SfuError::Config(_) | SfuError::Internal(_) => {
                ErrorCode::Internal
            }
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SfuError::RoomNotFound(_) | SfuError::RoomClosed => "Room not found".to_string(),
            SfuError::PeerNotFound(_) => "Not joined to this room".to_string(),
            SfuError::TransportNotFound(_) => "Transport not found".to_string(),
            SfuError::ProducerNotFound(_) => "Producer not found".to_string(),
            SfuError::ConsumerNotFound(_) => "Consumer not found".to_string(),
            SfuError::IncompatibleCapabilities(_) => {
                "Cannot consume this producer with the given capabilities".to_string()
            }
            SfuError::DuplicateJoin(_) => "Already joined this room".to_string(),
            SfuError::InvalidRequest(msg) => msg.clone(),
            SfuError::Engine(_) => "Media engine error".to_string(),
            SfuError::EngineFatal(_) => "Media engine unavailable".to_string(),
            SfuError::Draining => "Server is shutting down, please reconnect".to_string(),
            SfuError::CapacityExceeded => "Server is at capacity, please try again".to_string(),
            SfuError::ChannelClosed(_) | SfuError::Config(_) | SfuError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }
}
