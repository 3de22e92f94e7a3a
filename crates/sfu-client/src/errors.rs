//! Client error types.

use signaling_protocol::{Direction, ErrorCode, MediaKind};
use thiserror::Error;

/// Errors raised by the device seam (local media stack).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device has not been loaded with routing capabilities yet.
    #[error("Device not loaded")]
    NotLoaded,

    /// The local media stack refused an operation.
    #[error("Device operation failed: {0}")]
    Failed(String),
}

/// Session controller error type.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The signaling channel did not open within the connect timeout.
    #[error("Signaling channel did not connect within {0:?}")]
    ConnectTimeout(std::time::Duration),

    /// The signaling channel closed before the request was answered.
    #[error("Signaling channel closed")]
    ChannelClosed,

    /// The SFU answered `{ok:false}`.
    #[error("Request rejected ({code}): {message}")]
    Rejected { code: ErrorCode, message: String },

    /// The device cannot send this kind of media.
    #[error("Device cannot produce {0}")]
    CannotProduce(MediaKind),

    /// Operation requires a successful join first.
    #[error("Not joined")]
    NotJoined,

    /// No transport has been created in this direction yet.
    #[error("No {0} transport")]
    NoTransport(Direction),

    /// The SFU answered with a response of the wrong shape.
    #[error("Unexpected response to {0}")]
    UnexpectedResponse(&'static str),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Codec error: {0}")]
    Codec(#[from] signaling_protocol::CodecError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// The server error code, if the SFU rejected the request.
    #[must_use]
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_exposes_code() {
        let err = ClientError::Rejected {
            code: ErrorCode::ProducerNotFound,
            message: "Producer not found".to_string(),
        };
        assert_eq!(err.code(), Some(ErrorCode::ProducerNotFound));
        assert_eq!(
            err.to_string(),
            "Request rejected (PRODUCER_NOT_FOUND): Producer not found"
        );
        assert_eq!(ClientError::ChannelClosed.code(), None);
    }

    #[test]
    fn test_device_error_converts() {
        let err: ClientError = DeviceError::NotLoaded.into();
        assert!(matches!(err, ClientError::Device(DeviceError::NotLoaded)));
    }
}
