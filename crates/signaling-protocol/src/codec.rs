//! Codec for encoding and decoding signaling text frames.

use crate::message::{ClientFrame, ServerFrame};

/// Largest accepted text frame, in bytes.
///
/// Capability sets and RTP parameters are a few KiB at most; anything larger
/// is treated as a malformed or hostile frame.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Frame exceeds [`MAX_FRAME_LEN`]
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Frame is not valid JSON for the expected shape
    #[error("Invalid frame format: {0}")]
    InvalidFormat(#[from] serde_json::Error),
}

fn check_len(text: &str) -> Result<(), CodecError> {
    if text.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(text.len()));
    }
    Ok(())
}

/// Encode a client frame to JSON text
///
/// # Errors
///
/// Returns an error if serialization fails or the frame is too large
pub fn encode_client_frame(frame: &ClientFrame) -> Result<String, CodecError> {
    let text = serde_json::to_string(frame)?;
    check_len(&text)?;
    Ok(text)
}

/// Decode a client frame from JSON text
///
/// # Errors
///
/// Returns an error if the frame is too large or malformed
pub fn decode_client_frame(text: &str) -> Result<ClientFrame, CodecError> {
    check_len(text)?;
    Ok(serde_json::from_str(text)?)
}

/// Encode a server frame to JSON text
///
/// # Errors
///
/// Returns an error if serialization fails or the frame is too large
pub fn encode_server_frame(frame: &ServerFrame) -> Result<String, CodecError> {
    let text = serde_json::to_string(frame)?;
    check_len(&text)?;
    Ok(text)
}

/// Decode a server frame from JSON text
///
/// # Errors
///
/// Returns an error if the frame is too large or malformed
pub fn decode_server_frame(text: &str) -> Result<ServerFrame, CodecError> {
    check_len(text)?;
    Ok(serde_json::from_str(text)?)
}
