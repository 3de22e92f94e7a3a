//! Signaling protocol for the SFU.
//!
//! This crate defines the messages exchanged over the signaling channel
//! between clients and the SFU service:
//!
//! - [`media`] - negotiation parameter types relayed verbatim between the
//!   media engine and clients (capabilities, ICE/DTLS, RTP parameters)
//! - [`message`] - request/ack calls, notifications and push events
//! - [`codec`] - JSON text frame encoding and decoding

#![warn(clippy::pedantic)]

pub mod codec;
pub mod media;
pub mod message;

pub use codec::{
    decode_client_frame, decode_server_frame, encode_client_frame, encode_server_frame,
    CodecError, MAX_FRAME_LEN,
};
pub use media::*;
pub use message::*;
