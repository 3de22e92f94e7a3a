//! SFU Client Library
//!
//! Client side of the selective-forwarding unit. A [`SessionController`]
//! joins a room over a [`SignalingChannel`], sends local tracks and receives
//! remote ones through a [`Device`], and transparently rejoins after the
//! signaling connection drops.
//!
//! # Modules
//!
//! - [`channel`] - Signaling channel seam, request correlation and the
//!   reconnecting WebSocket channel
//! - [`device`] - Local media stack seam
//! - [`controller`] - Session controller and rejoin state machine
//! - [`config`] - Client configuration
//! - [`errors`] - Client error types

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod config;
pub mod controller;
pub mod device;
pub mod errors;

pub use channel::{ChannelEvent, SignalingChannel, WsSignalingChannel};
pub use config::ClientConfig;
pub use controller::{
    ConsumedTrack, JoinSnapshot, RejoinStep, SessionController, SessionEvent, SessionPhase,
};
pub use device::{Device, DeviceConsumer, DeviceProducer, DeviceTransport, MediaTrack};
pub use errors::{ClientError, DeviceError};
