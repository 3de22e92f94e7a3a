//! Message types for actor communication.
//!
//! Request-reply messages carry a `oneshot` responder. Fire-and-forget
//! messages (receive capabilities, registry cleanup, pushes) do not.

use super::connection::ConnectionActorHandle;
use super::room::RoomActorHandle;
use crate::errors::SfuError;

use common::{ConsumerId, PeerId, ProducerId, RoomCode, TransportId};
use signaling_protocol::{
    Ack, ConsumeResponse, Direction, DtlsParameters, IceParameters, JoinResponse, MediaKind,
    PeerSummary, ProducerSummary, PushEvent, RtpCapabilities, RtpParameters, TransportOptions,
};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Messages sent to `RoomRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Return the live room for `room_code`, spawning it if needed.
    GetOrCreate {
        room_code: RoomCode,
        respond_to: oneshot::Sender<Result<RoomActorHandle, SfuError>>,
    },

    /// Look up a live room without creating it.
    GetRoom {
        room_code: RoomCode,
        respond_to: oneshot::Sender<Option<RoomActorHandle>>,
    },

    /// Sent by a room that lost its last peer. Ignored unless `generation`
    /// still names the registered room.
    RemoveIfEmpty {
        room_code: RoomCode,
        generation: Uuid,
    },

    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Stop accepting rooms and cancel every room.
    Shutdown {
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },
}

/// Producer state changes requested by the owning peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerAction {
    Pause,
    Resume,
    Close,
}

impl ProducerAction {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ProducerAction::Pause => "pause",
            ProducerAction::Resume => "resume",
            ProducerAction::Close => "close",
        }
    }
}

/// Messages sent to `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    Join {
        peer_id: PeerId,
        display_name: String,
        connection: ConnectionActorHandle,
        respond_to: oneshot::Sender<Result<JoinResponse, SfuError>>,
    },

    SetReceiveCapabilities {
        peer_id: PeerId,
        rtp_capabilities: RtpCapabilities,
    },

    CreateTransport {
        peer_id: PeerId,
        direction: Direction,
        respond_to: oneshot::Sender<Result<TransportOptions, SfuError>>,
    },

    ConnectTransport {
        peer_id: PeerId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    Produce {
        peer_id: PeerId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        respond_to: oneshot::Sender<Result<ProducerId, SfuError>>,
    },

    Consume {
        peer_id: PeerId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        respond_to: oneshot::Sender<Result<ConsumeResponse, SfuError>>,
    },

    ResumeConsumer {
        peer_id: PeerId,
        consumer_id: ConsumerId,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    ProducerControl {
        peer_id: PeerId,
        producer_id: ProducerId,
        action: ProducerAction,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    RestartIce {
        peer_id: PeerId,
        transport_id: TransportId,
        respond_to: oneshot::Sender<Result<IceParameters, SfuError>>,
    },

    /// The peer's signaling channel closed. Tears the peer session down.
    Leave {
        peer_id: PeerId,
        respond_to: oneshot::Sender<()>,
    },

    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },
}

/// Messages sent to `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Server-initiated push.
    Push { seq: u64, event: PushEvent },

    /// Ack for request `id`.
    Reply { id: u64, ack: Ack },

    /// Close the connection.
    Close { reason: String },
}

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// Snapshot of a room, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room_code: RoomCode,
    pub generation: Uuid,
    /// Peers in join order.
    pub peers: Vec<PeerSummary>,
    /// Open producers in creation order.
    pub producers: Vec<ProducerSummary>,
    pub paused_producers: Vec<ProducerId>,
    pub consumer_count: usize,
    pub has_routing_context: bool,
    pub push_seq: u64,
}

/// Registry status (for health checks).
#[derive(Debug, Clone, Copy)]
pub struct RegistryStatus {
    pub room_count: usize,
    pub peer_count: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}
