//! Signaling messages.
//!
//! Clients send [`ClientFrame`]s: correlated requests that receive exactly one
//! [`Ack`], or fire-and-forget notifications. The SFU sends [`ServerFrame`]s:
//! acks and uncorrelated [`PushEvent`]s.
//!
//! Every request payload carries the room code it applies to.

use crate::media::{
    Direction, DtlsParameters, IceParameters, MediaKind, RtpCapabilities, RtpParameters,
    TransportOptions,
};
use common::{ConsumerId, PeerId, ProducerId, RoomCode, TransportId};
use serde::{Deserialize, Serialize};
use std::fmt;

// ----------------------------------------------------------------------------
// Requests
// ----------------------------------------------------------------------------

/// Register this connection in a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub room_code: RoomCode,
    /// Empty means "pick a default"
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportRequest {
    pub room_code: RoomCode,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub room_code: RoomCode,
    pub transport_id: TransportId,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub room_code: RoomCode,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub room_code: RoomCode,
    pub transport_id: TransportId,
    pub producer_id: ProducerId,
    pub rtp_capabilities: RtpCapabilities,
}

/// Payload of requests addressing one consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRequest {
    pub room_code: RoomCode,
    pub consumer_id: ConsumerId,
}

/// Payload of requests addressing one producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerRequest {
    pub room_code: RoomCode,
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartNegotiationRequest {
    pub room_code: RoomCode,
    pub transport_id: TransportId,
}

/// A correlated call from client to SFU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum Request {
    Join(JoinRequest),
    CreateTransport(CreateTransportRequest),
    ConnectTransport(ConnectTransportRequest),
    Produce(ProduceRequest),
    Consume(ConsumeRequest),
    ResumeConsumer(ConsumerRequest),
    PauseProducer(ProducerRequest),
    ResumeProducer(ProducerRequest),
    CloseProducer(ProducerRequest),
    RestartNegotiation(RestartNegotiationRequest),
}

impl Request {
    /// Wire event name, also used as a metric label.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Request::Join(_) => "join",
            Request::CreateTransport(_) => "create-transport",
            Request::ConnectTransport(_) => "connect-transport",
            Request::Produce(_) => "produce",
            Request::Consume(_) => "consume",
            Request::ResumeConsumer(_) => "resume-consumer",
            Request::PauseProducer(_) => "pause-producer",
            Request::ResumeProducer(_) => "resume-producer",
            Request::CloseProducer(_) => "close-producer",
            Request::RestartNegotiation(_) => "restart-negotiation",
        }
    }

    /// Room the request applies to.
    #[must_use]
    pub fn room_code(&self) -> &RoomCode {
        match self {
            Request::Join(r) => &r.room_code,
            Request::CreateTransport(r) => &r.room_code,
            Request::ConnectTransport(r) => &r.room_code,
            Request::Produce(r) => &r.room_code,
            Request::Consume(r) => &r.room_code,
            Request::ResumeConsumer(r) => &r.room_code,
            Request::PauseProducer(r)
            | Request::ResumeProducer(r)
            | Request::CloseProducer(r) => &r.room_code,
            Request::RestartNegotiation(r) => &r.room_code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetReceiveCapabilities {
    pub room_code: RoomCode,
    pub rtp_capabilities: RtpCapabilities,
}

/// Fire-and-forget message from client to SFU. Never acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum Notification {
    SetReceiveCapabilities(SetReceiveCapabilities),
}

impl Notification {
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Notification::SetReceiveCapabilities(_) => "set-receive-capabilities",
        }
    }
}

// ----------------------------------------------------------------------------
// Responses
// ----------------------------------------------------------------------------

/// A peer as seen by other members of the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    #[serde(rename = "socketId")]
    pub peer_id: PeerId,
    pub display_name: String,
}

/// An open producer in a room, with its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    #[serde(rename = "socketId")]
    pub peer_id: PeerId,
    pub display_name: String,
}

/// Snapshot returned by `join`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    /// Id assigned to the joining connection
    pub self_id: PeerId,
    /// Other peers already in the room
    pub peers: Vec<PeerSummary>,
    /// Codec set of the room's routing context
    pub rtp_capabilities: RtpCapabilities,
    /// Every open producer owned by other peers
    pub existing_producers: Vec<ProducerSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCreatedResponse {
    pub direction: Direction,
    pub transport_options: TransportOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducedResponse {
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResponse {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationRestartedResponse {
    pub ice_parameters: IceParameters,
}

/// Successful result of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "data", rename_all = "kebab-case")]
pub enum Response {
    Joined(JoinResponse),
    TransportCreated(TransportCreatedResponse),
    Produced(ProducedResponse),
    Consumed(ConsumeResponse),
    NegotiationRestarted(NegotiationRestartedResponse),
    /// Request succeeded with nothing to report
    Done,
}

/// Error codes carried in failed acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RoomNotFound,
    PeerNotFound,
    TransportNotFound,
    ProducerNotFound,
    ConsumerNotFound,
    IncompatibleCapabilities,
    DuplicateJoin,
    InvalidRequest,
    EngineError,
    EngineFatal,
    /// Server is draining or at capacity
    Unavailable,
    Internal,
}

impl ErrorCode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RoomNotFound => "ROOM_NOT_FOUND",
            ErrorCode::PeerNotFound => "PEER_NOT_FOUND",
            ErrorCode::TransportNotFound => "TRANSPORT_NOT_FOUND",
            ErrorCode::ProducerNotFound => "PRODUCER_NOT_FOUND",
            ErrorCode::ConsumerNotFound => "CONSUMER_NOT_FOUND",
            ErrorCode::IncompatibleCapabilities => "INCOMPATIBLE_CAPABILITIES",
            ErrorCode::DuplicateJoin => "DUPLICATE_JOIN",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::EngineError => "ENGINE_ERROR",
            ErrorCode::EngineFatal => "ENGINE_FATAL",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// Outcome of exactly one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Response>,
}

impl Ack {
    #[must_use]
    pub fn success(response: Response) -> Self {
        Self {
            ok: true,
            error: None,
            response: Some(response),
        }
    }

    #[must_use]
    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
            response: None,
        }
    }

    /// Convert into a `Result`. An `ok` ack without a body is [`Response::Done`].
    ///
    /// # Errors
    ///
    /// Returns the carried error body when `ok` is false. A failed ack with no
    /// body is reported as [`ErrorCode::Internal`].
    pub fn into_result(self) -> Result<Response, ErrorBody> {
        if self.ok {
            return Ok(self.response.unwrap_or(Response::Done));
        }
        Err(self.error.unwrap_or_else(|| ErrorBody {
            code: ErrorCode::Internal,
            message: "request failed".to_string(),
        }))
    }
}

// ----------------------------------------------------------------------------
// Pushes
// ----------------------------------------------------------------------------

/// Payload of producer state pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerEvent {
    pub producer_id: ProducerId,
    #[serde(rename = "socketId")]
    pub peer_id: PeerId,
    pub kind: MediaKind,
}

/// Unsolicited room event, broadcast by the SFU. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum PushEvent {
    PeerJoined(PeerSummary),
    PeerLeft(PeerSummary),
    NewProducer(ProducerSummary),
    ProducerClosed(ProducerEvent),
    ProducerPaused(ProducerEvent),
    ProducerResumed(ProducerEvent),
}

impl PushEvent {
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            PushEvent::PeerJoined(_) => "peer-joined",
            PushEvent::PeerLeft(_) => "peer-left",
            PushEvent::NewProducer(_) => "new-producer",
            PushEvent::ProducerClosed(_) => "producer-closed",
            PushEvent::ProducerPaused(_) => "producer-paused",
            PushEvent::ProducerResumed(_) => "producer-resumed",
        }
    }
}

// ----------------------------------------------------------------------------
// Frames
// ----------------------------------------------------------------------------

/// Text frame sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    Request { id: u64, request: Request },
    Notify { notification: Notification },
}

/// Text frame sent by the SFU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    Ack { id: u64, ack: Ack },
    /// `seq` increases per room in broadcast order
    Push { seq: u64, event: PushEvent },
}
