//! Media engine seam.
//!
//! The SFU core never touches RTP. It drives an external media engine through
//! these traits: one routing context per room, transports per peer and
//! direction, producers and consumers on transports. Negotiation parameters
//! are relayed between the engine and clients verbatim.
//!
//! Lifecycle events the engine raises asynchronously (negotiation failure,
//! producer closed from underneath) are delivered to the owning room through
//! the `events` channel handed to [`MediaEngine::create_routing_context`].
//! Engine death is process-wide and observed through
//! [`MediaEngine::subscribe_fatal`].

pub mod local;

use async_trait::async_trait;
use common::{ConsumerId, ProducerId, TransportId};
use signaling_protocol::{
    CodecCapability, Direction, DtlsParameters, IceParameters, MediaKind, RtpCapabilities,
    RtpParameters, TransportOptions,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

pub use local::{LocalEngineConfig, LocalMediaEngine};

/// Media engine error type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Parameters rejected by the engine (bad DTLS, unsupported codec, ...).
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The addressed resource was already closed.
    #[error("Resource closed")]
    Closed,

    /// No listening port left in the configured range.
    #[error("Port range exhausted")]
    PortsExhausted,

    /// The engine process died.
    #[error("Fatal: {0}")]
    Fatal(String),
}

/// Asynchronous lifecycle events, delivered to the room owning the resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// DTLS reached `closed` or `failed`; the transport is unusable.
    NegotiationFailed {
        transport_id: TransportId,
        state: String,
    },

    /// The engine closed a producer on its own.
    ProducerClosed { producer_id: ProducerId },
}

/// Entry point of a media engine (one per process).
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a routing context with the given codec set.
    async fn create_routing_context(
        &self,
        codecs: Vec<CodecCapability>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn RoutingContext>, EngineError>;

    /// Fatal signal. Holds `Some(reason)` once the engine has died.
    fn subscribe_fatal(&self) -> watch::Receiver<Option<String>>;
}

/// Per-room media router.
#[async_trait]
pub trait RoutingContext: Send + Sync {
    /// Codec set clients must load their device with.
    fn capabilities(&self) -> RtpCapabilities;

    /// Whether a receiver with `capabilities` can decode `producer_id`.
    async fn can_consume(&self, producer_id: ProducerId, capabilities: &RtpCapabilities) -> bool;

    async fn create_transport(
        &self,
        direction: Direction,
    ) -> Result<Arc<dyn EngineTransport>, EngineError>;

    /// Release the context. Closes everything created from it.
    async fn close(&self);
}

/// One ICE/DTLS transport.
#[async_trait]
pub trait EngineTransport: Send + Sync {
    fn id(&self) -> TransportId;

    fn direction(&self) -> Direction;

    /// Parameters the client needs to build its side of the transport.
    fn options(&self) -> TransportOptions;

    /// Complete the DTLS handshake with the client's parameters.
    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn EngineProducer>, EngineError>;

    /// Create a consumer for `producer_id`. Consumers start paused.
    async fn consume(
        &self,
        producer_id: ProducerId,
        capabilities: &RtpCapabilities,
    ) -> Result<Arc<dyn EngineConsumer>, EngineError>;

    /// Generate fresh ICE credentials.
    async fn restart_ice(&self) -> Result<IceParameters, EngineError>;

    async fn close(&self);
}

#[async_trait]
pub trait EngineProducer: Send + Sync {
    fn id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    async fn pause(&self) -> Result<(), EngineError>;
    async fn resume(&self) -> Result<(), EngineError>;
    async fn close(&self);
}

#[async_trait]
pub trait EngineConsumer: Send + Sync {
    fn id(&self) -> ConsumerId;
    fn producer_id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    /// Decoding parameters handed to the client.
    fn rtp_parameters(&self) -> RtpParameters;
    async fn resume(&self) -> Result<(), EngineError>;
    async fn close(&self);
}
