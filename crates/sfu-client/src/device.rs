//! Local media stack seam.
//!
//! The controller never encodes or decodes media. It drives a device through
//! these traits: load it with the room's routing capabilities, create one
//! transport per direction from the options the SFU returns, and bind
//! producers and consumers once the SFU has allocated them.

use crate::errors::DeviceError;

use async_trait::async_trait;
use common::{ConsumerId, ProducerId, TransportId};
use signaling_protocol::{
    ConsumeResponse, Direction, DtlsParameters, IceParameters, MediaKind, RtpCapabilities,
    RtpParameters, TransportOptions,
};
use std::fmt::Debug;
use std::sync::Arc;

/// A local capture or remote playback track.
pub trait MediaTrack: Send + Sync + Debug {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    /// False once the track has ended (device unplugged, stopped).
    fn is_live(&self) -> bool;

    fn stop(&self);
}

/// The client's media device.
#[async_trait]
pub trait Device: Send + Sync {
    /// Load the device with the routing capabilities of the joined room.
    async fn load(&self, router_capabilities: &RtpCapabilities) -> Result<(), DeviceError>;

    fn loaded(&self) -> bool;

    /// Receive capabilities declared to the SFU after loading.
    fn rtp_capabilities(&self) -> Result<RtpCapabilities, DeviceError>;

    fn can_produce(&self, kind: MediaKind) -> bool;

    /// Create the local half of a transport from the SFU's options.
    fn create_transport(
        &self,
        direction: Direction,
        options: &TransportOptions,
    ) -> Result<Arc<dyn DeviceTransport>, DeviceError>;
}

/// Local half of a transport.
#[async_trait]
pub trait DeviceTransport: Send + Sync + Debug {
    fn id(&self) -> TransportId;

    fn direction(&self) -> Direction;

    /// DTLS parameters sent with `connect-transport`.
    fn local_dtls_parameters(&self) -> DtlsParameters;

    /// Encoding parameters for sending `track` on this transport.
    fn send_parameters(&self, track: &dyn MediaTrack) -> Result<RtpParameters, DeviceError>;

    /// Start sending `track` under the producer id the SFU allocated.
    async fn bind_producer(
        &self,
        producer_id: ProducerId,
        track: Arc<dyn MediaTrack>,
    ) -> Result<Arc<dyn DeviceProducer>, DeviceError>;

    /// Start receiving the consumer the SFU allocated.
    async fn bind_consumer(
        &self,
        consumer: &ConsumeResponse,
    ) -> Result<Arc<dyn DeviceConsumer>, DeviceError>;

    fn restart_ice(&self, ice_parameters: IceParameters) -> Result<(), DeviceError>;

    fn close(&self);
}

/// Local sending side of a producer.
pub trait DeviceProducer: Send + Sync + Debug {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn pause(&self);

    fn resume(&self);

    fn is_paused(&self) -> bool;

    fn close(&self);
}

/// Local receiving side of a consumer.
pub trait DeviceConsumer: Send + Sync + Debug {
    fn id(&self) -> ConsumerId;

    fn producer_id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    /// Playback track fed by this consumer.
    fn track(&self) -> Arc<dyn MediaTrack>;

    fn pause(&self);

    fn resume(&self);

    fn is_paused(&self) -> bool;

    fn close(&self);
}
