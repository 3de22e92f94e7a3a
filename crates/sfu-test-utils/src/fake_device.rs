//! Fake client media stack.
//!
//! [`FakeDevice`] implements the client's `Device` seam without any media:
//! transports hand out fixture RTP parameters and a fixed DTLS fingerprint,
//! producers and consumers only track their paused and closed flags.
//!
//! # Example
//!
//! ```rust,ignore
//! let device = Arc::new(FakeDevice::new().with_receive_capabilities(audio_only_capabilities()));
//! let track = FakeTrack::new(MediaKind::Audio);
//! controller.produce(MediaKind::Audio, track.clone()).await?;
//! ```

use crate::fixtures::{client_dtls_parameters, rtp_parameters_for};

use async_trait::async_trait;
use common::{ConsumerId, ProducerId, TransportId};
use parking_lot::Mutex;
use sfu_client::{
    Device, DeviceConsumer, DeviceError, DeviceProducer, DeviceTransport, MediaTrack,
};
use signaling_protocol::{
    ConsumeResponse, Direction, DtlsParameters, IceParameters, MediaKind, RtpCapabilities,
    RtpParameters, TransportOptions,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// A media track with a controllable live flag.
#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: MediaKind,
    live: AtomicBool,
}

impl FakeTrack {
    #[must_use]
    pub fn new(kind: MediaKind) -> Arc<Self> {
        Arc::new(Self {
            id: format!("{kind}-{}", Uuid::new_v4().simple()),
            kind,
            live: AtomicBool::new(true),
        })
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct DeviceState {
    router_capabilities: Option<RtpCapabilities>,
    transports: Vec<Arc<FakeTransport>>,
}

/// Fake device.
pub struct FakeDevice {
    producible: Vec<MediaKind>,
    /// Overrides the loaded router capabilities as receive capabilities
    receive_capabilities: Option<RtpCapabilities>,
    fail_load: AtomicBool,
    loads: AtomicUsize,
    state: Mutex<DeviceState>,
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDevice {
    /// A device that can send audio and video and decodes every router codec.
    #[must_use]
    pub fn new() -> Self {
        Self {
            producible: MediaKind::ALL.to_vec(),
            receive_capabilities: None,
            fail_load: AtomicBool::new(false),
            loads: AtomicUsize::new(0),
            state: Mutex::new(DeviceState::default()),
        }
    }

    /// Restrict the kinds this device can send.
    #[must_use]
    pub fn with_producible(mut self, kinds: &[MediaKind]) -> Self {
        self.producible = kinds.to_vec();
        self
    }

    /// Declare these receive capabilities instead of the router's.
    #[must_use]
    pub fn with_receive_capabilities(mut self, capabilities: RtpCapabilities) -> Self {
        self.receive_capabilities = Some(capabilities);
        self
    }

    /// Make the next `load` fail.
    pub fn fail_next_load(&self) {
        self.fail_load.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Every transport created so far, closed ones included.
    #[must_use]
    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.state.lock().transports.clone()
    }

    /// Transports not closed yet.
    #[must_use]
    pub fn open_transports(&self) -> Vec<Arc<FakeTransport>> {
        self.state
            .lock()
            .transports
            .iter()
            .filter(|t| !t.is_closed())
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Device for FakeDevice {
    async fn load(&self, router_capabilities: &RtpCapabilities) -> Result<(), DeviceError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_load.swap(false, Ordering::SeqCst) {
            return Err(DeviceError::Failed("injected load failure".to_string()));
        }
        self.state.lock().router_capabilities = Some(router_capabilities.clone());
        Ok(())
    }

    fn loaded(&self) -> bool {
        self.state.lock().router_capabilities.is_some()
    }

    fn rtp_capabilities(&self) -> Result<RtpCapabilities, DeviceError> {
        let router = self
            .state
            .lock()
            .router_capabilities
            .clone()
            .ok_or(DeviceError::NotLoaded)?;
        Ok(match &self.receive_capabilities {
            Some(own) => own.intersect(&router),
            None => router,
        })
    }

    fn can_produce(&self, kind: MediaKind) -> bool {
        self.producible.contains(&kind)
    }

    fn create_transport(
        &self,
        direction: Direction,
        options: &TransportOptions,
    ) -> Result<Arc<dyn DeviceTransport>, DeviceError> {
        let mut state = self.state.lock();
        if state.router_capabilities.is_none() {
            return Err(DeviceError::NotLoaded);
        }
        let transport = Arc::new(FakeTransport {
            id: options.id,
            direction,
            ice_parameters: Mutex::new(options.ice_parameters.clone()),
            closed: AtomicBool::new(false),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        });
        state.transports.push(Arc::clone(&transport));
        Ok(transport)
    }
}

/// Fake transport.
#[derive(Debug)]
pub struct FakeTransport {
    id: TransportId,
    direction: Direction,
    ice_parameters: Mutex<IceParameters>,
    closed: AtomicBool,
    producers: Mutex<Vec<Arc<FakeProducer>>>,
    consumers: Mutex<Vec<Arc<FakeConsumer>>>,
}

impl FakeTransport {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.lock().clone()
    }

    #[must_use]
    pub fn consumers(&self) -> Vec<Arc<FakeConsumer>> {
        self.consumers.lock().clone()
    }

    #[must_use]
    pub fn producers(&self) -> Vec<Arc<FakeProducer>> {
        self.producers.lock().clone()
    }
}

#[async_trait]
impl DeviceTransport for FakeTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn local_dtls_parameters(&self) -> DtlsParameters {
        client_dtls_parameters()
    }

    fn send_parameters(&self, track: &dyn MediaTrack) -> Result<RtpParameters, DeviceError> {
        if self.direction != Direction::Send {
            return Err(DeviceError::Failed("not a send transport".to_string()));
        }
        Ok(rtp_parameters_for(track.kind()))
    }

    async fn bind_producer(
        &self,
        producer_id: ProducerId,
        track: Arc<dyn MediaTrack>,
    ) -> Result<Arc<dyn DeviceProducer>, DeviceError> {
        if self.is_closed() {
            return Err(DeviceError::Failed("transport closed".to_string()));
        }
        let producer = Arc::new(FakeProducer {
            id: producer_id,
            kind: track.kind(),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.producers.lock().push(Arc::clone(&producer));
        Ok(producer)
    }

    async fn bind_consumer(
        &self,
        consumer: &ConsumeResponse,
    ) -> Result<Arc<dyn DeviceConsumer>, DeviceError> {
        if self.is_closed() {
            return Err(DeviceError::Failed("transport closed".to_string()));
        }
        let fake = Arc::new(FakeConsumer {
            id: consumer.consumer_id,
            producer_id: consumer.producer_id,
            kind: consumer.kind,
            track: FakeTrack::new(consumer.kind),
            paused: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        });
        self.consumers.lock().push(Arc::clone(&fake));
        Ok(fake)
    }

    fn restart_ice(&self, ice_parameters: IceParameters) -> Result<(), DeviceError> {
        *self.ice_parameters.lock() = ice_parameters;
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Fake producer.
#[derive(Debug)]
pub struct FakeProducer {
    id: ProducerId,
    kind: MediaKind,
    paused: AtomicBool,
    closed: AtomicBool,
}

impl FakeProducer {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl DeviceProducer for FakeProducer {
    fn id(&self) -> ProducerId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Fake consumer. Starts paused like its server-side counterpart.
#[derive(Debug)]
pub struct FakeConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    track: Arc<FakeTrack>,
    paused: AtomicBool,
    closed: AtomicBool,
}

impl FakeConsumer {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl DeviceConsumer for FakeConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> Arc<dyn MediaTrack> {
        Arc::clone(&self.track) as Arc<dyn MediaTrack>
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.track.stop();
    }
}
