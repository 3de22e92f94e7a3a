//! In-process media engine.
//!
//! Keeps the engine bookkeeping (routing contexts, transports, producers,
//! consumers, listening ports) inside the SFU process and generates real
//! negotiation parameters: random ICE credentials, a SHA-256 DTLS
//! fingerprint and host candidates on the announced IP. Codec compatibility
//! is decided by matching the producer's negotiated codecs against the
//! receiver's capabilities.
//!
//! Ports are either one shared port (`webrtc_port != 0`) or allocated per
//! transport from `[rtc_min_port, rtc_max_port]` and released on close.

use super::{
    EngineConsumer, EngineError, EngineEvent, EngineProducer, EngineTransport, MediaEngine,
    RoutingContext,
};
use crate::config::Config;

use async_trait::async_trait;
use common::{ConsumerId, ProducerId, TransportId};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use signaling_protocol::{
    CodecCapability, Direction, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate,
    IceParameters, MediaKind, RtpCapabilities, RtpCodecParameters, RtpEncoding, RtpParameters,
    TransportOptions, TransportProtocol,
};
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

/// First dynamic payload type handed out to router codecs.
const FIRST_PAYLOAD_TYPE: u8 = 100;

const ICE_UFRAG_LEN: usize = 16;
const ICE_PWD_LEN: usize = 32;

/// Local engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEngineConfig {
    pub listen_ip: IpAddr,
    pub announced_ip: IpAddr,
    /// Shared port; zero selects the port range.
    pub webrtc_port: u16,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    /// Applied as `maxBitrate` on consumer encodings.
    pub initial_outgoing_bitrate: u32,
}

impl Default for LocalEngineConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::from([127, 0, 0, 1]),
            announced_ip: IpAddr::from([127, 0, 0, 1]),
            webrtc_port: 0,
            rtc_min_port: crate::config::DEFAULT_RTC_MIN_PORT,
            rtc_max_port: crate::config::DEFAULT_RTC_MAX_PORT,
            initial_outgoing_bitrate: crate::config::DEFAULT_INITIAL_OUTGOING_BITRATE,
        }
    }
}

impl From<&Config> for LocalEngineConfig {
    fn from(config: &Config) -> Self {
        Self {
            listen_ip: config.listen_ip,
            announced_ip: config.announced_ip,
            webrtc_port: config.webrtc_port,
            rtc_min_port: config.rtc_min_port,
            rtc_max_port: config.rtc_max_port,
            initial_outgoing_bitrate: config.initial_outgoing_bitrate,
        }
    }
}

/// Hands out listening ports.
#[derive(Debug)]
struct PortAllocator {
    shared_port: Option<u16>,
    min: u16,
    max: u16,
    in_use: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    fn new(config: &LocalEngineConfig) -> Self {
        Self {
            shared_port: (config.webrtc_port != 0).then_some(config.webrtc_port),
            min: config.rtc_min_port,
            max: config.rtc_max_port,
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    fn allocate(&self) -> Result<u16, EngineError> {
        if let Some(port) = self.shared_port {
            return Ok(port);
        }
        let mut in_use = self.in_use.lock();
        let port = (self.min..=self.max)
            .find(|p| !in_use.contains(p))
            .ok_or(EngineError::PortsExhausted)?;
        in_use.insert(port);
        Ok(port)
    }

    fn release(&self, port: u16) {
        if self.shared_port.is_none() {
            self.in_use.lock().remove(&port);
        }
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn random_ice_parameters() -> IceParameters {
    IceParameters {
        username_fragment: random_token(ICE_UFRAG_LEN),
        password: random_token(ICE_PWD_LEN),
        ice_lite: true,
    }
}

/// Colon-separated uppercase SHA-256 fingerprint, as carried in SDP.
fn generate_fingerprint() -> DtlsFingerprint {
    let mut certificate = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut certificate);
    let digest = ring::digest::digest(&ring::digest::SHA256, &certificate);
    let value = digest
        .as_ref()
        .iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join(":");
    DtlsFingerprint {
        algorithm: "sha-256".to_string(),
        value,
    }
}

/// The in-process media engine.
pub struct LocalMediaEngine {
    config: LocalEngineConfig,
    ports: Arc<PortAllocator>,
    fingerprint: DtlsFingerprint,
    fatal_tx: watch::Sender<Option<String>>,
}

impl LocalMediaEngine {
    #[must_use]
    pub fn new(config: LocalEngineConfig) -> Self {
        let (fatal_tx, _) = watch::channel(None);
        Self {
            ports: Arc::new(PortAllocator::new(&config)),
            config,
            fingerprint: generate_fingerprint(),
            fatal_tx,
        }
    }

    /// Mark the engine dead. Every subscriber of the fatal signal observes it
    /// and new routing contexts are refused.
    pub fn report_fatal(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(target: "sfu.engine", reason = %reason, "Media engine died");
        self.fatal_tx.send_replace(Some(reason));
    }

    fn fatal_reason(&self) -> Option<String> {
        self.fatal_tx.borrow().clone()
    }
}

#[async_trait]
impl MediaEngine for LocalMediaEngine {
    async fn create_routing_context(
        &self,
        codecs: Vec<CodecCapability>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn RoutingContext>, EngineError> {
        if let Some(reason) = self.fatal_reason() {
            return Err(EngineError::Fatal(reason));
        }
        if codecs.is_empty() {
            return Err(EngineError::Rejected("empty codec set".to_string()));
        }

        debug!(
            target: "sfu.engine",
            codecs = codecs.len(),
            "Creating routing context"
        );

        Ok(Arc::new(LocalRoutingContext {
            shared: Arc::new(RouterShared {
                capabilities: RtpCapabilities { codecs },
                producers: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                config: self.config.clone(),
                ports: Arc::clone(&self.ports),
                fingerprint: self.fingerprint.clone(),
                events,
                next_mid: AtomicU32::new(0),
            }),
            transports: Mutex::new(Vec::new()),
        }))
    }

    fn subscribe_fatal(&self) -> watch::Receiver<Option<String>> {
        self.fatal_tx.subscribe()
    }
}

/// A producer as the router sees it.
#[derive(Debug, Clone)]
struct ProducerRecord {
    kind: MediaKind,
    codecs: Vec<CodecCapability>,
}

/// State shared between a routing context and everything created from it.
struct RouterShared {
    capabilities: RtpCapabilities,
    producers: Mutex<HashMap<ProducerId, ProducerRecord>>,
    closed: AtomicBool,
    config: LocalEngineConfig,
    ports: Arc<PortAllocator>,
    fingerprint: DtlsFingerprint,
    events: mpsc::UnboundedSender<EngineEvent>,
    next_mid: AtomicU32,
}

impl RouterShared {
    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    fn payload_type(&self, codec: &CodecCapability) -> u8 {
        let index = self
            .capabilities
            .codecs
            .iter()
            .position(|c| c.matches(codec))
            .unwrap_or(0);
        FIRST_PAYLOAD_TYPE.saturating_add(u8::try_from(index).unwrap_or(u8::MAX))
    }

    fn can_consume(&self, producer_id: ProducerId, capabilities: &RtpCapabilities) -> bool {
        match self.producers.lock().get(&producer_id) {
            Some(record) => record.codecs.iter().any(|c| capabilities.supports(c)),
            None => false,
        }
    }
}

struct LocalRoutingContext {
    shared: Arc<RouterShared>,
    transports: Mutex<Vec<Arc<LocalTransport>>>,
}

#[async_trait]
impl RoutingContext for LocalRoutingContext {
    fn capabilities(&self) -> RtpCapabilities {
        self.shared.capabilities.clone()
    }

    async fn can_consume(&self, producer_id: ProducerId, capabilities: &RtpCapabilities) -> bool {
        self.shared.can_consume(producer_id, capabilities)
    }

    async fn create_transport(
        &self,
        direction: Direction,
    ) -> Result<Arc<dyn EngineTransport>, EngineError> {
        self.shared.ensure_open()?;
        let port = self.shared.ports.allocate()?;
        let id = TransportId::new();
        let config = &self.shared.config;

        let candidate = IceCandidate {
            foundation: "udpcandidate".to_string(),
            priority: 1_076_302_079,
            ip: config.announced_ip.to_string(),
            port,
            protocol: TransportProtocol::Udp,
            candidate_type: "host".to_string(),
        };

        let transport = Arc::new(LocalTransport {
            id,
            direction,
            port,
            shared: Arc::clone(&self.shared),
            ice_parameters: Mutex::new(random_ice_parameters()),
            candidates: vec![candidate],
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            producers: Mutex::new(Vec::new()),
        });

        debug!(
            target: "sfu.engine",
            transport_id = %id,
            direction = %direction,
            port = port,
            listen_ip = %config.listen_ip,
            "Transport created"
        );

        self.transports.lock().push(Arc::clone(&transport));
        Ok(transport)
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let transports: Vec<_> = self.transports.lock().drain(..).collect();
        for transport in transports {
            transport.close().await;
        }
        self.shared.producers.lock().clear();
        debug!(target: "sfu.engine", "Routing context closed");
    }
}

struct LocalTransport {
    id: TransportId,
    direction: Direction,
    port: u16,
    shared: Arc<RouterShared>,
    ice_parameters: Mutex<IceParameters>,
    candidates: Vec<IceCandidate>,
    connected: AtomicBool,
    closed: AtomicBool,
    producers: Mutex<Vec<ProducerId>>,
}

impl LocalTransport {
    fn ensure_open(&self) -> Result<(), EngineError> {
        self.shared.ensure_open()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    fn next_mid(&self) -> String {
        self.shared.next_mid.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// Report a DTLS failure to the owning room.
    fn fail_negotiation(&self, state: &str) {
        warn!(
            target: "sfu.engine",
            transport_id = %self.id,
            state = state,
            "DTLS negotiation failed"
        );
        let _ = self.shared.events.send(EngineEvent::NegotiationFailed {
            transport_id: self.id,
            state: state.to_string(),
        });
    }
}

#[async_trait]
impl EngineTransport for LocalTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn options(&self) -> TransportOptions {
        TransportOptions {
            id: self.id,
            ice_parameters: self.ice_parameters.lock().clone(),
            ice_candidates: self.candidates.clone(),
            dtls_parameters: DtlsParameters {
                role: Some(DtlsRole::Auto),
                fingerprints: vec![self.shared.fingerprint.clone()],
            },
        }
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError> {
        self.ensure_open()?;
        if dtls_parameters.fingerprints.is_empty() {
            self.fail_negotiation("failed");
            return Err(EngineError::Rejected(
                "DTLS parameters carry no fingerprint".to_string(),
            ));
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Rejected("transport already connected".to_string()));
        }
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn EngineProducer>, EngineError> {
        self.ensure_open()?;
        if self.direction != Direction::Send {
            return Err(EngineError::Rejected("cannot produce on a recv transport".to_string()));
        }

        let codecs: Vec<CodecCapability> = rtp_parameters
            .codecs
            .iter()
            .map(|c| c.as_capability(kind))
            .filter(|c| self.shared.capabilities.supports(c))
            .collect();
        if codecs.is_empty() {
            return Err(EngineError::Rejected(format!(
                "no {kind} codec supported by the router"
            )));
        }

        let id = ProducerId::new();
        self.shared
            .producers
            .lock()
            .insert(id, ProducerRecord { kind, codecs });
        self.producers.lock().push(id);

        Ok(Arc::new(LocalProducer {
            id,
            kind,
            shared: Arc::clone(&self.shared),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    async fn consume(
        &self,
        producer_id: ProducerId,
        capabilities: &RtpCapabilities,
    ) -> Result<Arc<dyn EngineConsumer>, EngineError> {
        self.ensure_open()?;
        if self.direction != Direction::Recv {
            return Err(EngineError::Rejected("cannot consume on a send transport".to_string()));
        }

        let record = self
            .shared
            .producers
            .lock()
            .get(&producer_id)
            .cloned()
            .ok_or(EngineError::Closed)?;

        let codecs: Vec<RtpCodecParameters> = record
            .codecs
            .iter()
            .filter(|c| capabilities.supports(c))
            .map(|c| RtpCodecParameters {
                mime_type: c.mime_type.clone(),
                payload_type: self.shared.payload_type(c),
                clock_rate: c.clock_rate,
                channels: c.channels,
                parameters: c.parameters.clone(),
            })
            .collect();
        if codecs.is_empty() {
            return Err(EngineError::Rejected(
                "receiver cannot decode producer".to_string(),
            ));
        }

        let rtp_parameters = RtpParameters {
            mid: Some(self.next_mid()),
            codecs,
            encodings: vec![RtpEncoding {
                ssrc: Some(rand::thread_rng().gen()),
                max_bitrate: Some(self.shared.config.initial_outgoing_bitrate),
            }],
        };

        Ok(Arc::new(LocalConsumer {
            id: ConsumerId::new(),
            producer_id,
            kind: record.kind,
            rtp_parameters,
            paused: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }))
    }

    async fn restart_ice(&self) -> Result<IceParameters, EngineError> {
        self.ensure_open()?;
        let fresh = random_ice_parameters();
        *self.ice_parameters.lock() = fresh.clone();
        Ok(fresh)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let owned: Vec<ProducerId> = self.producers.lock().drain(..).collect();
        {
            let mut producers = self.shared.producers.lock();
            for id in &owned {
                producers.remove(id);
            }
        }
        self.shared.ports.release(self.port);
        debug!(
            target: "sfu.engine",
            transport_id = %self.id,
            producers = owned.len(),
            "Transport closed"
        );
    }
}

struct LocalProducer {
    id: ProducerId,
    kind: MediaKind,
    shared: Arc<RouterShared>,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl EngineProducer for LocalProducer {
    fn id(&self) -> ProducerId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn pause(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.producers.lock().remove(&self.id);
        }
    }
}

struct LocalConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl EngineConsumer for LocalConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    async fn resume(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
