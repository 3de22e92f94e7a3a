//! Client session controller.
//!
//! Drives one session against the SFU: join, produce local tracks, consume
//! remote producers, and recover from signaling drops.
//!
//! # Rejoin
//!
//! ```text
//! Idle --join--> Connected --drop--> Disconnected(needs_rejoin)
//!                    ^                       |
//!                    |                   reconnect
//!                    |                       v
//!                    +---- all steps ok -- Rejoining
//! ```
//!
//! On reconnection the controller (1) discards its transports, producers and
//! consumers without signaling, (2) joins again, (3) re-produces every live
//! local track and (4) consumes every snapshot producer not consumed yet.
//! A failing step is reported as [`SessionEvent::RejoinFailed`] and does not
//! abort the later steps; the controller then stays `Disconnected` and tries
//! again on the next reconnection.
//!
//! # Ordering
//!
//! Joins, rejoins, media operations and push handling are serialized by one
//! operation lock, so pushes arriving mid-rejoin wait until it completes.

use crate::channel::{ChannelEvent, SignalingChannel, WsSignalingChannel};
use crate::config::ClientConfig;
use crate::device::{Device, DeviceConsumer, DeviceProducer, DeviceTransport, MediaTrack};
use crate::errors::ClientError;

use common::{ConsumerId, PeerId, ProducerId};
use parking_lot::Mutex;
use signaling_protocol::{
    ConnectTransportRequest, ConsumeRequest, ConsumerRequest, CreateTransportRequest, Direction,
    JoinRequest, MediaKind, Notification, PeerSummary, ProduceRequest, ProducerEvent,
    ProducerRequest, ProducerSummary, PushEvent, Request, Response, RestartNegotiationRequest,
    SetReceiveCapabilities,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Where the session stands relative to the SFU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// Not joined yet (or disconnected by the application).
    #[default]
    Idle,
    Connected,
    /// Signaling dropped after a join; a rejoin is pending.
    Disconnected,
    Rejoining,
}

/// Rejoin sub-step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejoinStep {
    Join,
    Produce(MediaKind),
    Consume(ProducerId),
}

/// Room state returned by a successful join.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSnapshot {
    pub self_id: PeerId,
    pub peers: Vec<PeerSummary>,
    pub existing_producers: Vec<ProducerSummary>,
}

/// A remote producer now being received.
#[derive(Debug, Clone)]
pub struct ConsumedTrack {
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub producer_id: ProducerId,
    pub consumer_id: ConsumerId,
    pub track: Arc<dyn MediaTrack>,
}

/// Events surfaced to the application.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PeerJoined(PeerSummary),
    /// The peer's consumers have already been closed.
    PeerLeft(PeerSummary),
    /// A producer is available; emitted when auto-consume is off.
    NewProducer(ProducerSummary),
    Track(ConsumedTrack),
    ConsumeFailed {
        producer_id: ProducerId,
        error: String,
    },
    ProducerClosed(ProducerEvent),
    ProducerPaused(ProducerEvent),
    ProducerResumed(ProducerEvent),
    Disconnected {
        reason: String,
    },
    Rejoined {
        self_id: PeerId,
    },
    RejoinFailed {
        step: RejoinStep,
        error: String,
    },
}

/// Local half of a transport plus its one-time handshake.
#[derive(Debug)]
struct TransportSlot {
    transport: Arc<dyn DeviceTransport>,
    connected: OnceCell<()>,
}

/// At most one transport per direction. Replaced wholesale on discard.
#[derive(Debug, Default)]
struct TransportSet {
    send: OnceCell<Arc<TransportSlot>>,
    recv: OnceCell<Arc<TransportSlot>>,
}

impl TransportSet {
    fn cell(&self, direction: Direction) -> &OnceCell<Arc<TransportSlot>> {
        match direction {
            Direction::Send => &self.send,
            Direction::Recv => &self.recv,
        }
    }

    fn close(&self) {
        for slot in [self.send.get(), self.recv.get()].into_iter().flatten() {
            slot.transport.close();
        }
    }
}

#[derive(Debug, Clone)]
struct RemoteConsumer {
    consumer: Arc<dyn DeviceConsumer>,
    producer_id: ProducerId,
}

#[derive(Default)]
struct SessionState {
    phase: SessionPhase,
    needs_rejoin: bool,
    joined_once: bool,
    self_id: Option<PeerId>,
    transports: Arc<TransportSet>,
    local_tracks: HashMap<MediaKind, Arc<dyn MediaTrack>>,
    local_producers: HashMap<MediaKind, Arc<dyn DeviceProducer>>,
    remote_consumers: HashMap<(PeerId, MediaKind), RemoteConsumer>,
    /// Producers consumed (or being consumed) in this epoch
    consumed: HashSet<ProducerId>,
    /// Bumped on every discard; results of older operations are dropped
    epoch: u64,
}

struct Inner {
    config: ClientConfig,
    channel: Arc<dyn SignalingChannel>,
    device: Arc<dyn Device>,
    op_lock: tokio::sync::Mutex<()>,
    state: Mutex<SessionState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel_token: CancellationToken,
}

/// Handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("room_code", &self.inner.config.room_code)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl SessionController {
    /// Start a session over an existing channel.
    ///
    /// Spawns the event loop consuming `channel_events`. Returns the
    /// controller and the application event stream.
    #[must_use]
    pub fn start(
        config: ClientConfig,
        channel: Arc<dyn SignalingChannel>,
        channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
        device: Arc<dyn Device>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config,
            channel,
            device,
            op_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(SessionState::default()),
            events,
            cancel_token: CancellationToken::new(),
        });

        tokio::spawn(Arc::clone(&inner).run(channel_events));

        (Self { inner }, events_rx)
    }

    /// Open a WebSocket channel to `config.endpoint()` and start a session.
    #[must_use]
    pub fn connect(
        config: ClientConfig,
        device: Arc<dyn Device>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (channel, channel_events) = WsSignalingChannel::spawn(&config);
        Self::start(config, channel, channel_events, device)
    }

    /// Join the configured room.
    ///
    /// Waits for the channel (bounded by the connect timeout), joins, loads
    /// the device and declares receive capabilities. Existing producers are
    /// consumed and delivered as [`SessionEvent::Track`].
    ///
    /// # Errors
    ///
    /// `ConnectTimeout` if the channel does not open in time, `Rejected` if
    /// the SFU refuses the join, `Device` if loading fails.
    pub async fn join(&self) -> Result<JoinSnapshot, ClientError> {
        let _guard = self.inner.op_lock.lock().await;
        let snapshot = self.inner.join_locked().await?;
        self.inner.state.lock().phase = SessionPhase::Connected;

        for producer in &snapshot.existing_producers {
            match self.inner.consume_locked(producer).await {
                Ok(Some(track)) => self.inner.emit(SessionEvent::Track(track)),
                Ok(None) => {}
                Err(e) => self.inner.emit(SessionEvent::ConsumeFailed {
                    producer_id: producer.producer_id,
                    error: e.to_string(),
                }),
            }
        }

        Ok(snapshot)
    }

    /// Send `track` as this session's `kind` producer, replacing any
    /// previous one. The track is remembered and re-produced after a rejoin.
    ///
    /// # Errors
    ///
    /// `CannotProduce` if the device cannot send `kind`, `NotJoined` before
    /// the first join, channel and rejection errors otherwise.
    pub async fn produce(
        &self,
        kind: MediaKind,
        track: Arc<dyn MediaTrack>,
    ) -> Result<ProducerId, ClientError> {
        if !self.inner.device.can_produce(kind) {
            return Err(ClientError::CannotProduce(kind));
        }

        let _guard = self.inner.op_lock.lock().await;
        {
            let mut state = self.inner.state.lock();
            if state.self_id.is_none() {
                return Err(ClientError::NotJoined);
            }
            state.local_tracks.insert(kind, Arc::clone(&track));
        }
        self.inner.produce_track(kind, track).await
    }

    /// Pause the local `kind` producer. Rejections are logged, not returned.
    pub async fn pause(&self, kind: MediaKind) {
        let _guard = self.inner.op_lock.lock().await;
        self.inner.set_producer_paused(kind, true).await;
    }

    /// Resume the local `kind` producer. Rejections are logged, not returned.
    pub async fn resume(&self, kind: MediaKind) {
        let _guard = self.inner.op_lock.lock().await;
        self.inner.set_producer_paused(kind, false).await;
    }

    /// Stop sending `kind` and forget its track.
    pub async fn close_producer(&self, kind: MediaKind) {
        let _guard = self.inner.op_lock.lock().await;
        let producer = {
            let mut state = self.inner.state.lock();
            state.local_tracks.remove(&kind);
            state.local_producers.remove(&kind)
        };
        if let Some(producer) = producer {
            producer.close();
            self.inner.close_remote_producer(producer.id()).await;
        }
    }

    /// Consume a remote producer.
    ///
    /// Returns `None` for this session's own producers and for producers
    /// already consumed.
    ///
    /// # Errors
    ///
    /// `NotJoined` before the first join, channel, rejection and device
    /// errors otherwise. A failed consume may be retried.
    pub async fn consume(
        &self,
        producer: &ProducerSummary,
    ) -> Result<Option<ConsumedTrack>, ClientError> {
        let _guard = self.inner.op_lock.lock().await;
        self.inner.consume_locked(producer).await
    }

    /// Refresh ICE credentials of the `direction` transport.
    ///
    /// # Errors
    ///
    /// `NoTransport` if no transport exists in that direction.
    pub async fn restart_ice(&self, direction: Direction) -> Result<(), ClientError> {
        let _guard = self.inner.op_lock.lock().await;
        let slot = {
            let transports = Arc::clone(&self.inner.state.lock().transports);
            transports.cell(direction).get().cloned()
        };
        let Some(slot) = slot else {
            return Err(ClientError::NoTransport(direction));
        };

        let response = self
            .inner
            .channel
            .request(Request::RestartNegotiation(RestartNegotiationRequest {
                room_code: self.inner.config.room_code.clone(),
                transport_id: slot.transport.id(),
            }))
            .await?;
        let Response::NegotiationRestarted(restarted) = response else {
            return Err(ClientError::UnexpectedResponse("restart-negotiation"));
        };

        slot.transport.restart_ice(restarted.ice_parameters)?;
        debug!(
            target: "sfu.client",
            direction = %direction,
            transport_id = %slot.transport.id(),
            "ICE restarted"
        );
        Ok(())
    }

    /// Close every transport, producer and consumer, close the channel and
    /// stop the event loop.
    pub async fn disconnect(&self) {
        let _guard = self.inner.op_lock.lock().await;
        self.inner.discard_media();
        {
            let mut state = self.inner.state.lock();
            state.local_tracks.clear();
            state.phase = SessionPhase::Idle;
            state.needs_rejoin = false;
            state.joined_once = false;
            state.self_id = None;
        }
        self.inner.channel.close();
        self.inner.cancel_token.cancel();
        info!(target: "sfu.client", room_code = %self.inner.config.room_code, "Session disconnected");
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.inner.state.lock().phase
    }

    #[must_use]
    pub fn self_id(&self) -> Option<PeerId> {
        self.inner.state.lock().self_id
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Current `kind` producer.
    #[must_use]
    pub fn local_producer(&self, kind: MediaKind) -> Option<Arc<dyn DeviceProducer>> {
        self.inner.state.lock().local_producers.get(&kind).cloned()
    }

    /// Consumer receiving `peer_id`'s `kind` producer.
    #[must_use]
    pub fn remote_consumer(
        &self,
        peer_id: PeerId,
        kind: MediaKind,
    ) -> Option<Arc<dyn DeviceConsumer>> {
        self.inner
            .state
            .lock()
            .remote_consumers
            .get(&(peer_id, kind))
            .map(|remote| Arc::clone(&remote.consumer))
    }

    #[must_use]
    pub fn remote_consumer_count(&self) -> usize {
        self.inner.state.lock().remote_consumers.len()
    }
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    #[instrument(skip_all, name = "sfu.client.session", fields(room_code = %self.config.room_code))]
    async fn run(self: Arc<Self>, mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>) {
        debug!(target: "sfu.client", "Session event loop started");

        loop {
            let event = tokio::select! {
                () = self.cancel_token.cancelled() => break,
                event = channel_events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                ChannelEvent::Connected => self.on_connected().await,
                ChannelEvent::Disconnected { reason } => self.on_disconnected(reason),
                ChannelEvent::Push { seq, event } => self.on_push(seq, event).await,
            }
        }

        debug!(target: "sfu.client", "Session event loop stopped");
    }

    fn on_disconnected(&self, reason: String) {
        {
            let mut state = self.state.lock();
            if !state.joined_once {
                return;
            }
            state.needs_rejoin = true;
            state.phase = SessionPhase::Disconnected;
        }
        warn!(target: "sfu.client", reason = %reason, "Signaling lost, rejoin pending");
        self.emit(SessionEvent::Disconnected { reason });
    }

    async fn on_connected(&self) {
        if !self.state.lock().needs_rejoin {
            return;
        }
        let _guard = self.op_lock.lock().await;
        self.rejoin().await;
    }

    async fn rejoin(&self) {
        {
            let mut state = self.state.lock();
            if !state.needs_rejoin {
                return;
            }
            state.phase = SessionPhase::Rejoining;
        }
        info!(target: "sfu.client", room_code = %self.config.room_code, "Rejoining");

        // 1. Server state is gone with the old connection
        self.discard_media();

        // 2.
        let snapshot = match self.join_locked().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.state.lock().phase = SessionPhase::Disconnected;
                self.report_rejoin_failure(RejoinStep::Join, &e);
                return;
            }
        };

        let mut failed = false;

        // 3.
        for kind in MediaKind::ALL {
            let track = {
                let mut state = self.state.lock();
                match state.local_tracks.get(&kind).cloned() {
                    Some(track) if track.is_live() => Some(track),
                    Some(_) => {
                        state.local_tracks.remove(&kind);
                        None
                    }
                    None => None,
                }
            };
            let Some(track) = track else {
                continue;
            };
            if let Err(e) = self.produce_track(kind, track).await {
                failed = true;
                self.report_rejoin_failure(RejoinStep::Produce(kind), &e);
            }
        }

        // 4.
        for producer in &snapshot.existing_producers {
            match self.consume_locked(producer).await {
                Ok(Some(track)) => self.emit(SessionEvent::Track(track)),
                Ok(None) => {}
                Err(e) => {
                    failed = true;
                    self.report_rejoin_failure(RejoinStep::Consume(producer.producer_id), &e);
                }
            }
        }

        {
            let mut state = self.state.lock();
            if failed {
                state.phase = SessionPhase::Disconnected;
            } else {
                state.needs_rejoin = false;
                state.phase = SessionPhase::Connected;
            }
        }

        if !failed {
            info!(
                target: "sfu.client",
                self_id = %snapshot.self_id,
                peers = snapshot.peers.len(),
                producers = snapshot.existing_producers.len(),
                "Rejoined"
            );
            self.emit(SessionEvent::Rejoined {
                self_id: snapshot.self_id,
            });
        }
    }

    fn report_rejoin_failure(&self, step: RejoinStep, error: &ClientError) {
        warn!(target: "sfu.client", step = ?step, error = %error, "Rejoin step failed");
        self.emit(SessionEvent::RejoinFailed {
            step,
            error: error.to_string(),
        });
    }

    async fn on_push(&self, seq: u64, event: PushEvent) {
        let _guard = self.op_lock.lock().await;
        debug!(target: "sfu.client", seq = seq, event = event.event_name(), "Push received");

        match event {
            PushEvent::PeerJoined(peer) => self.emit(SessionEvent::PeerJoined(peer)),
            PushEvent::PeerLeft(peer) => {
                let departed: Vec<RemoteConsumer> = {
                    let mut state = self.state.lock();
                    let keys: Vec<(PeerId, MediaKind)> = state
                        .remote_consumers
                        .keys()
                        .filter(|(owner, _)| *owner == peer.peer_id)
                        .copied()
                        .collect();
                    let removed: Vec<RemoteConsumer> = keys
                        .iter()
                        .filter_map(|key| state.remote_consumers.remove(key))
                        .collect();
                    for remote in &removed {
                        state.consumed.remove(&remote.producer_id);
                    }
                    removed
                };
                for remote in departed {
                    remote.consumer.close();
                }
                self.emit(SessionEvent::PeerLeft(peer));
            }
            PushEvent::NewProducer(producer) => {
                if self.state.lock().self_id == Some(producer.peer_id) {
                    return;
                }
                if !self.config.auto_consume {
                    self.emit(SessionEvent::NewProducer(producer));
                    return;
                }
                match self.consume_locked(&producer).await {
                    Ok(Some(track)) => self.emit(SessionEvent::Track(track)),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            target: "sfu.client",
                            producer_id = %producer.producer_id,
                            error = %e,
                            "Auto-consume failed"
                        );
                        self.emit(SessionEvent::ConsumeFailed {
                            producer_id: producer.producer_id,
                            error: e.to_string(),
                        });
                    }
                }
            }
            PushEvent::ProducerClosed(closed) => {
                let removed = {
                    let mut state = self.state.lock();
                    state.consumed.remove(&closed.producer_id);
                    let key = (closed.peer_id, closed.kind);
                    // A newer producer of the same kind may already own the slot
                    let owned = state
                        .remote_consumers
                        .get(&key)
                        .is_some_and(|remote| remote.producer_id == closed.producer_id);
                    if owned {
                        state.remote_consumers.remove(&key)
                    } else {
                        None
                    }
                };
                if let Some(remote) = removed {
                    remote.consumer.close();
                }
                self.emit(SessionEvent::ProducerClosed(closed));
            }
            PushEvent::ProducerPaused(paused) => {
                if let Some(consumer) = self.mirrored_consumer(&paused) {
                    consumer.pause();
                }
                self.emit(SessionEvent::ProducerPaused(paused));
            }
            PushEvent::ProducerResumed(resumed) => {
                if let Some(consumer) = self.mirrored_consumer(&resumed) {
                    consumer.resume();
                }
                self.emit(SessionEvent::ProducerResumed(resumed));
            }
        }
    }

    fn mirrored_consumer(&self, event: &ProducerEvent) -> Option<Arc<dyn DeviceConsumer>> {
        if !self.config.mirror_remote_pause {
            return None;
        }
        self.state
            .lock()
            .remote_consumers
            .get(&(event.peer_id, event.kind))
            .filter(|remote| remote.producer_id == event.producer_id)
            .map(|remote| Arc::clone(&remote.consumer))
    }

    async fn join_locked(&self) -> Result<JoinSnapshot, ClientError> {
        self.channel
            .wait_connected(self.config.connect_timeout)
            .await?;

        let response = self
            .channel
            .request(Request::Join(JoinRequest {
                room_code: self.config.room_code.clone(),
                display_name: self.config.display_name.clone(),
            }))
            .await?;
        let Response::Joined(joined) = response else {
            return Err(ClientError::UnexpectedResponse("join"));
        };

        if !self.device.loaded() {
            self.device.load(&joined.rtp_capabilities).await?;
        }
        let rtp_capabilities = self.device.rtp_capabilities()?;
        self.channel
            .notify(Notification::SetReceiveCapabilities(SetReceiveCapabilities {
                room_code: self.config.room_code.clone(),
                rtp_capabilities,
            }))
            .await?;

        {
            let mut state = self.state.lock();
            state.self_id = Some(joined.self_id);
            state.joined_once = true;
        }

        info!(
            target: "sfu.client",
            room_code = %self.config.room_code,
            self_id = %joined.self_id,
            peers = joined.peers.len(),
            producers = joined.existing_producers.len(),
            "Joined room"
        );

        Ok(JoinSnapshot {
            self_id: joined.self_id,
            peers: joined.peers,
            existing_producers: joined.existing_producers,
        })
    }

    /// Drop every transport, producer and consumer without signaling.
    fn discard_media(&self) {
        let (transports, producers, consumers) = {
            let mut state = self.state.lock();
            state.epoch += 1;
            state.consumed.clear();
            (
                std::mem::take(&mut state.transports),
                std::mem::take(&mut state.local_producers),
                std::mem::take(&mut state.remote_consumers),
            )
        };

        for remote in consumers.into_values() {
            remote.consumer.close();
        }
        for producer in producers.into_values() {
            producer.close();
        }
        transports.close();
    }

    /// The `direction` transport, created and connected on first use.
    ///
    /// Concurrent callers share one `create-transport` and one
    /// `connect-transport` request.
    async fn ensure_transport(&self, direction: Direction) -> Result<Arc<TransportSlot>, ClientError> {
        let transports = Arc::clone(&self.state.lock().transports);

        let slot = transports
            .cell(direction)
            .get_or_try_init(|| async {
                let response = self
                    .channel
                    .request(Request::CreateTransport(CreateTransportRequest {
                        room_code: self.config.room_code.clone(),
                        direction,
                    }))
                    .await?;
                let Response::TransportCreated(created) = response else {
                    return Err(ClientError::UnexpectedResponse("create-transport"));
                };
                let transport = self
                    .device
                    .create_transport(direction, &created.transport_options)?;
                debug!(
                    target: "sfu.client",
                    direction = %direction,
                    transport_id = %transport.id(),
                    "Transport created"
                );
                Ok(Arc::new(TransportSlot {
                    transport,
                    connected: OnceCell::new(),
                }))
            })
            .await?;
        let slot = Arc::clone(slot);

        slot.connected
            .get_or_try_init(|| async {
                self.channel
                    .request(Request::ConnectTransport(ConnectTransportRequest {
                        room_code: self.config.room_code.clone(),
                        transport_id: slot.transport.id(),
                        dtls_parameters: slot.transport.local_dtls_parameters(),
                    }))
                    .await?;
                Ok::<(), ClientError>(())
            })
            .await?;

        Ok(slot)
    }

    async fn produce_track(
        &self,
        kind: MediaKind,
        track: Arc<dyn MediaTrack>,
    ) -> Result<ProducerId, ClientError> {
        let epoch = self.state.lock().epoch;
        let slot = self.ensure_transport(Direction::Send).await?;
        let rtp_parameters = slot.transport.send_parameters(track.as_ref())?;

        let response = self
            .channel
            .request(Request::Produce(ProduceRequest {
                room_code: self.config.room_code.clone(),
                transport_id: slot.transport.id(),
                kind,
                rtp_parameters,
            }))
            .await?;
        let Response::Produced(produced) = response else {
            return Err(ClientError::UnexpectedResponse("produce"));
        };

        let producer = match slot.transport.bind_producer(produced.producer_id, track).await {
            Ok(producer) => producer,
            Err(e) => {
                self.close_remote_producer(produced.producer_id).await;
                return Err(e.into());
            }
        };

        let (stale, previous) = {
            let mut state = self.state.lock();
            if state.epoch == epoch {
                (false, state.local_producers.insert(kind, Arc::clone(&producer)))
            } else {
                (true, None)
            }
        };
        if stale {
            producer.close();
            return Err(ClientError::ChannelClosed);
        }

        if let Some(previous) = previous {
            previous.close();
            self.close_remote_producer(previous.id()).await;
        }

        info!(
            target: "sfu.client",
            kind = %kind,
            producer_id = %produced.producer_id,
            "Producing"
        );
        Ok(produced.producer_id)
    }

    async fn set_producer_paused(&self, kind: MediaKind, paused: bool) {
        let producer = self.state.lock().local_producers.get(&kind).cloned();
        let Some(producer) = producer else {
            debug!(target: "sfu.client", kind = %kind, "No producer to pause or resume");
            return;
        };

        let request = ProducerRequest {
            room_code: self.config.room_code.clone(),
            producer_id: producer.id(),
        };
        let request = if paused {
            producer.pause();
            Request::PauseProducer(request)
        } else {
            producer.resume();
            Request::ResumeProducer(request)
        };

        let event = request.event_name();
        if let Err(e) = self.channel.request(request).await {
            warn!(
                target: "sfu.client",
                kind = %kind,
                producer_id = %producer.id(),
                event = event,
                error = %e,
                "Producer state change not applied by SFU"
            );
        }
    }

    /// Best-effort `close-producer`.
    async fn close_remote_producer(&self, producer_id: ProducerId) {
        let result = self
            .channel
            .request(Request::CloseProducer(ProducerRequest {
                room_code: self.config.room_code.clone(),
                producer_id,
            }))
            .await;
        if let Err(e) = result {
            debug!(
                target: "sfu.client",
                producer_id = %producer_id,
                error = %e,
                "Close producer not applied by SFU"
            );
        }
    }

    async fn consume_locked(
        &self,
        producer: &ProducerSummary,
    ) -> Result<Option<ConsumedTrack>, ClientError> {
        let epoch = {
            let mut state = self.state.lock();
            let Some(self_id) = state.self_id else {
                return Err(ClientError::NotJoined);
            };
            if producer.peer_id == self_id {
                return Ok(None);
            }
            if !state.consumed.insert(producer.producer_id) {
                debug!(
                    target: "sfu.client",
                    producer_id = %producer.producer_id,
                    "Producer already consumed"
                );
                return Ok(None);
            }
            state.epoch
        };

        match self.try_consume(producer, epoch).await {
            Ok(track) => Ok(Some(track)),
            Err(e) => {
                let mut state = self.state.lock();
                if state.epoch == epoch {
                    state.consumed.remove(&producer.producer_id);
                }
                Err(e)
            }
        }
    }

    async fn try_consume(
        &self,
        producer: &ProducerSummary,
        epoch: u64,
    ) -> Result<ConsumedTrack, ClientError> {
        let slot = self.ensure_transport(Direction::Recv).await?;
        let rtp_capabilities = self.device.rtp_capabilities()?;

        let response = self
            .channel
            .request(Request::Consume(ConsumeRequest {
                room_code: self.config.room_code.clone(),
                transport_id: slot.transport.id(),
                producer_id: producer.producer_id,
                rtp_capabilities,
            }))
            .await?;
        let Response::Consumed(consumed) = response else {
            return Err(ClientError::UnexpectedResponse("consume"));
        };

        let consumer = slot.transport.bind_consumer(&consumed).await?;

        // Server-side consumers start paused
        let resumed = self
            .channel
            .request(Request::ResumeConsumer(ConsumerRequest {
                room_code: self.config.room_code.clone(),
                consumer_id: consumed.consumer_id,
            }))
            .await;
        if let Err(e) = resumed {
            consumer.close();
            return Err(e);
        }
        consumer.resume();

        let (stale, previous) = {
            let mut state = self.state.lock();
            if state.epoch == epoch {
                let previous = state.remote_consumers.insert(
                    (producer.peer_id, consumed.kind),
                    RemoteConsumer {
                        consumer: Arc::clone(&consumer),
                        producer_id: producer.producer_id,
                    },
                );
                if let Some(previous) = &previous {
                    if previous.producer_id != producer.producer_id {
                        state.consumed.remove(&previous.producer_id);
                    }
                }
                (false, previous)
            } else {
                (true, None)
            }
        };
        if stale {
            consumer.close();
            return Err(ClientError::ChannelClosed);
        }
        if let Some(previous) = previous {
            previous.consumer.close();
        }

        debug!(
            target: "sfu.client",
            peer_id = %producer.peer_id,
            kind = %consumed.kind,
            producer_id = %producer.producer_id,
            consumer_id = %consumed.consumer_id,
            "Consuming"
        );

        Ok(ConsumedTrack {
            peer_id: producer.peer_id,
            kind: consumed.kind,
            producer_id: producer.producer_id,
            consumer_id: consumed.consumer_id,
            track: consumer.track(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::errors::DeviceError;
    use async_trait::async_trait;
    use signaling_protocol::{RtpCapabilities, TransportOptions};
    use std::time::Duration;
    use tokio::sync::watch;

    /// Channel that never connects.
    struct OfflineChannel {
        connected: watch::Sender<bool>,
    }

    #[async_trait]
    impl SignalingChannel for OfflineChannel {
        fn is_connected(&self) -> bool {
            false
        }

        async fn wait_connected(&self, timeout: Duration) -> Result<(), ClientError> {
            crate::channel::wait_until_connected(self.connected.subscribe(), timeout).await
        }

        async fn request(&self, _request: Request) -> Result<Response, ClientError> {
            Err(ClientError::ChannelClosed)
        }

        async fn notify(&self, _notification: Notification) -> Result<(), ClientError> {
            Err(ClientError::ChannelClosed)
        }

        fn close(&self) {}
    }

    struct AudioOnlyDevice;

    #[async_trait]
    impl Device for AudioOnlyDevice {
        async fn load(&self, _router: &RtpCapabilities) -> Result<(), DeviceError> {
            Ok(())
        }

        fn loaded(&self) -> bool {
            false
        }

        fn rtp_capabilities(&self) -> Result<RtpCapabilities, DeviceError> {
            Err(DeviceError::NotLoaded)
        }

        fn can_produce(&self, kind: MediaKind) -> bool {
            kind == MediaKind::Audio
        }

        fn create_transport(
            &self,
            _direction: Direction,
            _options: &TransportOptions,
        ) -> Result<Arc<dyn DeviceTransport>, DeviceError> {
            Err(DeviceError::NotLoaded)
        }
    }

    #[derive(Debug)]
    struct StaticTrack(MediaKind);

    impl MediaTrack for StaticTrack {
        fn id(&self) -> &str {
            "static"
        }

        fn kind(&self) -> MediaKind {
            self.0
        }

        fn is_live(&self) -> bool {
            true
        }

        fn stop(&self) {}
    }

    fn offline_controller() -> (SessionController, mpsc::UnboundedReceiver<SessionEvent>) {
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let config = ClientConfig::new("ABC")
            .unwrap()
            .with_connect_timeout(Duration::from_secs(10));
        SessionController::start(
            config,
            Arc::new(OfflineChannel {
                connected: watch::channel(false).0,
            }),
            events_rx,
            Arc::new(AudioOnlyDevice),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_times_out_without_channel() {
        let (controller, _events) = offline_controller();

        let err = controller.join().await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectTimeout(d) if d == Duration::from_secs(10)));
        assert_eq!(controller.phase(), SessionPhase::Idle);
        assert_eq!(controller.self_id(), None);
    }

    #[tokio::test]
    async fn test_produce_requires_capable_device() {
        let (controller, _events) = offline_controller();

        let err = controller
            .produce(MediaKind::Video, Arc::new(StaticTrack(MediaKind::Video)))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::CannotProduce(MediaKind::Video)));
    }

    #[tokio::test]
    async fn test_media_operations_require_join() {
        let (controller, _events) = offline_controller();

        let err = controller
            .produce(MediaKind::Audio, Arc::new(StaticTrack(MediaKind::Audio)))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotJoined));

        let producer = ProducerSummary {
            producer_id: ProducerId::new(),
            kind: MediaKind::Audio,
            peer_id: PeerId::new(),
            display_name: "bob".to_string(),
        };
        let err = controller.consume(&producer).await.unwrap_err();
        assert!(matches!(err, ClientError::NotJoined));

        let err = controller.restart_ice(Direction::Send).await.unwrap_err();
        assert!(matches!(err, ClientError::NoTransport(Direction::Send)));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (controller, _events) = offline_controller();
        controller.disconnect().await;
        controller.disconnect().await;
        assert_eq!(controller.phase(), SessionPhase::Idle);
    }
}
