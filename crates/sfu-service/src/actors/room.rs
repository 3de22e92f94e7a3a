//! `RoomActor` - per-room actor that owns the room's media state.
//!
//! Each `RoomActor`:
//! - Owns the routing context (created on the first join, exactly once)
//! - Owns every peer session and, through them, transports, producers and
//!   consumers
//! - Serializes all mutations and broadcasts, so pushes reach every member
//!   in acceptance order
//! - Receives engine lifecycle events for its resources
//!
//! # Teardown
//!
//! When the last peer leaves the room releases its routing context, cancels
//! itself and asks the registry to drop it. Requests still queued in the
//! mailbox fail with `RoomClosed`, which `join` retries against a fresh room.

use crate::engine::{EngineEvent, MediaEngine, RoutingContext};
use crate::errors::SfuError;

use super::connection::ConnectionActorHandle;
use super::messages::{ProducerAction, RegistryMessage, RoomMessage, RoomState};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::session::{ClosedResources, ConsumerEntry, PeerSession, ProducerEntry, TransportEntry};

use common::{ConsumerId, PeerId, ProducerId, RoomCode, TransportId};
use signaling_protocol::{
    CodecCapability, ConsumeResponse, Direction, DtlsParameters, IceParameters, JoinResponse,
    MediaKind, PeerSummary, ProducerEvent, ProducerSummary, PushEvent, RtpCapabilities,
    RtpParameters, TransportOptions,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// Upper bound on engine teardown during shutdown.
const ROUTING_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

fn room_closed<E>(_: E) -> SfuError {
    SfuError::RoomClosed
}

/// Handle to a `RoomActor`.
#[derive(Clone, Debug)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_code: RoomCode,
    generation: Uuid,
}

impl RoomActorHandle {
    #[must_use]
    pub fn room_code(&self) -> &RoomCode {
        &self.room_code
    }

    /// Distinguishes successive rooms registered under the same code.
    #[must_use]
    pub fn generation(&self) -> Uuid {
        self.generation
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RoomMessage,
    ) -> Result<T, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender.send(build(tx)).await.map_err(room_closed)?;
        rx.await.map_err(room_closed)
    }

    /// Register a peer. Fails with `RoomClosed` if the room is tearing down.
    pub async fn join(
        &self,
        peer_id: PeerId,
        display_name: String,
        connection: ConnectionActorHandle,
    ) -> Result<JoinResponse, SfuError> {
        self.call(|respond_to| RoomMessage::Join {
            peer_id,
            display_name,
            connection,
            respond_to,
        })
        .await?
    }

    /// Fire-and-forget.
    pub async fn set_receive_capabilities(
        &self,
        peer_id: PeerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<(), SfuError> {
        self.sender
            .send(RoomMessage::SetReceiveCapabilities {
                peer_id,
                rtp_capabilities,
            })
            .await
            .map_err(room_closed)
    }

    pub async fn create_transport(
        &self,
        peer_id: PeerId,
        direction: Direction,
    ) -> Result<TransportOptions, SfuError> {
        self.call(|respond_to| RoomMessage::CreateTransport {
            peer_id,
            direction,
            respond_to,
        })
        .await?
    }

    pub async fn connect_transport(
        &self,
        peer_id: PeerId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SfuError> {
        self.call(|respond_to| RoomMessage::ConnectTransport {
            peer_id,
            transport_id,
            dtls_parameters,
            respond_to,
        })
        .await?
    }

    pub async fn produce(
        &self,
        peer_id: PeerId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, SfuError> {
        self.call(|respond_to| RoomMessage::Produce {
            peer_id,
            transport_id,
            kind,
            rtp_parameters,
            respond_to,
        })
        .await?
    }

    pub async fn consume(
        &self,
        peer_id: PeerId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumeResponse, SfuError> {
        self.call(|respond_to| RoomMessage::Consume {
            peer_id,
            transport_id,
            producer_id,
            rtp_capabilities,
            respond_to,
        })
        .await?
    }

    pub async fn resume_consumer(
        &self,
        peer_id: PeerId,
        consumer_id: ConsumerId,
    ) -> Result<(), SfuError> {
        self.call(|respond_to| RoomMessage::ResumeConsumer {
            peer_id,
            consumer_id,
            respond_to,
        })
        .await?
    }

    pub async fn producer_control(
        &self,
        peer_id: PeerId,
        producer_id: ProducerId,
        action: ProducerAction,
    ) -> Result<(), SfuError> {
        self.call(|respond_to| RoomMessage::ProducerControl {
            peer_id,
            producer_id,
            action,
            respond_to,
        })
        .await?
    }

    pub async fn restart_ice(
        &self,
        peer_id: PeerId,
        transport_id: TransportId,
    ) -> Result<IceParameters, SfuError> {
        self.call(|respond_to| RoomMessage::RestartIce {
            peer_id,
            transport_id,
            respond_to,
        })
        .await?
    }

    /// Tear down the peer's session. Resolves once the cascade has run.
    pub async fn leave(&self, peer_id: PeerId) -> Result<(), SfuError> {
        self.call(|respond_to| RoomMessage::Leave {
            peer_id,
            respond_to,
        })
        .await
    }

    pub async fn get_state(&self) -> Result<RoomState, SfuError> {
        self.call(|respond_to| RoomMessage::GetState { respond_to })
            .await
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Who receives a broadcast.
#[derive(Debug, Clone, Copy)]
enum Audience {
    Everyone,
    AllExcept(PeerId),
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_code: RoomCode,
    generation: Uuid,
    receiver: mpsc::Receiver<RoomMessage>,
    /// Used to measure the mailbox.
    self_sender: mpsc::WeakSender<RoomMessage>,
    /// Child of the registry's token.
    cancel_token: CancellationToken,
    engine: Arc<dyn MediaEngine>,
    codecs: Vec<CodecCapability>,
    routing: Option<Arc<dyn RoutingContext>>,
    engine_events_tx: mpsc::UnboundedSender<EngineEvent>,
    engine_events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    peers: HashMap<PeerId, PeerSession>,
    /// Orders joins and producer creation.
    next_seq: u64,
    push_seq: u64,
    /// Mailbox of the registry, for `RemoveIfEmpty`.
    registry: mpsc::Sender<RegistryMessage>,
    /// Set once the room has torn itself down.
    closed: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a new room actor.
    pub fn spawn(
        room_code: RoomCode,
        engine: Arc<dyn MediaEngine>,
        codecs: Vec<CodecCapability>,
        registry: mpsc::Sender<RegistryMessage>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        let (engine_events_tx, engine_events_rx) = mpsc::unbounded_channel();
        let generation = Uuid::new_v4();

        let actor = Self {
            room_code: room_code.clone(),
            generation,
            receiver,
            self_sender: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            engine,
            codecs,
            routing: None,
            engine_events_tx,
            engine_events_rx,
            peers: HashMap::new(),
            next_seq: 0,
            push_seq: 0,
            registry,
            closed: false,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Room, room_code.as_str()),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_code,
            generation,
        };

        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "sfu.actor.room",
        fields(room_code = %self.room_code, generation = %self.generation)
    )]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.room",
            room_code = %self.room_code,
            "RoomActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.room",
                        room_code = %self.room_code,
                        "RoomActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                Some(event) = self.engine_events_rx.recv() => {
                    self.handle_engine_event(event).await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.sample(&self.self_sender);
                            self.handle_message(message).await;
                            self.mailbox.record_processed();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "sfu.actor.room",
                                room_code = %self.room_code,
                                "RoomActor channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }
            }

            if self.closed {
                break;
            }
        }

        info!(
            target: "sfu.actor.room",
            room_code = %self.room_code,
            peers = self.peers.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join {
                peer_id,
                display_name,
                connection,
                respond_to,
            } => {
                let result = self.handle_join(peer_id, display_name, connection).await;
                let failed = result.is_err();
                let _ = respond_to.send(result);
                if failed {
                    self.close_if_empty().await;
                }
            }

            RoomMessage::SetReceiveCapabilities {
                peer_id,
                rtp_capabilities,
            } => {
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.receive_capabilities = Some(rtp_capabilities);
                }
            }

            RoomMessage::CreateTransport {
                peer_id,
                direction,
                respond_to,
            } => {
                let result = self.handle_create_transport(peer_id, direction).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::ConnectTransport {
                peer_id,
                transport_id,
                dtls_parameters,
                respond_to,
            } => {
                let result = self
                    .handle_connect_transport(peer_id, transport_id, dtls_parameters)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Produce {
                peer_id,
                transport_id,
                kind,
                rtp_parameters,
                respond_to,
            } => {
                let result = self
                    .handle_produce(peer_id, transport_id, kind, rtp_parameters)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Consume {
                peer_id,
                transport_id,
                producer_id,
                rtp_capabilities,
                respond_to,
            } => {
                let result = self
                    .handle_consume(peer_id, transport_id, producer_id, rtp_capabilities)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::ResumeConsumer {
                peer_id,
                consumer_id,
                respond_to,
            } => {
                let result = self.handle_resume_consumer(peer_id, consumer_id).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::ProducerControl {
                peer_id,
                producer_id,
                action,
                respond_to,
            } => {
                let result = self
                    .handle_producer_control(peer_id, producer_id, action)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::RestartIce {
                peer_id,
                transport_id,
                respond_to,
            } => {
                let result = self.handle_restart_ice(peer_id, transport_id).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Leave {
                peer_id,
                respond_to,
            } => {
                self.handle_leave(peer_id).await;
                let _ = respond_to.send(());
                self.close_if_empty().await;
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.get_state());
            }
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn peer_mut(&mut self, peer_id: PeerId) -> Result<&mut PeerSession, SfuError> {
        let room_code = self.room_code.as_str();
        self.peers
            .get_mut(&peer_id)
            .ok_or_else(|| SfuError::PeerNotFound(format!("{peer_id} in {room_code}")))
    }

    fn routing(&self) -> Result<Arc<dyn RoutingContext>, SfuError> {
        self.routing
            .clone()
            .ok_or_else(|| SfuError::Internal("routing context missing".to_string()))
    }

    /// Create the routing context on first use.
    async fn ensure_routing(&mut self) -> Result<Arc<dyn RoutingContext>, SfuError> {
        if let Some(routing) = &self.routing {
            return Ok(Arc::clone(routing));
        }
        let routing = self
            .engine
            .create_routing_context(self.codecs.clone(), self.engine_events_tx.clone())
            .await?;
        debug!(
            target: "sfu.actor.room",
            room_code = %self.room_code,
            "Routing context created"
        );
        self.routing = Some(Arc::clone(&routing));
        Ok(routing)
    }

    fn broadcast(&mut self, audience: Audience, event: PushEvent) {
        self.push_seq += 1;
        let seq = self.push_seq;
        for peer in self.peers.values() {
            if let Audience::AllExcept(excluded) = audience {
                if peer.peer_id == excluded {
                    continue;
                }
            }
            peer.connection.push(seq, event.clone());
        }
    }

    #[instrument(skip_all, fields(room_code = %self.room_code, peer_id = %peer_id))]
    async fn handle_join(
        &mut self,
        peer_id: PeerId,
        display_name: String,
        connection: ConnectionActorHandle,
    ) -> Result<JoinResponse, SfuError> {
        if self.peers.contains_key(&peer_id) {
            return Err(SfuError::DuplicateJoin(self.room_code.to_string()));
        }

        let routing = self.ensure_routing().await?;

        let display_name = match display_name.trim() {
            "" => format!("user-{}", peer_id.short()),
            name => name.to_string(),
        };

        let mut others: Vec<&PeerSession> = self.peers.values().collect();
        others.sort_by_key(|p| p.joined_seq);
        let peers: Vec<PeerSummary> = others.iter().map(|p| p.summary()).collect();

        let mut producers: Vec<(u64, ProducerSummary)> =
            others
            .iter()
            .copied()
            .flat_map(PeerSession::producer_summaries)
            .collect();
        producers.sort_by_key(|(seq, _)| *seq);
        let existing_producers = producers.into_iter().map(|(_, s)| s).collect();

        let joined_seq = self.next_seq();
        let session = PeerSession::new(peer_id, display_name, joined_seq, connection);
        let summary = session.summary();
        self.peers.insert(peer_id, session);
        self.metrics.peer_joined();

        self.broadcast(Audience::AllExcept(peer_id), PushEvent::PeerJoined(summary));

        info!(
            target: "sfu.actor.room",
            room_code = %self.room_code,
            peer_id = %peer_id,
            total_peers = self.peers.len(),
            "Peer joined"
        );

        Ok(JoinResponse {
            self_id: peer_id,
            peers,
            rtp_capabilities: routing.capabilities(),
            existing_producers,
        })
    }

    async fn handle_create_transport(
        &mut self,
        peer_id: PeerId,
        direction: Direction,
    ) -> Result<TransportOptions, SfuError> {
        let routing = self.routing()?;
        let peer = self.peer_mut(peer_id)?;

        if let Some(existing) = peer.slot(direction) {
            return Ok(existing.transport.options());
        }

        let transport = routing.create_transport(direction).await?;
        let options = transport.options();
        *peer.slot_mut(direction) = Some(TransportEntry::new(transport));

        debug!(
            target: "sfu.actor.room",
            room_code = %self.room_code,
            peer_id = %peer_id,
            transport_id = %options.id,
            direction = %direction,
            "Transport created"
        );

        Ok(options)
    }

    async fn handle_connect_transport(
        &mut self,
        peer_id: PeerId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SfuError> {
        let entry = self
            .peer_mut(peer_id)?
            .transport_mut(transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.to_string()))?;

        Ok(entry.transport.connect(dtls_parameters).await?)
    }

    async fn handle_produce(
        &mut self,
        peer_id: PeerId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, SfuError> {
        let created_seq = self.next_seq();
        let peer = self.peer_mut(peer_id)?;
        let display_name = peer.display_name.clone();
        let entry = peer
            .transport_mut(transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.to_string()))?;

        if entry.direction() != Direction::Send {
            return Err(SfuError::InvalidRequest(
                "cannot produce on a receive transport".to_string(),
            ));
        }

        let producer = entry.transport.produce(kind, rtp_parameters).await?;
        let producer_id = producer.id();
        entry.producers.insert(
            producer_id,
            ProducerEntry {
                producer,
                kind,
                paused: false,
                created_seq,
            },
        );
        self.metrics.producer_created();

        self.broadcast(
            Audience::AllExcept(peer_id),
            PushEvent::NewProducer(ProducerSummary {
                producer_id,
                kind,
                peer_id,
                display_name,
            }),
        );

        info!(
            target: "sfu.actor.room",
            room_code = %self.room_code,
            peer_id = %peer_id,
            producer_id = %producer_id,
            kind = %kind,
            "Producer created"
        );

        Ok(producer_id)
    }

    async fn handle_consume(
        &mut self,
        peer_id: PeerId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumeResponse, SfuError> {
        let routing = self.routing()?;

        let known_producer = self
            .peers
            .values()
            .any(|p| p.producer(producer_id).is_some());

        let peer = self.peer_mut(peer_id)?;
        let entry = peer
            .transport_mut(transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.to_string()))?;

        if entry.direction() != Direction::Recv {
            return Err(SfuError::InvalidRequest(
                "cannot consume on a send transport".to_string(),
            ));
        }
        if !known_producer {
            return Err(SfuError::ProducerNotFound(producer_id.to_string()));
        }
        if !routing.can_consume(producer_id, &rtp_capabilities).await {
            return Err(SfuError::IncompatibleCapabilities(producer_id.to_string()));
        }

        let consumer = entry
            .transport
            .consume(producer_id, &rtp_capabilities)
            .await?;
        let response = ConsumeResponse {
            consumer_id: consumer.id(),
            producer_id,
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
        };
        entry.consumers.insert(
            response.consumer_id,
            ConsumerEntry {
                producer_id,
                consumer,
            },
        );
        self.metrics.consumer_created();

        debug!(
            target: "sfu.actor.room",
            room_code = %self.room_code,
            peer_id = %peer_id,
            producer_id = %producer_id,
            consumer_id = %response.consumer_id,
            "Consumer created (paused)"
        );

        Ok(response)
    }

    async fn handle_resume_consumer(
        &mut self,
        peer_id: PeerId,
        consumer_id: ConsumerId,
    ) -> Result<(), SfuError> {
        let entry = self
            .peer_mut(peer_id)?
            .consumer_mut(consumer_id)
            .ok_or_else(|| SfuError::ConsumerNotFound(consumer_id.to_string()))?;

        Ok(entry.consumer.resume().await?)
    }

    async fn handle_producer_control(
        &mut self,
        peer_id: PeerId,
        producer_id: ProducerId,
        action: ProducerAction,
    ) -> Result<(), SfuError> {
        let room_code = self.room_code.clone();
        let peer = self.peer_mut(peer_id)?;

        let Some(entry) = peer.producer_mut(producer_id) else {
            debug!(
                target: "sfu.actor.room",
                room_code = %room_code,
                peer_id = %peer_id,
                producer_id = %producer_id,
                action = action.as_str(),
                "Producer control for unknown producer"
            );
            return Err(SfuError::ProducerNotFound(producer_id.to_string()));
        };
        let kind = entry.kind;
        let event = ProducerEvent {
            producer_id,
            peer_id,
            kind,
        };

        match action {
            ProducerAction::Pause => {
                entry.producer.pause().await?;
                entry.paused = true;
                self.broadcast(Audience::AllExcept(peer_id), PushEvent::ProducerPaused(event));
            }
            ProducerAction::Resume => {
                entry.producer.resume().await?;
                entry.paused = false;
                self.broadcast(Audience::AllExcept(peer_id), PushEvent::ProducerResumed(event));
            }
            ProducerAction::Close => {
                if let Some(removed) = peer.remove_producer(producer_id) {
                    removed.producer.close().await;
                    self.metrics.producer_closed();
                }
                self.close_bound_consumers(producer_id).await;
                self.broadcast(Audience::AllExcept(peer_id), PushEvent::ProducerClosed(event));
            }
        }

        debug!(
            target: "sfu.actor.room",
            room_code = %self.room_code,
            peer_id = %peer_id,
            producer_id = %producer_id,
            action = action.as_str(),
            "Producer state changed"
        );
        Ok(())
    }

    async fn handle_restart_ice(
        &mut self,
        peer_id: PeerId,
        transport_id: TransportId,
    ) -> Result<IceParameters, SfuError> {
        let entry = self
            .peer_mut(peer_id)?
            .transport_mut(transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.to_string()))?;

        Ok(entry.transport.restart_ice().await?)
    }

    /// Close every consumer, in any peer, bound to `producer_id`.
    async fn close_bound_consumers(&mut self, producer_id: ProducerId) {
        let mut detached = Vec::new();
        for peer in self.peers.values_mut() {
            detached.extend(peer.remove_consumers_of(producer_id));
        }
        for consumer in detached {
            consumer.close().await;
            self.metrics.consumer_closed();
        }
    }

    /// Propagate a cascade: close consumers bound to the released producers
    /// and announce each closure.
    async fn finish_cascade(&mut self, owner: PeerId, closed: ClosedResources, audience: Audience) {
        for _ in 0..closed.consumers {
            self.metrics.consumer_closed();
        }
        for (producer_id, kind) in closed.producers {
            self.metrics.producer_closed();
            self.close_bound_consumers(producer_id).await;
            self.broadcast(
                audience,
                PushEvent::ProducerClosed(ProducerEvent {
                    producer_id,
                    peer_id: owner,
                    kind,
                }),
            );
        }
    }

    async fn handle_leave(&mut self, peer_id: PeerId) {
        let Some(session) = self.peers.remove(&peer_id) else {
            debug!(
                target: "sfu.actor.room",
                room_code = %self.room_code,
                peer_id = %peer_id,
                "Leave for unknown peer"
            );
            return;
        };

        let summary = session.summary();
        let closed = session.close().await;
        self.metrics.peer_left();

        // The departed peer is no longer in `peers`, so Everyone means the
        // remaining members.
        self.finish_cascade(peer_id, closed, Audience::Everyone)
            .await;
        self.broadcast(Audience::Everyone, PushEvent::PeerLeft(summary));

        info!(
            target: "sfu.actor.room",
            room_code = %self.room_code,
            peer_id = %peer_id,
            remaining_peers = self.peers.len(),
            "Peer left"
        );
    }

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::NegotiationFailed {
                transport_id,
                state,
            } => {
                let owner = self
                    .peers
                    .values_mut()
                    .find_map(|p| p.take_transport(transport_id).map(|t| (p.peer_id, t)));
                let Some((owner, transport)) = owner else {
                    return;
                };

                warn!(
                    target: "sfu.actor.room",
                    room_code = %self.room_code,
                    peer_id = %owner,
                    transport_id = %transport_id,
                    state = %state,
                    "Transport negotiation failed, closing transport"
                );

                let closed = transport.close().await;
                self.finish_cascade(owner, closed, Audience::AllExcept(owner))
                    .await;
            }

            EngineEvent::ProducerClosed { producer_id } => {
                let removed = self.peers.values_mut().find_map(|p| {
                    p.remove_producer(producer_id)
                        .map(|entry| (p.peer_id, entry))
                });
                let Some((owner, entry)) = removed else {
                    return;
                };

                debug!(
                    target: "sfu.actor.room",
                    room_code = %self.room_code,
                    peer_id = %owner,
                    producer_id = %producer_id,
                    "Producer closed by engine"
                );

                entry.producer.close().await;
                self.finish_cascade(
                    owner,
                    ClosedResources {
                        producers: vec![(producer_id, entry.kind)],
                        ..ClosedResources::default()
                    },
                    Audience::AllExcept(owner),
                )
                .await;
            }
        }
    }

    fn get_state(&self) -> RoomState {
        let mut sessions: Vec<&PeerSession> = self.peers.values().collect();
        sessions.sort_by_key(|p| p.joined_seq);

        let mut producers: Vec<(u64, ProducerSummary)> = sessions
            .iter()
            .copied()
            .flat_map(PeerSession::producer_summaries)
            .collect();
        producers.sort_by_key(|(seq, _)| *seq);

        RoomState {
            room_code: self.room_code.clone(),
            generation: self.generation,
            peers: sessions.iter().map(|p| p.summary()).collect(),
            producers: producers.into_iter().map(|(_, s)| s).collect(),
            paused_producers: sessions
                .iter()
                .copied()
                .flat_map(PeerSession::paused_producers)
                .collect(),
            consumer_count: sessions.iter().map(|p| p.consumer_count()).sum(),
            has_routing_context: self.routing.is_some(),
            push_seq: self.push_seq,
        }
    }

    /// Tear the room down once no peer is left.
    async fn close_if_empty(&mut self) {
        if !self.peers.is_empty() || self.closed {
            return;
        }

        self.closed = true;
        self.cancel_token.cancel();
        if let Some(routing) = self.routing.take() {
            routing.close().await;
        }

        let _ = self
            .registry
            .send(RegistryMessage::RemoveIfEmpty {
                room_code: self.room_code.clone(),
                generation: self.generation,
            })
            .await;

        info!(
            target: "sfu.actor.room",
            room_code = %self.room_code,
            "Room empty, released"
        );
    }

    /// Close every session without announcing anything (SFU shutdown).
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "sfu.actor.room",
            room_code = %self.room_code,
            peers = self.peers.len(),
            "Performing graceful shutdown"
        );

        self.closed = true;
        for (_, session) in self.peers.drain() {
            let closed = session.close().await;
            self.metrics.peer_left();
            for _ in 0..closed.consumers {
                self.metrics.consumer_closed();
            }
            for _ in &closed.producers {
                self.metrics.producer_closed();
            }
        }

        if let Some(routing) = self.routing.take() {
            if tokio::time::timeout(ROUTING_CLOSE_TIMEOUT, routing.close())
                .await
                .is_err()
            {
                warn!(
                    target: "sfu.actor.room",
                    room_code = %self.room_code,
                    "Routing context close timed out"
                );
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::actors::connection::ConnectionActor;
    use crate::engine::{LocalEngineConfig, LocalMediaEngine};
    use signaling_protocol::{
        default_media_codecs, DtlsFingerprint, DtlsRole, RtpCodecParameters, RtpEncoding,
        ServerFrame,
    };

    struct TestPeer {
        id: PeerId,
        connection: ConnectionActorHandle,
        frames: mpsc::Receiver<ServerFrame>,
    }

    impl TestPeer {
        fn new() -> Self {
            let (tx, frames) = mpsc::channel(64);
            let id = PeerId::new();
            let (connection, _task) =
                ConnectionActor::spawn(id, tx, CancellationToken::new(), ActorMetrics::new());
            Self {
                id,
                connection,
                frames,
            }
        }

        async fn next_push(&mut self) -> PushEvent {
            let frame = tokio::time::timeout(Duration::from_secs(1), self.frames.recv())
                .await
                .expect("push timed out")
                .expect("connection closed");
            let ServerFrame::Push { event, .. } = frame else {
                unreachable!("expected a push, got {frame:?}");
            };
            event
        }

        fn no_pending_push(&mut self) -> bool {
            self.frames.try_recv().is_err()
        }
    }

    fn spawn_room() -> (RoomActorHandle, mpsc::Receiver<RegistryMessage>) {
        let engine: Arc<dyn MediaEngine> =
            Arc::new(LocalMediaEngine::new(LocalEngineConfig::default()));
        let (registry_tx, registry_rx) = mpsc::channel(16);
        let (handle, _task) = RoomActor::spawn(
            RoomCode::from("ROOM1"),
            engine,
            default_media_codecs(),
            registry_tx,
            CancellationToken::new(),
            ActorMetrics::new(),
        );
        (handle, registry_rx)
    }

    fn opus_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 111,
                clock_rate: 48_000,
                channels: Some(2),
                parameters: Default::default(),
            }],
            encodings: vec![RtpEncoding::default()],
        }
    }

    fn dtls() -> DtlsParameters {
        DtlsParameters {
            role: Some(DtlsRole::Client),
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AA:BB".to_string(),
            }],
        }
    }

    async fn produce_audio(room: &RoomActorHandle, peer: &TestPeer) -> ProducerId {
        let send = room.create_transport(peer.id, Direction::Send).await.unwrap();
        room.connect_transport(peer.id, send.id, dtls()).await.unwrap();
        room.produce(peer.id, send.id, MediaKind::Audio, opus_parameters())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_join_snapshot_and_peer_joined_push() {
        let (room, _registry) = spawn_room();
        let mut alice = TestPeer::new();
        let bob = TestPeer::new();

        let first = room
            .join(alice.id, "alice".to_string(), alice.connection.clone())
            .await
            .unwrap();
        assert_eq!(first.self_id, alice.id);
        assert!(first.peers.is_empty());
        assert!(!first.rtp_capabilities.codecs.is_empty());

        let second = room
            .join(bob.id, String::new(), bob.connection.clone())
            .await
            .unwrap();
        assert_eq!(second.peers.len(), 1);
        assert_eq!(second.peers[0].peer_id, alice.id);

        let PushEvent::PeerJoined(joined) = alice.next_push().await else {
            unreachable!("expected peer-joined");
        };
        assert_eq!(joined.peer_id, bob.id);
        assert_eq!(joined.display_name, format!("user-{}", bob.id.short()));

        room.cancel();
    }

    #[tokio::test]
    async fn test_duplicate_join_rejected() {
        let (room, _registry) = spawn_room();
        let alice = TestPeer::new();

        room.join(alice.id, "alice".to_string(), alice.connection.clone())
            .await
            .unwrap();
        let again = room
            .join(alice.id, "alice".to_string(), alice.connection.clone())
            .await;
        assert!(matches!(again, Err(SfuError::DuplicateJoin(_))));

        room.cancel();
    }

    #[tokio::test]
    async fn test_create_transport_idempotent_per_direction() {
        let (room, _registry) = spawn_room();
        let alice = TestPeer::new();
        room.join(alice.id, "alice".to_string(), alice.connection.clone())
            .await
            .unwrap();

        let a = room.create_transport(alice.id, Direction::Send).await.unwrap();
        let b = room.create_transport(alice.id, Direction::Send).await.unwrap();
        let c = room.create_transport(alice.id, Direction::Recv).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);

        room.cancel();
    }

    #[tokio::test]
    async fn test_unknown_transport_and_wrong_direction() {
        let (room, _registry) = spawn_room();
        let alice = TestPeer::new();
        room.join(alice.id, "alice".to_string(), alice.connection.clone())
            .await
            .unwrap();

        let stale = room
            .connect_transport(alice.id, TransportId::new(), dtls())
            .await;
        assert!(matches!(stale, Err(SfuError::TransportNotFound(_))));

        let recv = room.create_transport(alice.id, Direction::Recv).await.unwrap();
        let wrong = room
            .produce(alice.id, recv.id, MediaKind::Audio, opus_parameters())
            .await;
        assert!(matches!(wrong, Err(SfuError::InvalidRequest(_))));

        room.cancel();
    }

    #[tokio::test]
    async fn test_produce_broadcasts_and_consume_requires_compatibility() {
        let (room, _registry) = spawn_room();
        let alice = TestPeer::new();
        let mut bob = TestPeer::new();
        room.join(alice.id, "alice".to_string(), alice.connection.clone())
            .await
            .unwrap();
        room.join(bob.id, "bob".to_string(), bob.connection.clone())
            .await
            .unwrap();

        let producer_id = produce_audio(&room, &alice).await;
        let PushEvent::NewProducer(summary) = bob.next_push().await else {
            unreachable!("expected new-producer");
        };
        assert_eq!(summary.producer_id, producer_id);
        assert_eq!(summary.peer_id, alice.id);
        assert_eq!(summary.display_name, "alice");

        let recv = room.create_transport(bob.id, Direction::Recv).await.unwrap();

        let video_only = RtpCapabilities {
            codecs: vec![CodecCapability::video("video/VP8", 90_000)],
        };
        let rejected = room
            .consume(bob.id, recv.id, producer_id, video_only)
            .await;
        assert!(matches!(rejected, Err(SfuError::IncompatibleCapabilities(_))));

        let consumed = room
            .consume(
                bob.id,
                recv.id,
                producer_id,
                RtpCapabilities {
                    codecs: default_media_codecs(),
                },
            )
            .await
            .unwrap();
        assert_eq!(consumed.producer_id, producer_id);
        assert_eq!(consumed.kind, MediaKind::Audio);
        room.resume_consumer(bob.id, consumed.consumer_id)
            .await
            .unwrap();

        let missing = room
            .consume(
                bob.id,
                recv.id,
                ProducerId::new(),
                RtpCapabilities {
                    codecs: default_media_codecs(),
                },
            )
            .await;
        assert!(matches!(missing, Err(SfuError::ProducerNotFound(_))));

        room.cancel();
    }

    #[tokio::test]
    async fn test_pause_resume_unknown_producer() {
        let (room, _registry) = spawn_room();
        let alice = TestPeer::new();
        let mut bob = TestPeer::new();
        room.join(alice.id, "alice".to_string(), alice.connection.clone())
            .await
            .unwrap();
        room.join(bob.id, "bob".to_string(), bob.connection.clone())
            .await
            .unwrap();

        let producer_id = produce_audio(&room, &alice).await;
        let _new_producer = bob.next_push().await;

        room.producer_control(alice.id, producer_id, ProducerAction::Pause)
            .await
            .unwrap();
        assert!(matches!(bob.next_push().await, PushEvent::ProducerPaused(e) if e.producer_id == producer_id));

        room.producer_control(alice.id, producer_id, ProducerAction::Resume)
            .await
            .unwrap();
        assert!(matches!(bob.next_push().await, PushEvent::ProducerResumed(_)));

        // Only the owner may control a producer.
        let foreign = room
            .producer_control(bob.id, producer_id, ProducerAction::Pause)
            .await;
        assert!(matches!(foreign, Err(SfuError::ProducerNotFound(_))));

        room.cancel();
    }

    #[tokio::test]
    async fn test_close_producer_closes_bound_consumers() {
        let (room, _registry) = spawn_room();
        let mut alice = TestPeer::new();
        let mut bob = TestPeer::new();
        room.join(alice.id, "alice".to_string(), alice.connection.clone())
            .await
            .unwrap();
        room.join(bob.id, "bob".to_string(), bob.connection.clone())
            .await
            .unwrap();
        let _bob_joined = alice.next_push().await;

        let producer_id = produce_audio(&room, &alice).await;
        let _new_producer = bob.next_push().await;
        let recv = room.create_transport(bob.id, Direction::Recv).await.unwrap();
        room.consume(
            bob.id,
            recv.id,
            producer_id,
            RtpCapabilities {
                codecs: default_media_codecs(),
            },
        )
        .await
        .unwrap();
        assert_eq!(room.get_state().await.unwrap().consumer_count, 1);

        room.producer_control(alice.id, producer_id, ProducerAction::Close)
            .await
            .unwrap();

        assert!(matches!(bob.next_push().await, PushEvent::ProducerClosed(e) if e.producer_id == producer_id));
        let state = room.get_state().await.unwrap();
        assert_eq!(state.consumer_count, 0);
        assert!(state.producers.is_empty());
        assert!(alice.no_pending_push());

        room.cancel();
    }

    #[tokio::test]
    async fn test_leave_cascades_and_empty_room_releases() {
        let (room, mut registry) = spawn_room();
        let alice = TestPeer::new();
        let mut bob = TestPeer::new();
        room.join(alice.id, "alice".to_string(), alice.connection.clone())
            .await
            .unwrap();
        room.join(bob.id, "bob".to_string(), bob.connection.clone())
            .await
            .unwrap();

        let producer_id = produce_audio(&room, &alice).await;
        let _new_producer = bob.next_push().await;

        room.leave(alice.id).await.unwrap();
        assert!(matches!(bob.next_push().await, PushEvent::ProducerClosed(e) if e.producer_id == producer_id));
        assert!(matches!(bob.next_push().await, PushEvent::PeerLeft(p) if p.peer_id == alice.id));
        assert!(bob.no_pending_push());

        room.leave(bob.id).await.unwrap();
        let message = registry.recv().await.unwrap();
        let RegistryMessage::RemoveIfEmpty { room_code, generation } = message else {
            unreachable!("expected RemoveIfEmpty");
        };
        assert_eq!(room_code.as_str(), "ROOM1");
        assert_eq!(generation, room.generation());
        assert!(room.is_cancelled());

        let late = room
            .join(PeerId::new(), "late".to_string(), bob.connection.clone())
            .await;
        assert!(matches!(late, Err(SfuError::RoomClosed)));
    }

    #[tokio::test]
    async fn test_restart_ice_returns_fresh_credentials() {
        let (room, _registry) = spawn_room();
        let alice = TestPeer::new();
        room.join(alice.id, "alice".to_string(), alice.connection.clone())
            .await
            .unwrap();
        let send = room.create_transport(alice.id, Direction::Send).await.unwrap();

        let fresh = room.restart_ice(alice.id, send.id).await.unwrap();
        assert_ne!(fresh.password, send.ice_parameters.password);

        room.cancel();
    }
}
