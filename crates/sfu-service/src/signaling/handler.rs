//! Per-connection signaling dispatch.
//!
//! A `SignalingSession` is created for every accepted signaling channel. It
//! owns the connection's outbound actor, remembers which rooms the peer has
//! joined, and turns each decoded request into exactly one ack.

use crate::actors::{
    ActorMetrics, ConnectionActor, ConnectionActorHandle, ProducerAction, RoomActorHandle,
    RoomRegistryActorHandle,
};
use crate::errors::SfuError;
use crate::observability::metrics as prom;

use common::{PeerId, RoomCode};
use signaling_protocol::{
    Ack, ClientFrame, ErrorCode, JoinRequest, NegotiationRestartedResponse, Notification,
    ProducedResponse, Request, Response, ServerFrame, TransportCreatedResponse,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outbound frames buffered between the connection actor and the socket.
const OUTBOUND_BUFFER: usize = 64;

/// Join attempts when the target room is tearing down underneath us.
const JOIN_ATTEMPTS: usize = 3;

/// How long `close` waits for the connection actor.
const CONNECTION_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Server side of one signaling channel.
pub struct SignalingSession {
    peer_id: PeerId,
    registry: RoomRegistryActorHandle,
    connection: ConnectionActorHandle,
    connection_task: Option<JoinHandle<()>>,
    /// Rooms this connection joined.
    rooms: HashMap<RoomCode, RoomActorHandle>,
}

impl SignalingSession {
    /// Open a session. Returns the receiver the socket writer drains.
    #[must_use]
    pub fn open(
        registry: RoomRegistryActorHandle,
        metrics: Arc<ActorMetrics>,
    ) -> (Self, mpsc::Receiver<ServerFrame>) {
        let peer_id = PeerId::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let cancel_token: CancellationToken = registry.child_token();
        let (connection, connection_task) =
            ConnectionActor::spawn(peer_id, outbound_tx, cancel_token, metrics);

        debug!(
            target: "sfu.signaling",
            peer_id = %peer_id,
            "Signaling session opened"
        );

        (
            Self {
                peer_id,
                registry,
                connection,
                connection_task: Some(connection_task),
                rooms: HashMap::new(),
            },
            outbound_rx,
        )
    }

    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Cancelled when the connection must end, for example after a push
    /// did not fit. The socket reader stops on it.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.connection.cancel_token()
    }

    /// Rooms currently joined by this connection.
    #[must_use]
    pub fn joined_rooms(&self) -> Vec<RoomCode> {
        self.rooms.keys().cloned().collect()
    }

    /// Handle one decoded client frame.
    pub async fn handle_frame(&mut self, frame: ClientFrame) -> Result<(), SfuError> {
        match frame {
            ClientFrame::Request { id, request } => {
                let event = request.event_name();
                let start = Instant::now();
                let result = self.handle_request(request).await;

                let ack = match result {
                    Ok(response) => {
                        prom::record_signaling_request(event, "success", start.elapsed());
                        Ack::success(response)
                    }
                    Err(e) => {
                        let code = e.error_code();
                        prom::record_signaling_request(event, code.as_str(), start.elapsed());
                        if matches!(
                            code,
                            ErrorCode::Internal | ErrorCode::EngineError | ErrorCode::EngineFatal
                        ) {
                            warn!(
                                target: "sfu.signaling",
                                peer_id = %self.peer_id,
                                event = event,
                                error = %e,
                                "Request failed"
                            );
                        } else {
                            debug!(
                                target: "sfu.signaling",
                                peer_id = %self.peer_id,
                                event = event,
                                error = %e,
                                "Request rejected"
                            );
                        }
                        Ack::failure(code, e.client_message())
                    }
                };

                self.connection.reply(id, ack).await
            }

            ClientFrame::Notify { notification } => {
                self.handle_notification(notification).await;
                Ok(())
            }
        }
    }

    async fn handle_notification(&mut self, notification: Notification) {
        match notification {
            Notification::SetReceiveCapabilities(payload) => {
                let Some(room) = self.rooms.get(&payload.room_code) else {
                    debug!(
                        target: "sfu.signaling",
                        peer_id = %self.peer_id,
                        room_code = %payload.room_code,
                        "Receive capabilities for a room not joined, ignoring"
                    );
                    return;
                };
                if let Err(e) = room
                    .set_receive_capabilities(self.peer_id, payload.rtp_capabilities)
                    .await
                {
                    debug!(
                        target: "sfu.signaling",
                        peer_id = %self.peer_id,
                        error = %e,
                        "Receive capabilities not delivered"
                    );
                }
            }
        }
    }

    async fn handle_request(&mut self, request: Request) -> Result<Response, SfuError> {
        if let Request::Join(join) = request {
            return self.handle_join(join).await;
        }

        let room = self.joined_room(request.room_code()).await?;
        let peer_id = self.peer_id;

        match request {
            Request::Join(_) => Err(SfuError::Internal("join already dispatched".to_string())),

            Request::CreateTransport(payload) => {
                let transport_options = room.create_transport(peer_id, payload.direction).await?;
                Ok(Response::TransportCreated(TransportCreatedResponse {
                    direction: payload.direction,
                    transport_options,
                }))
            }

            Request::ConnectTransport(payload) => {
                room.connect_transport(peer_id, payload.transport_id, payload.dtls_parameters)
                    .await?;
                Ok(Response::Done)
            }

            Request::Produce(payload) => {
                let producer_id = room
                    .produce(
                        peer_id,
                        payload.transport_id,
                        payload.kind,
                        payload.rtp_parameters,
                    )
                    .await?;
                Ok(Response::Produced(ProducedResponse { producer_id }))
            }

            Request::Consume(payload) => {
                let consumed = room
                    .consume(
                        peer_id,
                        payload.transport_id,
                        payload.producer_id,
                        payload.rtp_capabilities,
                    )
                    .await?;
                Ok(Response::Consumed(consumed))
            }

            Request::ResumeConsumer(payload) => {
                room.resume_consumer(peer_id, payload.consumer_id).await?;
                Ok(Response::Done)
            }

            Request::PauseProducer(payload) => {
                room.producer_control(peer_id, payload.producer_id, ProducerAction::Pause)
                    .await?;
                Ok(Response::Done)
            }

            Request::ResumeProducer(payload) => {
                room.producer_control(peer_id, payload.producer_id, ProducerAction::Resume)
                    .await?;
                Ok(Response::Done)
            }

            Request::CloseProducer(payload) => {
                room.producer_control(peer_id, payload.producer_id, ProducerAction::Close)
                    .await?;
                Ok(Response::Done)
            }

            Request::RestartNegotiation(payload) => {
                let ice_parameters = room.restart_ice(peer_id, payload.transport_id).await?;
                Ok(Response::NegotiationRestarted(
                    NegotiationRestartedResponse { ice_parameters },
                ))
            }
        }
    }

    async fn handle_join(&mut self, join: JoinRequest) -> Result<Response, SfuError> {
        if join.room_code.is_empty() {
            return Err(SfuError::InvalidRequest("room code is required".to_string()));
        }
        if self.rooms.contains_key(&join.room_code) {
            return Err(SfuError::DuplicateJoin(join.room_code.to_string()));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let room = self.registry.get_or_create(join.room_code.clone()).await?;

            match room
                .join(
                    self.peer_id,
                    join.display_name.clone(),
                    self.connection.clone(),
                )
                .await
            {
                Ok(response) => {
                    info!(
                        target: "sfu.signaling",
                        peer_id = %self.peer_id,
                        room_code = %join.room_code,
                        peers = response.peers.len(),
                        existing_producers = response.existing_producers.len(),
                        "Joined room"
                    );
                    self.rooms.insert(join.room_code, room);
                    return Ok(Response::Joined(response));
                }
                // The room emptied and tore down between lookup and join.
                Err(SfuError::RoomClosed) if attempt < JOIN_ATTEMPTS => {
                    debug!(
                        target: "sfu.signaling",
                        peer_id = %self.peer_id,
                        room_code = %join.room_code,
                        attempt = attempt,
                        "Room closed during join, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn joined_room(&self, room_code: &RoomCode) -> Result<RoomActorHandle, SfuError> {
        if let Some(room) = self.rooms.get(room_code) {
            return Ok(room.clone());
        }
        match self.registry.get_room(room_code.clone()).await? {
            Some(_) => Err(SfuError::PeerNotFound(format!(
                "{} in {room_code}",
                self.peer_id
            ))),
            None => Err(SfuError::RoomNotFound(room_code.to_string())),
        }
    }

    /// Tear the session down: leave every room, then stop the connection.
    pub async fn close(mut self) {
        for (room_code, room) in self.rooms.drain() {
            if let Err(e) = room.leave(self.peer_id).await {
                debug!(
                    target: "sfu.signaling",
                    peer_id = %self.peer_id,
                    room_code = %room_code,
                    error = %e,
                    "Leave failed, room already gone"
                );
            }
        }

        self.connection.cancel();
        if let Some(task) = self.connection_task.take() {
            if tokio::time::timeout(CONNECTION_CLOSE_TIMEOUT, task)
                .await
                .is_err()
            {
                warn!(
                    target: "sfu.signaling",
                    peer_id = %self.peer_id,
                    "Connection actor did not stop in time"
                );
            }
        }

        debug!(
            target: "sfu.signaling",
            peer_id = %self.peer_id,
            "Signaling session closed"
        );
    }
}
