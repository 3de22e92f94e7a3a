//! `RoomRegistryActor` - singleton supervisor for room actors.
//!
//! The `RoomRegistryActor` is the top-level actor of the SFU:
//!
//! - Singleton per SFU instance
//! - Maps room codes to live `RoomActor`s, spawning them on first join
//! - Drops a room when it reports itself empty (generation-checked)
//! - Owns the root `CancellationToken` for graceful shutdown
//! - Monitors child actor health (panic detection via `JoinHandle`)
//!
//! Because every lookup and removal goes through this one mailbox, two
//! concurrent first joins for the same code always land on the same room.
//!
//! # Graceful Shutdown
//!
//! On SIGTERM the registry stops accepting rooms, cancels the root token
//! (propagating to every room) and waits for the rooms to release their
//! routing contexts.

use crate::engine::MediaEngine;
use crate::errors::SfuError;

use super::messages::{RegistryMessage, RegistryStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomActorHandle};

use common::RoomCode;
use signaling_protocol::CodecCapability;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// How long shutdown waits for each room task.
const ROOM_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a background cleanup waits for a replaced room task.
const ROOM_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the `RoomRegistryActor`.
#[derive(Clone, Debug)]
pub struct RoomRegistryActorHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryActorHandle {
    /// Create a new `RoomRegistryActor` and return a handle to it.
    ///
    /// # Arguments
    ///
    /// * `sfu_id` - SFU instance ID
    /// * `engine` - Media engine rooms create routing contexts on
    /// * `codecs` - Codec set of every routing context
    /// * `max_rooms` - Concurrent room limit
    /// * `metrics` - Shared actor metrics
    #[must_use]
    pub fn new(
        sfu_id: String,
        engine: Arc<dyn MediaEngine>,
        codecs: Vec<CodecCapability>,
        max_rooms: usize,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = RoomRegistryActor {
            mailbox: MailboxMonitor::new(ActorType::Registry, &sfu_id),
            sfu_id,
            receiver,
            self_sender: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            engine,
            codecs,
            max_rooms,
            rooms: HashMap::new(),
            accepting_new: true,
            metrics,
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Return the live room for `room_code`, creating it if needed.
    pub async fn get_or_create(&self, room_code: RoomCode) -> Result<RoomActorHandle, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetOrCreate {
                room_code,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Look up a live room without creating one.
    pub async fn get_room(&self, room_code: RoomCode) -> Result<Option<RoomActorHandle>, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetRoom {
                room_code,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Drop the room if `generation` still names the registered instance.
    pub async fn remove_if_empty(
        &self,
        room_code: RoomCode,
        generation: Uuid,
    ) -> Result<(), SfuError> {
        self.sender
            .send(RegistryMessage::RemoveIfEmpty {
                room_code,
                generation,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))
    }

    pub async fn get_status(&self) -> Result<RegistryStatus, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Initiate graceful shutdown.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Shutdown {
                deadline,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token for tasks that must stop with the registry.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    sfu_id: String,
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Given to rooms so they can report themselves empty, and used to
    /// measure the mailbox. Weak so the registry does not keep its own
    /// mailbox open.
    self_sender: mpsc::WeakSender<RegistryMessage>,
    /// Root token.
    cancel_token: CancellationToken,
    engine: Arc<dyn MediaEngine>,
    codecs: Vec<CodecCapability>,
    max_rooms: usize,
    rooms: HashMap<RoomCode, ManagedRoom>,
    accepting_new: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomRegistryActor {
    #[instrument(skip_all, name = "sfu.actor.registry", fields(sfu_id = %self.sfu_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            "RoomRegistryActor started"
        );

        loop {
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.registry",
                        sfu_id = %self.sfu_id,
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
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
                                target: "sfu.actor.registry",
                                sfu_id = %self.sfu_id,
                                "RoomRegistryActor channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::GetOrCreate {
                room_code,
                respond_to,
            } => {
                let result = self.get_or_create(room_code);
                let _ = respond_to.send(result);
            }

            RegistryMessage::GetRoom {
                room_code,
                respond_to,
            } => {
                let room = self
                    .rooms
                    .get(&room_code)
                    .filter(|managed| !managed.handle.is_cancelled())
                    .map(|managed| managed.handle.clone());
                let _ = respond_to.send(room);
            }

            RegistryMessage::RemoveIfEmpty {
                room_code,
                generation,
            } => {
                self.remove_if_empty(&room_code, generation);
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            RegistryMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                let result = self.initiate_shutdown(deadline);
                let _ = respond_to.send(result);
            }
        }
    }

    fn get_or_create(&mut self, room_code: RoomCode) -> Result<RoomActorHandle, SfuError> {
        if !self.accepting_new {
            return Err(SfuError::Draining);
        }

        if let Some(managed) = self.rooms.get(&room_code) {
            if !managed.handle.is_cancelled() {
                return Ok(managed.handle.clone());
            }
            // Torn down but its RemoveIfEmpty has not arrived yet.
            if let Some(stale) = self.rooms.remove(&room_code) {
                self.retire(room_code.clone(), stale);
            }
        }

        if self.rooms.len() >= self.max_rooms {
            warn!(
                target: "sfu.actor.registry",
                sfu_id = %self.sfu_id,
                room_count = self.rooms.len(),
                max_rooms = self.max_rooms,
                "Room capacity reached"
            );
            return Err(SfuError::CapacityExceeded);
        }

        let registry = self
            .self_sender
            .upgrade()
            .ok_or_else(|| SfuError::Internal("registry mailbox closed".to_string()))?;

        let (handle, task_handle) = RoomActor::spawn(
            room_code.clone(),
            Arc::clone(&self.engine),
            self.codecs.clone(),
            registry,
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        self.rooms.insert(
            room_code.clone(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
            },
        );
        self.metrics.room_created();

        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            room_code = %room_code,
            generation = %handle.generation(),
            total_rooms = self.rooms.len(),
            "Room actor created"
        );

        Ok(handle)
    }

    fn remove_if_empty(&mut self, room_code: &RoomCode, generation: Uuid) {
        let matches = self
            .rooms
            .get(room_code)
            .is_some_and(|managed| managed.handle.generation() == generation);

        if !matches {
            debug!(
                target: "sfu.actor.registry",
                sfu_id = %self.sfu_id,
                room_code = %room_code,
                generation = %generation,
                "Stale removal ignored"
            );
            return;
        }

        if let Some(managed) = self.rooms.remove(room_code) {
            self.retire(room_code.clone(), managed);
            info!(
                target: "sfu.actor.registry",
                sfu_id = %self.sfu_id,
                room_code = %room_code,
                total_rooms = self.rooms.len(),
                "Room removed"
            );
        }
    }

    /// Cancel a room that left the map and reap its task off the loop.
    fn retire(&self, room_code: RoomCode, managed: ManagedRoom) {
        managed.handle.cancel();
        self.metrics.room_removed();

        let sfu_id = self.sfu_id.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(ROOM_CLEANUP_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.registry",
                        sfu_id = %sfu_id,
                        room_code = %room_code,
                        "Room actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.registry",
                        sfu_id = %sfu_id,
                        room_code = %room_code,
                        error = ?e,
                        "Room actor task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.registry",
                        sfu_id = %sfu_id,
                        room_code = %room_code,
                        "Room actor task cleanup timed out"
                    );
                }
            }
        });
    }

    fn get_status(&self) -> RegistryStatus {
        RegistryStatus {
            room_count: self.rooms.len(),
            peer_count: self.metrics.peer_count(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    fn initiate_shutdown(&mut self, deadline: Duration) -> Result<(), SfuError> {
        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            room_count = self.rooms.len(),
            deadline_secs = deadline.as_secs(),
            "Initiating graceful shutdown"
        );

        self.accepting_new = false;
        self.cancel_token.cancel();

        Ok(())
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            room_count = self.rooms.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        for managed in self.rooms.values() {
            managed.handle.cancel();
        }

        for (room_code, managed) in self.rooms.drain() {
            match tokio::time::timeout(ROOM_SHUTDOWN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.registry",
                        sfu_id = %self.sfu_id,
                        room_code = %room_code,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.registry",
                        sfu_id = %self.sfu_id,
                        room_code = %room_code,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.registry",
                        sfu_id = %self.sfu_id,
                        room_code = %room_code,
                        "Room actor shutdown timed out"
                    );
                }
            }
            self.metrics.room_removed();
        }

        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            "Graceful shutdown complete"
        );
    }

    /// Reap room tasks that ended without going through `RemoveIfEmpty`.
    async fn check_room_health(&mut self) {
        let finished: Vec<RoomCode> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(code, _)| code.clone())
            .collect();

        for room_code in finished {
            let Some(managed) = self.rooms.remove(&room_code) else {
                continue;
            };

            match managed.task_handle.await {
                Ok(()) => {
                    debug!(
                        target: "sfu.actor.registry",
                        sfu_id = %self.sfu_id,
                        room_code = %room_code,
                        "Room actor exited"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "sfu.actor.registry",
                            sfu_id = %self.sfu_id,
                            room_code = %room_code,
                            error = ?join_error,
                            "Room actor panicked"
                        );
                        self.metrics.record_panic(ActorType::Room);
                    }
                }
            }

            self.metrics.room_removed();
        }
    }
}
