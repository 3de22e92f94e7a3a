//! `ConnectionActor` - per-signaling-connection outbound actor.
//!
//! Each `ConnectionActor`:
//! - Serializes everything written to one client: acks and pushes
//! - Is shared by every room the peer joined
//! - Never blocks a room: pushes are offered with `try_send`
//! - Never leaves a gap: a push that does not fit cancels the connection,
//!   so the client reconnects and rejoins instead of missing an event
//!
//! # Lifecycle
//!
//! 1. Spawned when the signaling channel opens
//! 2. Runs until closed, cancelled, or the outbound writer goes away
//! 3. Dropping the outbound sender ends the socket writer task; the socket
//!    reader watches the same cancellation token

use crate::errors::SfuError;
use crate::observability::metrics as prom;

use super::messages::ConnectionMessage;
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::PeerId;
use signaling_protocol::{Ack, PushEvent, ServerFrame};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Connection mailbox size. A push beyond this closes the connection.
pub const CONNECTION_CHANNEL_BUFFER: usize = 200;

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    peer_id: PeerId,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActorHandle {
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Offer a push without waiting. Returns false if it was not queued.
    ///
    /// A full mailbox means the client has fallen behind. The push is lost,
    /// so the connection is cancelled and the client rebuilds its view by
    /// rejoining.
    pub fn push(&self, seq: u64, event: PushEvent) -> bool {
        if self.cancel_token.is_cancelled() {
            return false;
        }

        let event_name = event.event_name();
        match self.sender.try_send(ConnectionMessage::Push { seq, event }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.mailbox.record_drop();
                prom::record_push_dropped(event_name);
                warn!(
                    target: "sfu.actor.connection",
                    peer_id = %self.peer_id,
                    event = event_name,
                    seq = seq,
                    "Connection mailbox full, closing connection"
                );
                self.cancel_token.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    target: "sfu.actor.connection",
                    peer_id = %self.peer_id,
                    event = event_name,
                    "Push to closed connection discarded"
                );
                false
            }
        }
    }

    /// Deliver the ack for request `id`.
    pub async fn reply(&self, id: u64, ack: Ack) -> Result<(), SfuError> {
        self.sender
            .send(ConnectionMessage::Reply { id, ack })
            .await
            .map_err(|e| SfuError::ChannelClosed(format!("channel send failed: {e}")))
    }

    pub async fn close(&self, reason: String) -> Result<(), SfuError> {
        self.sender
            .send(ConnectionMessage::Close { reason })
            .await
            .map_err(|e| SfuError::ChannelClosed(format!("channel send failed: {e}")))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Resolves once the connection is cancelled.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    peer_id: PeerId,
    receiver: mpsc::Receiver<ConnectionMessage>,
    /// Used to measure the mailbox.
    self_sender: mpsc::WeakSender<ConnectionMessage>,
    /// Frames for the socket writer.
    outbound: mpsc::Sender<ServerFrame>,
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActor {
    /// Spawn a new connection actor writing to `outbound`.
    pub fn spawn(
        peer_id: PeerId,
        outbound: mpsc::Sender<ServerFrame>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);
        let mailbox = Arc::new(MailboxMonitor::new(
            ActorType::Connection,
            peer_id.to_string(),
        ));

        let actor = Self {
            peer_id,
            receiver,
            self_sender: sender.downgrade(),
            outbound,
            cancel_token: cancel_token.clone(),
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            peer_id,
            mailbox,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "sfu.actor.connection", fields(peer_id = %self.peer_id))]
    async fn run(mut self) {
        debug!(
            target: "sfu.actor.connection",
            peer_id = %self.peer_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "sfu.actor.connection",
                        peer_id = %self.peer_id,
                        "ConnectionActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.sample(&self.self_sender);
                            let should_exit = self.handle_message(message).await;
                            self.mailbox.record_processed();
                            self.metrics.record_message_processed();

                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "sfu.actor.connection",
                                peer_id = %self.peer_id,
                                "ConnectionActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.connection",
            peer_id = %self.peer_id,
            messages_processed = self.mailbox.messages_processed(),
            pushes_dropped = self.mailbox.messages_dropped(),
            "ConnectionActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ConnectionMessage) -> bool {
        let frame = match message {
            ConnectionMessage::Push { seq, event } => ServerFrame::Push { seq, event },
            ConnectionMessage::Reply { id, ack } => ServerFrame::Ack { id, ack },
            ConnectionMessage::Close { reason } => {
                debug!(
                    target: "sfu.actor.connection",
                    peer_id = %self.peer_id,
                    reason = %reason,
                    "Closing connection"
                );
                return true;
            }
        };

        // A stalled writer must not outlive cancellation.
        tokio::select! {
            () = self.cancel_token.cancelled() => true,
            sent = self.outbound.send(frame) => {
                if sent.is_err() {
                    debug!(
                        target: "sfu.actor.connection",
                        peer_id = %self.peer_id,
                        "Outbound writer gone, exiting"
                    );
                }
                sent.is_err()
            }
        }
    }
}
