//! In-process signaling channel.
//!
//! [`LoopbackChannel`] implements the client's `SignalingChannel` on top of
//! a real [`SignalingSession`], skipping the socket. Tests can drop and
//! re-establish the connection to exercise the rejoin path, queue
//! rejections for specific request events, hold a request in flight, and
//! deliver pushes of their own.
//!
//! # Example
//!
//! ```rust,ignore
//! let server = TestSfu::new();
//! let (channel, events) = LoopbackChannel::connect(&server);
//! let (controller, session_events) =
//!     SessionController::start(config, channel.clone(), events, Arc::new(FakeDevice::new()));
//!
//! controller.join().await?;
//! channel.drop_connection().await;   // server cleans up the peer
//! channel.reconnect();               // controller rejoins
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use sfu_client::channel::{ack_to_result, wait_until_connected, ChannelEvent, Correlator};
use sfu_client::{ClientError, SignalingChannel};
use sfu_service::actors::{ActorMetrics, RoomRegistryActorHandle};
use sfu_service::signaling::SignalingSession;
use signaling_protocol::{
    ClientFrame, ErrorCode, Notification, PushEvent, Request, Response, ServerFrame,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::server::TestSfu;

/// One simulated connection.
struct Link {
    frames: mpsc::UnboundedSender<ClientFrame>,
    cancel_token: CancellationToken,
    /// Resolves to true if the server ended the session and it was reported.
    task: JoinHandle<bool>,
}

struct Shared {
    correlator: Correlator,
    events: mpsc::UnboundedSender<ChannelEvent>,
    connected: watch::Sender<bool>,
}

/// Signaling channel wired straight into a registry.
pub struct LoopbackChannel {
    registry: RoomRegistryActorHandle,
    metrics: Arc<ActorMetrics>,
    shared: Arc<Shared>,
    link: Mutex<Option<Link>>,
    closed: CancellationToken,
    rejections: Mutex<HashMap<&'static str, VecDeque<ErrorCode>>>,
    holds: Mutex<HashMap<&'static str, VecDeque<oneshot::Receiver<()>>>>,
    sent: Mutex<Vec<&'static str>>,
}

impl LoopbackChannel {
    /// Create a connected channel to `server`.
    #[must_use]
    pub fn connect(server: &TestSfu) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            registry: server.registry.clone(),
            metrics: Arc::clone(&server.metrics),
            shared: Arc::new(Shared {
                correlator: Correlator::new(),
                events: events_tx,
                connected: watch::channel(false).0,
            }),
            link: Mutex::new(None),
            closed: CancellationToken::new(),
            rejections: Mutex::new(HashMap::new()),
            holds: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
        });
        channel.reconnect();
        (channel, events_rx)
    }

    /// Establish a fresh connection (new server-side session).
    pub fn reconnect(&self) {
        if self.closed.is_cancelled() {
            return;
        }

        let (session, outbound) = SignalingSession::open(self.registry.clone(), Arc::clone(&self.metrics));
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();
        let task = tokio::spawn(serve(
            session,
            outbound,
            frames_rx,
            Arc::clone(&self.shared),
            cancel_token.clone(),
        ));

        let previous = self.link.lock().replace(Link {
            frames: frames_tx,
            cancel_token,
            task,
        });
        if let Some(previous) = previous {
            previous.cancel_token.cancel();
        }

        self.shared.connected.send_replace(true);
        let _ = self.shared.events.send(ChannelEvent::Connected);
    }

    /// Drop the connection. Returns once the server has cleaned up the peer.
    pub async fn drop_connection(&self) {
        let link = self.link.lock().take();
        let Some(link) = link else {
            return;
        };

        self.shared.connected.send_replace(false);
        self.shared.correlator.fail_all();
        link.cancel_token.cancel();
        let already_reported = link.task.await.unwrap_or(false);

        if !already_reported {
            let _ = self.shared.events.send(ChannelEvent::Disconnected {
                reason: "simulated drop".to_string(),
            });
        }
    }

    /// Reject the next `event` request with `code` without reaching the SFU.
    pub fn reject_next(&self, event: &'static str, code: ErrorCode) {
        self.rejections.lock().entry(event).or_default().push_back(code);
    }

    /// Hold the next `event` request before it reaches the SFU.
    ///
    /// The request is counted as sent right away and goes out once the
    /// returned sender fires or is dropped, on whatever connection is
    /// current by then.
    pub fn hold_next(&self, event: &'static str) -> oneshot::Sender<()> {
        let (release, held) = oneshot::channel();
        self.holds.lock().entry(event).or_default().push_back(held);
        release
    }

    /// Hand `event` to the client as if the SFU had pushed it.
    pub fn deliver_push(&self, seq: u64, event: PushEvent) {
        let _ = self.shared.events.send(ChannelEvent::Push { seq, event });
    }

    /// Event names of every request sent so far, in order.
    #[must_use]
    pub fn sent_requests(&self) -> Vec<&'static str> {
        self.sent.lock().clone()
    }

    /// How many `event` requests were sent so far.
    #[must_use]
    pub fn count(&self, event: &str) -> usize {
        self.sent.lock().iter().filter(|e| **e == event).count()
    }

    fn send(&self, frame: ClientFrame) -> bool {
        match self.link.lock().as_ref() {
            Some(link) => link.frames.send(frame).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl SignalingChannel for LoopbackChannel {
    fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    async fn wait_connected(&self, timeout: Duration) -> Result<(), ClientError> {
        if self.closed.is_cancelled() {
            return Err(ClientError::ChannelClosed);
        }
        wait_until_connected(self.shared.connected.subscribe(), timeout).await
    }

    async fn request(&self, request: Request) -> Result<Response, ClientError> {
        let event = request.event_name();
        self.sent.lock().push(event);

        let injected = self
            .rejections
            .lock()
            .get_mut(event)
            .and_then(VecDeque::pop_front);
        if let Some(code) = injected {
            return Err(ClientError::Rejected {
                code,
                message: "injected rejection".to_string(),
            });
        }

        let held = self.holds.lock().get_mut(event).and_then(VecDeque::pop_front);
        if let Some(held) = held {
            let _ = held.await;
        }

        let (id, reply) = self.shared.correlator.register();
        if !self.send(ClientFrame::Request { id, request }) {
            self.shared.correlator.cancel(id);
            return Err(ClientError::ChannelClosed);
        }
        let ack = reply.await.map_err(|_| ClientError::ChannelClosed)?;
        ack_to_result(ack)
    }

    async fn notify(&self, notification: Notification) -> Result<(), ClientError> {
        if self.send(ClientFrame::Notify { notification }) {
            Ok(())
        } else {
            Err(ClientError::ChannelClosed)
        }
    }

    fn close(&self) {
        self.closed.cancel();
        let link = self.link.lock().take();
        if let Some(link) = link {
            link.cancel_token.cancel();
        }
        self.shared.connected.send_replace(false);
        self.shared.correlator.fail_all();
    }
}

/// Run one server-side session until cancelled or the client side goes away.
///
/// If the server closes the connection first, the client is told it was
/// disconnected, as a socket close would. Returns true in that case.
async fn serve(
    mut session: SignalingSession,
    mut outbound: mpsc::Receiver<ServerFrame>,
    mut frames: mpsc::UnboundedReceiver<ClientFrame>,
    shared: Arc<Shared>,
    cancel_token: CancellationToken,
) -> bool {
    let reader_token = cancel_token.clone();
    let reader_shared = Arc::clone(&shared);
    let reader = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = reader_token.cancelled() => break,
                frame = outbound.recv() => match frame {
                    Some(ServerFrame::Ack { id, ack }) => {
                        reader_shared.correlator.resolve(id, ack);
                    }
                    Some(ServerFrame::Push { seq, event }) => {
                        let _ = reader_shared.events.send(ChannelEvent::Push { seq, event });
                    }
                    None => break,
                },
            }
        }
    });

    let server_token = session.cancel_token();
    let mut server_closed = false;
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            () = server_token.cancelled() => {
                server_closed = true;
                break;
            }
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if session.handle_frame(frame).await.is_err() {
                        server_closed = !cancel_token.is_cancelled();
                        break;
                    }
                }
                None => break,
            },
        }
    }

    cancel_token.cancel();
    session.close().await;
    let _ = reader.await;

    if server_closed {
        shared.connected.send_replace(false);
        shared.correlator.fail_all();
        let _ = shared.events.send(ChannelEvent::Disconnected {
            reason: "server closed connection".to_string(),
        });
    }
    server_closed
}
