//! Signaling channel seam.
//!
//! A channel carries correlated requests (exactly one ack each) and
//! fire-and-forget notifications to the SFU, and surfaces connectivity
//! changes and ordered pushes as [`ChannelEvent`]s. Channels reconnect on
//! their own; pending requests fail with [`ClientError::ChannelClosed`] when
//! the connection drops.

pub mod ws;

use crate::errors::ClientError;

use async_trait::async_trait;
use parking_lot::Mutex;
use signaling_protocol::{Ack, Notification, PushEvent, Request, Response};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{oneshot, watch};

pub use ws::WsSignalingChannel;

/// Connectivity changes and pushes, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected,
    Disconnected { reason: String },
    Push { seq: u64, event: PushEvent },
}

/// Request/notify transport to the SFU.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Wait until the channel is connected.
    ///
    /// Fails with `ConnectTimeout` after `timeout`, or `ChannelClosed` if the
    /// channel was closed for good.
    async fn wait_connected(&self, timeout: Duration) -> Result<(), ClientError>;

    /// Send a request and wait for its ack. `{ok:false}` acks become
    /// [`ClientError::Rejected`].
    async fn request(&self, request: Request) -> Result<Response, ClientError>;

    async fn notify(&self, notification: Notification) -> Result<(), ClientError>;

    /// Close for good. Stops reconnecting.
    fn close(&self);
}

/// Map an ack to the request outcome.
///
/// # Errors
///
/// Returns `ClientError::Rejected` carrying the server code when `ok` is false.
pub fn ack_to_result(ack: Ack) -> Result<Response, ClientError> {
    ack.into_result().map_err(|body| ClientError::Rejected {
        code: body.code,
        message: body.message,
    })
}

/// Wait on a connectivity flag.
///
/// # Errors
///
/// `ConnectTimeout` if the flag stays false for `timeout`, `ChannelClosed` if
/// its sender is gone.
pub async fn wait_until_connected(
    mut connected: watch::Receiver<bool>,
    timeout: Duration,
) -> Result<(), ClientError> {
    match tokio::time::timeout(timeout, connected.wait_for(|up| *up)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err(ClientError::ChannelClosed),
        Err(_) => Err(ClientError::ConnectTimeout(timeout)),
    }
}

/// Matches acks to outstanding requests by id.
#[derive(Debug)]
pub struct Correlator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Ack>>>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a request id and the receiver its ack will arrive on.
    pub fn register(&self) -> (u64, oneshot::Receiver<Ack>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        (id, rx)
    }

    /// Deliver an ack. Returns false for unknown (or already failed) ids.
    pub fn resolve(&self, id: u64, ack: Ack) -> bool {
        let Some(tx) = self.pending.lock().remove(&id) else {
            return false;
        };
        tx.send(ack).is_ok()
    }

    /// Forget a request that was never sent.
    pub fn cancel(&self, id: u64) {
        self.pending.lock().remove(&id);
    }

    /// Fail every outstanding request. Returns how many were pending.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        drained.len()
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}
