//! Actor metrics and mailbox monitoring.
//!
//! Mailbox depth thresholds:
//!
//! | Actor Type | Normal | Warning | Critical |
//! |------------|--------|---------|----------|
//! | Room       | < 100  | 100-500 | > 500    |
//! | Connection | < 50   | 50-200  | > 200    |
//!
//! The registry uses the room thresholds. Gauges are mirrored to the
//! Prometheus recorder (see [`crate::observability::metrics`]).

use crate::observability::metrics as prom;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Mailbox depth thresholds for room actors.
pub const ROOM_MAILBOX_NORMAL: usize = 100;
pub const ROOM_MAILBOX_WARNING: usize = 500;

/// Mailbox depth thresholds for connection actors.
pub const CONNECTION_MAILBOX_NORMAL: usize = 50;
pub const CONNECTION_MAILBOX_WARNING: usize = 200;

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// `RoomRegistryActor` (singleton).
    Registry,
    /// `RoomActor` (one per room).
    Room,
    /// `ConnectionActor` (one per peer session).
    Connection,
}

impl ActorType {
    /// Label value for metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Registry => "registry",
            ActorType::Room => "room",
            ActorType::Connection => "connection",
        }
    }

    #[must_use]
    pub const fn warning_threshold(&self) -> usize {
        match self {
            ActorType::Registry | ActorType::Room => ROOM_MAILBOX_WARNING,
            ActorType::Connection => CONNECTION_MAILBOX_WARNING,
        }
    }

    #[must_use]
    pub const fn normal_threshold(&self) -> usize {
        match self {
            ActorType::Registry | ActorType::Room => ROOM_MAILBOX_NORMAL,
            ActorType::Connection => CONNECTION_MAILBOX_NORMAL,
        }
    }
}

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

/// Tracks queue depth of one actor's mailbox.
///
/// Depth is read from the channel itself each time the actor takes a
/// message, so it counts what senders have queued behind that message.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    /// Room code, peer id, or sfu id.
    actor_id: String,
    depth: AtomicUsize,
    messages_processed: AtomicU64,
    /// Messages dropped due to backpressure.
    messages_dropped: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Record how many messages are waiting in the mailbox `sender` feeds.
    ///
    /// Weak so the monitor never keeps the actor's mailbox open.
    pub fn sample<T>(&self, sender: &mpsc::WeakSender<T>) {
        let queued = sender
            .upgrade()
            .map_or(0, |s| s.max_capacity().saturating_sub(s.capacity()));
        self.record_depth(queued);
    }

    /// Record the current mailbox depth, logging threshold crossings.
    pub fn record_depth(&self, depth: usize) {
        let previous = self.depth.swap(depth, Ordering::Relaxed);
        prom::set_actor_mailbox_depth(self.actor_type.as_str(), depth);

        let level = self.level_for_depth(depth);
        if level == self.level_for_depth(previous) {
            return;
        }
        match level {
            MailboxLevel::Critical => warn!(
                target: "sfu.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth = depth,
                threshold = self.actor_type.warning_threshold(),
                "Mailbox depth critical"
            ),
            MailboxLevel::Warning => debug!(
                target: "sfu.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth = depth,
                "Mailbox depth elevated"
            ),
            MailboxLevel::Normal => {}
        }
    }

    pub fn record_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an outbound message dropped because the receiver is full.
    pub fn record_drop(&self) {
        let dropped = self.messages_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            target: "sfu.actor.mailbox",
            actor_type = self.actor_type.as_str(),
            actor_id = %self.actor_id,
            dropped = dropped,
            "Message dropped due to backpressure"
        );
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }

    fn level_for_depth(&self, depth: usize) -> MailboxLevel {
        if depth > self.actor_type.warning_threshold() {
            MailboxLevel::Critical
        } else if depth > self.actor_type.normal_threshold() {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Process-wide counters for the actor system.
///
/// Shared between every actor; each change is mirrored to the matching
/// Prometheus gauge.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    pub active_rooms: AtomicUsize,
    pub active_peers: AtomicUsize,
    pub active_producers: AtomicUsize,
    pub active_consumers: AtomicUsize,
    /// Total actor panics (indicates bugs).
    pub actor_panics: AtomicU64,
    pub total_messages_processed: AtomicU64,
}

fn decrement(counter: &AtomicUsize) -> usize {
    // Saturating so a double close never wraps the gauge.
    let mut current = counter.load(Ordering::Relaxed);
    loop {
        let next = current.saturating_sub(1);
        match counter.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => current = actual,
        }
    }
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn room_created(&self) {
        let count = self.active_rooms.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_rooms_active(count as u64);
    }

    pub fn room_removed(&self) {
        prom::set_rooms_active(decrement(&self.active_rooms) as u64);
    }

    pub fn peer_joined(&self) {
        let count = self.active_peers.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_peers_active(count as u64);
    }

    pub fn peer_left(&self) {
        prom::set_peers_active(decrement(&self.active_peers) as u64);
    }

    pub fn producer_created(&self) {
        let count = self.active_producers.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_producers_active(count as u64);
    }

    pub fn producer_closed(&self) {
        prom::set_producers_active(decrement(&self.active_producers) as u64);
    }

    pub fn consumer_created(&self) {
        let count = self.active_consumers.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_consumers_active(count as u64);
    }

    pub fn consumer_closed(&self) {
        prom::set_consumers_active(decrement(&self.active_consumers) as u64);
    }

    /// Record an actor panic.
    pub fn record_panic(&self, actor_type: ActorType) {
        let total = self.actor_panics.fetch_add(1, Ordering::Relaxed) + 1;
        prom::record_actor_panic(actor_type.as_str());
        tracing::error!(
            target: "sfu.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = total,
            "Actor panic detected - indicates bug, investigation required"
        );
    }

    pub fn record_message_processed(&self) {
        self.total_messages_processed
            .fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.active_peers.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_type_as_str() {
        assert_eq!(ActorType::Registry.as_str(), "registry");
        assert_eq!(ActorType::Room.as_str(), "room");
        assert_eq!(ActorType::Connection.as_str(), "connection");
    }

    #[test]
    fn test_actor_type_thresholds() {
        assert_eq!(ActorType::Room.normal_threshold(), 100);
        assert_eq!(ActorType::Room.warning_threshold(), 500);
        assert_eq!(ActorType::Registry.warning_threshold(), 500);
        assert_eq!(ActorType::Connection.normal_threshold(), 50);
        assert_eq!(ActorType::Connection.warning_threshold(), 200);
    }

    #[test]
    fn test_mailbox_monitor_records_depth() {
        let monitor = MailboxMonitor::new(ActorType::Room, "ROOM1");
        assert_eq!(monitor.current_depth(), 0);

        monitor.record_depth(3);
        assert_eq!(monitor.current_depth(), 3);
        monitor.record_depth(1);
        assert_eq!(monitor.current_depth(), 1);

        monitor.record_processed();
        monitor.record_processed();
        assert_eq!(monitor.messages_processed(), 2);
    }

    #[test]
    fn test_mailbox_monitor_levels() {
        let monitor = MailboxMonitor::new(ActorType::Connection, "peer-1");
        assert_eq!(monitor.level_for_depth(0), MailboxLevel::Normal);
        assert_eq!(monitor.level_for_depth(50), MailboxLevel::Normal);
        assert_eq!(monitor.level_for_depth(75), MailboxLevel::Warning);
        assert_eq!(monitor.level_for_depth(201), MailboxLevel::Critical);

        let monitor = MailboxMonitor::new(ActorType::Registry, "sfu-1");
        assert_eq!(monitor.level_for_depth(101), MailboxLevel::Warning);
        assert_eq!(monitor.level_for_depth(501), MailboxLevel::Critical);
    }

    #[test]
    fn test_sample_counts_queued_messages() {
        let (tx, mut rx) = mpsc::channel::<u32>(10);
        let weak = tx.downgrade();
        let monitor = MailboxMonitor::new(ActorType::Room, "ROOM1");

        for i in 0..4 {
            tx.try_send(i).unwrap();
        }
        monitor.sample(&weak);
        assert_eq!(monitor.current_depth(), 4);

        rx.try_recv().unwrap();
        monitor.sample(&weak);
        assert_eq!(monitor.current_depth(), 3);

        // Once every sender is gone there is nothing left to measure
        drop(tx);
        monitor.sample(&weak);
        assert_eq!(monitor.current_depth(), 0);
    }

    #[test]
    fn test_depth_gauge_reaches_recorder() {
        use metrics_util::debugging::{DebugValue, DebuggingRecorder};

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let monitor = MailboxMonitor::new(ActorType::Room, "ROOM1");

        metrics::with_local_recorder(&recorder, || monitor.record_depth(120));

        let depth = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .find(|(key, _, _, _)| key.key().name() == "sfu_actor_mailbox_depth")
            .map(|(_, _, _, value)| value);
        assert!(matches!(depth, Some(DebugValue::Gauge(v)) if (v.into_inner() - 120.0).abs() < f64::EPSILON));
    }

    #[test]
    fn test_mailbox_monitor_drop() {
        let monitor = MailboxMonitor::new(ActorType::Connection, "peer-1");
        monitor.record_drop();
        monitor.record_drop();
        assert_eq!(monitor.messages_dropped(), 2);
    }

    #[test]
    fn test_actor_metrics_counts() {
        let metrics = ActorMetrics::new();

        metrics.room_created();
        metrics.peer_joined();
        metrics.peer_joined();
        metrics.producer_created();
        metrics.consumer_created();
        assert_eq!(metrics.active_rooms.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.peer_count(), 2);

        metrics.peer_left();
        metrics.producer_closed();
        metrics.consumer_closed();
        metrics.room_removed();
        assert_eq!(metrics.peer_count(), 1);
        assert_eq!(metrics.active_producers.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.active_consumers.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.active_rooms.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_actor_metrics_decrement_saturates() {
        let metrics = ActorMetrics::new();
        metrics.consumer_closed();
        assert_eq!(metrics.active_consumers.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_actor_metrics_panics() {
        let metrics = ActorMetrics::new();
        metrics.record_panic(ActorType::Room);
        metrics.record_panic(ActorType::Connection);
        assert_eq!(metrics.actor_panics.load(Ordering::Relaxed), 2);
    }
}
