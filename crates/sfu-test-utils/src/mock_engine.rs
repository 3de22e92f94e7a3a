//! Mock media engine for SFU testing.
//!
//! Wraps the in-process [`LocalMediaEngine`] so negotiation behaves
//! realistically, and adds:
//! - Call counting per engine operation
//! - Fault injection (fail the next N calls of an operation)
//! - Lifecycle event injection (negotiation failure, producer closed)
//! - Engine death
//!
//! # Example
//!
//! ```rust,ignore
//! use sfu_test_utils::{EngineOp, MockEngine};
//!
//! let engine = MockEngine::new();
//! engine.fail_next(EngineOp::Produce, EngineError::Rejected("boom".into()));
//!
//! // ... drive a room ...
//!
//! assert_eq!(engine.calls(EngineOp::CreateRoutingContext), 1);
//! ```

use async_trait::async_trait;
use common::{ProducerId, TransportId};
use parking_lot::Mutex;
use sfu_service::engine::{
    EngineConsumer, EngineError, EngineEvent, EngineProducer, EngineTransport, LocalEngineConfig,
    LocalMediaEngine, MediaEngine, RoutingContext,
};
use signaling_protocol::{
    CodecCapability, Direction, DtlsParameters, IceParameters, MediaKind, RtpCapabilities,
    RtpParameters, TransportOptions,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Engine operations that can be counted and failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    CreateRoutingContext,
    CreateTransport,
    Connect,
    Produce,
    Consume,
    RestartIce,
}

#[derive(Default)]
struct MockState {
    calls: Mutex<HashMap<EngineOp, usize>>,
    faults: Mutex<HashMap<EngineOp, VecDeque<EngineError>>>,
    /// Event channels of every routing context created so far
    event_senders: Mutex<Vec<mpsc::UnboundedSender<EngineEvent>>>,
    open_contexts: AtomicUsize,
}

impl MockState {
    /// Count a call and return the injected failure, if any.
    fn enter(&self, op: EngineOp) -> Result<(), EngineError> {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        match self.faults.lock().get_mut(&op).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Media engine with fault injection and call counting.
#[derive(Clone)]
pub struct MockEngine {
    inner: Arc<LocalMediaEngine>,
    state: Arc<MockState>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(LocalEngineConfig::default())
    }

    #[must_use]
    pub fn with_config(config: LocalEngineConfig) -> Self {
        Self {
            inner: Arc::new(LocalMediaEngine::new(config)),
            state: Arc::new(MockState::default()),
        }
    }

    /// Fail the next call of `op` with `error`. Calls queue up.
    pub fn fail_next(&self, op: EngineOp, error: EngineError) {
        self.state
            .faults
            .lock()
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Number of calls of `op` so far, failed ones included.
    #[must_use]
    pub fn calls(&self, op: EngineOp) -> usize {
        self.state.calls.lock().get(&op).copied().unwrap_or(0)
    }

    /// Routing contexts created and not yet closed.
    #[must_use]
    pub fn open_routing_contexts(&self) -> usize {
        self.state.open_contexts.load(Ordering::SeqCst)
    }

    /// Raise a DTLS failure for `transport_id` in every room.
    pub fn fail_negotiation(&self, transport_id: TransportId) {
        self.broadcast(EngineEvent::NegotiationFailed {
            transport_id,
            state: "failed".to_string(),
        });
    }

    /// Close `producer_id` from underneath its room.
    pub fn close_producer(&self, producer_id: ProducerId) {
        self.broadcast(EngineEvent::ProducerClosed { producer_id });
    }

    /// Kill the engine.
    pub fn kill(&self, reason: &str) {
        self.inner.report_fatal(reason);
    }

    fn broadcast(&self, event: EngineEvent) {
        self.state
            .event_senders
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    async fn create_routing_context(
        &self,
        codecs: Vec<CodecCapability>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn RoutingContext>, EngineError> {
        self.state.enter(EngineOp::CreateRoutingContext)?;
        let inner = self
            .inner
            .create_routing_context(codecs, events.clone())
            .await?;
        self.state.event_senders.lock().push(events);
        self.state.open_contexts.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockRoutingContext {
            inner,
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }

    fn subscribe_fatal(&self) -> watch::Receiver<Option<String>> {
        self.inner.subscribe_fatal()
    }
}

struct MockRoutingContext {
    inner: Arc<dyn RoutingContext>,
    state: Arc<MockState>,
    closed: AtomicBool,
}

#[async_trait]
impl RoutingContext for MockRoutingContext {
    fn capabilities(&self) -> RtpCapabilities {
        self.inner.capabilities()
    }

    async fn can_consume(&self, producer_id: ProducerId, capabilities: &RtpCapabilities) -> bool {
        self.inner.can_consume(producer_id, capabilities).await
    }

    async fn create_transport(
        &self,
        direction: Direction,
    ) -> Result<Arc<dyn EngineTransport>, EngineError> {
        self.state.enter(EngineOp::CreateTransport)?;
        let inner = self.inner.create_transport(direction).await?;
        Ok(Arc::new(MockTransport {
            inner,
            state: Arc::clone(&self.state),
        }))
    }

    async fn close(&self) {
        self.inner.close().await;
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.open_contexts.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct MockTransport {
    inner: Arc<dyn EngineTransport>,
    state: Arc<MockState>,
}

#[async_trait]
impl EngineTransport for MockTransport {
    fn id(&self) -> TransportId {
        self.inner.id()
    }

    fn direction(&self) -> Direction {
        self.inner.direction()
    }

    fn options(&self) -> TransportOptions {
        self.inner.options()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError> {
        self.state.enter(EngineOp::Connect)?;
        self.inner.connect(dtls_parameters).await
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn EngineProducer>, EngineError> {
        self.state.enter(EngineOp::Produce)?;
        self.inner.produce(kind, rtp_parameters).await
    }

    async fn consume(
        &self,
        producer_id: ProducerId,
        capabilities: &RtpCapabilities,
    ) -> Result<Arc<dyn EngineConsumer>, EngineError> {
        self.state.enter(EngineOp::Consume)?;
        self.inner.consume(producer_id, capabilities).await
    }

    async fn restart_ice(&self) -> Result<IceParameters, EngineError> {
        self.state.enter(EngineOp::RestartIce)?;
        self.inner.restart_ice().await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signaling_protocol::default_media_codecs;

    #[tokio::test]
    async fn test_counts_calls_and_injects_faults() {
        let engine = MockEngine::new();
        engine.fail_next(
            EngineOp::CreateRoutingContext,
            EngineError::Rejected("injected".to_string()),
        );

        let (tx, _rx) = mpsc::unbounded_channel();
        let first = engine
            .create_routing_context(default_media_codecs(), tx.clone())
            .await;
        assert!(matches!(first, Err(EngineError::Rejected(_))));

        let router = engine
            .create_routing_context(default_media_codecs(), tx)
            .await
            .unwrap();
        assert_eq!(engine.calls(EngineOp::CreateRoutingContext), 2);
        assert_eq!(engine.open_routing_contexts(), 1);

        router.close().await;
        assert_eq!(engine.open_routing_contexts(), 0);
    }

    #[tokio::test]
    async fn test_injected_events_reach_rooms() {
        let engine = MockEngine::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _router = engine
            .create_routing_context(default_media_codecs(), tx)
            .await
            .unwrap();

        let producer_id = ProducerId::new();
        engine.close_producer(producer_id);
        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::ProducerClosed { producer_id }
        );
    }
}
