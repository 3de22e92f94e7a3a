//! Peer session ownership tree.
//!
//! A peer owns at most one transport per direction. Producers live on the
//! send transport, consumers on the recv transport. Closing a node closes
//! everything below it: consumers first, then producers, then the transport.

use super::connection::ConnectionActorHandle;
use crate::engine::{EngineConsumer, EngineProducer, EngineTransport};

use common::{ConsumerId, PeerId, ProducerId, TransportId};
use signaling_protocol::{Direction, MediaKind, PeerSummary, ProducerSummary, RtpCapabilities};
use std::collections::HashMap;
use std::sync::Arc;

pub struct ProducerEntry {
    pub producer: Arc<dyn EngineProducer>,
    pub kind: MediaKind,
    pub paused: bool,
    /// Room-wide ordering of producer creation.
    pub created_seq: u64,
}

pub struct ConsumerEntry {
    pub consumer: Arc<dyn EngineConsumer>,
    pub producer_id: ProducerId,
}

impl ConsumerEntry {
    pub async fn close(self) {
        self.consumer.close().await;
    }
}

pub struct TransportEntry {
    pub transport: Arc<dyn EngineTransport>,
    pub producers: HashMap<ProducerId, ProducerEntry>,
    pub consumers: HashMap<ConsumerId, ConsumerEntry>,
}

/// What a cascading close released.
#[derive(Debug, Default)]
pub struct ClosedResources {
    pub producers: Vec<(ProducerId, MediaKind)>,
    pub consumers: usize,
}

impl ClosedResources {
    fn absorb(&mut self, other: ClosedResources) {
        self.producers.extend(other.producers);
        self.consumers += other.consumers;
    }
}

impl TransportEntry {
    #[must_use]
    pub fn new(transport: Arc<dyn EngineTransport>) -> Self {
        Self {
            transport,
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> TransportId {
        self.transport.id()
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.transport.direction()
    }

    /// Close consumers, producers, then the transport itself.
    pub async fn close(self) -> ClosedResources {
        let mut closed = ClosedResources {
            consumers: self.consumers.len(),
            ..ClosedResources::default()
        };
        for (_, consumer) in self.consumers {
            consumer.close().await;
        }

        let mut producers: Vec<_> = self.producers.into_iter().collect();
        producers.sort_by_key(|(_, entry)| entry.created_seq);
        for (producer_id, entry) in producers {
            entry.producer.close().await;
            closed.producers.push((producer_id, entry.kind));
        }

        self.transport.close().await;
        closed
    }
}

/// One peer's presence in one room.
pub struct PeerSession {
    pub peer_id: PeerId,
    pub display_name: String,
    /// Room-wide ordering of joins.
    pub joined_seq: u64,
    pub connection: ConnectionActorHandle,
    pub receive_capabilities: Option<RtpCapabilities>,
    pub send_transport: Option<TransportEntry>,
    pub recv_transport: Option<TransportEntry>,
}

impl PeerSession {
    #[must_use]
    pub fn new(
        peer_id: PeerId,
        display_name: String,
        joined_seq: u64,
        connection: ConnectionActorHandle,
    ) -> Self {
        Self {
            peer_id,
            display_name,
            joined_seq,
            connection,
            receive_capabilities: None,
            send_transport: None,
            recv_transport: None,
        }
    }

    #[must_use]
    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            peer_id: self.peer_id,
            display_name: self.display_name.clone(),
        }
    }

    #[must_use]
    pub fn slot(&self, direction: Direction) -> Option<&TransportEntry> {
        match direction {
            Direction::Send => self.send_transport.as_ref(),
            Direction::Recv => self.recv_transport.as_ref(),
        }
    }

    pub fn slot_mut(&mut self, direction: Direction) -> &mut Option<TransportEntry> {
        match direction {
            Direction::Send => &mut self.send_transport,
            Direction::Recv => &mut self.recv_transport,
        }
    }

    fn transports(&self) -> impl Iterator<Item = &TransportEntry> {
        self.send_transport.iter().chain(self.recv_transport.iter())
    }

    fn transports_mut(&mut self) -> impl Iterator<Item = &mut TransportEntry> {
        self.send_transport
            .iter_mut()
            .chain(self.recv_transport.iter_mut())
    }

    pub fn transport_mut(&mut self, transport_id: TransportId) -> Option<&mut TransportEntry> {
        self.transports_mut().find(|t| t.id() == transport_id)
    }

    /// Detach the transport with this id, leaving the slot empty.
    pub fn take_transport(&mut self, transport_id: TransportId) -> Option<TransportEntry> {
        if self.send_transport.as_ref().map(TransportEntry::id) == Some(transport_id) {
            return self.send_transport.take();
        }
        if self.recv_transport.as_ref().map(TransportEntry::id) == Some(transport_id) {
            return self.recv_transport.take();
        }
        None
    }

    #[must_use]
    pub fn producer(&self, producer_id: ProducerId) -> Option<&ProducerEntry> {
        self.transports().find_map(|t| t.producers.get(&producer_id))
    }

    pub fn producer_mut(&mut self, producer_id: ProducerId) -> Option<&mut ProducerEntry> {
        self.transports_mut()
            .find_map(|t| t.producers.get_mut(&producer_id))
    }

    pub fn remove_producer(&mut self, producer_id: ProducerId) -> Option<ProducerEntry> {
        self.transports_mut()
            .find_map(|t| t.producers.remove(&producer_id))
    }

    pub fn consumer_mut(&mut self, consumer_id: ConsumerId) -> Option<&mut ConsumerEntry> {
        self.transports_mut()
            .find_map(|t| t.consumers.get_mut(&consumer_id))
    }

    /// Detach every consumer bound to `producer_id`.
    pub fn remove_consumers_of(&mut self, producer_id: ProducerId) -> Vec<ConsumerEntry> {
        let mut removed = Vec::new();
        for transport in self.transports_mut() {
            let ids: Vec<ConsumerId> = transport
                .consumers
                .iter()
                .filter(|(_, c)| c.producer_id == producer_id)
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                if let Some(entry) = transport.consumers.remove(&id) {
                    removed.push(entry);
                }
            }
        }
        removed
    }

    /// Open producers of this peer as advertised to others.
    pub fn producer_summaries(&self) -> impl Iterator<Item = (u64, ProducerSummary)> + '_ {
        self.transports().flat_map(move |t| {
            t.producers.iter().map(move |(id, entry)| {
                (
                    entry.created_seq,
                    ProducerSummary {
                        producer_id: *id,
                        kind: entry.kind,
                        peer_id: self.peer_id,
                        display_name: self.display_name.clone(),
                    },
                )
            })
        })
    }

    pub fn paused_producers(&self) -> impl Iterator<Item = ProducerId> + '_ {
        self.transports().flat_map(|t| {
            t.producers
                .iter()
                .filter(|(_, entry)| entry.paused)
                .map(|(id, _)| *id)
        })
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.transports().map(|t| t.consumers.len()).sum()
    }

    /// Close both transports and everything they own.
    pub async fn close(mut self) -> ClosedResources {
        let mut closed = ClosedResources::default();
        if let Some(recv) = self.recv_transport.take() {
            closed.absorb(recv.close().await);
        }
        if let Some(send) = self.send_transport.take() {
            closed.absorb(send.close().await);
        }
        closed
    }
}
