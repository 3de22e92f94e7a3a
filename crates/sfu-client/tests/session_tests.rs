//! Session controller integration tests.
//!
//! Each `Client` is a `SessionController` over a `LoopbackChannel` into a
//! shared `TestSfu`, with a `FakeDevice` standing in for the media stack.
//! The last section repeats the basics over a real WebSocket.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::sync::Arc;
use std::time::Duration;

use common::{PeerId, ProducerId, RoomCode};
use sfu_client::{
    ClientConfig, ClientError, MediaTrack, RejoinStep, SessionController, SessionEvent,
    SessionPhase,
};
use sfu_test_utils::{
    audio_only_capabilities, unique_room_code, FakeDevice, FakeTrack, LoopbackChannel, TestSfu,
    TestSfuServer,
};
use signaling_protocol::{
    Direction, ErrorCode, MediaKind, PeerSummary, ProducerSummary, PushEvent,
};
use tokio::sync::mpsc;

const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Test client
// ============================================================================

struct Client {
    controller: SessionController,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    channel: Arc<LoopbackChannel>,
    device: Arc<FakeDevice>,
}

impl Client {
    fn start(sfu: &TestSfu, config: ClientConfig, device: FakeDevice) -> Self {
        let device = Arc::new(device);
        let (channel, channel_events) = LoopbackChannel::connect(sfu);
        let (controller, events) = SessionController::start(
            config,
            channel.clone(),
            channel_events,
            device.clone(),
        );
        Self {
            controller,
            events,
            channel,
            device,
        }
    }

    fn new(sfu: &TestSfu, room: &str, name: &str) -> Self {
        let config = ClientConfig::new(room).unwrap().with_display_name(name);
        Self::start(sfu, config, FakeDevice::new())
    }

    fn peer_id(&self) -> PeerId {
        self.controller.self_id().expect("client has joined")
    }

    async fn next_event(&mut self) -> SessionEvent {
        tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("session event stream closed")
    }

    /// Skip events until `pick` returns a value.
    async fn wait_for<T>(&mut self, mut pick: impl FnMut(SessionEvent) -> Option<T>) -> T {
        loop {
            if let Some(value) = pick(self.next_event().await) {
                return value;
            }
        }
    }

    async fn produce(&self, kind: MediaKind) -> (ProducerId, Arc<FakeTrack>) {
        let track = FakeTrack::new(kind);
        let producer_id = self.controller.produce(kind, track.clone()).await.unwrap();
        (producer_id, track)
    }
}

async fn paused_producers(sfu: &TestSfu, room: &str) -> Vec<ProducerId> {
    sfu.registry
        .get_room(RoomCode::from(room))
        .await
        .unwrap()
        .expect("room exists")
        .get_state()
        .await
        .unwrap()
        .paused_producers
}

/// Poll until `channel` has sent at least `n` requests of `event`.
async fn wait_for_requests(channel: &LoopbackChannel, event: &str, n: usize) {
    for _ in 0..200 {
        if channel.count(event) >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    unreachable!("{event} was not sent {n} times");
}

/// Producer ids behind the client's remote consumers of `owner`.
fn consumed_from(client: &Client, owner: PeerId) -> Vec<ProducerId> {
    MediaKind::ALL
        .into_iter()
        .filter_map(|kind| client.controller.remote_consumer(owner, kind))
        .map(|consumer| consumer.producer_id())
        .collect()
}

async fn consumer_count(sfu: &TestSfu, room: &str) -> usize {
    sfu.registry
        .get_room(RoomCode::from(room))
        .await
        .unwrap()
        .expect("room exists")
        .get_state()
        .await
        .unwrap()
        .consumer_count
}

// ============================================================================
// Join and consume
// ============================================================================

#[tokio::test]
async fn test_join_consumes_existing_producers() {
    let sfu = TestSfu::new();
    let room = unique_room_code();

    let mut alice = Client::new(&sfu, &room, "alice");
    let snapshot = alice.controller.join().await.unwrap();
    assert!(snapshot.peers.is_empty());
    assert!(snapshot.existing_producers.is_empty());
    assert_eq!(alice.controller.phase(), SessionPhase::Connected);
    assert_eq!(alice.device.load_count(), 1);
    let (audio, _track) = alice.produce(MediaKind::Audio).await;

    let mut bob = Client::new(&sfu, &room, "bob");
    let snapshot = bob.controller.join().await.unwrap();
    assert_eq!(snapshot.peers.len(), 1);
    assert_eq!(snapshot.existing_producers.len(), 1);
    assert_eq!(snapshot.existing_producers[0].producer_id, audio);

    let track = bob
        .wait_for(|e| match e {
            SessionEvent::Track(track) => Some(track),
            _ => None,
        })
        .await;
    assert_eq!(track.producer_id, audio);
    assert_eq!(track.peer_id, alice.peer_id());
    assert_eq!(track.kind, MediaKind::Audio);

    let consumer = bob
        .controller
        .remote_consumer(alice.peer_id(), MediaKind::Audio)
        .expect("consumer registered");
    assert!(!consumer.is_paused(), "consumer resumed after consume");

    // Alice never consumes her own producer
    let own = ProducerSummary {
        producer_id: audio,
        kind: MediaKind::Audio,
        peer_id: alice.peer_id(),
        display_name: "alice".to_string(),
    };
    assert!(alice.controller.consume(&own).await.unwrap().is_none());

    let joined = alice
        .wait_for(|e| match e {
            SessionEvent::PeerJoined(peer) => Some(peer),
            _ => None,
        })
        .await;
    assert_eq!(joined.display_name, "bob");

    bob.controller.disconnect().await;
    alice.controller.disconnect().await;
    sfu.shutdown();
}

#[tokio::test]
async fn test_concurrent_consume_creates_one_consumer() {
    let sfu = TestSfu::new();
    let room = unique_room_code();

    let alice = Client::new(&sfu, &room, "alice");
    let mut bob = Client::new(&sfu, &room, "bob");
    alice.controller.join().await.unwrap();
    bob.controller.join().await.unwrap();

    let (video, _track) = alice.produce(MediaKind::Video).await;
    let summary = bob
        .wait_for(|e| match e {
            SessionEvent::NewProducer(p) => Some(p),
            _ => None,
        })
        .await;
    assert_eq!(summary.producer_id, video);

    let (first, second) = tokio::join!(
        bob.controller.consume(&summary),
        bob.controller.consume(&summary)
    );
    let created = [first.unwrap(), second.unwrap()]
        .into_iter()
        .flatten()
        .count();

    assert_eq!(created, 1);
    assert_eq!(bob.channel.count("consume"), 1);
    assert_eq!(bob.controller.remote_consumer_count(), 1);
    assert_eq!(consumer_count(&sfu, &room).await, 1);

    alice.controller.disconnect().await;
    bob.controller.disconnect().await;
    sfu.shutdown();
}

#[tokio::test]
async fn test_auto_consume_new_producer() {
    let sfu = TestSfu::new();
    let room = unique_room_code();

    let alice = Client::new(&sfu, &room, "alice");
    let config = ClientConfig::new(room.as_str())
        .unwrap()
        .with_display_name("bob")
        .with_auto_consume(true);
    let mut bob = Client::start(&sfu, config, FakeDevice::new());
    alice.controller.join().await.unwrap();
    bob.controller.join().await.unwrap();

    let (audio, _track) = alice.produce(MediaKind::Audio).await;

    let track = bob
        .wait_for(|e| match e {
            SessionEvent::Track(track) => Some(track),
            SessionEvent::NewProducer(_) => unreachable!("auto-consume emits tracks"),
            _ => None,
        })
        .await;
    assert_eq!(track.producer_id, audio);
    assert!(track.track.is_live());

    alice.controller.disconnect().await;
    bob.controller.disconnect().await;
    sfu.shutdown();
}

#[tokio::test]
async fn test_incompatible_producer_reported_as_consume_failure() {
    let sfu = TestSfu::new();
    let room = unique_room_code();

    let alice = Client::new(&sfu, &room, "alice");
    let config = ClientConfig::new(room.as_str())
        .unwrap()
        .with_display_name("bob")
        .with_auto_consume(true);
    let mut bob = Client::start(
        &sfu,
        config,
        FakeDevice::new().with_receive_capabilities(audio_only_capabilities()),
    );
    alice.controller.join().await.unwrap();
    bob.controller.join().await.unwrap();

    let (video, _track) = alice.produce(MediaKind::Video).await;

    let failed = bob
        .wait_for(|e| match e {
            SessionEvent::ConsumeFailed { producer_id, .. } => Some(producer_id),
            _ => None,
        })
        .await;
    assert_eq!(failed, video);
    assert_eq!(bob.controller.remote_consumer_count(), 0);

    alice.controller.disconnect().await;
    bob.controller.disconnect().await;
    sfu.shutdown();
}

#[tokio::test]
async fn test_produce_requires_capable_device_and_join() {
    let sfu = TestSfu::new();
    let room = unique_room_code();

    let config = ClientConfig::new(room.as_str()).unwrap();
    let client = Client::start(
        &sfu,
        config,
        FakeDevice::new().with_producible(&[MediaKind::Audio]),
    );

    let result = client
        .controller
        .produce(MediaKind::Audio, FakeTrack::new(MediaKind::Audio))
        .await;
    assert!(matches!(result, Err(ClientError::NotJoined)));

    client.controller.join().await.unwrap();
    let result = client
        .controller
        .produce(MediaKind::Video, FakeTrack::new(MediaKind::Video))
        .await;
    assert!(matches!(result, Err(ClientError::CannotProduce(MediaKind::Video))));
    assert_eq!(client.channel.count("produce"), 0);

    client.controller.disconnect().await;
    sfu.shutdown();
}

// ============================================================================
// Producer control
// ============================================================================

#[tokio::test]
async fn test_remote_pause_is_mirrored() {
    let sfu = TestSfu::new();
    let room = unique_room_code();

    let alice = Client::new(&sfu, &room, "alice");
    alice.controller.join().await.unwrap();
    let (video, _track) = alice.produce(MediaKind::Video).await;

    let mut bob = Client::new(&sfu, &room, "bob");
    bob.controller.join().await.unwrap();
    bob.wait_for(|e| matches!(e, SessionEvent::Track(_)).then_some(()))
        .await;
    let consumer = bob
        .controller
        .remote_consumer(alice.peer_id(), MediaKind::Video)
        .unwrap();

    alice.controller.pause(MediaKind::Video).await;
    let paused = bob
        .wait_for(|e| match e {
            SessionEvent::ProducerPaused(p) => Some(p),
            _ => None,
        })
        .await;
    assert_eq!(paused.producer_id, video);
    assert!(consumer.is_paused());
    assert!(alice
        .controller
        .local_producer(MediaKind::Video)
        .unwrap()
        .is_paused());
    assert_eq!(paused_producers(&sfu, &room).await, vec![video]);

    alice.controller.resume(MediaKind::Video).await;
    bob.wait_for(|e| matches!(e, SessionEvent::ProducerResumed(_)).then_some(()))
        .await;
    assert!(!consumer.is_paused());
    assert!(paused_producers(&sfu, &room).await.is_empty());

    alice.controller.disconnect().await;
    bob.controller.disconnect().await;
    sfu.shutdown();
}

#[tokio::test]
async fn test_close_producer_closes_remote_consumer() {
    let sfu = TestSfu::new();
    let room = unique_room_code();

    let alice = Client::new(&sfu, &room, "alice");
    alice.controller.join().await.unwrap();
    let (audio, track) = alice.produce(MediaKind::Audio).await;

    let mut bob = Client::new(&sfu, &room, "bob");
    bob.controller.join().await.unwrap();
    let received = bob
        .wait_for(|e| match e {
            SessionEvent::Track(track) => Some(track),
            _ => None,
        })
        .await;

    alice.controller.close_producer(MediaKind::Audio).await;
    assert!(alice.controller.local_producer(MediaKind::Audio).is_none());
    // Closing the producer does not stop the caller's track
    assert!(track.is_live());

    let closed = bob
        .wait_for(|e| match e {
            SessionEvent::ProducerClosed(p) => Some(p),
            _ => None,
        })
        .await;
    assert_eq!(closed.producer_id, audio);
    assert_eq!(bob.controller.remote_consumer_count(), 0);
    assert!(!received.track.is_live());

    alice.controller.disconnect().await;
    bob.controller.disconnect().await;
    sfu.shutdown();
}

#[tokio::test]
async fn test_replacing_producer_closes_previous() {
    let sfu = TestSfu::new();
    let room = unique_room_code();

    let alice = Client::new(&sfu, &room, "alice");
    alice.controller.join().await.unwrap();
    let (first, _) = alice.produce(MediaKind::Audio).await;
    let (second, _) = alice.produce(MediaKind::Audio).await;
    assert_ne!(first, second);

    let transports = alice.device.transports();
    assert_eq!(transports.len(), 1, "send transport reused");
    let producers = transports[0].producers();
    assert_eq!(producers.len(), 2);
    assert!(producers[0].is_closed());
    assert!(!producers[1].is_closed());

    let state = sfu
        .registry
        .get_room(RoomCode::from(room.as_str()))
        .await
        .unwrap()
        .unwrap()
        .get_state()
        .await
        .unwrap();
    assert_eq!(state.producers.len(), 1);
    assert_eq!(state.producers[0].producer_id, second);

    alice.controller.disconnect().await;
    sfu.shutdown();
}

#[tokio::test]
async fn test_restart_ice_refreshes_transport() {
    let sfu = TestSfu::new();
    let room = unique_room_code();

    let alice = Client::new(&sfu, &room, "alice");
    alice.controller.join().await.unwrap();

    let result = alice.controller.restart_ice(Direction::Send).await;
    assert!(matches!(result, Err(ClientError::NoTransport(Direction::Send))));

    alice.produce(MediaKind::Audio).await;
    let transport = alice.device.transports()[0].clone();
    let before = transport.ice_parameters();

    alice.controller.restart_ice(Direction::Send).await.unwrap();
    assert_ne!(transport.ice_parameters().password, before.password);

    alice.controller.disconnect().await;
    sfu.shutdown();
}

// ============================================================================
// Departure and rejoin
// ============================================================================

#[tokio::test]
async fn test_peer_left_closes_consumers() {
    let sfu = TestSfu::new();
    let room = unique_room_code();

    let alice = Client::new(&sfu, &room, "alice");
    alice.controller.join().await.unwrap();
    alice.produce(MediaKind::Audio).await;
    alice.produce(MediaKind::Video).await;
    let alice_id = alice.peer_id();

    let mut bob = Client::new(&sfu, &room, "bob");
    bob.controller.join().await.unwrap();
    assert_eq!(bob.controller.remote_consumer_count(), 2);

    alice.controller.disconnect().await;

    let left = bob
        .wait_for(|e| match e {
            SessionEvent::PeerLeft(peer) => Some(peer),
            _ => None,
        })
        .await;
    assert_eq!(left.peer_id, alice_id);
    assert_eq!(bob.controller.remote_consumer_count(), 0);
    assert!(alice.device.open_transports().is_empty());

    bob.controller.disconnect().await;
    sfu.shutdown();
}

#[tokio::test]
async fn test_rejoin_after_connection_drop() {
    let sfu = TestSfu::new();
    let room = unique_room_code();

    let mut alice = Client::new(&sfu, &room, "alice");
    alice.controller.join().await.unwrap();
    let (p1, _track) = alice.produce(MediaKind::Video).await;
    let first_id = alice.peer_id();

    let mut bob = Client::new(&sfu, &room, "bob");
    bob.controller.join().await.unwrap();
    bob.wait_for(|e| matches!(e, SessionEvent::Track(_)).then_some(()))
        .await;

    alice.channel.drop_connection().await;
    alice
        .wait_for(|e| matches!(e, SessionEvent::Disconnected { .. }).then_some(()))
        .await;
    assert_eq!(alice.controller.phase(), SessionPhase::Disconnected);

    alice.channel.reconnect();
    let rejoined_as = alice
        .wait_for(|e| match e {
            SessionEvent::Rejoined { self_id } => Some(self_id),
            SessionEvent::RejoinFailed { step, error } => {
                unreachable!("rejoin failed at {step:?}: {error}")
            }
            _ => None,
        })
        .await;
    assert_ne!(rejoined_as, first_id);
    assert_eq!(alice.controller.phase(), SessionPhase::Connected);

    let p2 = alice
        .controller
        .local_producer(MediaKind::Video)
        .expect("video re-produced")
        .id();
    assert_ne!(p1, p2);
    assert_eq!(alice.device.open_transports().len(), 1);

    // Bob sees the old producer go, then the new one arrive
    let mut closed_p1 = false;
    loop {
        match bob.next_event().await {
            SessionEvent::ProducerClosed(e) => {
                assert_eq!(e.producer_id, p1);
                closed_p1 = true;
            }
            SessionEvent::NewProducer(p) => {
                assert!(closed_p1, "new-producer before producer-closed");
                assert_eq!(p.producer_id, p2);
                assert_eq!(p.peer_id, rejoined_as);
                break;
            }
            _ => {}
        }
    }

    alice.controller.disconnect().await;
    bob.controller.disconnect().await;
    sfu.shutdown();
}

#[tokio::test]
async fn test_rejoin_skips_stopped_tracks() {
    let sfu = TestSfu::new();
    let room = unique_room_code();

    let mut alice = Client::new(&sfu, &room, "alice");
    alice.controller.join().await.unwrap();
    let (_, audio_track) = alice.produce(MediaKind::Audio).await;
    alice.produce(MediaKind::Video).await;

    audio_track.stop();
    alice.channel.drop_connection().await;
    alice.channel.reconnect();
    alice
        .wait_for(|e| matches!(e, SessionEvent::Rejoined { .. }).then_some(()))
        .await;

    assert!(alice.controller.local_producer(MediaKind::Audio).is_none());
    assert!(alice.controller.local_producer(MediaKind::Video).is_some());
    assert_eq!(alice.channel.count("produce"), 3);

    alice.controller.disconnect().await;
    sfu.shutdown();
}

#[tokio::test]
async fn test_failed_rejoin_is_reported_and_retried() {
    let sfu = TestSfu::new();
    let room = unique_room_code();

    let mut alice = Client::new(&sfu, &room, "alice");
    alice.controller.join().await.unwrap();
    alice.produce(MediaKind::Video).await;

    alice.channel.drop_connection().await;
    alice
        .channel
        .reject_next("produce", ErrorCode::EngineError);
    alice.channel.reconnect();

    let step = alice
        .wait_for(|e| match e {
            SessionEvent::RejoinFailed { step, .. } => Some(step),
            SessionEvent::Rejoined { .. } => unreachable!("rejoin should fail"),
            _ => None,
        })
        .await;
    assert_eq!(step, RejoinStep::Produce(MediaKind::Video));
    assert_eq!(alice.controller.phase(), SessionPhase::Disconnected);

    // The next connection retries the whole rejoin
    alice.channel.drop_connection().await;
    alice.channel.reconnect();
    alice
        .wait_for(|e| matches!(e, SessionEvent::Rejoined { .. }).then_some(()))
        .await;
    assert_eq!(alice.controller.phase(), SessionPhase::Connected);
    assert!(alice.controller.local_producer(MediaKind::Video).is_some());

    alice.controller.disconnect().await;
    sfu.shutdown();
}

#[tokio::test]
async fn test_failed_rejoin_join_step() {
    let sfu = TestSfu::new();
    let room = unique_room_code();

    let mut alice = Client::new(&sfu, &room, "alice");
    alice.controller.join().await.unwrap();

    alice.channel.drop_connection().await;
    alice.channel.reject_next("join", ErrorCode::Unavailable);
    alice.channel.reconnect();

    let step = alice
        .wait_for(|e| match e {
            SessionEvent::RejoinFailed { step, .. } => Some(step),
            _ => None,
        })
        .await;
    assert_eq!(step, RejoinStep::Join);
    assert_eq!(alice.controller.phase(), SessionPhase::Disconnected);

    alice.controller.disconnect().await;
    assert_eq!(alice.controller.phase(), SessionPhase::Idle);
    sfu.shutdown();
}

#[tokio::test]
async fn test_rejoin_reconsumes_snapshot_producers() {
    let sfu = TestSfu::new();
    let room = unique_room_code();

    let alice = Client::new(&sfu, &room, "alice");
    alice.controller.join().await.unwrap();
    alice.produce(MediaKind::Audio).await;
    alice.produce(MediaKind::Video).await;
    let alice_id = alice.peer_id();

    let mut bob = Client::new(&sfu, &room, "bob");
    bob.controller.join().await.unwrap();
    for _ in 0..2 {
        bob.wait_for(|e| matches!(e, SessionEvent::Track(_)).then_some(()))
            .await;
    }
    let fresh = consumed_from(&bob, alice_id);
    assert_eq!(fresh.len(), 2);
    assert_eq!(consumer_count(&sfu, &room).await, 2);

    bob.channel.drop_connection().await;
    bob.channel.reconnect();

    let mut tracks = Vec::new();
    loop {
        match bob.next_event().await {
            SessionEvent::Track(track) => tracks.push(track.producer_id),
            SessionEvent::Rejoined { .. } => break,
            SessionEvent::RejoinFailed { step, error } => {
                unreachable!("rejoin failed at {step:?}: {error}")
            }
            _ => {}
        }
    }

    // Same producers as the fresh join, on new consumers
    tracks.sort();
    let mut expected = fresh.clone();
    expected.sort();
    assert_eq!(tracks, expected);
    assert_eq!(consumed_from(&bob, alice_id), fresh);
    assert_eq!(bob.controller.remote_consumer_count(), 2);
    assert_eq!(consumer_count(&sfu, &room).await, 2);
    assert_eq!(bob.channel.count("consume"), 4);
    assert_eq!(bob.device.open_transports().len(), 1);

    alice.controller.disconnect().await;
    bob.controller.disconnect().await;
    sfu.shutdown();
}

#[tokio::test]
async fn test_snapshot_and_new_producer_push_consume_once() {
    let sfu = TestSfu::new();
    let room = unique_room_code();

    let alice = Client::new(&sfu, &room, "alice");
    alice.controller.join().await.unwrap();
    let (audio, _track) = alice.produce(MediaKind::Audio).await;

    let config = ClientConfig::new(room.as_str())
        .unwrap()
        .with_display_name("bob")
        .with_auto_consume(true);
    let mut bob = Client::start(&sfu, config, FakeDevice::new());
    let release = bob.channel.hold_next("consume");

    // The same producer arrives through the snapshot and a push while the
    // snapshot consume is still in flight
    let announced = ProducerSummary {
        producer_id: audio,
        kind: MediaKind::Audio,
        peer_id: alice.peer_id(),
        display_name: "alice".to_string(),
    };
    let (joined, ()) = tokio::join!(bob.controller.join(), async {
        wait_for_requests(&bob.channel, "consume", 1).await;
        bob.channel
            .deliver_push(1_000, PushEvent::NewProducer(announced.clone()));
        let _ = release.send(());
    });
    assert_eq!(joined.unwrap().existing_producers.len(), 1);

    let marker = PeerSummary {
        peer_id: PeerId::new(),
        display_name: "marker".to_string(),
    };
    bob.channel
        .deliver_push(1_001, PushEvent::PeerJoined(marker));

    let mut tracks = 0;
    loop {
        match bob.next_event().await {
            SessionEvent::Track(track) => {
                assert_eq!(track.producer_id, audio);
                tracks += 1;
            }
            SessionEvent::PeerJoined(peer) if peer.display_name == "marker" => break,
            SessionEvent::ConsumeFailed { error, .. } => unreachable!("consume failed: {error}"),
            _ => {}
        }
    }

    assert_eq!(tracks, 1);
    assert_eq!(bob.channel.count("consume"), 1);
    assert_eq!(bob.controller.remote_consumer_count(), 1);
    assert_eq!(consumer_count(&sfu, &room).await, 1);

    alice.controller.disconnect().await;
    bob.controller.disconnect().await;
    sfu.shutdown();
}

#[tokio::test]
async fn test_push_during_rejoin_waits_for_rejoin() {
    let sfu = TestSfu::new();
    let room = unique_room_code();

    let alice = Client::new(&sfu, &room, "alice");
    alice.controller.join().await.unwrap();
    let (video, _track) = alice.produce(MediaKind::Video).await;

    let mut bob = Client::new(&sfu, &room, "bob");
    bob.controller.join().await.unwrap();
    bob.wait_for(|e| matches!(e, SessionEvent::Track(_)).then_some(()))
        .await;

    bob.channel.drop_connection().await;
    let release = bob.channel.hold_next("consume");
    bob.channel.reconnect();

    // The rejoin has joined the room and is stuck re-consuming
    wait_for_requests(&bob.channel, "consume", 2).await;
    assert_eq!(bob.controller.phase(), SessionPhase::Rejoining);

    alice.controller.pause(MediaKind::Video).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _ = release.send(());

    let mut order = Vec::new();
    loop {
        match bob.next_event().await {
            SessionEvent::Track(track) => {
                assert_eq!(track.producer_id, video);
                order.push("track");
            }
            SessionEvent::Rejoined { .. } => order.push("rejoined"),
            SessionEvent::ProducerPaused(paused) => {
                assert_eq!(paused.producer_id, video);
                order.push("paused");
                break;
            }
            SessionEvent::RejoinFailed { step, error } => {
                unreachable!("rejoin failed at {step:?}: {error}")
            }
            _ => {}
        }
    }
    assert_eq!(order, ["track", "rejoined", "paused"]);

    // Applied to the consumer the rejoin created
    let consumer = bob
        .controller
        .remote_consumer(alice.peer_id(), MediaKind::Video)
        .expect("consumer re-created");
    assert!(consumer.is_paused());

    alice.controller.disconnect().await;
    bob.controller.disconnect().await;
    sfu.shutdown();
}

#[tokio::test]
async fn test_rejoin_interrupted_by_drop_is_retried() {
    let sfu = TestSfu::new();
    let room = unique_room_code();

    let alice = Client::new(&sfu, &room, "alice");
    alice.controller.join().await.unwrap();
    alice.produce(MediaKind::Audio).await;

    let mut bob = Client::new(&sfu, &room, "bob");
    bob.controller.join().await.unwrap();
    assert_eq!(bob.controller.remote_consumer_count(), 1);

    bob.channel.drop_connection().await;
    let release = bob.channel.hold_next("join");
    bob.channel.reconnect();
    wait_for_requests(&bob.channel, "join", 2).await;
    assert_eq!(bob.controller.phase(), SessionPhase::Rejoining);

    // Connection lost again while the rejoin's join is in flight
    bob.channel.drop_connection().await;
    let _ = release.send(());

    let step = bob
        .wait_for(|e| match e {
            SessionEvent::RejoinFailed { step, .. } => Some(step),
            SessionEvent::Rejoined { .. } => unreachable!("join went out on a dead connection"),
            _ => None,
        })
        .await;
    assert_eq!(step, RejoinStep::Join);
    bob.wait_for(|e| matches!(e, SessionEvent::Disconnected { .. }).then_some(()))
        .await;
    assert_eq!(bob.controller.phase(), SessionPhase::Disconnected);
    assert_eq!(bob.controller.remote_consumer_count(), 0);

    bob.channel.reconnect();
    let rejoined_as = bob
        .wait_for(|e| match e {
            SessionEvent::Rejoined { self_id } => Some(self_id),
            SessionEvent::RejoinFailed { step, error } => {
                unreachable!("retry failed at {step:?}: {error}")
            }
            _ => None,
        })
        .await;
    assert_eq!(bob.controller.phase(), SessionPhase::Connected);
    assert_eq!(bob.controller.remote_consumer_count(), 1);
    assert_eq!(consumer_count(&sfu, &room).await, 1);

    // Only alice and the rejoined bob remain
    let state = sfu
        .registry
        .get_room(RoomCode::from(room.as_str()))
        .await
        .unwrap()
        .expect("room exists")
        .get_state()
        .await
        .unwrap();
    let mut members: Vec<PeerId> = state.peers.iter().map(|p| p.peer_id).collect();
    members.sort();
    let mut expected = vec![alice.peer_id(), rejoined_as];
    expected.sort();
    assert_eq!(members, expected);

    alice.controller.disconnect().await;
    bob.controller.disconnect().await;
    sfu.shutdown();
}

#[tokio::test]
async fn test_server_closed_connection_is_a_disconnect() {
    let sfu = TestSfu::new();
    let room = unique_room_code();

    let mut alice = Client::new(&sfu, &room, "alice");
    alice.controller.join().await.unwrap();

    // Connection tokens are children of the registry's
    sfu.registry.cancel();

    alice
        .wait_for(|e| matches!(e, SessionEvent::Disconnected { .. }).then_some(()))
        .await;
    assert_eq!(alice.controller.phase(), SessionPhase::Disconnected);
    assert_eq!(alice.channel.count("join"), 1);

    alice.controller.disconnect().await;
    sfu.shutdown();
}

// ============================================================================
// Real WebSocket
// ============================================================================

#[tokio::test]
async fn test_session_over_websocket() {
    let server = TestSfuServer::spawn().await.unwrap();
    let room = unique_room_code();

    let config = |name: &str| {
        ClientConfig::new(room.as_str())
            .unwrap()
            .with_display_name(name)
            .with_url(server.url())
            .with_connect_timeout(Duration::from_secs(5))
    };

    let (alice, mut alice_events) =
        SessionController::connect(config("alice"), Arc::new(FakeDevice::new()));
    let (bob, _bob_events) = SessionController::connect(config("bob"), Arc::new(FakeDevice::new()));

    alice.join().await.unwrap();
    let snapshot = bob.join().await.unwrap();
    assert_eq!(snapshot.peers.len(), 1);
    assert_eq!(snapshot.peers[0].display_name, "alice");

    let producer_id = bob
        .produce(MediaKind::Audio, FakeTrack::new(MediaKind::Audio))
        .await
        .unwrap();

    let announced = loop {
        let event = tokio::time::timeout(EVENT_TIMEOUT, alice_events.recv())
            .await
            .expect("timed out waiting for new-producer")
            .expect("event stream closed");
        if let SessionEvent::NewProducer(p) = event {
            break p;
        }
    };
    assert_eq!(announced.producer_id, producer_id);

    let consumed = alice.consume(&announced).await.unwrap().expect("consumed");
    assert_eq!(consumed.producer_id, producer_id);

    let status = server.sfu.registry.get_status().await.unwrap();
    assert_eq!(status.peer_count, 2);

    alice.disconnect().await;
    bob.disconnect().await;
}
