//! Integration tests for delivery faults and failures.
//!
//! 1. Duplicated deliveries are stored once.
//! 2. Corrupted deliveries are skipped without stopping the stream.
//! 3. Dropped deliveries are recovered by backfill.
//! 4. A terminated subscription is reported and can be restarted.
//! 5. Store outages lose nothing that backfill cannot recover.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use termsync::config::EngineConfig;
use termsync::event::Event;
use termsync::messenger::Messenger;
use termsync::store::InMemoryStore;
use termsync::stream::StreamState;
use termsync::transport::TransportError;
use termsync::transport::memory::{FaultPlan, MemoryNetwork, MemoryTransport};
use termsync_proto::contact::{Contact, PublicKey};
use termsync_proto::message::Message;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Peer {
    transport: Arc<MemoryTransport>,
    store: Arc<InMemoryStore>,
    messenger: Messenger<MemoryTransport, InMemoryStore>,
    events: mpsc::Receiver<Event>,
}

fn peer(net: &MemoryNetwork, byte: u8) -> Peer {
    let key = PublicKey::new(vec![byte; 32]);
    let transport = Arc::new(net.endpoint(key.clone()));
    let store = Arc::new(InMemoryStore::new());
    let (messenger, events) = Messenger::new(
        Arc::clone(&transport),
        Arc::clone(&store),
        key,
        EngineConfig::default(),
    );
    Peer {
        transport,
        store,
        messenger,
        events,
    }
}

fn room(name: &str) -> Contact {
    Contact::public_room(name).unwrap()
}

/// Joins `alice` and `bob` to the same room.
async fn joined_pair(net: &MemoryNetwork) -> (Peer, Peer, Contact) {
    let alice = peer(net, 0xAA);
    let bob = peer(net, 0xBB);
    let status = room("status");
    alice.messenger.join(status.clone()).await.unwrap();
    bob.messenger.join(status.clone()).await.unwrap();
    (alice, bob, status)
}

async fn wait_for_stored(peer: &Peer, contact: &Contact, count: usize) -> Vec<Message> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let stored = peer.messenger.messages(contact, 0).await.unwrap();
        if stored.len() >= count || tokio::time::Instant::now() >= deadline {
            return stored;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Collects whatever events are queued right now.
fn drain(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicated_deliveries_are_stored_once() {
    let net = MemoryNetwork::default();
    let (alice, mut bob, status) = joined_pair(&net).await;
    net.set_faults(FaultPlan {
        duplicate_rate: 1.0,
        ..FaultPlan::none()
    });

    for text in ["a", "b", "c"] {
        alice.messenger.send(&status, text).await.unwrap();
    }
    wait_for_stored(&bob, &status, 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(bob.messenger.messages(&status, 0).await.unwrap().len(), 3);
    let announced = drain(&mut bob.events)
        .into_iter()
        .filter(|e| matches!(e, Event::Message { .. }))
        .count();
    assert_eq!(announced, 3);
}

#[tokio::test]
async fn corrupted_deliveries_are_skipped() {
    let net = MemoryNetwork::default();
    let (alice, mut bob, status) = joined_pair(&net).await;
    net.set_faults(FaultPlan {
        corrupt_rate: 1.0,
        ..FaultPlan::none()
    });

    for text in ["a", "b", "c"] {
        alice.messenger.send(&status, text).await.unwrap();
    }
    let stored = wait_for_stored(&bob, &status, 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(stored.len(), 3);
    assert!(stored.iter().all(|m| m.id.as_bytes().len() == 32));
    assert_eq!(bob.messenger.stream_state(&status).await, Some(StreamState::Running));
    assert!(
        !drain(&mut bob.events)
            .iter()
            .any(|e| matches!(e, Event::Error { .. }))
    );
}

#[tokio::test]
async fn dropped_deliveries_are_recovered_by_backfill() {
    let net = MemoryNetwork::default();
    let (alice, bob, status) = joined_pair(&net).await;
    net.set_faults(FaultPlan {
        drop_rate: 1.0,
        ..FaultPlan::none()
    });

    for text in ["a", "b", "c"] {
        alice.messenger.send(&status, text).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bob.messenger.messages(&status, 0).await.unwrap().is_empty());

    net.set_faults(FaultPlan::none());
    bob.messenger.request_all(true).await.unwrap();
    let stored = wait_for_stored(&bob, &status, 3).await;
    let texts: Vec<&str> = stored.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn terminated_subscription_is_reported_and_restartable() {
    let net = MemoryNetwork::default();
    let (alice, mut bob, status) = joined_pair(&net).await;
    let _ = drain(&mut bob.events);

    bob.transport
        .close_subscriptions(&TransportError::SubscriptionClosed("node went away".into()));

    let event = tokio::time::timeout(Duration::from_secs(2), bob.events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event bus closed");
    assert_eq!(
        event,
        Event::Error {
            contact: status.clone(),
            error: "subscription closed: node went away".into(),
        }
    );
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while bob.messenger.stream_state(&status).await != Some(StreamState::Stopped) {
        assert!(tokio::time::Instant::now() < deadline, "stream never stopped");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Re-joining restarts the stream and backfills the gap.
    alice.messenger.send(&status, "during outage").await.unwrap();
    bob.messenger.join(status.clone()).await.unwrap();
    assert_eq!(bob.messenger.stream_state(&status).await, Some(StreamState::Running));

    alice.messenger.send(&status, "after restart").await.unwrap();
    let stored = wait_for_stored(&bob, &status, 2).await;
    let texts: Vec<&str> = stored.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["during outage", "after restart"]);
}

#[tokio::test]
async fn store_outage_is_recovered_by_backfill() {
    let net = MemoryNetwork::default();
    let (alice, bob, status) = joined_pair(&net).await;

    bob.store.set_unavailable(true);
    alice.messenger.send(&status, "lost live").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bob.messenger.messages(&status, 0).await.unwrap().is_empty());
    assert_eq!(bob.messenger.stream_state(&status).await, Some(StreamState::Running));

    bob.store.set_unavailable(false);
    bob.messenger.request_all(true).await.unwrap();
    let stored = wait_for_stored(&bob, &status, 1).await;
    assert_eq!(stored[0].text, "lost live");
}

#[tokio::test]
async fn failed_history_request_can_be_retried() {
    let net = MemoryNetwork::default();
    let alice = peer(&net, 0xAA);
    let bob = peer(&net, 0xBB);
    let status = room("status");
    alice.messenger.join(status.clone()).await.unwrap();
    alice.messenger.send(&status, "history").await.unwrap();

    bob.transport
        .fail_next_request(TransportError::RequestFailed("store node offline".into()));
    assert!(bob.messenger.join(status.clone()).await.is_err());
    assert_eq!(bob.messenger.window(&status).unwrap().newest, None);

    bob.messenger.request_all(true).await.unwrap();
    let stored = wait_for_stored(&bob, &status, 1).await;
    assert_eq!(stored[0].text, "history");
}
