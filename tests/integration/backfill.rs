//! Integration tests for history backfill.
//!
//! 1. Joining a room replays the history sent before the join.
//! 2. Starting a messenger resumes every stored contact and fetches its
//!    history.
//! 3. A restart catches up on what was missed while stopped, starting from
//!    where the previous window ended.
//! 4. Replays honour the per-request limit.

use std::sync::Arc;
use std::time::Duration;

use termsync::config::EngineConfig;
use termsync::messenger::Messenger;
use termsync::requester::TimeRange;
use termsync::store::{InMemoryStore, Store};
use termsync::stream::StreamState;
use termsync::transport::memory::{MemoryNetwork, MemoryTransport};
use termsync_proto::contact::{Contact, PublicKey};
use termsync_proto::message::Message;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type TestMessenger = Messenger<MemoryTransport, InMemoryStore>;

struct Peer {
    transport: Arc<MemoryTransport>,
    store: Arc<InMemoryStore>,
    messenger: TestMessenger,
}

fn peer_with(net: &MemoryNetwork, byte: u8, config: EngineConfig) -> Peer {
    let key = PublicKey::new(vec![byte; 32]);
    let transport = Arc::new(net.endpoint(key.clone()));
    let store = Arc::new(InMemoryStore::new());
    // Events are not inspected here; dropping the receiver is fine.
    let (messenger, _events) =
        Messenger::new(Arc::clone(&transport), Arc::clone(&store), key, config);
    Peer {
        transport,
        store,
        messenger,
    }
}

fn peer(net: &MemoryNetwork, byte: u8) -> Peer {
    peer_with(net, byte, EngineConfig::default())
}

fn room(name: &str) -> Contact {
    Contact::public_room(name).unwrap()
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

fn texts(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.text.as_str()).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn late_joiner_receives_earlier_history() {
    let net = MemoryNetwork::default();
    let alice = peer(&net, 0xAA);
    let status = room("status");
    alice.messenger.join(status.clone()).await.unwrap();
    for text in ["one", "two", "three"] {
        alice.messenger.send(&status, text).await.unwrap();
    }

    let bob = peer(&net, 0xBB);
    bob.messenger.join(status.clone()).await.unwrap();

    let stored = wait_for_stored(&bob, &status, 3).await;
    assert_eq!(texts(&stored), vec!["one", "two", "three"]);

    let window = bob.messenger.window(&status).unwrap();
    let requested = bob.transport.requests()[0].clone();
    assert_eq!(window.newest, Some(TimeRange::new(requested.from, requested.to)));
}

#[tokio::test]
async fn start_resumes_stored_contacts() {
    let net = MemoryNetwork::default();
    let alice = peer(&net, 0xAA);
    let (status, dev) = (room("status"), room("dev"));
    alice.messenger.join(status.clone()).await.unwrap();
    alice.messenger.join(dev.clone()).await.unwrap();
    alice.messenger.send(&status, "status update").await.unwrap();
    alice.messenger.send(&dev, "dev update").await.unwrap();

    let bob = peer(&net, 0xBB);
    bob.store
        .save_contacts(&[status.clone(), dev.clone()])
        .await
        .unwrap();
    bob.messenger.start().await.unwrap();

    assert_eq!(bob.messenger.stream_state(&status).await, Some(StreamState::Running));
    assert_eq!(bob.messenger.stream_state(&dev).await, Some(StreamState::Running));
    // Both rooms had empty windows, so they share one request.
    assert_eq!(bob.transport.requests().len(), 1);

    assert_eq!(texts(&wait_for_stored(&bob, &status, 1).await), vec!["status update"]);
    assert_eq!(texts(&wait_for_stored(&bob, &dev, 1).await), vec!["dev update"]);
}

#[tokio::test]
async fn restart_catches_up_from_newest_window() {
    let net = MemoryNetwork::default();
    let alice = peer(&net, 0xAA);
    let bob = peer(&net, 0xBB);
    let status = room("status");
    alice.messenger.join(status.clone()).await.unwrap();
    bob.messenger.join(status.clone()).await.unwrap();
    let joined = bob.transport.requests()[0].clone();

    bob.messenger.stop().await;
    assert_eq!(bob.messenger.stream_state(&status).await, None);
    alice.messenger.send(&status, "missed one").await.unwrap();
    alice.messenger.send(&status, "missed two").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bob.messenger.messages(&status, 0).await.unwrap().is_empty());

    bob.messenger.start().await.unwrap();
    let catch_up = bob.transport.requests()[1].clone();
    assert_eq!(catch_up.from, joined.to);
    assert!(catch_up.to >= joined.to);

    let stored = wait_for_stored(&bob, &status, 2).await;
    assert_eq!(texts(&stored), vec!["missed one", "missed two"]);
}

#[tokio::test]
async fn replay_is_capped_at_request_limit() {
    let net = MemoryNetwork::default();
    let alice = peer(&net, 0xAA);
    let status = room("status");
    alice.messenger.join(status.clone()).await.unwrap();
    for n in 0..5 {
        alice.messenger.send(&status, &format!("m{n}")).await.unwrap();
    }

    let bob = peer_with(
        &net,
        0xBB,
        EngineConfig {
            request_limit: 2,
            ..EngineConfig::default()
        },
    );
    bob.messenger.join(status.clone()).await.unwrap();

    let stored = wait_for_stored(&bob, &status, 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(texts(&stored), vec!["m3", "m4"]);
    assert_eq!(bob.messenger.messages(&status, 0).await.unwrap().len(), 2);
}

#[tokio::test]
async fn explicit_range_outside_history_replays_nothing() {
    let net = MemoryNetwork::default();
    let alice = peer(&net, 0xAA);
    let bob = peer(&net, 0xBB);
    let status = room("status");
    alice.messenger.join(status.clone()).await.unwrap();
    alice.messenger.send(&status, "recent").await.unwrap();

    bob.store.save_contacts(&[status.clone()]).await.unwrap();
    bob.messenger.start().await.unwrap();
    wait_for_stored(&bob, &status, 1).await;

    bob.messenger
        .request(&status, TimeRange::new(0, 1_000))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bob.messenger.messages(&status, 0).await.unwrap().len(), 1);
    assert_eq!(
        bob.messenger.window(&status).unwrap().oldest,
        Some(TimeRange::new(0, 1_000))
    );
}
