//! Integration tests for public room synchronization.
//!
//! Several messengers share one in-memory network and exchange messages in
//! public rooms:
//!
//! 1. A message sent to a room reaches every other member exactly once.
//! 2. The sender keeps its own copy without receiving an echo.
//! 3. Every member ends up with the same messages, ordered by clock.
//! 4. Leaving a room stops live delivery; re-joining backfills what was
//!    missed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use termsync::config::EngineConfig;
use termsync::event::Event;
use termsync::messenger::Messenger;
use termsync::store::InMemoryStore;
use termsync::transport::memory::{MemoryNetwork, MemoryTransport};
use termsync_proto::contact::{Contact, PublicKey};
use termsync_proto::message::{Message, MessageKind};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Peer {
    key: PublicKey,
    messenger: Messenger<MemoryTransport, InMemoryStore>,
    events: mpsc::Receiver<Event>,
}

fn peer(net: &MemoryNetwork, byte: u8) -> Peer {
    let key = PublicKey::new(vec![byte; 32]);
    let (messenger, events) = Messenger::new(
        Arc::new(net.endpoint(key.clone())),
        Arc::new(InMemoryStore::new()),
        key.clone(),
        EngineConfig::default(),
    );
    Peer {
        key,
        messenger,
        events,
    }
}

fn room(name: &str) -> Contact {
    Contact::public_room(name).unwrap()
}

async fn next_event(rx: &mut mpsc::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event bus closed")
}

/// Waits for the next message event, skipping init and rearrange.
async fn next_message(rx: &mut mpsc::Receiver<Event>) -> (Contact, Message) {
    loop {
        if let Event::Message { contact, message } = next_event(rx).await {
            return (contact, message);
        }
    }
}

/// Polls until `count` messages are stored for `contact`.
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

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn room_message_reaches_other_member() {
    let net = MemoryNetwork::default();
    let alice = peer(&net, 0xAA);
    let mut bob = peer(&net, 0xBB);
    let status = room("status");

    alice.messenger.join(status.clone()).await.unwrap();
    bob.messenger.join(status.clone()).await.unwrap();
    assert_eq!(next_event(&mut bob.events).await, Event::Init { contact: status.clone() });

    let sent = alice.messenger.send(&status, "hello room").await.unwrap();

    let (contact, received) = next_message(&mut bob.events).await;
    assert_eq!(contact, status);
    assert_eq!(received, sent);
    assert!(received.is_signed_by(&alice.key));
    assert_eq!(received.kind, MessageKind::PublicGroupText);
    assert_eq!(received.chat_id, "status");
}

#[tokio::test]
async fn sender_keeps_one_copy_of_its_own_message() {
    let net = MemoryNetwork::default();
    let alice = peer(&net, 0xAA);
    let status = room("status");
    alice.messenger.join(status.clone()).await.unwrap();

    let sent = alice.messenger.send(&status, "just me").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(alice.messenger.messages(&status, 0).await.unwrap(), vec![sent]);
}

#[tokio::test]
async fn three_members_converge_in_clock_order() {
    let net = MemoryNetwork::default();
    let peers = [peer(&net, 1), peer(&net, 2), peer(&net, 3)];
    let status = room("status");
    for p in &peers {
        p.messenger.join(status.clone()).await.unwrap();
    }

    for round in 0..2 {
        for (i, p) in peers.iter().enumerate() {
            p.messenger
                .send(&status, &format!("round {round} from {i}"))
                .await
                .unwrap();
        }
    }

    let mut histories = Vec::new();
    for p in &peers {
        let stored = wait_for_stored(p, &status, 6).await;
        assert_eq!(stored.len(), 6);
        assert!(stored.windows(2).all(|w| w[0].clock <= w[1].clock));
        let mut ids: Vec<_> = stored.iter().map(|m| m.id.clone()).collect();
        ids.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
        histories.push(ids);
    }
    assert_eq!(histories[0], histories[1]);
    assert_eq!(histories[1], histories[2]);
}

#[tokio::test]
async fn separate_rooms_do_not_leak() {
    let net = MemoryNetwork::default();
    let alice = peer(&net, 0xAA);
    let bob = peer(&net, 0xBB);
    let (status, dev) = (room("status"), room("dev"));

    alice.messenger.join(status.clone()).await.unwrap();
    alice.messenger.join(dev.clone()).await.unwrap();
    bob.messenger.join(status.clone()).await.unwrap();

    alice.messenger.send(&dev, "dev only").await.unwrap();
    alice.messenger.send(&status, "for everyone").await.unwrap();

    let stored = wait_for_stored(&bob, &status, 1).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].text, "for everyone");
    assert!(bob.messenger.messages(&dev, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn leave_stops_delivery_and_rejoin_backfills() {
    let net = MemoryNetwork::default();
    let alice = peer(&net, 0xAA);
    let bob = peer(&net, 0xBB);
    let status = room("status");
    alice.messenger.join(status.clone()).await.unwrap();
    bob.messenger.join(status.clone()).await.unwrap();

    bob.messenger.leave(&status).await.unwrap();
    let missed = alice.messenger.send(&status, "while you were out").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(bob.messenger.messages(&status, 0).await.unwrap().is_empty());

    bob.messenger.join(status.clone()).await.unwrap();
    let stored = wait_for_stored(&bob, &status, 1).await;
    assert_eq!(stored, vec![missed]);
}
