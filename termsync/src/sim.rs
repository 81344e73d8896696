//! In-process simulation of several peers syncing over a faulty network.
//!
//! Every peer gets its own [`Messenger`], [`InMemoryStore`] and endpoint on
//! one shared [`MemoryNetwork`]. The run goes through four phases:
//!
//! 1. every peer joins the configured rooms and befriends the next peer;
//! 2. with faults enabled, every peer posts to every room and sends one
//!    direct message;
//! 3. faults are lifted and every peer catches up with `request_all`;
//! 4. each peer's store is summarised.
//!
//! Live deliveries may be dropped, duplicated or corrupted in phase 2; the
//! backfill in phase 3 is what brings the stores back in line.

use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use termsync_proto::contact::{Contact, ContactError, PublicKey};

use crate::config::ClientConfig;
use crate::event::Event;
use crate::identity::{FileKeyStore, Identity, IdentityError, load_or_generate};
use crate::messenger::{Messenger, MessengerError};
use crate::store::InMemoryStore;
use crate::transport::memory::{FaultPlan, MemoryNetwork, MemoryTransport};

type SimMessenger = Messenger<MemoryTransport, InMemoryStore>;

/// Errors that abort a simulation run.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// A messenger operation failed.
    #[error(transparent)]
    Messenger(#[from] MessengerError),

    /// The identity could not be loaded.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// A configured room name is invalid.
    #[error(transparent)]
    Contact(#[from] ContactError),

    /// A peer task panicked.
    #[error("peer task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Per-conversation message count for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    /// The conversation.
    pub contact: Contact,
    /// Messages stored for it.
    pub stored: usize,
}

/// What one peer ended up with.
#[derive(Debug, Clone)]
pub struct PeerSummary {
    /// Display name of the peer.
    pub name: String,
    /// Fingerprint of its public key.
    pub fingerprint: String,
    /// Stored conversations.
    pub conversations: Vec<ConversationSummary>,
}

/// Result of a simulation run.
#[derive(Debug, Clone)]
pub struct SimReport {
    /// Messages every peer should hold per room.
    pub expected_per_room: usize,
    /// One entry per peer.
    pub peers: Vec<PeerSummary>,
}

impl SimReport {
    /// Whether every peer holds every room message.
    #[must_use]
    pub fn converged(&self) -> bool {
        self.peers.iter().all(|peer| {
            peer.conversations
                .iter()
                .filter(|c| c.contact.is_public())
                .all(|c| c.stored == self.expected_per_room)
        })
    }
}

struct Peer {
    name: String,
    fingerprint: String,
    messenger: Arc<SimMessenger>,
}

/// Renders one observed event as a log line.
#[must_use]
pub fn format_event(at: DateTime<Local>, peer: &str, event: &Event) -> String {
    let stamp = at.format("%H:%M:%S%.3f");
    match event {
        Event::Init { contact } => format!("[{stamp}] {peer}: {contact} active"),
        Event::Rearrange { contact } => format!("[{stamp}] {peer}: {contact} reordered"),
        Event::Message { contact, message } => {
            let from = message
                .signer
                .as_ref()
                .map_or_else(|| "?".to_string(), PublicKey::fingerprint);
            format!("[{stamp}] {peer}: {contact} <{from}> {}", message.text)
        }
        Event::Error { contact, error } => format!("[{stamp}] {peer}: {contact} error: {error}"),
    }
}

/// Runs a simulation, forwarding every peer's events to `observer`.
///
/// # Errors
///
/// Returns [`SimError`] if a peer cannot be set up or an engine call fails
/// outside the faulty phase.
pub async fn run(
    config: &ClientConfig,
    observer: mpsc::Sender<(String, Event)>,
) -> Result<SimReport, SimError> {
    let sim = &config.simulation;
    let net = MemoryNetwork::new(config.engine.subscription_buffer);
    let rooms = sim
        .rooms
        .iter()
        .map(Contact::public_room)
        .collect::<Result<Vec<_>, _>>()?;

    let mut peers = Vec::with_capacity(sim.peers);
    for index in 0..sim.peers {
        let identity = match (&config.key_file, index) {
            (Some(path), 0) => load_or_generate(&FileKeyStore::new(path))?,
            _ => Identity::generate(),
        };
        peers.push(spawn_peer(&net, config, format!("peer-{index}"), &identity, &observer));
    }
    drop(observer);

    tracing::info!(peers = peers.len(), rooms = rooms.len(), "simulation: joining");
    for peer in &peers {
        peer.messenger.start().await?;
        for room in &rooms {
            peer.messenger.join(room.clone()).await?;
        }
    }
    if peers.len() > 1 {
        for (index, peer) in peers.iter().enumerate() {
            let next = &peers[(index + 1) % peers.len()];
            let friend = Contact::direct_peer(next.name.clone(), next.messenger.own_key().clone())?;
            peer.messenger.join(friend).await?;
        }
    }

    tracing::info!(faults = ?sim.faults, "simulation: exchanging messages");
    net.set_faults(sim.faults);
    let mut tasks = JoinSet::new();
    for (index, peer) in peers.iter().enumerate() {
        let messenger = Arc::clone(&peer.messenger);
        let rooms = rooms.clone();
        let name = peer.name.clone();
        let friend = (peers.len() > 1).then(|| {
            let next = &peers[(index + 1) % peers.len()];
            (next.name.clone(), next.messenger.own_key().clone())
        });
        let count = sim.messages_per_peer;
        tasks.spawn(async move {
            for room in &rooms {
                for n in 1..=count {
                    let text = format!("message {n} from {name}");
                    if let Err(e) = messenger.send(room, &text).await {
                        tracing::warn!(peer = %name, room = %room, error = %e, "send failed");
                    }
                }
            }
            if let Some((friend_name, key)) = friend {
                match Contact::direct_peer(friend_name, key) {
                    Ok(contact) => {
                        if let Err(e) = messenger.send(&contact, &format!("hi from {name}")).await {
                            tracing::warn!(peer = %name, error = %e, "direct send failed");
                        }
                    }
                    Err(e) => tracing::warn!(peer = %name, error = %e, "bad direct peer"),
                }
            }
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined?;
    }
    tokio::time::sleep(sim.settle).await;

    tracing::info!("simulation: backfilling");
    net.set_faults(FaultPlan::none());
    for peer in &peers {
        peer.messenger.request_all(true).await?;
    }
    tokio::time::sleep(sim.settle).await;

    let mut summaries = Vec::with_capacity(peers.len());
    for peer in &peers {
        let mut conversations = Vec::new();
        for contact in peer.messenger.contacts().await? {
            let stored = peer.messenger.messages(&contact, 0).await?.len();
            conversations.push(ConversationSummary { contact, stored });
        }
        peer.messenger.stop().await;
        summaries.push(PeerSummary {
            name: peer.name.clone(),
            fingerprint: peer.fingerprint.clone(),
            conversations,
        });
    }

    Ok(SimReport {
        expected_per_room: sim.peers * sim.messages_per_peer,
        peers: summaries,
    })
}

fn spawn_peer(
    net: &MemoryNetwork,
    config: &ClientConfig,
    name: String,
    identity: &Identity,
    observer: &mpsc::Sender<(String, Event)>,
) -> Peer {
    let key = identity.public_key().clone();
    let transport = Arc::new(net.endpoint(key.clone()));
    let store = Arc::new(InMemoryStore::new());
    let (messenger, mut events) = Messenger::new(transport, store, key, config.engine.clone());

    let forward = observer.clone();
    let label = name.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if forward.send((label.clone(), event)).await.is_err() {
                break;
            }
        }
    });

    Peer {
        name,
        fingerprint: identity.fingerprint(),
        messenger: Arc::new(messenger),
    }
}
