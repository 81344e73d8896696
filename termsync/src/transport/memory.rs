//! In-process transport for tests and simulation.
//!
//! A [`MemoryNetwork`] is a shared hub; each participant gets its own
//! [`MemoryTransport`] endpoint via [`MemoryNetwork::endpoint`]. Public
//! rooms are broadcast topics, direct messages go to the recipient's inbox.
//! Every envelope is archived so that [`Transport::request`] can replay
//! history into the requester's live subscriptions.
//!
//! The network can be told to misbehave: drop, duplicate or corrupt live
//! deliveries at configurable rates, fail the next send or request of an
//! endpoint, and terminate an endpoint's subscriptions.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use sha2::{Digest, Sha256};

use termsync_proto::clock::now_millis;
use termsync_proto::contact::PublicKey;
use termsync_proto::message::MessageId;

use super::{
    ChatOptions, Envelope, RequestOptions, Subscription, SubscriptionSink, Transport,
    TransportError,
};

/// Default per-subscription channel capacity.
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 256;

/// Delivery faults applied to live broadcasts.
///
/// Rates are probabilities in `[0.0, 1.0]`; out-of-range values are
/// clamped. History replays are never faulted.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FaultPlan {
    /// Probability a delivery is silently lost.
    pub drop_rate: f64,
    /// Probability a delivery arrives twice.
    pub duplicate_rate: f64,
    /// Probability a truncated copy of the payload is delivered first.
    pub corrupt_rate: f64,
}

impl FaultPlan {
    /// No faults at all.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            corrupt_rate: 0.0,
        }
    }
}

/// Where an envelope is published.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Topic {
    /// A public room, by name.
    Chat(String),
    /// The inbox of the identity with this key.
    Inbox(PublicKey),
}

impl Topic {
    fn for_options(options: &ChatOptions) -> Result<Self, TransportError> {
        options.validate()?;
        match (&options.chat_name, &options.recipient) {
            (Some(name), _) => Ok(Self::Chat(name.clone())),
            (None, Some(key)) => Ok(Self::Inbox(key.clone())),
            (None, None) => Err(TransportError::InvalidOptions(
                "one of chat name or recipient is required".into(),
            )),
        }
    }
}

struct Subscriber {
    owner: PublicKey,
    topic: Topic,
    sink: SubscriptionSink,
}

struct NetworkState {
    subscribers: Vec<Subscriber>,
    archive: Vec<(Topic, Envelope)>,
}

/// Shared in-process network hub.
///
/// Cheap to clone; all clones refer to the same network.
#[derive(Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
    faults: Arc<Mutex<FaultPlan>>,
    buffer: usize,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIPTION_BUFFER)
    }
}

impl MemoryNetwork {
    /// Creates an empty network whose subscriptions buffer `buffer` envelopes.
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                subscribers: Vec::new(),
                archive: Vec::new(),
            })),
            faults: Arc::new(Mutex::new(FaultPlan::none())),
            buffer: buffer.max(1),
        }
    }

    /// Replaces the fault plan for subsequent live deliveries.
    pub fn set_faults(&self, plan: FaultPlan) {
        *self.faults.lock() = plan;
    }

    /// Creates an endpoint acting as the identity `own_key`.
    #[must_use]
    pub fn endpoint(&self, own_key: PublicKey) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            own_key,
            requests: Mutex::new(Vec::new()),
            fail_send: Mutex::new(None),
            fail_request: Mutex::new(None),
        }
    }

    /// Number of envelopes archived so far.
    #[must_use]
    pub fn archive_len(&self) -> usize {
        self.state.lock().archive.len()
    }

    /// Number of live subscriptions on the network.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|s| !s.sink.is_closed());
        state.subscribers.len()
    }

    /// Delivers a raw envelope to every subscriber of a conversation.
    ///
    /// Bypasses the archive and the fault plan. Returns the number of
    /// subscribers reached.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidOptions`] for malformed options.
    pub async fn inject(
        &self,
        options: &ChatOptions,
        envelope: Envelope,
    ) -> Result<usize, TransportError> {
        let topic = Topic::for_options(options)?;
        let sinks = self.sinks_for(&topic, |_| true);
        let mut reached = 0;
        for sink in sinks {
            if sink.deliver(envelope.clone()).await {
                reached += 1;
            }
        }
        Ok(reached)
    }

    /// Clones out the sinks on `topic` whose owner passes `accept`, pruning
    /// closed ones. The lock is released before anything is delivered.
    fn sinks_for(
        &self,
        topic: &Topic,
        accept: impl Fn(&PublicKey) -> bool,
    ) -> Vec<SubscriptionSink> {
        let mut state = self.state.lock();
        state.subscribers.retain(|s| !s.sink.is_closed());
        state
            .subscribers
            .iter()
            .filter(|s| &s.topic == topic && accept(&s.owner))
            .map(|s| s.sink.clone())
            .collect()
    }
}

/// What to do with one live delivery.
struct Delivery {
    drop: bool,
    duplicate: bool,
    corrupt: bool,
}

fn roll(plan: &FaultPlan) -> Delivery {
    let mut rng = rand::rng();
    let mut chance = |p: f64| p > 0.0 && rng.random_bool(p.clamp(0.0, 1.0));
    Delivery {
        drop: chance(plan.drop_rate),
        duplicate: chance(plan.duplicate_rate),
        corrupt: chance(plan.corrupt_rate),
    }
}

fn envelope_id(signer: &PublicKey, payload: &[u8], timestamp: i64) -> MessageId {
    let mut hasher = Sha256::new();
    hasher.update(signer.as_bytes());
    hasher.update(payload);
    hasher.update(timestamp.to_be_bytes());
    MessageId::new(hasher.finalize().to_vec())
}

fn corrupted(envelope: &Envelope) -> Envelope {
    let mut payload = envelope.payload.clone();
    payload.truncate(payload.len() / 2);
    let mut id = envelope.id.as_bytes().to_vec();
    id.push(0xff);
    Envelope {
        id: MessageId::new(id),
        payload,
        ..envelope.clone()
    }
}

/// One participant's view of a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    own_key: PublicKey,
    requests: Mutex<Vec<RequestOptions>>,
    fail_send: Mutex<Option<TransportError>>,
    fail_request: Mutex<Option<TransportError>>,
}

impl MemoryTransport {
    /// Identity this endpoint signs with.
    #[must_use]
    pub const fn own_key(&self) -> &PublicKey {
        &self.own_key
    }

    /// Every request this endpoint has issued, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<RequestOptions> {
        self.requests.lock().clone()
    }

    /// Makes the next [`send`](Transport::send) fail with `error`.
    pub fn fail_next_send(&self, error: TransportError) {
        *self.fail_send.lock() = Some(error);
    }

    /// Makes the next [`request`](Transport::request) fail with `error`.
    pub fn fail_next_request(&self, error: TransportError) {
        *self.fail_request.lock() = Some(error);
    }

    /// Terminates every live subscription owned by this endpoint.
    ///
    /// Each subscription reports `error` once drained.
    pub fn close_subscriptions(&self, error: &TransportError) {
        let closed: Vec<SubscriptionSink> = {
            let mut state = self.network.state.lock();
            let (mine, rest) = std::mem::take(&mut state.subscribers)
                .into_iter()
                .partition(|s: &Subscriber| s.owner == self.own_key);
            state.subscribers = rest;
            mine.into_iter().map(|s| s.sink).collect()
        };
        tracing::debug!(count = closed.len(), error = %error, "closing subscriptions");
        for sink in closed {
            sink.fail(error.clone());
        }
    }
}

impl Transport for MemoryTransport {
    async fn subscribe(&self, options: &ChatOptions) -> Result<Subscription, TransportError> {
        let topic = match Topic::for_options(options)? {
            Topic::Chat(name) => Topic::Chat(name),
            Topic::Inbox(_) => Topic::Inbox(self.own_key.clone()),
        };
        let (sink, subscription) = Subscription::channel(self.network.buffer);
        self.network.state.lock().subscribers.push(Subscriber {
            owner: self.own_key.clone(),
            topic,
            sink,
        });
        Ok(subscription)
    }

    async fn send(
        &self,
        payload: &[u8],
        options: &ChatOptions,
    ) -> Result<MessageId, TransportError> {
        let topic = Topic::for_options(options)?;
        if let Some(error) = self.fail_send.lock().take() {
            return Err(error);
        }

        let timestamp = now_millis();
        let envelope = Envelope {
            id: envelope_id(&self.own_key, payload, timestamp),
            signer: Some(self.own_key.clone()),
            payload: payload.to_vec(),
            timestamp,
        };

        self.network
            .state
            .lock()
            .archive
            .push((topic.clone(), envelope.clone()));

        let sinks = self
            .network
            .sinks_for(&topic, |owner| owner != &self.own_key);
        let plan = *self.network.faults.lock();
        for sink in sinks {
            let delivery = roll(&plan);
            if delivery.drop {
                tracing::trace!(id = %envelope.id, "fault: dropped delivery");
                continue;
            }
            if delivery.corrupt {
                sink.deliver(corrupted(&envelope)).await;
            }
            sink.deliver(envelope.clone()).await;
            if delivery.duplicate {
                sink.deliver(envelope.clone()).await;
            }
        }

        Ok(envelope.id)
    }

    async fn request(&self, options: &RequestOptions) -> Result<(), TransportError> {
        options.validate()?;
        self.requests.lock().push(options.clone());
        if let Some(error) = self.fail_request.lock().take() {
            return Err(error);
        }

        let limit = usize::try_from(options.limit).unwrap_or(usize::MAX);
        let mut seen = HashSet::new();
        for chat in &options.chats {
            if !seen.insert(chat.clone()) {
                continue;
            }
            // Inbox history is filtered down to the one peer being asked about.
            let (topic, from_peer) = match Topic::for_options(chat)? {
                Topic::Chat(name) => (Topic::Chat(name), None),
                Topic::Inbox(peer) => (Topic::Inbox(self.own_key.clone()), Some(peer)),
            };

            let history: Vec<Envelope> = {
                let state = self.network.state.lock();
                let mut matching: Vec<Envelope> = state
                    .archive
                    .iter()
                    .filter(|(t, _)| t == &topic)
                    .map(|(_, e)| e)
                    .filter(|e| {
                        let secs = e.timestamp / 1000;
                        secs >= options.from && secs <= options.to
                    })
                    .filter(|e| from_peer.is_none() || e.signer == from_peer)
                    .rev()
                    .take(limit)
                    .cloned()
                    .collect();
                matching.reverse();
                matching
            };

            let sinks = self
                .network
                .sinks_for(&topic, |owner| owner == &self.own_key);
            tracing::debug!(
                chat = %chat,
                envelopes = history.len(),
                subscribers = sinks.len(),
                "replaying history"
            );
            for sink in sinks {
                for envelope in &history {
                    sink.deliver(envelope.clone()).await;
                }
            }
        }
        Ok(())
    }
}
