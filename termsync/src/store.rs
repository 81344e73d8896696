//! Persistence contract for contacts and messages.
//!
//! Defines the [`Store`] trait the engine writes through, plus
//! [`InMemoryStore`] for tests and the simulation binary.
//!
//! Messages are append-only per contact. The store is the single place
//! where duplicate message ids are detected: a second save of the same id
//! for the same contact fails with [`StoreError::AlreadyExists`], which the
//! engine treats as an expected outcome of at-least-once delivery.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;

use termsync_proto::contact::{Contact, ContactKey, ContactKind};
use termsync_proto::message::{Message, MessageId};

/// Errors that can occur during store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A message with this id is already stored for the contact.
    #[error("message {id} already exists")]
    AlreadyExists {
        /// The duplicate id.
        id: MessageId,
    },

    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The underlying storage is unavailable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether this is the duplicate-id signal.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// Trait for persisting contacts and their messages.
///
/// Implementations must serialize concurrent writers internally; the
/// engine saves from several stream tasks at once.
///
/// Implementations include:
/// - [`InMemoryStore`] — non-persistent store for tests and simulation
pub trait Store: Send + Sync {
    /// All known contacts, in insertion order.
    fn contacts(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Contact>, StoreError>> + Send;

    /// Inserts or replaces contacts, matching on `(name, kind)`.
    fn save_contacts(
        &self,
        contacts: &[Contact],
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Removes a contact and its messages.
    ///
    /// Fails with [`StoreError::NotFound`] if the contact is unknown.
    fn delete_contact(
        &self,
        contact: &Contact,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Highest logical clock stored for the contact, or `0` if none.
    fn last_message_clock(
        &self,
        contact: &Contact,
    ) -> impl std::future::Future<Output = Result<i64, StoreError>> + Send;

    /// Appends a batch of messages, all or nothing.
    ///
    /// Returns the sequence number assigned to the last message of the
    /// batch. Fails with [`StoreError::AlreadyExists`] if any id is already
    /// stored for the contact or repeats within the batch.
    fn save_messages(
        &self,
        contact: &Contact,
        messages: &[Message],
    ) -> impl std::future::Future<Output = Result<i64, StoreError>> + Send;

    /// Messages whose wall-clock timestamp falls in `[from, to]` (unix
    /// seconds), ascending by logical clock.
    fn messages(
        &self,
        contact: &Contact,
        from: i64,
        to: i64,
    ) -> impl std::future::Future<Output = Result<Vec<Message>, StoreError>> + Send;

    /// Messages with a sequence number `>= offset`, ascending by logical
    /// clock.
    fn get_new_messages(
        &self,
        contact: &Contact,
        offset: i64,
    ) -> impl std::future::Future<Output = Result<Vec<Message>, StoreError>> + Send;

    /// Whether a public room contact with this name is stored.
    fn public_contact_exists(
        &self,
        contact: &Contact,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;
}

#[derive(Debug, Clone)]
struct Stored {
    seq: i64,
    message: Message,
}

#[derive(Default)]
struct StoreState {
    contacts: Vec<Contact>,
    messages: HashMap<ContactKey, Vec<Stored>>,
    last_seq: i64,
}

fn sorted(mut stored: Vec<&Stored>) -> Vec<Message> {
    stored.sort_by(|a, b| {
        a.message
            .clock
            .cmp(&b.message.clock)
            .then(a.seq.cmp(&b.seq))
    });
    stored.into_iter().map(|s| s.message.clone()).collect()
}

/// In-memory implementation of [`Store`].
///
/// Sequence numbers come from one counter shared by all contacts, starting
/// at 1. Not persistent: all data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    /// Create a new, empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write fail with [`StoreError::Unavailable`] while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("store is read-only".into()))
        } else {
            Ok(())
        }
    }
}

impl Store for InMemoryStore {
    async fn contacts(&self) -> Result<Vec<Contact>, StoreError> {
        Ok(self.state.lock().await.contacts.clone())
    }

    async fn save_contacts(&self, contacts: &[Contact]) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        for contact in contacts {
            match state.contacts.iter_mut().find(|c| *c == contact) {
                Some(existing) => *existing = contact.clone(),
                None => state.contacts.push(contact.clone()),
            }
        }
        Ok(())
    }

    async fn delete_contact(&self, contact: &Contact) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        let before = state.contacts.len();
        state.contacts.retain(|c| c != contact);
        if state.contacts.len() == before {
            return Err(StoreError::NotFound(format!("contact {contact}")));
        }
        state.messages.remove(&contact.key());
        Ok(())
    }

    async fn last_message_clock(&self, contact: &Contact) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .messages
            .get(&contact.key())
            .and_then(|stored| stored.iter().map(|s| s.message.clock).max())
            .unwrap_or(0))
    }

    async fn save_messages(
        &self,
        contact: &Contact,
        messages: &[Message],
    ) -> Result<i64, StoreError> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        let key = contact.key();

        let mut ids: HashSet<&MessageId> = state
            .messages
            .get(&key)
            .map(|stored| stored.iter().map(|s| &s.message.id).collect())
            .unwrap_or_default();
        if let Some(dup) = messages.iter().find(|m| !ids.insert(&m.id)) {
            return Err(StoreError::AlreadyExists { id: dup.id.clone() });
        }
        drop(ids);

        let mut seq = state.last_seq;
        let fresh: Vec<Stored> = messages
            .iter()
            .map(|message| {
                seq += 1;
                Stored {
                    seq,
                    message: message.clone(),
                }
            })
            .collect();
        state.last_seq = seq;
        state.messages.entry(key).or_default().extend(fresh);
        Ok(seq)
    }

    async fn messages(
        &self,
        contact: &Contact,
        from: i64,
        to: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let state = self.state.lock().await;
        let in_range: Vec<&Stored> = state
            .messages
            .get(&contact.key())
            .map(|stored| {
                stored
                    .iter()
                    .filter(|s| {
                        let secs = s.message.timestamp / 1000;
                        secs >= from && secs <= to
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(sorted(in_range))
    }

    async fn get_new_messages(
        &self,
        contact: &Contact,
        offset: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let state = self.state.lock().await;
        let newer: Vec<&Stored> = state
            .messages
            .get(&contact.key())
            .map(|stored| stored.iter().filter(|s| s.seq >= offset).collect())
            .unwrap_or_default();
        Ok(sorted(newer))
    }

    async fn public_contact_exists(&self, contact: &Contact) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .contacts
            .iter()
            .any(|c| c.kind == ContactKind::PublicRoom && c.name == contact.name))
    }
}
