//! Event bus from the engine to its observer.
//!
//! One ordered queue of [`Event`]s, each tagged with the contact it
//! concerns. The queue is bounded: when the observer falls behind,
//! producers wait for capacity instead of dropping events, so events for
//! one contact are never lost or reordered.
//!
//! The bus also tracks the highest logical clock it has announced per
//! contact. A message arriving below that mark is preceded by a
//! [`Event::Rearrange`] telling the observer to reload that conversation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use termsync_proto::contact::{Contact, ContactKey};
use termsync_proto::message::Message;

/// Something the observer should react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A conversation became active (loaded, joined or discovered).
    Init {
        /// The conversation.
        contact: Contact,
    },
    /// Already-announced messages are no longer in clock order; reload
    /// the conversation from offset 0.
    Rearrange {
        /// The conversation.
        contact: Contact,
    },
    /// A message was persisted.
    Message {
        /// The conversation.
        contact: Contact,
        /// The stored message.
        message: Message,
    },
    /// A stream for this conversation terminated with an error.
    Error {
        /// The conversation.
        contact: Contact,
        /// Rendered error.
        error: String,
    },
}

impl Event {
    /// The contact this event concerns.
    #[must_use]
    pub const fn contact(&self) -> &Contact {
        match self {
            Self::Init { contact }
            | Self::Rearrange { contact }
            | Self::Message { contact, .. }
            | Self::Error { contact, .. } => contact,
        }
    }
}

/// Sending side of the event queue.
///
/// Cheap to clone; every stream handler holds one.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<Event>,
    announced: Arc<Mutex<HashMap<ContactKey, i64>>>,
}

impl EventBus {
    /// Creates a bus and its receiving end with capacity `buffer`.
    #[must_use]
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                tx,
                announced: Arc::new(Mutex::new(HashMap::new())),
            },
            rx,
        )
    }

    /// Announces that a conversation became active.
    pub async fn init(&self, contact: &Contact) {
        self.emit(Event::Init {
            contact: contact.clone(),
        })
        .await;
    }

    /// Announces a persisted message, preceded by a rearrange if its clock
    /// is below one already announced for the contact.
    pub async fn message(&self, contact: &Contact, message: Message) {
        let out_of_order = {
            let mut announced = self.announced.lock();
            let highest = announced.entry(contact.key()).or_insert(i64::MIN);
            let behind = message.clock < *highest;
            *highest = (*highest).max(message.clock);
            behind
        };
        if out_of_order {
            self.emit(Event::Rearrange {
                contact: contact.clone(),
            })
            .await;
        }
        self.emit(Event::Message {
            contact: contact.clone(),
            message,
        })
        .await;
    }

    /// Reports a stream failure.
    pub async fn error(&self, contact: &Contact, error: &impl std::fmt::Display) {
        self.emit(Event::Error {
            contact: contact.clone(),
            error: error.to_string(),
        })
        .await;
    }

    /// Forgets the clock high-water mark for a contact.
    pub fn forget(&self, contact: &Contact) {
        self.announced.lock().remove(&contact.key());
    }

    async fn emit(&self, event: Event) {
        if let Err(e) = self.tx.send(event).await {
            tracing::debug!(contact = %e.0.contact(), "event observer gone; discarding");
        }
    }
}
