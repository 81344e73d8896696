//! Stream handlers: the single write path from the network into the store.
//!
//! A [`StreamHandler`] receives each decoded [`Message`] a stream delivers,
//! persists it and announces it on the [`EventBus`]. Two variants exist:
//!
//! - [`PublicHandler`] is bound to one public room and stores every message
//!   against that room.
//! - [`PrivateHandler`] serves the shared private stream. It resolves the
//!   signer to a direct peer, creating a contact in the `New` state for
//!   unknown keys, and drops messages from blocked peers.
//!
//! Duplicate deliveries surface as [`HandlerError::Duplicate`], carrying the
//! store's error untouched.

use std::sync::Arc;

use termsync_proto::contact::{Contact, ContactKind, ContactState, PublicKey};
use termsync_proto::message::Message;

use crate::event::EventBus;
use crate::store::{Store, StoreError};

/// Errors returned by a [`StreamHandler`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// A private message arrived without a signer.
    #[error("message should be signed")]
    Unsigned,

    /// The message is already stored for this contact.
    #[error(transparent)]
    Duplicate(StoreError),

    /// Persisting the message failed.
    #[error("failed to save message for {contact}: {source}")]
    Save {
        /// Contact the message was saved against.
        contact: String,
        /// Underlying store error.
        source: StoreError,
    },

    /// Persisting a newly discovered contact failed.
    #[error("failed to save contact {contact}: {source}")]
    SaveContact {
        /// The discovered contact.
        contact: String,
        /// Underlying store error.
        source: StoreError,
    },

    /// Looking up known contacts failed.
    #[error("failed to look up contacts: {0}")]
    Lookup(StoreError),
}

impl HandlerError {
    /// Whether this is a duplicate delivery.
    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// Persists one inbound message for a stream.
pub trait StreamHandler: Send + Sync + 'static {
    /// Handle a single decoded message.
    fn handle(
        &self,
        message: Message,
    ) -> impl std::future::Future<Output = Result<(), HandlerError>> + Send;
}

async fn persist<S: Store>(
    store: &S,
    events: &EventBus,
    contact: &Contact,
    message: Message,
) -> Result<(), HandlerError> {
    match store
        .save_messages(contact, std::slice::from_ref(&message))
        .await
    {
        Ok(_) => {
            events.message(contact, message).await;
            Ok(())
        }
        Err(e) if e.is_already_exists() => Err(HandlerError::Duplicate(e)),
        Err(source) => Err(HandlerError::Save {
            contact: contact.to_string(),
            source,
        }),
    }
}

/// Handler bound to one public room.
pub struct PublicHandler<S> {
    contact: Contact,
    store: Arc<S>,
    events: EventBus,
}

impl<S: Store> PublicHandler<S> {
    /// Creates a handler that stores every message against `contact`.
    #[must_use]
    pub const fn new(contact: Contact, store: Arc<S>, events: EventBus) -> Self {
        Self {
            contact,
            store,
            events,
        }
    }
}

impl<S: Store + 'static> StreamHandler for PublicHandler<S> {
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        persist(self.store.as_ref(), &self.events, &self.contact, message).await
    }
}

/// Handler for the shared private stream.
pub struct PrivateHandler<S> {
    store: Arc<S>,
    events: EventBus,
}

impl<S: Store> PrivateHandler<S> {
    /// Creates a handler that attributes messages by signer.
    #[must_use]
    pub const fn new(store: Arc<S>, events: EventBus) -> Self {
        Self { store, events }
    }

    /// Finds the direct peer for `signer`, creating it if unknown.
    ///
    /// A named contact wins over one created on discovery while both exist.
    async fn resolve(&self, signer: &PublicKey) -> Result<Contact, HandlerError> {
        let known = self
            .store
            .contacts()
            .await
            .map_err(HandlerError::Lookup)?
            .into_iter()
            .filter(|c| c.kind == ContactKind::DirectPeer && c.public_key.as_ref() == Some(signer))
            .min_by_key(|c| c.state == ContactState::New);
        if let Some(contact) = known {
            return Ok(contact);
        }

        let contact = Contact::discovered(signer.clone());
        self.store
            .save_contacts(std::slice::from_ref(&contact))
            .await
            .map_err(|source| HandlerError::SaveContact {
                contact: contact.to_string(),
                source,
            })?;
        tracing::info!(contact = %contact, "discovered new direct peer");
        self.events.init(&contact).await;
        Ok(contact)
    }
}

impl<S: Store + 'static> StreamHandler for PrivateHandler<S> {
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        let signer = message.signer.clone().ok_or(HandlerError::Unsigned)?;
        let contact = self.resolve(&signer).await?;
        if contact.state == ContactState::Blocked {
            tracing::debug!(
                contact = %contact,
                id = %message.id,
                "dropping message from blocked peer"
            );
            return Ok(());
        }
        persist(self.store.as_ref(), &self.events, &contact, message).await
    }
}
