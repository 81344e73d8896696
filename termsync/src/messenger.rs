//! The messenger: owns every stream and coordinates sending and backfill.
//!
//! [`Messenger`] is the engine's public entry point. It keeps one
//! [`Stream`] per joined public room and one shared stream for all direct
//! peers (private subscriptions are scoped to the local identity, not to a
//! peer), computes logical clocks for outgoing messages, persists its own
//! sends, and drives history backfill through per-contact [`Requester`]s.
//!
//! Everything the observer needs to know arrives on the [`Event`] receiver
//! returned by [`Messenger::new`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

use termsync_proto::clock::{next_clock, now_millis, now_secs};
use termsync_proto::codec::{self, CodecError};
use termsync_proto::contact::{
    Contact, ContactError, ContactKey, ContactKind, ContactState, PublicKey,
};
use termsync_proto::message::{Message, MessageKind, Payload, ValidationError};

use crate::config::EngineConfig;
use crate::event::{Event, EventBus};
use crate::handler::{PrivateHandler, PublicHandler};
use crate::requester::{RequestWindow, Requester, TimeRange, batch};
use crate::store::{Store, StoreError};
use crate::stream::{Stream, StreamError, StreamState};
use crate::transport::{ChatOptions, RequestOptions, Transport, TransportError};

/// Errors returned by [`Messenger`] operations.
#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    /// The contact is malformed.
    #[error(transparent)]
    Contact(#[from] ContactError),

    /// The outgoing message is invalid.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The outgoing payload could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A transport call failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A store call failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A stream could not be started.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// The contact is not known.
    #[error("contact not found: {0}")]
    NotFound(String),
}

struct Streams<T, S> {
    public: HashMap<ContactKey, Stream<T, PublicHandler<S>>>,
    private: Option<Stream<T, PrivateHandler<S>>>,
}

/// Coordinates streams, sends and backfill for one identity.
pub struct Messenger<T, S> {
    transport: Arc<T>,
    store: Arc<S>,
    own_key: PublicKey,
    events: EventBus,
    config: EngineConfig,
    streams: Mutex<Streams<T, S>>,
    requesters: parking_lot::Mutex<HashMap<ContactKey, Requester>>,
}

impl<T, S> Messenger<T, S>
where
    T: Transport + 'static,
    S: Store + 'static,
{
    /// Creates a messenger and the receiver for its events.
    ///
    /// Nothing is subscribed until [`start`](Self::start) or
    /// [`join`](Self::join) is called.
    #[must_use]
    pub fn new(
        transport: Arc<T>,
        store: Arc<S>,
        own_key: PublicKey,
        config: EngineConfig,
    ) -> (Self, mpsc::Receiver<Event>) {
        let (events, rx) = EventBus::new(config.event_buffer);
        let messenger = Self {
            transport,
            store,
            own_key,
            events,
            config,
            streams: Mutex::new(Streams {
                public: HashMap::new(),
                private: None,
            }),
            requesters: parking_lot::Mutex::new(HashMap::new()),
        };
        (messenger, rx)
    }

    /// The local identity's public key.
    #[must_use]
    pub const fn own_key(&self) -> &PublicKey {
        &self.own_key
    }

    /// Starts streams for every stored contact and catches up on history.
    ///
    /// One stream is started per public room, plus one shared private
    /// stream if any direct peer is stored. An [`Event::Init`] is emitted
    /// for every contact before the backfill.
    ///
    /// # Errors
    ///
    /// Fails on the first stream that cannot be started, or with the first
    /// failed backfill request.
    pub async fn start(&self) -> Result<(), MessengerError> {
        let contacts = self.store.contacts().await?;
        for contact in &contacts {
            contact.validate()?;
        }

        {
            let mut streams = self.streams.lock().await;
            for contact in contacts.iter().filter(|c| c.is_public()) {
                self.ensure_public(&mut streams, contact).await?;
            }
            if let Some(representative) = contacts.iter().find(|c| !c.is_public()) {
                self.ensure_private(&mut streams, representative).await?;
            }
            tracing::info!(
                public = streams.public.len(),
                private = streams.private.is_some(),
                "messenger started"
            );
        }

        for contact in &contacts {
            self.events.init(contact).await;
        }
        self.request_all(true).await
    }

    /// Stops every stream. Contacts and windows are kept.
    pub async fn stop(&self) {
        let mut streams = self.streams.lock().await;
        for (_, mut stream) in streams.public.drain() {
            stream.stop().await;
        }
        if let Some(mut stream) = streams.private.take() {
            stream.stop().await;
        }
        tracing::info!("messenger stopped");
    }

    /// Adds a conversation and requests its recent history.
    ///
    /// A public room gets its own stream unless one exists already; a
    /// stream that ended on its own is restarted. Direct peers share the
    /// private stream, which is started on the first join. Joining a direct
    /// peer absorbs any other stored peer with the same key, such as one
    /// created when its first message arrived.
    ///
    /// # Errors
    ///
    /// Returns an error if the contact is malformed, cannot be stored, its
    /// stream cannot be started, or the history request fails.
    pub async fn join(&self, contact: Contact) -> Result<(), MessengerError> {
        contact.validate()?;
        self.store
            .save_contacts(std::slice::from_ref(&contact))
            .await?;
        if contact.kind == ContactKind::DirectPeer {
            self.merge_aliases(&contact).await?;
        }

        {
            let mut streams = self.streams.lock().await;
            if contact.is_public() {
                self.ensure_public(&mut streams, &contact).await?;
            } else {
                self.ensure_private(&mut streams, &contact).await?;
            }
        }
        tracing::info!(contact = %contact, "joined");
        self.events.init(&contact).await;

        let range = self.requester(&contact)?.default_range(now_secs());
        self.request_range(&contact, range).await
    }

    /// Leaves a public room, stopping its stream.
    ///
    /// The contact and its messages stay in the store. Leaving a direct
    /// peer has no effect on streams.
    ///
    /// # Errors
    ///
    /// Returns [`MessengerError::NotFound`] for a public room that has
    /// neither a stream nor a stored contact.
    pub async fn leave(&self, contact: &Contact) -> Result<(), MessengerError> {
        if contact.kind == ContactKind::DirectPeer {
            return Ok(());
        }
        let mut streams = self.streams.lock().await;
        match streams.public.remove(&contact.key()) {
            Some(mut stream) => {
                stream.stop().await;
                tracing::info!(contact = %contact, "left");
                Ok(())
            }
            None if self.store.public_contact_exists(contact).await? => Ok(()),
            None => Err(MessengerError::NotFound(contact.to_string())),
        }
    }

    /// Sends a text message and persists it locally.
    ///
    /// The message gets the next logical clock for the conversation, the id
    /// returned by the transport, and the local key as signer.
    ///
    /// # Errors
    ///
    /// Returns an error if the contact or text is invalid, or if the
    /// transport or store call fails. Nothing is stored if the send fails.
    pub async fn send(&self, contact: &Contact, text: &str) -> Result<Message, MessengerError> {
        contact.validate()?;
        let kind = match contact.kind {
            ContactKind::PublicRoom => MessageKind::PublicGroupText,
            ContactKind::DirectPeer => MessageKind::PrivateText,
        };
        let options = ChatOptions::for_contact(contact)?;

        let now = now_millis();
        let clock = next_clock(self.store.last_message_clock(contact).await?, now);
        let payload = Payload::text(kind, contact.chat_id(), text, clock, now);
        payload.validate()?;
        let bytes = codec::encode(&payload)?;

        let id = self.transport.send(&bytes, &options).await?;
        let message = payload.into_message(id, Some(self.own_key.clone()));
        match self
            .store
            .save_messages(contact, std::slice::from_ref(&message))
            .await
        {
            Ok(_) => {
                tracing::debug!(contact = %contact, id = %message.id, clock, "sent");
                self.events.message(contact, message.clone()).await;
            }
            // A history replay stored and announced it first.
            Err(e) if e.is_already_exists() => {
                tracing::debug!(contact = %contact, id = %message.id, "sent, already stored");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(message)
    }

    /// Requests history for one contact over `range`.
    ///
    /// The contact's window is widened only if the request succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`MessengerError::NotFound`] for an unknown contact, or the
    /// transport error.
    pub async fn request(&self, contact: &Contact, range: TimeRange) -> Result<(), MessengerError> {
        if !self.store.contacts().await?.contains(contact) {
            return Err(MessengerError::NotFound(contact.to_string()));
        }
        self.request_range(contact, range).await
    }

    /// Requests the next older stretch of history for one contact.
    ///
    /// # Errors
    ///
    /// As for [`request`](Self::request).
    pub async fn request_more(&self, contact: &Contact) -> Result<(), MessengerError> {
        let range = self.requester(contact)?.next_range(false, now_secs());
        self.request(contact, range).await
    }

    /// Requests history for every contact, batching equal windows.
    ///
    /// With `newest`, contacts that have been synced before catch up from
    /// where their newest window ended. Blocked peers are skipped. Every
    /// batch is attempted; windows advance only for batches that
    /// succeeded.
    ///
    /// # Errors
    ///
    /// Returns the first transport error after all batches were attempted.
    pub async fn request_all(&self, newest: bool) -> Result<(), MessengerError> {
        let contacts = self.store.contacts().await?;
        let now = now_secs();
        let planned = {
            let mut requesters = self.requesters.lock();
            contacts
                .iter()
                .filter(|c| c.state != ContactState::Blocked)
                .map(|c| -> Result<_, MessengerError> {
                    let requester = self.requester_in(&mut requesters, c)?;
                    Ok((c.key(), requester.next_options(newest, now)))
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut first_error = None;
        for (keys, options) in batch(planned) {
            match self.transport.request(&options).await {
                Ok(()) => {
                    tracing::debug!(
                        chats = options.chats.len(),
                        from = options.from,
                        to = options.to,
                        "history requested"
                    );
                    let mut requesters = self.requesters.lock();
                    for key in &keys {
                        if let Some(requester) = requesters.get_mut(key) {
                            requester.update(&options);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        chats = options.chats.len(),
                        error = %e,
                        "history request failed"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }

    /// Messages for a contact with a store sequence number `>= offset`,
    /// ascending by logical clock.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn messages(
        &self,
        contact: &Contact,
        offset: i64,
    ) -> Result<Vec<Message>, MessengerError> {
        Ok(self.store.get_new_messages(contact, offset).await?)
    }

    /// Stored messages for a contact sent within `[from, to]` unix seconds.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn history(
        &self,
        contact: &Contact,
        from: i64,
        to: i64,
    ) -> Result<Vec<Message>, MessengerError> {
        Ok(self.store.messages(contact, from, to).await?)
    }

    /// All stored contacts.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn contacts(&self) -> Result<Vec<Contact>, MessengerError> {
        Ok(self.store.contacts().await?)
    }

    /// Leaves a contact and deletes it with its messages and window.
    ///
    /// # Errors
    ///
    /// Returns [`MessengerError::NotFound`] or the store error.
    pub async fn remove_contact(&self, contact: &Contact) -> Result<(), MessengerError> {
        self.leave(contact).await?;
        self.store.delete_contact(contact).await.map_err(|e| match e {
            StoreError::NotFound(_) => MessengerError::NotFound(contact.to_string()),
            other => other.into(),
        })?;
        self.requesters.lock().remove(&contact.key());
        self.events.forget(contact);
        Ok(())
    }

    /// Changes the state of a stored contact, e.g. to block a peer.
    ///
    /// # Errors
    ///
    /// Returns [`MessengerError::NotFound`] for an unknown contact, or the
    /// store error.
    pub async fn set_contact_state(
        &self,
        contact: &Contact,
        state: ContactState,
    ) -> Result<Contact, MessengerError> {
        let stored = self
            .store
            .contacts()
            .await?
            .into_iter()
            .find(|c| c == contact)
            .ok_or_else(|| MessengerError::NotFound(contact.to_string()))?;
        let updated = stored.with_state(state);
        self.store
            .save_contacts(std::slice::from_ref(&updated))
            .await?;
        Ok(updated)
    }

    /// The backfill window recorded for a contact, if any.
    #[must_use]
    pub fn window(&self, contact: &Contact) -> Option<RequestWindow> {
        self.requesters
            .lock()
            .get(&contact.key())
            .map(Requester::window)
    }

    /// Restores a contact's backfill window, e.g. after a restart.
    ///
    /// # Errors
    ///
    /// Returns an error if the contact is malformed.
    pub fn restore_window(
        &self,
        contact: &Contact,
        window: RequestWindow,
    ) -> Result<(), MessengerError> {
        let mut requesters = self.requesters.lock();
        self.requester_in(&mut requesters, contact)?.restore(window);
        Ok(())
    }

    /// Lifecycle state of the stream serving a contact, if any.
    pub async fn stream_state(&self, contact: &Contact) -> Option<StreamState> {
        let streams = self.streams.lock().await;
        if contact.is_public() {
            streams.public.get(&contact.key()).map(Stream::state)
        } else {
            streams.private.as_ref().map(Stream::state)
        }
    }

    async fn ensure_public(
        &self,
        streams: &mut Streams<T, S>,
        contact: &Contact,
    ) -> Result<(), MessengerError> {
        if let Some(stream) = streams.public.get_mut(&contact.key()) {
            if stream.state() == StreamState::Stopped {
                tracing::info!(contact = %contact, "restarting stopped stream");
                stream.start().await?;
            }
            return Ok(());
        }
        let handler =
            PublicHandler::new(contact.clone(), Arc::clone(&self.store), self.events.clone());
        let mut stream = Stream::new(
            contact.clone(),
            ChatOptions::for_contact(contact)?,
            Arc::clone(&self.transport),
            Arc::new(handler),
            self.events.clone(),
        );
        stream.start().await?;
        streams.public.insert(contact.key(), stream);
        Ok(())
    }

    async fn ensure_private(
        &self,
        streams: &mut Streams<T, S>,
        representative: &Contact,
    ) -> Result<(), MessengerError> {
        if let Some(stream) = streams.private.as_mut() {
            if stream.state() == StreamState::Stopped {
                tracing::info!("restarting stopped private stream");
                stream.start().await?;
            }
            return Ok(());
        }
        let handler = PrivateHandler::new(Arc::clone(&self.store), self.events.clone());
        let mut stream = Stream::new(
            representative.clone(),
            ChatOptions::for_contact(representative)?,
            Arc::clone(&self.transport),
            Arc::new(handler),
            self.events.clone(),
        );
        stream.start().await?;
        streams.private = Some(stream);
        Ok(())
    }

    /// Moves the messages of every other direct peer stored under
    /// `contact`'s key into `contact`, then deletes those peers.
    async fn merge_aliases(&self, contact: &Contact) -> Result<(), MessengerError> {
        let aliases: Vec<Contact> = self
            .store
            .contacts()
            .await?
            .into_iter()
            .filter(|c| {
                c.kind == ContactKind::DirectPeer
                    && c.public_key == contact.public_key
                    && c != contact
            })
            .collect();

        for alias in aliases {
            let messages = self.store.get_new_messages(&alias, 0).await?;
            for message in &messages {
                match self
                    .store
                    .save_messages(contact, std::slice::from_ref(message))
                    .await
                {
                    Ok(_) => {}
                    Err(e) if e.is_already_exists() => {}
                    Err(e) => return Err(e.into()),
                }
            }
            self.store.delete_contact(&alias).await?;
            self.requesters.lock().remove(&alias.key());
            self.events.forget(&alias);
            tracing::info!(
                alias = %alias,
                contact = %contact,
                messages = messages.len(),
                "merged direct peer"
            );
        }
        Ok(())
    }

    async fn request_range(
        &self,
        contact: &Contact,
        range: TimeRange,
    ) -> Result<(), MessengerError> {
        let options: RequestOptions = self.requester(contact)?.options(range);
        self.transport.request(&options).await?;
        if let Some(requester) = self.requesters.lock().get_mut(&contact.key()) {
            requester.update(&options);
        }
        tracing::debug!(contact = %contact, from = range.from, to = range.to, "history requested");
        Ok(())
    }

    /// A snapshot of the contact's requester, creating it if needed.
    fn requester(&self, contact: &Contact) -> Result<Requester, MessengerError> {
        let mut requesters = self.requesters.lock();
        self.requester_in(&mut requesters, contact).cloned()
    }

    fn requester_in<'a>(
        &self,
        requesters: &'a mut HashMap<ContactKey, Requester>,
        contact: &Contact,
    ) -> Result<&'a mut Requester, MessengerError> {
        let key = contact.key();
        if !requesters.contains_key(&key) {
            let requester = Requester::new(
                ChatOptions::for_contact(contact)?,
                self.config.default_window,
                self.config.request_limit,
            );
            requesters.insert(key.clone(), requester);
        }
        requesters
            .get_mut(&key)
            .ok_or_else(|| MessengerError::NotFound(contact.to_string()))
    }
}
