//! Transport contract for `TermSync`.
//!
//! Defines the [`Transport`] trait the engine consumes: a pub/sub service
//! with `subscribe`, `send` and a historical `request`. Concrete
//! implementations include:
//! - [`memory::MemoryTransport`] — in-process broadcast network with an
//!   archive, used by tests and the simulation binary
//!
//! The transport delivers [`Envelope`]s at-least-once and in no particular
//! order. Payload bytes are opaque here; decoding happens in the stream
//! pump so that one malformed payload cannot take a subscription down.

pub mod memory;
pub mod subscription;

pub use subscription::{Subscription, SubscriptionSink};

use termsync_proto::contact::{Contact, ContactKind, PublicKey};
use termsync_proto::message::MessageId;

/// Errors that can occur during transport operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Chat options named neither a room nor a recipient, or both.
    #[error("invalid chat options: {0}")]
    InvalidOptions(String),

    /// Request options were malformed (no chats, inverted range).
    #[error("invalid request options: {0}")]
    InvalidRequest(String),

    /// The subscription was terminated by the transport.
    #[error("subscription closed: {0}")]
    SubscriptionClosed(String),

    /// Sending a payload failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// A history request failed.
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// The transport has been shut down.
    #[error("transport closed")]
    Closed,
}

/// Addresses one conversation on the transport.
///
/// Exactly one of `chat_name` (public room) or `recipient` (direct peer)
/// must be set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChatOptions {
    /// Public room name.
    pub chat_name: Option<String>,
    /// Direct peer key.
    pub recipient: Option<PublicKey>,
}

impl ChatOptions {
    /// Options addressing a public room.
    #[must_use]
    pub fn public(name: impl Into<String>) -> Self {
        Self {
            chat_name: Some(name.into()),
            recipient: None,
        }
    }

    /// Options addressing a direct peer.
    #[must_use]
    pub const fn private(recipient: PublicKey) -> Self {
        Self {
            chat_name: None,
            recipient: Some(recipient),
        }
    }

    /// Options addressing the given contact.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidOptions`] if a direct peer has no key.
    pub fn for_contact(contact: &Contact) -> Result<Self, TransportError> {
        match contact.kind {
            ContactKind::PublicRoom => Ok(Self::public(contact.name.clone())),
            ContactKind::DirectPeer => contact
                .public_key
                .clone()
                .map(Self::private)
                .ok_or_else(|| {
                    TransportError::InvalidOptions(format!(
                        "direct peer {} has no public key",
                        contact.name
                    ))
                }),
        }
    }

    /// Checks that exactly one addressing field is set.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidOptions`] on both-or-neither.
    pub fn validate(&self) -> Result<(), TransportError> {
        match (&self.chat_name, &self.recipient) {
            (Some(name), None) if name.is_empty() => Err(TransportError::InvalidOptions(
                "chat name is empty".into(),
            )),
            (Some(_), None) | (None, Some(_)) => Ok(()),
            (Some(_), Some(_)) => Err(TransportError::InvalidOptions(
                "chat name and recipient are mutually exclusive".into(),
            )),
            (None, None) => Err(TransportError::InvalidOptions(
                "one of chat name or recipient is required".into(),
            )),
        }
    }
}

impl std::fmt::Display for ChatOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.chat_name, &self.recipient) {
            (Some(name), _) => write!(f, "#{name}"),
            (None, Some(key)) => write!(f, "@{}", key.fingerprint()),
            (None, None) => write!(f, "<unaddressed>"),
        }
    }
}

/// A historical backfill request, possibly covering several chats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOptions {
    /// Chats to backfill.
    pub chats: Vec<ChatOptions>,
    /// Start of the range, unix seconds (inclusive).
    pub from: i64,
    /// End of the range, unix seconds (inclusive).
    pub to: i64,
    /// Maximum number of envelopes to return per chat.
    pub limit: u32,
}

impl RequestOptions {
    /// Checks the chat list and the time range.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidRequest`] if there are no chats or
    /// `from > to`, and [`TransportError::InvalidOptions`] for a malformed chat.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.chats.is_empty() {
            return Err(TransportError::InvalidRequest("no chats given".into()));
        }
        if self.from > self.to {
            return Err(TransportError::InvalidRequest(format!(
                "from {} is after to {}",
                self.from, self.to
            )));
        }
        self.chats.iter().try_for_each(ChatOptions::validate)
    }
}

/// A raw delivery from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Envelope hash.
    pub id: MessageId,
    /// Signer of the envelope, if signed.
    pub signer: Option<PublicKey>,
    /// Encoded payload bytes.
    pub payload: Vec<u8>,
    /// Time the envelope entered the network, milliseconds since the epoch.
    pub timestamp: i64,
}

/// Async pub/sub transport consumed by the engine.
///
/// Implementations deliver envelopes at-least-once and in any order, never
/// deliver a sender's own broadcasts back to it, and answer
/// [`request`](Transport::request) by pushing archived envelopes into the
/// caller's live subscriptions.
pub trait Transport: Send + Sync {
    /// Open a live subscription for one conversation.
    ///
    /// Private subscriptions are identity-scoped: any recipient yields the
    /// local identity's inbox.
    fn subscribe(
        &self,
        options: &ChatOptions,
    ) -> impl std::future::Future<Output = Result<Subscription, TransportError>> + Send;

    /// Publish an encoded payload, returning the envelope id.
    fn send(
        &self,
        payload: &[u8],
        options: &ChatOptions,
    ) -> impl std::future::Future<Output = Result<MessageId, TransportError>> + Send;

    /// Ask the network to replay history for one or more chats.
    fn request(
        &self,
        options: &RequestOptions,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;
}
