//! Message model for `TermSync`.
//!
//! A [`Message`] is the decoded, ordered unit of conversation content. Its
//! body travels on the wire as a [`Payload`]; the envelope-level fields
//! (`id`, `signer`) are supplied by the transport on receipt and by the
//! transport's send result on the sending side.

use serde::{Deserialize, Serialize};

use crate::contact::{PublicKey, hex_string};

/// Maximum allowed text size in bytes (64 KB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Content type of plain text messages.
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

/// Unique identifier for a message: the transport envelope hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Vec<u8>);

impl MessageId {
    /// Wraps raw identifier bytes.
    #[must_use]
    pub const fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Returns the raw identifier bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for MessageId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex_string(&self.0))
    }
}

/// Which conversation class a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Text posted to a public room.
    PublicGroupText,
    /// Text sent directly to one peer.
    PrivateText,
}

/// The on-wire body of a message.
///
/// This is everything the sender decides; the transport adds the envelope
/// id and signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Conversation class.
    pub kind: MessageKind,
    /// MIME-style content type.
    pub content_type: String,
    /// Message text.
    pub text: String,
    /// Logical clock assigned by the sender.
    pub clock: i64,
    /// Sender wall clock in milliseconds since the UNIX epoch.
    pub timestamp: i64,
    /// Conversation identifier.
    pub chat_id: String,
}

/// A decoded message attributed to a conversation.
///
/// Messages are immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Envelope hash assigned by the transport.
    pub id: MessageId,
    /// Key of the signer, when the envelope was signed.
    pub signer: Option<PublicKey>,
    /// MIME-style content type.
    pub content_type: String,
    /// Conversation class.
    pub kind: MessageKind,
    /// Message text.
    pub text: String,
    /// Logical clock.
    pub clock: i64,
    /// Wall clock in milliseconds since the UNIX epoch.
    pub timestamp: i64,
    /// Conversation identifier.
    pub chat_id: String,
}

/// Error returned when a message fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message text is empty.
    #[error("message content is empty")]
    Empty,
    /// Message text exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the text in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

impl Payload {
    /// Builds a plain text payload.
    #[must_use]
    pub fn text(
        kind: MessageKind,
        chat_id: impl Into<String>,
        text: impl Into<String>,
        clock: i64,
        timestamp: i64,
    ) -> Self {
        Self {
            kind,
            content_type: CONTENT_TYPE_TEXT.to_string(),
            text: text.into(),
            clock,
            timestamp,
            chat_id: chat_id.into(),
        }
    }

    /// Validates this payload for sending.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Empty`] if the text is empty, or
    /// [`ValidationError::TooLarge`] if it exceeds [`MAX_MESSAGE_SIZE`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.text.is_empty() {
            return Err(ValidationError::Empty);
        }
        let size = self.text.len();
        if size > MAX_MESSAGE_SIZE {
            return Err(ValidationError::TooLarge {
                size,
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(())
    }

    /// Attaches envelope data, producing a [`Message`].
    #[must_use]
    pub fn into_message(self, id: MessageId, signer: Option<PublicKey>) -> Message {
        Message {
            id,
            signer,
            content_type: self.content_type,
            kind: self.kind,
            text: self.text,
            clock: self.clock,
            timestamp: self.timestamp,
            chat_id: self.chat_id,
        }
    }
}

impl Message {
    /// Returns the on-wire body of this message.
    #[must_use]
    pub fn payload(&self) -> Payload {
        Payload {
            kind: self.kind,
            content_type: self.content_type.clone(),
            text: self.text.clone(),
            clock: self.clock,
            timestamp: self.timestamp,
            chat_id: self.chat_id.clone(),
        }
    }

    /// Whether this message was signed by `key`.
    #[must_use]
    pub fn is_signed_by(&self, key: &PublicKey) -> bool {
        self.signer.as_ref() == Some(key)
    }
}
