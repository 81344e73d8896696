//! Conversation endpoints for `TermSync`.
//!
//! A [`Contact`] is one logical conversation: either a public room joined by
//! name or a direct peer identified by its public key. Identity and equality
//! are defined by `(name, kind)` only; `state`, `topic` and `public_key` are
//! attributes that may change without creating a new conversation.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Number of key bytes shown by [`PublicKey::fingerprint`].
const FINGERPRINT_BYTES: usize = 8;

/// A peer's public identity key.
///
/// Opaque bytes as far as the engine is concerned; equality is byte
/// equality. Displayed as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(Vec<u8>);

impl PublicKey {
    /// Wraps raw key bytes.
    #[must_use]
    pub const fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Returns the raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Full lowercase hex rendering of the key.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex_string(&self.0)
    }

    /// Abbreviated hex rendering (first 8 bytes) for logs and display.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        hex_string(&self.0[..FINGERPRINT_BYTES.min(self.0.len())])
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

pub(crate) fn hex_string(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut output, b| {
        let _ = write!(output, "{b:02x}");
        output
    })
}

/// What kind of conversation a contact represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ContactKind {
    /// A public room, addressed by name.
    PublicRoom,
    /// A one-to-one conversation with a peer, addressed by public key.
    DirectPeer,
}

impl std::fmt::Display for ContactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PublicRoom => write!(f, "public"),
            Self::DirectPeer => write!(f, "direct"),
        }
    }
}

/// Lifecycle state of a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContactState {
    /// Explicitly added by the user.
    Added,
    /// Discovered from an inbound private message; not yet confirmed.
    New,
    /// Explicitly blocked by the user.
    Blocked,
}

/// Errors returned when a contact violates its structural invariants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContactError {
    /// The contact name is empty.
    #[error("contact name cannot be empty")]
    EmptyName,

    /// A direct peer was built without a public key.
    #[error("direct peer {0} has no public key")]
    MissingPublicKey(String),

    /// A public room carries a public key.
    #[error("public room {0} must not carry a public key")]
    UnexpectedPublicKey(String),
}

/// Identity of a conversation, usable as a map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContactKey {
    /// Contact name.
    pub name: String,
    /// Contact kind.
    pub kind: ContactKind,
}

impl std::fmt::Display for ContactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// A conversation endpoint: a public room or a direct peer.
///
/// # Invariant
///
/// A [`ContactKind::DirectPeer`] contact always carries a public key and a
/// [`ContactKind::PublicRoom`] contact never does. The constructors enforce
/// this; [`validate`](Self::validate) re-checks values that arrived from
/// elsewhere (deserialized, built with struct literals).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    /// Room name or peer display name.
    pub name: String,
    /// Public room or direct peer.
    pub kind: ContactKind,
    /// Lifecycle state.
    pub state: ContactState,
    /// Transport topic the conversation is published on.
    pub topic: String,
    /// The peer's key; present exactly for direct peers.
    pub public_key: Option<PublicKey>,
}

impl Contact {
    /// Creates a public room contact in the [`ContactState::Added`] state.
    ///
    /// # Errors
    ///
    /// Returns [`ContactError::EmptyName`] if the trimmed name is empty.
    pub fn public_room(name: impl Into<String>) -> Result<Self, ContactError> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(ContactError::EmptyName);
        }
        Ok(Self {
            topic: name.clone(),
            name,
            kind: ContactKind::PublicRoom,
            state: ContactState::Added,
            public_key: None,
        })
    }

    /// Creates a direct peer contact in the [`ContactState::Added`] state.
    ///
    /// # Errors
    ///
    /// Returns [`ContactError::EmptyName`] if the trimmed name is empty.
    pub fn direct_peer(name: impl Into<String>, key: PublicKey) -> Result<Self, ContactError> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(ContactError::EmptyName);
        }
        Ok(Self {
            name,
            kind: ContactKind::DirectPeer,
            state: ContactState::Added,
            topic: key.to_hex(),
            public_key: Some(key),
        })
    }

    /// Creates a contact for a previously unknown signer.
    ///
    /// The name is derived from the key fingerprint and the state is
    /// [`ContactState::New`].
    #[must_use]
    pub fn discovered(key: PublicKey) -> Self {
        Self {
            name: key.fingerprint(),
            kind: ContactKind::DirectPeer,
            state: ContactState::New,
            topic: key.to_hex(),
            public_key: Some(key),
        }
    }

    /// Checks the kind/key invariant and that the name is non-empty.
    ///
    /// # Errors
    ///
    /// Returns the [`ContactError`] describing the violated invariant.
    pub fn validate(&self) -> Result<(), ContactError> {
        if self.name.trim().is_empty() {
            return Err(ContactError::EmptyName);
        }
        match (self.kind, &self.public_key) {
            (ContactKind::DirectPeer, None) => {
                Err(ContactError::MissingPublicKey(self.name.clone()))
            }
            (ContactKind::PublicRoom, Some(_)) => {
                Err(ContactError::UnexpectedPublicKey(self.name.clone()))
            }
            _ => Ok(()),
        }
    }

    /// Returns the identity of this contact.
    #[must_use]
    pub fn key(&self) -> ContactKey {
        ContactKey {
            name: self.name.clone(),
            kind: self.kind,
        }
    }

    /// Whether this is a public room.
    #[must_use]
    pub const fn is_public(&self) -> bool {
        matches!(self.kind, ContactKind::PublicRoom)
    }

    /// Returns a copy of this contact with a different state.
    #[must_use]
    pub fn with_state(mut self, state: ContactState) -> Self {
        self.state = state;
        self
    }

    /// The chat identifier messages in this conversation carry.
    ///
    /// Rooms use their name; direct conversations use the peer's hex key.
    #[must_use]
    pub fn chat_id(&self) -> String {
        match &self.public_key {
            Some(key) if !self.is_public() => key.to_hex(),
            _ => self.name.clone(),
        }
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.kind == other.kind
    }
}

impl Eq for Contact {}

impl Hash for Contact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.kind.hash(state);
    }
}

impl std::fmt::Display for Contact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ContactKind::PublicRoom => write!(f, "#{}", self.name),
            ContactKind::DirectPeer => write!(f, "@{}", self.name),
        }
    }
}
