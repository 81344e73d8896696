//! Local identity keys.
//!
//! The engine signs and addresses traffic with a long-term x25519 keypair.
//! Its public half is the [`PublicKey`] peers know this client by; the
//! private half never leaves this module and is zeroized on drop.

use std::path::{Path, PathBuf};

use termsync_proto::contact::PublicKey;
use zeroize::ZeroizeOnDrop;

/// Length of an x25519 private key.
const KEY_LEN: usize = 32;

/// Errors that can occur when loading or storing an identity.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// The stored private key is malformed.
    #[error("invalid private key: {0}")]
    InvalidKey(String),

    /// Reading the key file failed.
    #[error("failed to read key file {path}: {source}")]
    Read {
        /// File that was read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Writing the key file failed.
    #[error("failed to write key file {path}: {source}")]
    Write {
        /// File that was written.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// No data directory could be determined for the default key file.
    #[error("could not determine data directory")]
    NoDataDir,
}

/// A long-term identity keypair.
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    private_key: [u8; KEY_LEN],
    #[zeroize(skip)]
    public_key: PublicKey,
}

impl Identity {
    /// Generate a new random identity using the system's CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let secret = x25519_dalek::StaticSecret::random_from_rng(rand_core::OsRng);
        Self::from_secret(&secret)
    }

    /// Load an identity from a stored private key.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidKey`] if `bytes` is not 32 bytes long.
    pub fn from_private_key(bytes: &[u8]) -> Result<Self, IdentityError> {
        let key_bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            IdentityError::InvalidKey(format!(
                "expected {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::from_secret(&x25519_dalek::StaticSecret::from(key_bytes)))
    }

    fn from_secret(secret: &x25519_dalek::StaticSecret) -> Self {
        let public = x25519_dalek::PublicKey::from(secret);
        Self {
            private_key: secret.to_bytes(),
            public_key: PublicKey::new(public.as_bytes().to_vec()),
        }
    }

    /// The public key peers address this identity by.
    #[must_use]
    pub const fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Abbreviated hex rendering of the public key.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        self.public_key.fingerprint()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Persistent storage for an identity.
pub trait KeyStore: Send + Sync {
    /// Load the stored identity, or `None` if there is none yet.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] if the stored key is unreadable or corrupt.
    fn load(&self) -> Result<Option<Identity>, IdentityError>;

    /// Persist an identity.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] if the identity cannot be written.
    fn save(&self, identity: &Identity) -> Result<(), IdentityError>;
}

/// Loads the stored identity, generating and saving a new one if absent.
///
/// # Errors
///
/// Propagates [`KeyStore`] errors.
pub fn load_or_generate(store: &impl KeyStore) -> Result<Identity, IdentityError> {
    if let Some(identity) = store.load()? {
        return Ok(identity);
    }
    let identity = Identity::generate();
    store.save(&identity)?;
    tracing::info!(fingerprint = %identity.fingerprint(), "generated new identity");
    Ok(identity)
}

/// Key store holding the raw private key in a file.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    /// Key store at an explicit path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Key store at `<data_dir>/termsync/identity.key`.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::NoDataDir`] if there is no data directory.
    pub fn default_location() -> Result<Self, IdentityError> {
        let dir = dirs::data_dir().ok_or(IdentityError::NoDataDir)?;
        Ok(Self::new(dir.join("termsync").join("identity.key")))
    }

    /// The key file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyStore for FileKeyStore {
    fn load(&self) -> Result<Option<Identity>, IdentityError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Identity::from_private_key(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(IdentityError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn save(&self, identity: &Identity) -> Result<(), IdentityError> {
        let write_err = |source| IdentityError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path).map_err(write_err)?;
        std::io::Write::write_all(&mut file, &identity.private_key).map_err(write_err)
    }
}
