//! Key material for field encryption and the primary / rotation key ring.
//!
//! # Lifecycle
//!
//! 1. At process start the binary reads `USER_ENCRYPTION_KEY` (primary) and the
//!    optional `USER_ENCRYPTION_KEY_ROTATION` from its configuration.
//! 2. [`KeyRing::load`] parses both into [`EncryptionKey`]s. A missing primary key
//!    is fatal under [`KeyPolicy::Require`]; under [`KeyPolicy::GenerateIfMissing`]
//!    an ephemeral key is generated and a warning is emitted.
//! 3. The ring is handed to [`crate::FieldCipher`] and never changes afterwards.
//!
//! # Security invariants
//!
//! - Key bytes are zeroed on drop and never printed, not even in `Debug` output.
//! - The only representation of a key that may appear in logs is its
//!   [`EncryptionKey::fingerprint`].

use aes_gcm_siv::aead::{rand_core::RngCore, OsRng};
use base64::{
    engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD},
    Engine as _,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Errors produced while loading key material.
#[derive(Debug, Error)]
pub enum KeyError {
    /// No primary key was configured and the policy forbids generating one.
    #[error("primary encryption key is not configured")]
    MissingPrimary,

    /// The configured value is not base64 in any accepted alphabet.
    #[error("encryption key is not valid base64")]
    InvalidEncoding,

    /// The decoded key material has the wrong length.
    #[error("encryption key has invalid length: expected {KEY_LEN} bytes, got {0}")]
    InvalidLength(usize),

    /// The rotation key was present but could not be parsed.
    #[error("rotation key rejected: {0}")]
    InvalidRotation(Box<KeyError>),
}

/// What to do when no primary key is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPolicy {
    /// Refuse to start. Used by the migration console and, by default, the service.
    Require,
    /// Generate an ephemeral key and warn loudly. Development only: anything
    /// written under the generated key is unreadable after a restart.
    GenerateIfMissing,
}

/// A 32-byte symmetric key.
///
/// The bytes are overwritten with zeroes when the value is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

impl EncryptionKey {
    /// Generate a fresh key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut key = Self([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut key.0);
        key
    }

    /// Build a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidLength`] unless `bytes` is exactly [`KEY_LEN`] long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != KEY_LEN {
            return Err(KeyError::InvalidLength(bytes.len()));
        }
        let mut key = Self([0u8; KEY_LEN]);
        key.0.copy_from_slice(bytes);
        Ok(key)
    }

    /// Parse a base64-encoded key.
    ///
    /// URL-safe and standard alphabets are accepted, with or without padding.
    /// Surrounding whitespace is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidEncoding`] if no alphabet decodes the value and
    /// [`KeyError::InvalidLength`] if it does not decode to [`KEY_LEN`] bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let encoded = encoded.trim();
        let decoded = [URL_SAFE, URL_SAFE_NO_PAD, STANDARD, STANDARD_NO_PAD]
            .iter()
            .find_map(|engine| engine.decode(encoded).ok())
            .map(Zeroizing::new)
            .ok_or(KeyError::InvalidEncoding)?;
        Self::from_bytes(&decoded)
    }

    /// Render the key as URL-safe padded base64, the form read from the environment.
    pub fn to_base64(&self) -> String {
        URL_SAFE.encode(&self.0[..])
    }

    /// Short, non-reversible identifier safe to log: hex of the first 8 bytes of
    /// the key's SHA-256 digest.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.0[..]);
        digest[..8].iter().map(|b| format!("{b:02x}")).collect()
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }
}

/// The keys a [`crate::FieldCipher`] works with.
///
/// New ciphertext is always produced under the primary key. Decryption tries
/// the primary key first, then the rotation key.
#[derive(Clone, Debug)]
pub struct KeyRing {
    primary: EncryptionKey,
    rotation: Option<EncryptionKey>,
}

impl KeyRing {
    /// Create a ring from already-parsed keys.
    pub fn new(primary: EncryptionKey, rotation: Option<EncryptionKey>) -> Self {
        Self { primary, rotation }
    }

    /// Load the ring from configured base64 strings.
    ///
    /// Empty or whitespace-only values count as absent.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::MissingPrimary`] when no primary key is configured under
    /// [`KeyPolicy::Require`], or a parse error for malformed key material.
    pub fn load(
        primary: Option<&str>,
        rotation: Option<&str>,
        policy: KeyPolicy,
    ) -> Result<Self, KeyError> {
        let primary = match non_blank(primary) {
            Some(encoded) => EncryptionKey::from_base64(encoded)?,
            None => match policy {
                KeyPolicy::Require => return Err(KeyError::MissingPrimary),
                KeyPolicy::GenerateIfMissing => {
                    let key = EncryptionKey::generate();
                    warn!(
                        fingerprint = %key.fingerprint(),
                        "no primary encryption key configured; generated an ephemeral key. \
                         Data encrypted now is unreadable after restart. \
                         Run `crypt-migrate generate-key` and set USER_ENCRYPTION_KEY"
                    );
                    key
                }
            },
        };

        let rotation = non_blank(rotation)
            .map(EncryptionKey::from_base64)
            .transpose()
            .map_err(|e| KeyError::InvalidRotation(Box::new(e)))?;

        match &rotation {
            Some(old) => info!(
                primary = %primary.fingerprint(),
                rotation = %old.fingerprint(),
                "key ring loaded with rotation support"
            ),
            None => info!(primary = %primary.fingerprint(), "key ring loaded with single key"),
        }

        Ok(Self { primary, rotation })
    }

    /// The key used for every new encryption.
    pub fn primary(&self) -> &EncryptionKey {
        &self.primary
    }

    /// The legacy key accepted for decryption only, if configured.
    pub fn rotation(&self) -> Option<&EncryptionKey> {
        self.rotation.as_ref()
    }

    /// Keys in the order decryption tries them: primary, then rotation.
    pub fn decryption_keys(&self) -> impl Iterator<Item = &EncryptionKey> {
        std::iter::once(&self.primary).chain(self.rotation.iter())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}
