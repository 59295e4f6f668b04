//! Field-level encryption at rest for the feedback annotator.
//!
//! # Layers
//!
//! - [`keys`]: primary / rotation key ring loaded once at process start.
//! - [`crypto`]: AES-256-GCM-SIV token primitive and the [`FieldCipher`] service
//!   that encrypts, decrypts and classifies individual string fields.
//! - [`store`]: the record store seam ([`RecordStore`]) and the table catalogue.
//! - [`lookup`]: equality search over non-deterministic ciphertext.
//! - [`migration`]: operator batch jobs that move tables between plaintext and
//!   encrypted form, with backups, checkpoints and foreign-key repair.
//!
//! # Invariants
//!
//! - Encrypting the same plaintext twice never yields the same ciphertext, so
//!   lookups by an encrypted column always scan and decrypt.
//! - No plaintext field value and no key material is written to logs. Rows are
//!   identified by id, keys by [`EncryptionKey::fingerprint`].

pub mod crypto;
pub mod keys;
pub mod lookup;
pub mod migration;
pub mod store;

mod persist;

pub use crypto::{is_encrypted, CipherError, Decryption, FieldCipher};
pub use keys::{EncryptionKey, KeyError, KeyPolicy, KeyRing};
pub use lookup::Lookup;
pub use store::{MemoryStore, RecordStore, Row, RowId, StoreError, Table};

/// A record as the store sees it: column name to JSON value.
pub type Record = serde_json::Map<String, serde_json::Value>;
