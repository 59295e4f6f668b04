//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use fieldcrypt::{EncryptionKey, FieldCipher, KeyRing, MemoryStore, RecordStore};

/// Application state shared across all request handlers.
///
/// Every field is `Arc`-backed, so Axum clones the state per request without
/// copying the store or the key ring.
#[derive(Clone)]
pub struct AppState {
    /// The record store behind every service.
    pub store: Arc<dyn RecordStore>,
    /// Field cipher holding the primary and optional rotation key.
    pub cipher: Arc<FieldCipher>,
    /// Name of the HTTP header identifying the calling user.
    pub user_header_name: Arc<String>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn RecordStore>,
        cipher: Arc<FieldCipher>,
        user_header_name: String,
    ) -> Self {
        Self {
            store,
            cipher,
            user_header_name: Arc::new(user_header_name),
        }
    }
}

impl Default for AppState {
    /// An empty in-memory store and a freshly generated key, for tests.
    fn default() -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FieldCipher::new(KeyRing::new(EncryptionKey::generate(), None))),
            "X-User-Email".into(),
        )
    }
}
