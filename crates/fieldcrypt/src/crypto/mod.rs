//! AES-256-GCM-SIV field encryption.
//!
//! This module is intentionally free of store and HTTP dependencies.
//!
//! # Stored format
//!
//! ```text
//! base64url-padded( 0x01 || nonce(12) || AES-256-GCM-SIV(plaintext || 0x80 || 0x00*) )
//! ```
//!
//! The leading version byte leaves room for a future algorithm change without
//! breaking existing ciphertext.

pub mod cipher;
pub mod field;

pub use cipher::{CipherError, MIN_TOKEN_BYTES};
pub use field::{is_encrypted, Decryption, FieldCipher};
