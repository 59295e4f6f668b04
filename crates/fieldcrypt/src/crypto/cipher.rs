//! AES-256-GCM-SIV sealing and opening of individual field tokens.
//!
//! **Algorithm choice:** AES-256-GCM-SIV (RFC 8452) is nonce-misuse-resistant.
//! A fresh random 96-bit nonce is drawn for every call, so sealing the same
//! plaintext twice yields different tokens.
//!
//! **Do NOT substitute plain AES-256-GCM with a fixed nonce.** GCM nonce reuse
//! is catastrophic: it breaks both confidentiality and authentication.

use aes_gcm_siv::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256GcmSiv, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use thiserror::Error;

use crate::keys::{EncryptionKey, KEY_LEN};

/// Byte length of an AES-GCM-SIV nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Byte length of the AEAD authentication tag.
pub const TAG_LEN: usize = 16;

/// First byte of every token.
pub const TOKEN_VERSION: u8 = 0x01;

/// Plaintext is padded to a multiple of this many bytes before sealing.
pub const PAD_BLOCK: usize = 32;

/// Smallest decoded length classified as ciphertext by [`super::is_encrypted`].
///
/// The smallest token this module emits is 1 + 12 + 32 + 16 = 61 bytes.
pub const MIN_TOKEN_BYTES: usize = 60;

const PAD_MARKER: u8 = 0x80;

/// Errors produced by the cipher layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    /// The key is the wrong length (must be [`KEY_LEN`] bytes).
    #[error("invalid key length: expected {KEY_LEN} bytes")]
    InvalidKeyLength,

    /// AES-GCM-SIV encryption or decryption failed.
    #[error("aead operation failed")]
    AeadFailure,

    /// The stored string is not base64 or is too short to be a token.
    #[error("invalid token format")]
    InvalidFormat,

    /// The token was produced by an unknown format version.
    #[error("unsupported token version {0:#04x}")]
    UnsupportedVersion(u8),

    /// The opened plaintext does not end in valid padding.
    #[error("invalid plaintext padding")]
    InvalidPadding,

    /// The opened plaintext is not UTF-8.
    #[error("decrypted field is not valid UTF-8")]
    InvalidUtf8,
}

/// A parsed token.
///
/// Byte layout: `version (1) || nonce (12) || ciphertext+tag`. The stored string
/// is URL-safe padded base64 of those bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Raw nonce bytes.
    pub nonce: [u8; NONCE_LEN],
    /// Raw ciphertext + authentication tag bytes.
    pub ciphertext: Vec<u8>,
}

impl Token {
    /// Serialise to raw token bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + NONCE_LEN + self.ciphertext.len());
        out.push(TOKEN_VERSION);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse raw token bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidFormat`] if the input is shorter than a header
    /// plus tag, or [`CipherError::UnsupportedVersion`] for an unknown version byte.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CipherError> {
        if bytes.len() < 1 + NONCE_LEN + TAG_LEN {
            return Err(CipherError::InvalidFormat);
        }
        if bytes[0] != TOKEN_VERSION {
            return Err(CipherError::UnsupportedVersion(bytes[0]));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[1..1 + NONCE_LEN]);
        Ok(Self {
            nonce,
            ciphertext: bytes[1 + NONCE_LEN..].to_vec(),
        })
    }

    /// Encode to the string stored in a text column.
    pub fn encode(&self) -> String {
        URL_SAFE.encode(self.to_bytes())
    }

    /// Decode a stored string back into a [`Token`].
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidFormat`] if the string is not URL-safe base64,
    /// plus any error from [`Token::from_bytes`].
    pub fn decode(s: &str) -> Result<Self, CipherError> {
        let bytes = URL_SAFE
            .decode(s.as_bytes())
            .map_err(|_| CipherError::InvalidFormat)?;
        Self::from_bytes(&bytes)
    }
}

/// Seal `plaintext` under `key` with a fresh random nonce.
///
/// # Errors
///
/// Returns [`CipherError::AeadFailure`] on an internal AEAD error (should be
/// unreachable with a valid key and nonce).
pub fn seal(plaintext: &[u8], key: &EncryptionKey) -> Result<Token, CipherError> {
    let cipher = build_cipher(key.as_bytes())?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, pad(plaintext).as_slice())
        .map_err(|_| CipherError::AeadFailure)?;

    Ok(Token {
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Open a [`Token`] under `key` and strip its padding.
///
/// # Errors
///
/// Returns [`CipherError::AeadFailure`] if authentication fails (wrong key or
/// tampered data) and [`CipherError::InvalidPadding`] if the plaintext is not
/// padded the way [`seal`] pads it.
pub fn open(token: &Token, key: &EncryptionKey) -> Result<Vec<u8>, CipherError> {
    let cipher = build_cipher(key.as_bytes())?;
    let nonce = Nonce::from_slice(&token.nonce);
    let padded = cipher
        .decrypt(nonce, token.ciphertext.as_ref())
        .map_err(|_| CipherError::AeadFailure)?;
    unpad(padded)
}

/// `plaintext || 0x80 || 0x00*`, to the next multiple of [`PAD_BLOCK`].
fn pad(plaintext: &[u8]) -> Vec<u8> {
    let padded_len = (plaintext.len() / PAD_BLOCK + 1) * PAD_BLOCK;
    let mut out = Vec::with_capacity(padded_len);
    out.extend_from_slice(plaintext);
    out.push(PAD_MARKER);
    out.resize(padded_len, 0);
    out
}

fn unpad(mut padded: Vec<u8>) -> Result<Vec<u8>, CipherError> {
    if padded.is_empty() || padded.len() % PAD_BLOCK != 0 {
        return Err(CipherError::InvalidPadding);
    }
    let marker = padded
        .iter()
        .rposition(|&b| b != 0)
        .ok_or(CipherError::InvalidPadding)?;
    if padded[marker] != PAD_MARKER || padded.len() - marker > PAD_BLOCK {
        return Err(CipherError::InvalidPadding);
    }
    padded.truncate(marker);
    Ok(padded)
}

fn build_cipher(key: &[u8]) -> Result<Aes256GcmSiv, CipherError> {
    if key.len() != KEY_LEN {
        return Err(CipherError::InvalidKeyLength);
    }
    Aes256GcmSiv::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let key = EncryptionKey::generate();
        let token = seal(b"12345678", &key).unwrap();
        assert_eq!(open(&token, &key).unwrap(), b"12345678");
    }

    #[test]
    fn wrong_key_fails_open() {
        let token = seal(b"secret", &EncryptionKey::generate()).unwrap();
        assert_eq!(
            open(&token, &EncryptionKey::generate()),
            Err(CipherError::AeadFailure)
        );
    }

    #[test]
    fn smallest_token_clears_heuristic_threshold() {
        let token = seal(b"", &EncryptionKey::generate()).unwrap();
        assert_eq!(token.to_bytes().len(), 1 + NONCE_LEN + PAD_BLOCK + TAG_LEN);
        assert!(token.to_bytes().len() >= MIN_TOKEN_BYTES);
    }

    #[test]
    fn padding_hides_length_within_a_block() {
        let key = EncryptionKey::generate();
        let short = seal(b"a@b.com", &key).unwrap();
        let longer = seal(b"alice.smith@student.uni.edu", &key).unwrap();
        assert_eq!(short.ciphertext.len(), longer.ciphertext.len());
    }

    #[test]
    fn pad_handles_exact_block_multiple() {
        let plaintext = [b'x'; PAD_BLOCK];
        let padded = pad(&plaintext);
        assert_eq!(padded.len(), 2 * PAD_BLOCK);
        assert_eq!(unpad(padded).unwrap(), plaintext);
    }

    #[test]
    fn unpad_rejects_missing_marker() {
        assert_eq!(unpad(vec![0u8; PAD_BLOCK]), Err(CipherError::InvalidPadding));
        assert_eq!(unpad(vec![1u8; PAD_BLOCK]), Err(CipherError::InvalidPadding));
    }

    #[test]
    fn string_encoding_round_trip() {
        let token = seal(b"hello", &EncryptionKey::generate()).unwrap();
        let parsed = Token::decode(&token.encode()).unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn decode_rejects_bad_version() {
        let mut bytes = seal(b"x", &EncryptionKey::generate()).unwrap().to_bytes();
        bytes[0] = 0x07;
        assert_eq!(
            Token::from_bytes(&bytes),
            Err(CipherError::UnsupportedVersion(0x07))
        );
    }

    #[test]
    fn decode_rejects_short_and_non_base64_input() {
        assert_eq!(Token::decode("AQID"), Err(CipherError::InvalidFormat));
        assert_eq!(Token::decode("a@b.com"), Err(CipherError::InvalidFormat));
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let key = EncryptionKey::generate();
        let mut token = seal(b"tamper me", &key).unwrap();
        token.ciphertext[0] ^= 0xFF;
        assert_eq!(open(&token, &key), Err(CipherError::AeadFailure));
    }
}
