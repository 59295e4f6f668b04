//! [`FieldCipher`]: the process-wide service that encrypts and decrypts PII
//! string fields.

use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::cipher::{self, CipherError, Token, MIN_TOKEN_BYTES};
use crate::keys::KeyRing;
use crate::Record;

/// Outcome of decrypting a stored field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decryption {
    /// The value was ciphertext and verified under one of the configured keys.
    Decrypted(String),
    /// The value does not look like ciphertext; it predates encryption.
    LegacyPlaintext(String),
    /// The value looks like ciphertext but no configured key verifies it.
    Corrupt {
        /// The stored value, unchanged.
        raw: String,
        /// Why the last attempt failed.
        error: CipherError,
    },
}

impl Decryption {
    /// The decrypted plaintext, or the stored value for legacy and corrupt input.
    pub fn as_str(&self) -> &str {
        match self {
            Decryption::Decrypted(s) | Decryption::LegacyPlaintext(s) => s,
            Decryption::Corrupt { raw, .. } => raw,
        }
    }

    /// Collapse to a plain string, returning the stored value when decryption
    /// did not succeed.
    pub fn into_lenient(self) -> String {
        match self {
            Decryption::Decrypted(s) | Decryption::LegacyPlaintext(s) => s,
            Decryption::Corrupt { raw, .. } => raw,
        }
    }
}

/// Heuristic: does `value` look like a token produced by [`FieldCipher::encrypt`]?
///
/// Attempts URL-safe base64 decoding; if that succeeds and the decoded length is
/// at least [`MIN_TOKEN_BYTES`], the value is classified as encrypted. This is not
/// cryptographically certain. Migrations rely on it to skip fields that are
/// already encrypted.
pub fn is_encrypted(value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    URL_SAFE
        .decode(value.as_bytes())
        .map(|decoded| decoded.len() >= MIN_TOKEN_BYTES)
        .unwrap_or(false)
}

/// Encrypts and decrypts individual string fields under a [`KeyRing`].
///
/// Immutable after construction and safe to share across requests as
/// `Arc<FieldCipher>`.
#[derive(Debug)]
pub struct FieldCipher {
    keys: KeyRing,
}

/// Which key of the ring opened a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenedWith {
    Primary,
    Rotation,
}

impl FieldCipher {
    /// Create a cipher over `keys`.
    pub fn new(keys: KeyRing) -> Self {
        info!(
            primary = %keys.primary().fingerprint(),
            rotation = keys.rotation().is_some(),
            "field cipher initialised"
        );
        Self { keys }
    }

    /// Whether a rotation key is configured.
    pub fn rotation_enabled(&self) -> bool {
        self.keys.rotation().is_some()
    }

    /// Encrypt an optional field. `None` and `""` pass through unchanged.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`CipherError`] if sealing fails.
    pub fn encrypt(&self, plaintext: Option<&str>) -> Result<Option<String>, CipherError> {
        plaintext.map(|p| self.encrypt_str(p)).transpose()
    }

    /// Encrypt a single string. `""` passes through unchanged.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`CipherError`] if sealing fails.
    pub fn encrypt_str(&self, plaintext: &str) -> Result<String, CipherError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let token = cipher::seal(plaintext.as_bytes(), self.keys.primary())?;
        Ok(token.encode())
    }

    /// Decrypt an optional field, falling back to the stored value.
    ///
    /// `None` and `""` pass through unchanged. When a value cannot be decrypted it
    /// is returned as-is and a warning records whether it looked like legacy
    /// plaintext or like corrupt ciphertext. Callers that need to tell those
    /// cases apart should use [`FieldCipher::decrypt_tagged`].
    pub fn decrypt(&self, ciphertext: Option<&str>) -> Option<String> {
        let value = ciphertext?;
        if value.is_empty() {
            return Some(String::new());
        }
        let outcome = self.decrypt_tagged(value);
        match &outcome {
            Decryption::Decrypted(_) => {}
            Decryption::LegacyPlaintext(_) => {
                warn!("field is not ciphertext; returning stored value as legacy plaintext");
            }
            Decryption::Corrupt { error, .. } => {
                warn!(
                    error = %error,
                    "field looks encrypted but failed verification under every key; returning stored value"
                );
            }
        }
        Some(outcome.into_lenient())
    }

    /// Decrypt a stored value and report what kind of value it was.
    pub fn decrypt_tagged(&self, value: &str) -> Decryption {
        if !is_encrypted(value) {
            return Decryption::LegacyPlaintext(value.to_owned());
        }
        match self.open(value) {
            Ok((plain, _)) => Decryption::Decrypted(plain),
            Err(error) => Decryption::Corrupt {
                raw: value.to_owned(),
                error,
            },
        }
    }

    /// `true` if `value` looks like ciphertext. See [`is_encrypted`].
    pub fn is_encrypted(&self, value: &str) -> bool {
        is_encrypted(value)
    }

    /// Return a copy of `record` with the named string fields encrypted.
    ///
    /// Null, missing, empty and non-string values are left alone, as is every
    /// field not named in `fields`.
    ///
    /// # Errors
    ///
    /// Returns the first [`CipherError`] encountered.
    pub fn encrypt_record(&self, record: &Record, fields: &[&str]) -> Result<Record, CipherError> {
        let mut out = record.clone();
        for field in fields {
            if let Some(Value::String(s)) = out.get_mut(*field) {
                *s = self.encrypt_str(s)?;
            }
        }
        Ok(out)
    }

    /// Return a copy of `record` with the named string fields decrypted.
    ///
    /// Same passthrough rules as [`FieldCipher::encrypt_record`]; values that fail
    /// to decrypt are kept as stored.
    pub fn decrypt_record(&self, record: &Record, fields: &[&str]) -> Record {
        let mut out = record.clone();
        for field in fields {
            if let Some(Value::String(s)) = out.get_mut(*field) {
                if let Some(plain) = self.decrypt(Some(s)) {
                    *s = plain;
                }
            }
        }
        out
    }

    /// Re-encrypt `value` under the primary key when it needs it.
    ///
    /// Returns `Some(new_ciphertext)` for legacy plaintext and for ciphertext that
    /// only the rotation key opens; `None` when the value is already under the
    /// primary key, is empty, or is corrupt (corrupt values are never rewritten).
    ///
    /// # Errors
    ///
    /// Returns the underlying [`CipherError`] if sealing fails.
    pub fn reencrypt(&self, value: &str) -> Result<Option<String>, CipherError> {
        if value.is_empty() {
            return Ok(None);
        }
        if !is_encrypted(value) {
            return self.encrypt_str(value).map(Some);
        }
        match self.open(value) {
            Ok((_, OpenedWith::Primary)) => Ok(None),
            Ok((plain, OpenedWith::Rotation)) => {
                debug!("re-encrypting field from rotation key to primary key");
                self.encrypt_str(&plain).map(Some)
            }
            Err(_) => Ok(None),
        }
    }

    fn open(&self, value: &str) -> Result<(String, OpenedWith), CipherError> {
        let token = Token::decode(value)?;
        let mut last_error = CipherError::AeadFailure;
        for (i, key) in self.keys.decryption_keys().enumerate() {
            match cipher::open(&token, key) {
                Ok(bytes) => {
                    let plain = String::from_utf8(bytes).map_err(|_| CipherError::InvalidUtf8)?;
                    let which = if i == 0 {
                        OpenedWith::Primary
                    } else {
                        OpenedWith::Rotation
                    };
                    return Ok((plain, which));
                }
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::EncryptionKey;
    use serde_json::json;

    fn cipher() -> FieldCipher {
        FieldCipher::new(KeyRing::new(EncryptionKey::generate(), None))
    }

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn round_trip() {
        let c = cipher();
        let ct = c.encrypt(Some("alice@uni.edu")).unwrap();
        assert_eq!(c.decrypt(ct.as_deref()).as_deref(), Some("alice@uni.edu"));
    }

    #[test]
    fn null_and_empty_pass_through() {
        let c = cipher();
        assert_eq!(c.encrypt(None).unwrap(), None);
        assert_eq!(c.decrypt(None), None);
        assert_eq!(c.encrypt(Some("")).unwrap().as_deref(), Some(""));
        assert_eq!(c.decrypt(Some("")).as_deref(), Some(""));
    }

    #[test]
    fn encryption_is_non_deterministic() {
        let c = cipher();
        let a = c.encrypt_str("a@b.com").unwrap();
        let b = c.encrypt_str("a@b.com").unwrap();
        assert_ne!(a, b);
        assert_eq!(c.decrypt(Some(&a)).as_deref(), Some("a@b.com"));
        assert_eq!(c.decrypt(Some(&b)).as_deref(), Some("a@b.com"));
    }

    #[test]
    fn rotation_key_still_decrypts_old_ciphertext() {
        let old = EncryptionKey::generate();
        let before = FieldCipher::new(KeyRing::new(old.clone(), None));
        let ct = before.encrypt_str("bob@uni.edu").unwrap();

        let after = FieldCipher::new(KeyRing::new(EncryptionKey::generate(), Some(old)));
        assert_eq!(
            after.decrypt_tagged(&ct),
            Decryption::Decrypted("bob@uni.edu".into())
        );
    }

    #[test]
    fn without_rotation_key_old_ciphertext_is_corrupt() {
        let ct = cipher().encrypt_str("bob@uni.edu").unwrap();
        let other = cipher();
        assert!(matches!(
            other.decrypt_tagged(&ct),
            Decryption::Corrupt { error: CipherError::AeadFailure, .. }
        ));
        assert_eq!(other.decrypt_tagged(&ct).into_lenient(), ct);
        assert_eq!(other.decrypt(Some(&ct)).as_deref(), Some(ct.as_str()));
    }

    #[test]
    fn legacy_plaintext_is_returned_unchanged() {
        let c = cipher();
        assert_eq!(
            c.decrypt_tagged("carol@uni.edu"),
            Decryption::LegacyPlaintext("carol@uni.edu".into())
        );
        assert_eq!(c.decrypt(Some("carol@uni.edu")).as_deref(), Some("carol@uni.edu"));
    }

    #[test]
    fn is_encrypted_heuristic() {
        let c = cipher();
        assert!(is_encrypted(&c.encrypt_str("a@b.com").unwrap()));
        assert!(!is_encrypted("a@b.com"));
        assert!(!is_encrypted(""));
        // Valid base64, but far below the token threshold.
        assert!(!is_encrypted("QUJDRA=="));
    }

    #[test]
    fn record_helpers_touch_only_named_fields() {
        let c = cipher();
        let original = record(json!({
            "email": "dave@uni.edu",
            "firstName": "Dave",
            "monashId": null,
            "mark": 87,
            "role": "Student"
        }));
        let fields = ["email", "firstName", "monashId", "mark"];

        let encrypted = c.encrypt_record(&original, &fields).unwrap();
        assert_ne!(encrypted["email"], original["email"]);
        assert_ne!(encrypted["firstName"], original["firstName"]);
        assert_eq!(encrypted["monashId"], Value::Null);
        assert_eq!(encrypted["mark"], json!(87));
        assert_eq!(encrypted["role"], json!("Student"));

        let decrypted = c.decrypt_record(&encrypted, &fields);
        assert_eq!(decrypted, original);
    }

    #[test]
    fn reencrypt_moves_rotation_ciphertext_to_primary() {
        let old = EncryptionKey::generate();
        let ct_old = FieldCipher::new(KeyRing::new(old.clone(), None))
            .encrypt_str("erin@uni.edu")
            .unwrap();
        let c = FieldCipher::new(KeyRing::new(EncryptionKey::generate(), Some(old)));

        let rewritten = c.reencrypt(&ct_old).unwrap().expect("needs rewrite");
        assert_eq!(c.open(&rewritten).unwrap().1, OpenedWith::Primary);
        assert_eq!(c.reencrypt(&rewritten).unwrap(), None);
        assert!(c.reencrypt("legacy@uni.edu").unwrap().is_some());
        assert_eq!(c.reencrypt("").unwrap(), None);
    }

    proptest::proptest! {
        #[test]
        fn any_non_empty_string_round_trips(plain in "\\PC{1,200}") {
            let c = cipher();
            let ct = c.encrypt_str(&plain).unwrap();
            proptest::prop_assert!(is_encrypted(&ct));
            proptest::prop_assert_eq!(c.decrypt_tagged(&ct), Decryption::Decrypted(plain));
        }
    }
}
