//! Domain operations behind the HTTP handlers.
//!
//! Every PII column is encrypted here before a record reaches the store and
//! decrypted here before it leaves the service. Lookups by email go through
//! [`fieldcrypt::lookup`], which scans and decrypts the candidate rows.

pub mod feedback;
pub mod feedback_requests;
pub mod highlights;
pub mod logs;
pub mod users;

use common::ServiceError;
use fieldcrypt::{CipherError, FieldCipher, Record, Row, StoreError, Table};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::error;

/// Map a store failure to the error returned to callers.
pub(crate) fn store_error(err: StoreError) -> ServiceError {
    match err {
        StoreError::NotFound { table, .. } => ServiceError::NotFound(format!("{table} row")),
        StoreError::Unavailable(msg) => ServiceError::Unavailable(msg),
        other => {
            error!(error = %other, "record store failure");
            ServiceError::Internal("record store failure".into())
        }
    }
}

pub(crate) fn cipher_error(err: CipherError) -> ServiceError {
    error!(error = %err, "field encryption failed");
    ServiceError::EncryptionFailure("field encryption failed".into())
}

/// Serialise a request body into a store record, dropping null fields, and
/// encrypt the PII columns of `table`.
pub(crate) fn encode<T: Serialize>(
    cipher: &FieldCipher,
    table: Table,
    value: &T,
) -> Result<Record, ServiceError> {
    let record = match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => return Err(ServiceError::Internal("unserialisable record".into())),
    };
    let record: Record = record.into_iter().filter(|(_, v)| !v.is_null()).collect();
    cipher
        .encrypt_record(&record, table.encrypted_columns())
        .map_err(cipher_error)
}

/// Decrypt the PII columns of `row` and deserialise it, with the row id
/// available as `id`.
pub(crate) fn decode<T: DeserializeOwned>(
    cipher: &FieldCipher,
    table: Table,
    row: &Row,
) -> Result<T, ServiceError> {
    let mut record = cipher.decrypt_record(&row.record, table.encrypted_columns());
    record.insert("id".into(), Value::from(row.id));
    serde_json::from_value(Value::Object(record)).map_err(|e| {
        error!(%table, id = row.id, error = %e, "stored row does not match its schema");
        ServiceError::Internal("stored record is malformed".into())
    })
}

/// Rewrite PII columns of `row` not already in `changes` that are legacy
/// plaintext or readable only under the rotation key.
pub(crate) fn lazy_reencrypt(
    cipher: &FieldCipher,
    table: Table,
    row: &Row,
    changes: &mut Record,
) -> Result<(), ServiceError> {
    for column in table.encrypted_columns() {
        if changes.contains_key(*column) {
            continue;
        }
        let Some(stored) = row.str_field(column) else {
            continue;
        };
        if let Some(fresh) = cipher.reencrypt(stored).map_err(cipher_error)? {
            changes.insert((*column).to_owned(), Value::String(fresh));
        }
    }
    Ok(())
}
