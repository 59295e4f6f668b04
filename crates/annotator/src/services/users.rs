//! User accounts and the units a user is enrolled in.

use std::collections::BTreeSet;

use common::protocol::{AssessmentSummary, EnrolledUnit, UserProfile, UserResponse, UserUpdate};
use common::ServiceError;
use fieldcrypt::lookup::{find_all_by_encrypted_field, find_by_encrypted_field};
use fieldcrypt::{FieldCipher, Lookup, RecordStore, Row, Table};
use serde_json::Value;
use tracing::info;

use super::{decode, encode, lazy_reencrypt, store_error};

/// The stored user whose decrypted email is `email`.
pub async fn find_user(
    store: &dyn RecordStore,
    cipher: &FieldCipher,
    email: &str,
) -> Result<Option<Row>, ServiceError> {
    find_by_encrypted_field(store, cipher, &Lookup::new(Table::User, "email", email))
        .await
        .map_err(store_error)
}

async fn require_user(
    store: &dyn RecordStore,
    cipher: &FieldCipher,
    email: &str,
) -> Result<Row, ServiceError> {
    find_user(store, cipher, email)
        .await?
        .ok_or_else(|| ServiceError::NotFound("user not found".into()))
}

/// Register a new user. Fails with `Conflict` if the email is taken.
pub async fn signup(
    store: &dyn RecordStore,
    cipher: &FieldCipher,
    profile: UserProfile,
) -> Result<UserResponse, ServiceError> {
    if profile.email.trim().is_empty() {
        return Err(ServiceError::BadRequest("email must not be empty".into()));
    }
    if find_user(store, cipher, &profile.email).await?.is_some() {
        return Err(ServiceError::Conflict("user already exists".into()));
    }
    let record = encode(cipher, Table::User, &profile)?;
    let row = store.insert(Table::User, record).await.map_err(store_error)?;
    info!(id = row.id, "user created");
    Ok(UserResponse {
        id: row.id,
        profile,
    })
}

pub async fn list_users(
    store: &dyn RecordStore,
    cipher: &FieldCipher,
) -> Result<Vec<UserResponse>, ServiceError> {
    let rows = store.rows(Table::User).await.map_err(store_error)?;
    rows.iter()
        .map(|row| decode(cipher, Table::User, row))
        .collect()
}

pub async fn get_user(
    store: &dyn RecordStore,
    cipher: &FieldCipher,
    email: &str,
) -> Result<UserResponse, ServiceError> {
    let row = require_user(store, cipher, email).await?;
    decode(cipher, Table::User, &row)
}

/// Apply the present fields of `update`. PII columns not being replaced are
/// re-encrypted under the primary key if needed.
pub async fn update_user(
    store: &dyn RecordStore,
    cipher: &FieldCipher,
    email: &str,
    update: UserUpdate,
) -> Result<UserResponse, ServiceError> {
    let row = require_user(store, cipher, email).await?;
    let mut changes = encode(cipher, Table::User, &update)?;
    lazy_reencrypt(cipher, Table::User, &row, &mut changes)?;
    let updated = store
        .update(Table::User, row.id, changes)
        .await
        .map_err(store_error)?;
    info!(id = row.id, "user updated");
    decode(cipher, Table::User, &updated)
}

pub async fn delete_user(
    store: &dyn RecordStore,
    cipher: &FieldCipher,
    email: &str,
) -> Result<(), ServiceError> {
    let row = require_user(store, cipher, email).await?;
    store
        .delete(Table::User, row.id)
        .await
        .map_err(store_error)?;
    info!(id = row.id, "user deleted");
    Ok(())
}

/// Units the user is enrolled in, each with its assessments.
///
/// Enrollment rows are matched on their encrypted `userEmail`; units and
/// assessments are joined on the plaintext `unitCode`.
pub async fn units_for_user(
    store: &dyn RecordStore,
    cipher: &FieldCipher,
    email: &str,
) -> Result<Vec<EnrolledUnit>, ServiceError> {
    require_user(store, cipher, email).await?;

    let enrollments = find_all_by_encrypted_field(
        store,
        cipher,
        &Lookup::new(Table::Enrollment, "userEmail", email),
    )
    .await
    .map_err(store_error)?;

    let codes: BTreeSet<String> = enrollments
        .iter()
        .filter_map(|row| row.str_field("unitCode").map(str::to_owned))
        .collect();

    let mut units = Vec::with_capacity(codes.len());
    for code in codes {
        let code_value = Value::String(code.clone());
        let unit = store
            .rows_where(Table::Unit, "unitCode", &code_value)
            .await
            .map_err(store_error)?
            .into_iter()
            .next();
        let assessments = store
            .rows_where(Table::Assessment, "unitCode", &code_value)
            .await
            .map_err(store_error)?
            .iter()
            .map(|row| AssessmentSummary {
                id: row.id,
                assessment_name: row.str_field("assessmentName").unwrap_or_default().to_owned(),
            })
            .collect();

        units.push(EnrolledUnit {
            unit_name: unit
                .as_ref()
                .and_then(|u| u.str_field("unitName"))
                .unwrap_or_default()
                .to_owned(),
            offering: unit
                .as_ref()
                .and_then(|u| u.str_field("offering"))
                .map(str::to_owned),
            unit_code: code,
            assessments,
        });
    }
    Ok(units)
}
