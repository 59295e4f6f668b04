//! Assessment feedback and its ratings.

use common::protocol::{FeedbackRating, FeedbackResponse, FeedbackWithHighlights, NewFeedback};
use common::ServiceError;
use fieldcrypt::lookup::{find_all_by_encrypted_field, owns};
use fieldcrypt::{FieldCipher, Lookup, RecordStore, Row, RowId, Table};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::highlights::{detail, is_active};
use super::{decode, encode, lazy_reencrypt, store_error};

pub async fn create_feedback(
    store: &dyn RecordStore,
    cipher: &FieldCipher,
    feedback: NewFeedback,
) -> Result<FeedbackResponse, ServiceError> {
    let record = encode(cipher, Table::Feedback, &feedback)?;
    let row = store
        .insert(Table::Feedback, record)
        .await
        .map_err(store_error)?;
    info!(id = row.id, assessment = feedback.assessment_id, "feedback created");
    decode(cipher, Table::Feedback, &row)
}

/// All feedback addressed to `student_email`.
pub async fn feedback_for_student(
    store: &dyn RecordStore,
    cipher: &FieldCipher,
    student_email: &str,
) -> Result<Vec<FeedbackResponse>, ServiceError> {
    let lookup = Lookup::new(Table::Feedback, "studentEmail", student_email);
    let rows = find_all_by_encrypted_field(store, cipher, &lookup)
        .await
        .map_err(store_error)?;
    rows.iter()
        .map(|row| decode(cipher, Table::Feedback, row))
        .collect()
}

/// The caller's feedback that has active highlights on the page `url`, each
/// with those highlights and their action items.
pub async fn feedback_for_url(
    store: &dyn RecordStore,
    cipher: &FieldCipher,
    caller: &str,
    url: &str,
) -> Result<Vec<FeedbackWithHighlights>, ServiceError> {
    let lookup = Lookup::new(Table::Feedback, "studentEmail", caller);
    let owned = find_all_by_encrypted_field(store, cipher, &lookup)
        .await
        .map_err(store_error)?;
    let on_page = store
        .rows_where(Table::Highlight, "url", &Value::from(url))
        .await
        .map_err(store_error)?;

    let mut results = Vec::new();
    for row in &owned {
        let mut highlights = Vec::new();
        for highlight in on_page.iter().filter(|h| is_active(h)) {
            if highlight.record.get("feedbackId") == Some(&Value::from(row.id)) {
                highlights.push(detail(store, cipher, highlight).await?);
            }
        }
        if highlights.is_empty() {
            continue;
        }
        results.push(FeedbackWithHighlights {
            feedback: decode(cipher, Table::Feedback, row)?,
            highlights,
        });
    }
    debug!(feedback = results.len(), "feedback on page resolved");
    Ok(results)
}

/// The feedback row `id`, provided `caller` is the student it belongs to.
///
/// A missing row is `NotFound`; someone else's row is `Forbidden`.
pub async fn owned_feedback(
    store: &dyn RecordStore,
    cipher: &FieldCipher,
    id: RowId,
    caller: &str,
) -> Result<Row, ServiceError> {
    let row = store
        .get(Table::Feedback, id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| ServiceError::NotFound("feedback not found".into()))?;
    if !owns(cipher, &row, "studentEmail", caller) {
        warn!(id, "feedback access denied");
        return Err(ServiceError::Forbidden(
            "feedback belongs to another user".into(),
        ));
    }
    Ok(row)
}

/// Record the owning student's rating of a piece of feedback.
pub async fn rate_feedback(
    store: &dyn RecordStore,
    cipher: &FieldCipher,
    id: RowId,
    caller: &str,
    rating: FeedbackRating,
) -> Result<FeedbackResponse, ServiceError> {
    if let Some(field) = rating.out_of_range() {
        return Err(ServiceError::BadRequest(format!(
            "{field} must be between 1 and 5"
        )));
    }
    let row = owned_feedback(store, cipher, id, caller).await?;
    let mut changes = encode(cipher, Table::Feedback, &rating)?;
    lazy_reencrypt(cipher, Table::Feedback, &row, &mut changes)?;
    let updated = store
        .update(Table::Feedback, id, changes)
        .await
        .map_err(store_error)?;
    info!(id, "feedback rated");
    decode(cipher, Table::Feedback, &updated)
}
