//! Student requests for feedback on an assignment, one per
//! `(assignmentId, student)`.

use common::protocol::{FeedbackRequestCreate, FeedbackRequestResponse};
use common::ServiceError;
use fieldcrypt::lookup::find_by_encrypted_field;
use fieldcrypt::{FieldCipher, Lookup, RecordStore, Table};
use serde::Serialize;
use tracing::info;

use super::{decode, encode, lazy_reencrypt, store_error};

#[derive(Serialize)]
struct StoredRequest<'a> {
    #[serde(flatten)]
    request: &'a FeedbackRequestCreate,
    student_id: &'a str,
}

/// Create the caller's request for the assignment, or update it in place if
/// one exists.
///
/// The existing row is found by narrowing on the plaintext `assignmentId` and
/// then comparing the decrypted `student_id`.
pub async fn upsert_request(
    store: &dyn RecordStore,
    cipher: &FieldCipher,
    student: &str,
    request: FeedbackRequestCreate,
) -> Result<FeedbackRequestResponse, ServiceError> {
    let lookup = Lookup::new(Table::FeedbackRequest, "student_id", student)
        .prefilter("assignmentId", request.assignment_id);
    let existing = find_by_encrypted_field(store, cipher, &lookup)
        .await
        .map_err(store_error)?;

    let (row, created) = match existing {
        Some(row) => {
            let mut changes = encode(cipher, Table::FeedbackRequest, &request)?;
            lazy_reencrypt(cipher, Table::FeedbackRequest, &row, &mut changes)?;
            let row = store
                .update(Table::FeedbackRequest, row.id, changes)
                .await
                .map_err(store_error)?;
            info!(id = row.id, assignment = request.assignment_id, "feedback request updated");
            (row, false)
        }
        None => {
            let stored = StoredRequest {
                request: &request,
                student_id: student,
            };
            let record = encode(cipher, Table::FeedbackRequest, &stored)?;
            let row = store
                .insert(Table::FeedbackRequest, record)
                .await
                .map_err(store_error)?;
            info!(id = row.id, assignment = request.assignment_id, "feedback request created");
            (row, true)
        }
    };

    let saved: FeedbackRequestCreate = decode(cipher, Table::FeedbackRequest, &row)?;
    Ok(FeedbackRequestResponse {
        id: row.id,
        assignment_id: saved.assignment_id,
        rubric_items: saved.rubric_items,
        previous_feedback_usage: saved.previous_feedback_usage,
        created,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing;
    use common::protocol::RubricItem;

    fn request(assignment: u64, usage: &str) -> FeedbackRequestCreate {
        FeedbackRequestCreate {
            assignment_id: assignment,
            rubric_items: vec![RubricItem {
                id: "2f1c".into(),
                item: "Structure".into(),
                comments: "Is my argument clear?".into(),
            }],
            previous_feedback_usage: usage.into(),
        }
    }

    #[tokio::test]
    async fn second_request_for_same_assignment_updates() {
        let (store, c) = (testing::store(), testing::cipher());
        let first = upsert_request(&store, &c, "s@uni.edu", request(10, "first"))
            .await
            .unwrap();
        assert!(first.created);

        let second = upsert_request(&store, &c, "s@uni.edu", request(10, "second"))
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.previous_feedback_usage, "second");

        let rows = store.rows(Table::FeedbackRequest).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(c.is_encrypted(rows[0].str_field("student_id").unwrap()));
    }

    #[tokio::test]
    async fn different_student_or_assignment_creates() {
        let (store, c) = (testing::store(), testing::cipher());
        upsert_request(&store, &c, "s@uni.edu", request(10, "x")).await.unwrap();
        assert!(upsert_request(&store, &c, "t@uni.edu", request(10, "x")).await.unwrap().created);
        assert!(upsert_request(&store, &c, "s@uni.edu", request(11, "x")).await.unwrap().created);
        assert_eq!(store.rows(Table::FeedbackRequest).await.unwrap().len(), 3);
    }
}
