//! Highlights on a piece of feedback, with their action items.

use common::protocol::{ActionItem, HighlightDetail, HighlightResponse, NewHighlight, RowStatus};
use common::ServiceError;
use fieldcrypt::{FieldCipher, Record, RecordStore, Row, RowId, Table};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use super::feedback::owned_feedback;
use super::{decode, encode, store_error};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StoredHighlight<'a> {
    feedback_id: RowId,
    row_status: RowStatus,
    #[serde(flatten)]
    highlight: &'a NewHighlight,
}

/// Create a highlight and its action items on feedback owned by `caller`.
///
/// The highlight and each action item are separate writes; a failure part way
/// leaves the rows already written in place.
pub async fn create_highlight(
    store: &dyn RecordStore,
    cipher: &FieldCipher,
    feedback_id: RowId,
    caller: &str,
    highlight: NewHighlight,
) -> Result<HighlightResponse, ServiceError> {
    owned_feedback(store, cipher, feedback_id, caller).await?;

    let mut record = encode(
        cipher,
        Table::Highlight,
        &StoredHighlight {
            feedback_id,
            row_status: RowStatus::Active,
            highlight: &highlight,
        },
    )?;
    record.remove("actionItems");
    let row = store
        .insert(Table::Highlight, record)
        .await
        .map_err(store_error)?;

    let mut action_item_ids = Vec::with_capacity(highlight.action_items.len());
    for item in &highlight.action_items {
        let mut action = encode(cipher, Table::Action, item)?;
        action.insert("highlightId".into(), row.id.into());
        let action_row = store
            .insert(Table::Action, action)
            .await
            .map_err(store_error)?;
        action_item_ids.push(action_row.id);
    }

    info!(
        id = row.id,
        feedback = feedback_id,
        action_items = action_item_ids.len(),
        "highlight created"
    );
    Ok(HighlightResponse {
        id: row.id,
        feedback_id,
        action_item_ids,
    })
}

/// The active highlight `id`, provided `caller` owns the feedback it is on.
///
/// A missing or soft-deleted highlight is `NotFound`, as is one whose feedback
/// no longer exists; someone else's highlight is `Forbidden`.
async fn owned_highlight(
    store: &dyn RecordStore,
    cipher: &FieldCipher,
    id: RowId,
    caller: &str,
) -> Result<Row, ServiceError> {
    let row = store
        .get(Table::Highlight, id)
        .await
        .map_err(store_error)?
        .filter(is_active)
        .ok_or_else(|| ServiceError::NotFound("highlight not found".into()))?;
    let feedback_id = row
        .record
        .get("feedbackId")
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            warn!(id, "highlight has no feedback id");
            ServiceError::NotFound("highlight not found".into())
        })?;
    owned_feedback(store, cipher, feedback_id, caller).await?;
    Ok(row)
}

pub(crate) fn is_active(row: &Row) -> bool {
    row.record
        .get("rowStatus")
        .map_or(true, |status| *status == "ACTIVE")
}

/// Decode a highlight row with the action items attached to it.
pub(crate) async fn detail(
    store: &dyn RecordStore,
    cipher: &FieldCipher,
    row: &Row,
) -> Result<HighlightDetail, ServiceError> {
    let mut detail: HighlightDetail = decode(cipher, Table::Highlight, row)?;
    let actions = store
        .rows_where(Table::Action, "highlightId", &Value::from(row.id))
        .await
        .map_err(store_error)?;
    detail.action_items = actions
        .iter()
        .map(|action| decode::<ActionItem>(cipher, Table::Action, action))
        .collect::<Result<_, _>>()?;
    Ok(detail)
}

/// Replace the notes on a highlight owned by `caller`.
pub async fn update_notes(
    store: &dyn RecordStore,
    cipher: &FieldCipher,
    id: RowId,
    caller: &str,
    notes: String,
) -> Result<HighlightDetail, ServiceError> {
    owned_highlight(store, cipher, id, caller).await?;
    let mut changes = Record::new();
    changes.insert("notes".into(), Value::String(notes));
    let updated = store
        .update(Table::Highlight, id, changes)
        .await
        .map_err(store_error)?;
    info!(id, "highlight notes updated");
    detail(store, cipher, &updated).await
}

/// Soft-delete a highlight owned by `caller`. Its action items are kept.
pub async fn delete_highlight(
    store: &dyn RecordStore,
    cipher: &FieldCipher,
    id: RowId,
    caller: &str,
) -> Result<(), ServiceError> {
    owned_highlight(store, cipher, id, caller).await?;
    let mut changes = Record::new();
    changes.insert("rowStatus".into(), Value::from("INACTIVE"));
    store
        .update(Table::Highlight, id, changes)
        .await
        .map_err(store_error)?;
    info!(id, "highlight deactivated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::feedback::create_feedback;
    use crate::services::testing;
    use common::protocol::{
        ActionItem, ActionPointCategory, AnnotationTag, DomMeta, NewFeedback,
    };

    fn highlight() -> NewHighlight {
        let meta = |offset| DomMeta {
            parent_tag_name: "P".into(),
            parent_index: 2,
            text_offset: offset,
        };
        NewHighlight {
            start_meta: meta(0),
            end_meta: meta(12),
            text: "weak argument".into(),
            url: "https://lms.example/feedback/4".into(),
            annotation_tag: AnnotationTag::ActionItem,
            notes: None,
            action_items: vec![ActionItem {
                action: "Re-read chapter 3".into(),
                category: ActionPointCategory::ReferLearningResources,
                deadline: Some("2024-05-01".into()),
            }],
        }
    }

    async fn feedback_for(
        store: &dyn RecordStore,
        c: &FieldCipher,
        student: &str,
    ) -> RowId {
        create_feedback(
            store,
            c,
            NewFeedback {
                assessment_id: 1,
                student_email: student.into(),
                marker_email: None,
                mark: None,
            },
        )
        .await
        .unwrap()
        .id
    }

    #[tokio::test]
    async fn owner_creates_highlight_with_actions() {
        let (store, c) = (testing::store(), testing::cipher());
        let fb = feedback_for(&store, &c, "s@uni.edu").await;

        let created = create_highlight(&store, &c, fb, "s@uni.edu", highlight())
            .await
            .unwrap();
        assert_eq!(created.action_item_ids.len(), 1);

        let stored = store.get(Table::Highlight, created.id).await.unwrap().unwrap();
        assert_eq!(stored.record["feedbackId"], fb);
        assert_eq!(stored.record["annotationTag"], "Action Item");
        assert_eq!(stored.record["rowStatus"], "ACTIVE");
        assert!(!stored.record.contains_key("actionItems"));

        let action = store
            .get(Table::Action, created.action_item_ids[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(action.record["highlightId"], created.id);
        assert_eq!(action.record["category"], "Refer Learning Resources");
    }

    #[tokio::test]
    async fn other_students_cannot_highlight() {
        let (store, c) = (testing::store(), testing::cipher());
        let fb = feedback_for(&store, &c, "s@uni.edu").await;
        let err = create_highlight(&store, &c, fb, "t@uni.edu", highlight())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
        assert!(store.rows(Table::Highlight).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn owner_updates_notes() {
        let (store, c) = (testing::store(), testing::cipher());
        let fb = feedback_for(&store, &c, "s@uni.edu").await;
        let h = create_highlight(&store, &c, fb, "s@uni.edu", highlight())
            .await
            .unwrap();

        let updated = update_notes(&store, &c, h.id, "s@uni.edu", "ask in lab".into())
            .await
            .unwrap();
        assert_eq!(updated.notes.as_deref(), Some("ask in lab"));
        assert_eq!(updated.feedback_id, fb);
        assert_eq!(updated.row_status, RowStatus::Active);
        assert_eq!(updated.action_items.len(), 1);
        assert_eq!(updated.action_items[0].action, "Re-read chapter 3");
    }

    #[tokio::test]
    async fn notes_of_other_or_missing_highlights_are_refused() {
        let (store, c) = (testing::store(), testing::cipher());
        let fb = feedback_for(&store, &c, "s@uni.edu").await;
        let h = create_highlight(&store, &c, fb, "s@uni.edu", highlight())
            .await
            .unwrap();

        let err = update_notes(&store, &c, h.id, "t@uni.edu", "mine now".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
        let stored = store.get(Table::Highlight, h.id).await.unwrap().unwrap();
        assert!(!stored.record.contains_key("notes"));

        let err = update_notes(&store, &c, 999, "s@uni.edu", "x".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_is_soft_and_owner_only() {
        let (store, c) = (testing::store(), testing::cipher());
        let fb = feedback_for(&store, &c, "s@uni.edu").await;
        let h = create_highlight(&store, &c, fb, "s@uni.edu", highlight())
            .await
            .unwrap();

        let err = delete_highlight(&store, &c, h.id, "t@uni.edu").await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));

        delete_highlight(&store, &c, h.id, "s@uni.edu").await.unwrap();
        let stored = store.get(Table::Highlight, h.id).await.unwrap().unwrap();
        assert_eq!(stored.record["rowStatus"], "INACTIVE");
        assert!(!is_active(&stored));

        let err = delete_highlight(&store, &c, h.id, "s@uni.edu").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        let err = update_notes(&store, &c, h.id, "s@uni.edu", "x".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
