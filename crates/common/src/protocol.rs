//! Request and response types of the annotator HTTP API.
//!
//! Field names are camelCase on the wire. Every PII field here is plaintext:
//! encryption happens in the service layer before a record reaches the store.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// Role of a user within a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Student,
    Tutor,
    #[serde(rename = "Chief Examiner")]
    ChiefExaminer,
    Admin,
}

/// Faculty a user belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Faculty {
    Engineering,
    #[serde(rename = "Information Technology")]
    InformationTechnology,
    Science,
    #[serde(rename = "Business and Economics")]
    Business,
    Arts,
    #[serde(rename = "Medicine, Nursing and Health Sciences")]
    Medicine,
    #[serde(rename = "Pharmacy and Pharmaceutical Sciences")]
    Pharmacy,
    Law,
    Education,
    #[serde(rename = "Art, Design and Architecture")]
    ArtDesignArchitecture,
}

/// Request body for `POST /users`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub monash_id: Option<String>,
    #[serde(default)]
    pub monash_object_id: Option<String>,
    #[serde(default)]
    pub authcate: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub faculty: Option<Faculty>,
}

/// Request body for `PUT /users/:email`. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub monash_id: Option<String>,
    pub monash_object_id: Option<String>,
    pub authcate: Option<String>,
    pub role: Option<Role>,
    pub faculty: Option<Faculty>,
}

/// A user as returned by the API, with PII decrypted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: u64,
    #[serde(flatten)]
    pub profile: UserProfile,
}

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

/// An assessment within a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentSummary {
    pub id: u64,
    pub assessment_name: String,
}

/// Response item for `GET /users/:email/units`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrolledUnit {
    pub unit_code: String,
    pub unit_name: String,
    #[serde(default)]
    pub offering: Option<String>,
    pub assessments: Vec<AssessmentSummary>,
}

// ---------------------------------------------------------------------------
// Feedback
// ---------------------------------------------------------------------------

/// Request body for `POST /feedback`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFeedback {
    pub assessment_id: u64,
    pub student_email: String,
    #[serde(default)]
    pub marker_email: Option<String>,
    #[serde(default)]
    pub mark: Option<u32>,
}

/// A feedback record with PII decrypted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackResponse {
    pub id: u64,
    pub assessment_id: u64,
    pub student_email: String,
    pub marker_email: Option<String>,
    pub mark: Option<u32>,
    pub clarity: Option<u8>,
    pub personalise: Option<u8>,
    pub usability: Option<u8>,
    pub emotion: Option<u8>,
}

/// Request body for `PUT /feedback/:id/rating`. Each score is 1 to 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRating {
    pub clarity: u8,
    pub personalise: u8,
    pub usability: u8,
    pub emotion: u8,
}

impl FeedbackRating {
    /// The name of the first score outside `1..=5`, if any.
    pub fn out_of_range(&self) -> Option<&'static str> {
        [
            ("clarity", self.clarity),
            ("personalise", self.personalise),
            ("usability", self.usability),
            ("emotion", self.emotion),
        ]
        .into_iter()
        .find(|(_, score)| !(1..=5).contains(score))
        .map(|(name, _)| name)
    }
}

// ---------------------------------------------------------------------------
// Feedback requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricItem {
    pub id: String,
    pub item: String,
    pub comments: String,
}

/// Request body for `POST /feedback-requests`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRequestCreate {
    pub assignment_id: u64,
    pub rubric_items: Vec<RubricItem>,
    pub previous_feedback_usage: String,
}

/// Response body for `POST /feedback-requests`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRequestResponse {
    pub id: u64,
    pub assignment_id: u64,
    pub rubric_items: Vec<RubricItem>,
    pub previous_feedback_usage: String,
    /// `false` when an existing request for the same assignment and student
    /// was updated instead.
    pub created: bool,
}

// ---------------------------------------------------------------------------
// Highlights and action items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnnotationTag {
    Strength,
    Weakness,
    #[serde(rename = "Action Item")]
    ActionItem,
    Confused,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionPointCategory {
    #[serde(rename = "Further Practice")]
    FurtherPractice,
    #[serde(rename = "Contact Tutor")]
    ContactTutor,
    #[serde(rename = "Refer Learning Resources")]
    ReferLearningResources,
    #[serde(rename = "Explore Online")]
    ExploreOnline,
    #[serde(rename = "Ask Classmates")]
    AskClassmates,
    Other,
}

/// Position of a highlight boundary in the rendered feedback page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomMeta {
    pub parent_tag_name: String,
    pub parent_index: u32,
    pub text_offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionItem {
    pub action: String,
    pub category: ActionPointCategory,
    /// ISO-8601 date.
    #[serde(default)]
    pub deadline: Option<String>,
}

/// Request body for `POST /feedback/:id/highlights`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewHighlight {
    pub start_meta: DomMeta,
    pub end_meta: DomMeta,
    pub text: String,
    pub url: String,
    pub annotation_tag: AnnotationTag,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub action_items: Vec<ActionItem>,
}

/// Response body for `POST /feedback/:id/highlights`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HighlightResponse {
    pub id: u64,
    pub feedback_id: u64,
    /// Ids of the action items created with the highlight.
    pub action_item_ids: Vec<u64>,
}

/// Soft-delete marker on highlight rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowStatus {
    #[default]
    Active,
    Inactive,
}

/// A stored highlight with its action items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HighlightDetail {
    pub id: u64,
    pub feedback_id: u64,
    pub start_meta: DomMeta,
    pub end_meta: DomMeta,
    pub text: String,
    pub url: String,
    pub annotation_tag: AnnotationTag,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub row_status: RowStatus,
    #[serde(default)]
    pub action_items: Vec<ActionItem>,
}

/// Request body for `PATCH /highlights/:id/notes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighlightNotes {
    pub notes: String,
}

/// Query string of `GET /feedback`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlQuery {
    pub url: String,
}

/// Response item of `GET /feedback?url=`: one piece of the caller's feedback
/// and its active highlights on that page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackWithHighlights {
    #[serde(flatten)]
    pub feedback: FeedbackResponse,
    pub highlights: Vec<HighlightDetail>,
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

/// Request body for `POST /logs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub event_type: String,
    #[serde(default)]
    pub tag_name: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
}

/// Response body for `POST /logs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogResponse {
    pub id: u64,
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// Standard error response body returned on any non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short machine-readable error code (e.g. `"not_found"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Response body for `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall service status: `"ok"` or `"degraded"`.
    pub status: String,
    /// Whether the record store answered its readiness probe.
    pub store_ready: bool,
    /// Whether a rotation key is configured alongside the primary key.
    pub key_rotation: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn user_profile_uses_camel_case_and_display_names() {
        let profile: UserProfile = serde_json::from_value(json!({
            "email": "a@uni.edu",
            "firstName": "Ann",
            "lastName": "Lee",
            "role": "Chief Examiner",
            "faculty": "Information Technology"
        }))
        .unwrap();
        assert_eq!(profile.role, Role::ChiefExaminer);
        assert_eq!(profile.faculty, Some(Faculty::InformationTechnology));
        assert_eq!(profile.monash_id, None);
    }

    #[test]
    fn user_response_flattens_profile() {
        let resp = UserResponse {
            id: 3,
            profile: UserProfile {
                email: "a@uni.edu".into(),
                first_name: "Ann".into(),
                last_name: "Lee".into(),
                monash_id: None,
                monash_object_id: None,
                authcate: None,
                role: Role::Student,
                faculty: None,
            },
        };
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["id"], 3);
        assert_eq!(value["firstName"], "Ann");
    }

    #[test]
    fn rating_range_check() {
        let ok = FeedbackRating { clarity: 1, personalise: 5, usability: 3, emotion: 2 };
        assert_eq!(ok.out_of_range(), None);
        let bad = FeedbackRating { emotion: 6, ..ok };
        assert_eq!(bad.out_of_range(), Some("emotion"));
    }

    #[test]
    fn highlight_defaults_action_items() {
        let h: NewHighlight = serde_json::from_value(json!({
            "startMeta": { "parentTagName": "P", "parentIndex": 0, "textOffset": 4 },
            "endMeta": { "parentTagName": "P", "parentIndex": 0, "textOffset": 19 },
            "text": "needs more depth",
            "url": "https://lms.example/feedback/1",
            "annotationTag": "Action Item"
        }))
        .unwrap();
        assert_eq!(h.annotation_tag, AnnotationTag::ActionItem);
        assert!(h.action_items.is_empty());
    }

    #[test]
    fn row_status_defaults_to_active() {
        let h: HighlightDetail = serde_json::from_value(json!({
            "id": 7,
            "feedbackId": 2,
            "startMeta": { "parentTagName": "P", "parentIndex": 0, "textOffset": 0 },
            "endMeta": { "parentTagName": "P", "parentIndex": 0, "textOffset": 5 },
            "text": "vague",
            "url": "https://lms.example/feedback/2",
            "annotationTag": "Weakness"
        }))
        .unwrap();
        assert_eq!(h.row_status, RowStatus::Active);
        assert_eq!(serde_json::to_value(RowStatus::Inactive).unwrap(), "INACTIVE");
    }

    #[test]
    fn error_response_new() {
        let e = ErrorResponse::new("not_found", "user not found");
        assert_eq!(e.code, "not_found");
        assert!(e.message.contains("user"));
    }
}
