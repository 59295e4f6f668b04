//! Axum request handlers for all service endpoints.

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use common::protocol::{
    EnrolledUnit, ErrorResponse, FeedbackRating, FeedbackRequestCreate, FeedbackRequestResponse,
    FeedbackResponse, FeedbackWithHighlights, HealthResponse, HighlightDetail, HighlightNotes,
    HighlightResponse, LogEvent, LogResponse, NewFeedback, NewHighlight, UrlQuery, UserProfile,
    UserResponse, UserUpdate,
};
use common::ServiceError;
use fieldcrypt::RowId;
use tracing::warn;

use super::state::AppState;
use crate::services::{feedback, feedback_requests, highlights, logs, users};

/// A [`ServiceError`] rendered as a JSON [`ErrorResponse`].
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = match &self.0 {
            ServiceError::BadRequest(m)
            | ServiceError::Forbidden(m)
            | ServiceError::NotFound(m)
            | ServiceError::Conflict(m)
            | ServiceError::EncryptionFailure(m)
            | ServiceError::Unavailable(m)
            | ServiceError::Internal(m) => m.clone(),
        };
        (status, Json(ErrorResponse::new(self.0.code(), message))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Email of the calling user, taken from the configured identity header.
#[derive(Debug, Clone)]
pub struct Caller(pub String);

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let name = state.user_header_name.as_str();
        let value = parts
            .headers
            .get(name)
            .ok_or_else(|| ServiceError::BadRequest(format!("missing {name} header")))?;
        let email = value
            .to_str()
            .map_err(|_| ServiceError::BadRequest(format!("{name} header is not valid ASCII")))?
            .trim();
        if email.is_empty() {
            return Err(ServiceError::BadRequest(format!("{name} header is empty")).into());
        }
        Ok(Caller(email.to_owned()))
    }
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// `POST /users`
pub async fn signup(
    State(state): State<AppState>,
    Json(profile): Json<UserProfile>,
) -> ApiResult<(StatusCode, Json<UserResponse>)> {
    let user = users::signup(state.store.as_ref(), &state.cipher, profile).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

/// `GET /users`
pub async fn list_users(State(state): State<AppState>) -> ApiResult<Json<Vec<UserResponse>>> {
    Ok(Json(users::list_users(state.store.as_ref(), &state.cipher).await?))
}

/// `GET /users/:email`
pub async fn get_user(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> ApiResult<Json<UserResponse>> {
    Ok(Json(
        users::get_user(state.store.as_ref(), &state.cipher, &email).await?,
    ))
}

/// `PUT /users/:email`
pub async fn update_user(
    State(state): State<AppState>,
    Path(email): Path<String>,
    Json(update): Json<UserUpdate>,
) -> ApiResult<Json<UserResponse>> {
    Ok(Json(
        users::update_user(state.store.as_ref(), &state.cipher, &email, update).await?,
    ))
}

/// `DELETE /users/:email`
pub async fn delete_user(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> ApiResult<StatusCode> {
    users::delete_user(state.store.as_ref(), &state.cipher, &email).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /users/:email/units`
pub async fn user_units(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> ApiResult<Json<Vec<EnrolledUnit>>> {
    Ok(Json(
        users::units_for_user(state.store.as_ref(), &state.cipher, &email).await?,
    ))
}

// ---------------------------------------------------------------------------
// Feedback
// ---------------------------------------------------------------------------

/// `GET /users/:email/feedback`
pub async fn user_feedback(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> ApiResult<Json<Vec<FeedbackResponse>>> {
    Ok(Json(
        feedback::feedback_for_student(state.store.as_ref(), &state.cipher, &email).await?,
    ))
}

/// `POST /feedback`
pub async fn create_feedback(
    State(state): State<AppState>,
    Json(body): Json<NewFeedback>,
) -> ApiResult<(StatusCode, Json<FeedbackResponse>)> {
    let created = feedback::create_feedback(state.store.as_ref(), &state.cipher, body).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// `GET /feedback?url=`: the caller's feedback highlighted on that page.
pub async fn feedback_for_url(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(query): Query<UrlQuery>,
) -> ApiResult<Json<Vec<FeedbackWithHighlights>>> {
    Ok(Json(
        feedback::feedback_for_url(state.store.as_ref(), &state.cipher, &caller, &query.url)
            .await?,
    ))
}

/// `PUT /feedback/:id/rating`, by the student the feedback belongs to.
pub async fn rate_feedback(
    State(state): State<AppState>,
    Path(id): Path<RowId>,
    Caller(caller): Caller,
    Json(rating): Json<FeedbackRating>,
) -> ApiResult<Json<FeedbackResponse>> {
    Ok(Json(
        feedback::rate_feedback(state.store.as_ref(), &state.cipher, id, &caller, rating).await?,
    ))
}

/// `POST /feedback/:id/highlights`, by the student the feedback belongs to.
pub async fn create_highlight(
    State(state): State<AppState>,
    Path(id): Path<RowId>,
    Caller(caller): Caller,
    Json(body): Json<NewHighlight>,
) -> ApiResult<(StatusCode, Json<HighlightResponse>)> {
    let created =
        highlights::create_highlight(state.store.as_ref(), &state.cipher, id, &caller, body)
            .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// `PATCH /highlights/:id/notes`, by the owner of the highlighted feedback.
pub async fn update_highlight_notes(
    State(state): State<AppState>,
    Path(id): Path<RowId>,
    Caller(caller): Caller,
    Json(body): Json<HighlightNotes>,
) -> ApiResult<Json<HighlightDetail>> {
    Ok(Json(
        highlights::update_notes(state.store.as_ref(), &state.cipher, id, &caller, body.notes)
            .await?,
    ))
}

/// `DELETE /highlights/:id`: soft delete, by the owner of the highlighted feedback.
pub async fn delete_highlight(
    State(state): State<AppState>,
    Path(id): Path<RowId>,
    Caller(caller): Caller,
) -> ApiResult<StatusCode> {
    highlights::delete_highlight(state.store.as_ref(), &state.cipher, id, &caller).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Feedback requests and logs
// ---------------------------------------------------------------------------

/// `POST /feedback-requests`: 201 when created, 200 when an existing request
/// was updated.
pub async fn upsert_feedback_request(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(body): Json<FeedbackRequestCreate>,
) -> ApiResult<(StatusCode, Json<FeedbackRequestResponse>)> {
    let saved =
        feedback_requests::upsert_request(state.store.as_ref(), &state.cipher, &caller, body)
            .await?;
    let status = if saved.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(saved)))
}

/// `POST /logs`
pub async fn record_event(
    State(state): State<AppState>,
    Json(event): Json<LogEvent>,
) -> ApiResult<(StatusCode, Json<LogResponse>)> {
    let logged = logs::record_event(state.store.as_ref(), &state.cipher, event).await?;
    Ok((StatusCode::CREATED, Json(logged)))
}

// ---------------------------------------------------------------------------
// Health and fallback
// ---------------------------------------------------------------------------

/// `GET /health`: liveness and readiness check.
///
/// Returns `200 OK` when the record store answers its probe and
/// `503 Service Unavailable` otherwise.
pub async fn health(State(state): State<AppState>) -> Response {
    let store_ready = match state.store.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "record store not ready");
            false
        }
    };

    let (status_code, status_str) = if store_ready {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    let body = HealthResponse {
        status: status_str.into(),
        store_ready,
        key_rotation: state.cipher.rotation_enabled(),
    };
    (status_code, Json(body)).into_response()
}

/// Catch-all 404 handler.
pub async fn not_found() -> impl IntoResponse {
    let err = ErrorResponse::new("not_found", "the requested resource does not exist");
    (StatusCode::NOT_FOUND, Json(err))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use axum::{body::Body, http::Request, routing::get, Router};
    use fieldcrypt::store::MockRecordStore;
    use fieldcrypt::StoreError;
    use tower::ServiceExt;

    fn health_router(state: AppState) -> Router {
        Router::new()
            .route("/health", get(health))
            .with_state(state)
    }

    async fn get_health(state: AppState) -> (StatusCode, HealthResponse) {
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = health_router(state).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_is_ok_with_reachable_store() {
        let (status, body) = get_health(AppState::default()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.status, "ok");
        assert!(body.store_ready);
        assert!(!body.key_rotation);
    }

    #[tokio::test]
    async fn health_returns_503_when_store_is_down() {
        let mut store = MockRecordStore::new();
        store
            .expect_ping()
            .returning(|| Err(StoreError::Unavailable("connection refused".into())));
        let state = AppState {
            store: Arc::new(store),
            ..AppState::default()
        };
        let (status, body) = get_health(state).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.status, "degraded");
        assert!(!body.store_ready);
    }

    #[tokio::test]
    async fn api_error_uses_status_and_code() {
        let resp = ApiError(ServiceError::Forbidden("not yours".into())).into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: ErrorResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.code, "forbidden");
        assert_eq!(body.message, "not yours");
    }
}
