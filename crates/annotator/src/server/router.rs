//! Axum router construction.

use axum::{
    routing::{delete, get, patch, post, put},
    Router,
};
use tower_http::{compression::CompressionLayer, timeout::TimeoutLayer, trace::TraceLayer};

use super::{handlers, middleware, state::AppState};

/// Build the application [`Router`] with all routes and middleware attached.
pub fn build(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/users", get(handlers::list_users).post(handlers::signup))
        .route(
            "/users/:email",
            get(handlers::get_user)
                .put(handlers::update_user)
                .delete(handlers::delete_user),
        )
        .route("/users/:email/units", get(handlers::user_units))
        .route("/users/:email/feedback", get(handlers::user_feedback))
        .route(
            "/feedback",
            get(handlers::feedback_for_url).post(handlers::create_feedback),
        )
        .route("/feedback/:id/rating", put(handlers::rate_feedback))
        .route("/feedback/:id/highlights", post(handlers::create_highlight))
        .route("/highlights/:id", delete(handlers::delete_highlight))
        .route(
            "/highlights/:id/notes",
            patch(handlers::update_highlight_notes),
        )
        .route("/feedback-requests", post(handlers::upsert_feedback_request))
        .route("/logs", post(handlers::record_event))
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(middleware::REQUEST_TIMEOUT))
        .layer(CompressionLayer::new())
        .with_state(state)
}
