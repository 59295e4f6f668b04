//! HTTP layer: routing, shared state and request handlers.
//!
//! Handlers stay thin. They extract the request, call into [`crate::services`]
//! and map [`common::ServiceError`] onto a status code and an
//! [`common::protocol::ErrorResponse`] body.

pub mod handlers;
pub mod middleware;
pub mod router;
pub mod state;
