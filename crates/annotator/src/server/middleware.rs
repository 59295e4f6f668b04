//! Middleware settings shared by every route.
//!
//! The router applies request tracing, a per-request timeout and response
//! compression.

use std::time::Duration;

/// Per-request timeout. A lookup scans and decrypts every candidate row, so
/// this also bounds the cost of a scan on a large table.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
