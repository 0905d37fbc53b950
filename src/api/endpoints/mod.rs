//! HTTP endpoint handlers.
//!
//! Handlers take `State<ApiContext>` and return `Result<_, ApiError>`.
//! Guards run as middleware (see `router.rs`), except the event stream,
//! which authenticates with a run-bound token inside its handler.

pub mod admin;
pub mod documents;
pub mod events;
pub mod health;
pub mod patients;
pub mod runs;

use crate::api::error::ApiError;

/// Parse an optional `limit` query value. Clamping is left to the caller;
/// only non-numeric input is an error.
pub(crate) fn parse_limit(raw: Option<&str>) -> Result<Option<i64>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => s
            .parse::<i64>()
            .map(Some)
            .map_err(|_| ApiError::BadRequest("limit must be an integer".into())),
    }
}
