//! Route handlers.

pub mod checkouts;
pub mod health;
pub mod idempotency;
pub mod metrics;
pub mod reservations;
pub mod stock;

use std::str::FromStr;

use crate::error::ApiError;

/// Parses a path id, answering 400 for malformed ids.
pub(crate) fn parse_id<T: FromStr>(raw: &str, what: &str) -> Result<T, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("malformed {what}: {raw}")))
}
