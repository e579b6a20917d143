//! Error classification shared by every layer.

use serde::{Deserialize, Serialize};

/// Coarse class of a failure, used to decide retries and to pick the
/// stable error code surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Caller bug; never retried.
    Invalid,
    /// Not enough stock for the requested lines.
    OutOfStock,
    /// Idempotency clash or lost optimistic-concurrency race.
    Conflict,
    /// Transient peer or store failure.
    Unavailable,
    /// Deadline exceeded; retry only idempotent calls.
    Timeout,
    /// Anything else; logged and surfaced without detail.
    Internal,
}

impl ErrorKind {
    /// Returns true if the operation may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Unavailable | ErrorKind::Timeout)
    }

    /// Returns the stable code string.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Invalid => "INVALID",
            ErrorKind::OutOfStock => "OUT_OF_STOCK",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Unavailable => "UNAVAILABLE",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}
