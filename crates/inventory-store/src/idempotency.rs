use serde::{Deserialize, Serialize};

/// The first response produced for an idempotency key, replayed verbatim
/// to later requests carrying the same key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

/// What a key maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    /// The reservation or checkout id bound to the key on first use.
    pub resource_id: String,
    /// Present once the first request finished.
    pub response: Option<StoredResponse>,
}
