//! `Idempotency-Key` handling shared by every mutating endpoint.
//!
//! A key is bound to one resource id on first use. Later requests with the
//! same key reuse that id and, once the first request has finished, get its
//! response back verbatim.

use axum::Json;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use inventory_store::{IdempotencyStore, StoredResponse};
use serde::Serialize;

use crate::error::{ApiError, Result};

pub const IDEMPOTENCY_KEY: &str = "idempotency-key";
pub const REPLAYED: &str = "idempotent-replayed";
const MAX_KEY_LEN: usize = 255;

/// The request's `Idempotency-Key` header. Missing or malformed keys are
/// rejected with 400.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyKey(pub String);

impl<S> FromRequestParts<S> for IdempotencyKey
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        let value = parts
            .headers
            .get(IDEMPOTENCY_KEY)
            .ok_or_else(|| ApiError::BadRequest("Idempotency-Key header is required".to_string()))?
            .to_str()
            .map_err(|_| ApiError::BadRequest("Idempotency-Key must be ASCII".to_string()))?
            .trim();

        if value.is_empty() || value.len() > MAX_KEY_LEN {
            return Err(ApiError::BadRequest(format!(
                "Idempotency-Key must be 1 to {MAX_KEY_LEN} characters"
            )));
        }
        Ok(Self(value.to_string()))
    }
}

pub enum Claim {
    /// The key already produced a response; send it again.
    Replay(Response),
    /// First use, or the first request has not finished yet.
    Proceed(Idempotent),
}

/// A claimed key awaiting its first response.
#[derive(Debug)]
pub struct Idempotent {
    scope: &'static str,
    key: String,
    resource_id: String,
}

impl Idempotent {
    /// The resource id bound to the key.
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Records the response for later replays and returns it.
    ///
    /// A failed write only costs the replay; the caller still gets the
    /// response.
    pub async fn finish<S, T>(self, store: &S, status: StatusCode, body: T) -> Result<Response>
    where
        S: IdempotencyStore,
        T: Serialize,
    {
        let body = serde_json::to_value(body)
            .map_err(|e| ApiError::Internal(format!("encoding response: {e}")))?;
        let stored = StoredResponse {
            status: status.as_u16(),
            body: body.clone(),
        };
        if let Err(e) = store.complete_key(self.scope, &self.key, stored).await {
            tracing::warn!(
                scope = self.scope,
                key = %self.key,
                error = %e,
                "Failed to record idempotent response"
            );
        }
        Ok((status, Json(body)).into_response())
    }
}

/// Binds `key` in `scope` to `candidate` unless it is already bound.
///
/// `candidate_is_required` marks a candidate the client chose (a path id or
/// an explicit body id); a key bound to a different resource is then a
/// conflict rather than a reuse of the bound id.
pub async fn claim<S: IdempotencyStore>(
    store: &S,
    scope: &'static str,
    key: IdempotencyKey,
    candidate: &str,
    candidate_is_required: bool,
    now: DateTime<Utc>,
) -> Result<Claim> {
    let record = store.claim_key(scope, &key.0, candidate, now).await?;

    if candidate_is_required && record.resource_id != candidate {
        return Err(ApiError::IdempotencyMismatch {
            bound_to: record.resource_id,
        });
    }

    if let Some(stored) = record.response {
        metrics::counter!("idempotent_replays_total", "scope" => scope).increment(1);
        tracing::debug!(scope, key = %key.0, "Replaying idempotent response");
        return Ok(Claim::Replay(replay(stored)));
    }

    Ok(Claim::Proceed(Idempotent {
        scope,
        key: key.0,
        resource_id: record.resource_id,
    }))
}

fn replay(stored: StoredResponse) -> Response {
    let status = StatusCode::from_u16(stored.status).unwrap_or(StatusCode::OK);
    let mut response = (status, Json(stored.body)).into_response();
    response
        .headers_mut()
        .insert(REPLAYED, HeaderValue::from_static("true"));
    response
}
