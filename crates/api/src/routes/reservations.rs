//! Reservation endpoints: Reserve, Commit, Rollback and lookup.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use checkout::MAX_TTL_SECS;
use common::{CheckoutId, ReservationId, SkuId, to_millis};
use inventory_store::{HistoryEntry, Reservation, ReservationLine, ReservationState, Store};
use ledger::{CommitOutcome, ReleaseCause, ReserveOutcome, ReserveRequest, RollbackOutcome};
use serde::{Deserialize, Serialize};

use super::idempotency::{Claim, IdempotencyKey, claim};
use super::parse_id;
use crate::AppState;
use crate::error::{ApiError, Result};

// -- Request types --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReserveBody {
    /// Chosen by the server when absent.
    pub reservation_id: Option<ReservationId>,
    pub checkout_id: CheckoutId,
    pub lines: Vec<ReservationLine>,
    pub ttl_secs: Option<u64>,
}

// -- Response types --

#[derive(Debug, Serialize)]
pub struct ReserveResponse {
    pub reservation_id: ReservationId,
    /// `HELD`, `DUPLICATE`, `OUT_OF_STOCK` or `INVALID`.
    pub state: &'static str,
    /// Current state of the reservation on `DUPLICATE`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_state: Option<ReservationState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicting_sku: Option<SkuId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TransitionResponse {
    pub reservation_id: ReservationId,
    pub state: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ReservationView {
    pub reservation_id: ReservationId,
    pub checkout_id: CheckoutId,
    pub state: ReservationState,
    pub lines: Vec<ReservationLine>,
    pub created_at: i64,
    pub expires_at: i64,
    pub terminal_at: Option<i64>,
    pub history: Vec<HistoryView>,
}

#[derive(Debug, Serialize)]
pub struct HistoryView {
    pub from_state: ReservationState,
    pub to_state: ReservationState,
    pub cause: String,
    pub at: i64,
}

impl ReservationView {
    fn new(reservation: Reservation, history: Vec<HistoryEntry>) -> Self {
        Self {
            reservation_id: reservation.reservation_id,
            checkout_id: reservation.checkout_id,
            state: reservation.state,
            lines: reservation.lines,
            created_at: to_millis(reservation.created_at),
            expires_at: to_millis(reservation.expires_at),
            terminal_at: reservation.terminal_at.map(to_millis),
            history: history
                .into_iter()
                .map(|h| HistoryView {
                    from_state: h.from_state,
                    to_state: h.to_state,
                    cause: h.cause,
                    at: to_millis(h.at),
                })
                .collect(),
        }
    }
}

fn reserve_response(
    reservation_id: ReservationId,
    outcome: &ReserveOutcome,
) -> (StatusCode, ReserveResponse) {
    let mut response = ReserveResponse {
        reservation_id,
        state: outcome.as_str(),
        reservation_state: None,
        expires_at: None,
        conflicting_sku: None,
        reason: None,
    };
    let status = match outcome {
        ReserveOutcome::Held(r) => {
            response.expires_at = Some(to_millis(r.expires_at));
            StatusCode::CREATED
        }
        ReserveOutcome::Duplicate(r) => {
            response.reservation_state = Some(r.state);
            response.expires_at = Some(to_millis(r.expires_at));
            StatusCode::OK
        }
        ReserveOutcome::OutOfStock(sku) => {
            response.conflicting_sku = Some(sku.clone());
            StatusCode::CONFLICT
        }
        ReserveOutcome::Invalid(reason) => {
            response.reason = Some(reason.clone());
            StatusCode::BAD_REQUEST
        }
    };
    (status, response)
}

fn commit_status(outcome: CommitOutcome) -> StatusCode {
    match outcome {
        CommitOutcome::Ok | CommitOutcome::AlreadyCommitted => StatusCode::OK,
        CommitOutcome::NotFound => StatusCode::NOT_FOUND,
        CommitOutcome::AlreadyReleased | CommitOutcome::Expired => StatusCode::CONFLICT,
    }
}

fn rollback_status(outcome: RollbackOutcome) -> StatusCode {
    match outcome {
        RollbackOutcome::Ok | RollbackOutcome::AlreadyReleased => StatusCode::OK,
        RollbackOutcome::NotFound => StatusCode::NOT_FOUND,
        RollbackOutcome::AlreadyCommitted => StatusCode::CONFLICT,
    }
}

// -- Handlers --

/// POST /reservations: hold stock for a checkout.
#[tracing::instrument(skip(state, key, body), fields(key = %key.0))]
pub async fn reserve<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    key: IdempotencyKey,
    body: std::result::Result<Json<ReserveBody>, JsonRejection>,
) -> Result<Response> {
    let Json(body) = body?;
    let candidate = body.reservation_id.unwrap_or_default();
    let idem = match claim(
        &state.store,
        "reserve",
        key,
        &candidate.to_string(),
        body.reservation_id.is_some(),
        state.clock().now(),
    )
    .await?
    {
        Claim::Replay(response) => return Ok(response),
        Claim::Proceed(idem) => idem,
    };
    let reservation_id: ReservationId = parse_id(idem.resource_id(), "reservation_id")?;

    let ttl_secs = body.ttl_secs.unwrap_or(state.default_ttl_secs);
    let outcome = if ttl_secs > MAX_TTL_SECS {
        ReserveOutcome::Invalid(format!("ttl_secs must not exceed {MAX_TTL_SECS}"))
    } else {
        let request = ReserveRequest::new(
            reservation_id,
            body.checkout_id,
            body.lines,
            chrono::Duration::seconds(ttl_secs as i64),
        );
        state.ledger.reserve(request).await?
    };

    let (status, response) = reserve_response(reservation_id, &outcome);
    idem.finish(&state.store, status, response).await
}

/// POST /reservations/{id}/commit: finalize a held reservation.
#[tracing::instrument(skip(state, key), fields(key = %key.0))]
pub async fn commit<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    key: IdempotencyKey,
) -> Result<Response> {
    let reservation_id: ReservationId = parse_id(&id, "reservation_id")?;
    let idem = match claim(
        &state.store,
        "commit",
        key,
        &reservation_id.to_string(),
        true,
        state.clock().now(),
    )
    .await?
    {
        Claim::Replay(response) => return Ok(response),
        Claim::Proceed(idem) => idem,
    };

    let outcome = state.ledger.commit(reservation_id).await?;
    let response = TransitionResponse {
        reservation_id,
        state: outcome.as_str(),
    };
    idem.finish(&state.store, commit_status(outcome), response)
        .await
}

/// POST /reservations/{id}/rollback: release a held reservation.
#[tracing::instrument(skip(state, key), fields(key = %key.0))]
pub async fn rollback<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    key: IdempotencyKey,
) -> Result<Response> {
    let reservation_id: ReservationId = parse_id(&id, "reservation_id")?;
    let idem = match claim(
        &state.store,
        "rollback",
        key,
        &reservation_id.to_string(),
        true,
        state.clock().now(),
    )
    .await?
    {
        Claim::Replay(response) => return Ok(response),
        Claim::Proceed(idem) => idem,
    };

    let outcome = state
        .ledger
        .rollback(reservation_id, ReleaseCause::Rollback)
        .await?;
    let response = TransitionResponse {
        reservation_id,
        state: outcome.as_str(),
    };
    idem.finish(&state.store, rollback_status(outcome), response)
        .await
}

/// GET /reservations/{id}: the reservation and its transition history.
pub async fn get<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Response> {
    let reservation_id: ReservationId = parse_id(&id, "reservation_id")?;
    let reservation = state
        .ledger
        .reservation(reservation_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("reservation {reservation_id}")))?;
    let history = state.ledger.history(reservation_id).await?;

    Ok(Json(ReservationView::new(reservation, history)).into_response())
}
