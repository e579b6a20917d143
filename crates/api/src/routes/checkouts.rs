//! Checkout endpoints: start, status, cancel.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use checkout::StartCheckout;
use common::{CheckoutId, ReservationId, UserId, to_millis};
use inventory_store::{CartLine, CartSnapshot, CheckoutRecord, CheckoutState, Store};
use serde::{Deserialize, Serialize};

use super::idempotency::{Claim, IdempotencyKey, claim};
use super::parse_id;
use crate::AppState;
use crate::error::Result;

// -- Request types --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartBody {
    pub checkout_id: Option<CheckoutId>,
    pub user_id: UserId,
    /// Cart snapshot; fetched from the cart service when absent.
    pub lines: Option<Vec<CartLine>>,
    pub payment_method: String,
    pub shipping_address: Option<String>,
    pub ttl_secs: Option<u64>,
}

// -- Response types --

#[derive(Debug, Serialize)]
pub struct StartedResponse {
    pub checkout_id: CheckoutId,
    pub state: CheckoutState,
}

#[derive(Debug, Serialize)]
pub struct CheckoutView {
    pub checkout_id: CheckoutId,
    pub user_id: UserId,
    pub state: CheckoutState,
    pub reservation_id: ReservationId,
    pub lines: Vec<CartLine>,
    /// `null` when the cart total does not fit in 64 bits.
    pub total_cents: Option<i64>,
    pub payment_id: Option<String>,
    pub order_id: Option<String>,
    pub last_error: Option<String>,
    pub cancel_requested: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<CheckoutRecord> for CheckoutView {
    fn from(record: CheckoutRecord) -> Self {
        Self {
            checkout_id: record.checkout_id,
            user_id: record.user_id,
            state: record.state,
            reservation_id: record.reservation_id,
            total_cents: record.cart.total_cents(),
            lines: record.cart.lines,
            payment_id: record.payment_id,
            order_id: record.order_id,
            last_error: record.last_error,
            cancel_requested: record.cancel_requested,
            created_at: to_millis(record.created_at),
            updated_at: to_millis(record.updated_at),
        }
    }
}

// -- Handlers --

/// POST /checkouts: admit a checkout and drive it in the background.
///
/// Answers 202 as soon as the checkout is persisted in `INIT`; poll
/// `GET /checkouts/{id}` for the outcome.
#[tracing::instrument(skip(state, key, body), fields(key = %key.0))]
pub async fn start<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    key: IdempotencyKey,
    body: std::result::Result<Json<StartBody>, JsonRejection>,
) -> Result<Response> {
    let Json(body) = body?;
    let candidate = body.checkout_id.unwrap_or_default();
    let idem = match claim(
        &state.store,
        "checkout",
        key,
        &candidate.to_string(),
        body.checkout_id.is_some(),
        state.clock().now(),
    )
    .await?
    {
        Claim::Replay(response) => return Ok(response),
        Claim::Proceed(idem) => idem,
    };
    let checkout_id: CheckoutId = parse_id(idem.resource_id(), "checkout_id")?;

    let mut request = StartCheckout::new(body.user_id, body.payment_method).with_id(checkout_id);
    if let Some(lines) = body.lines {
        request = request.with_cart(CartSnapshot::new(lines));
    }
    if let Some(address) = body.shipping_address {
        request = request.with_address(address);
    }
    if let Some(ttl_secs) = body.ttl_secs {
        request = request.with_ttl_secs(ttl_secs);
    }

    let record = state.checkout.start_checkout(request).await?;
    let response = StartedResponse {
        checkout_id: record.checkout_id,
        state: record.state,
    };
    idem.finish(&state.store, StatusCode::ACCEPTED, response)
        .await
}

/// GET /checkouts/{id}: current state of a checkout.
pub async fn get<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<CheckoutView>> {
    let checkout_id: CheckoutId = parse_id(&id, "checkout_id")?;
    let record = state.checkout.get_checkout(checkout_id).await?;
    Ok(Json(record.into()))
}

/// POST /checkouts/{id}/cancel: request cancellation. Only `INIT` and
/// `STOCK_HELD` checkouts accept it; compensation runs in the background.
#[tracing::instrument(skip(state, key), fields(key = %key.0))]
pub async fn cancel<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    key: IdempotencyKey,
) -> Result<Response> {
    let checkout_id: CheckoutId = parse_id(&id, "checkout_id")?;
    let idem = match claim(
        &state.store,
        "cancel",
        key,
        &checkout_id.to_string(),
        true,
        state.clock().now(),
    )
    .await?
    {
        Claim::Replay(response) => return Ok(response),
        Claim::Proceed(idem) => idem,
    };

    let record = state.checkout.cancel_checkout(checkout_id).await?;
    idem.finish(&state.store, StatusCode::ACCEPTED, CheckoutView::from(record))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::SkuId;

    #[test]
    fn view_reports_cart_total() {
        let cart = CartSnapshot::new(vec![CartLine {
            sku_id: SkuId::new("A"),
            qty: 3,
            unit_price_cents: 250,
        }]);
        let record = CheckoutRecord::new(UserId::new(), cart, "card".to_string(), None, 34, Utc::now());
        let view = CheckoutView::from(record);
        assert_eq!(view.total_cents, Some(750));
        assert_eq!(view.state, CheckoutState::Init);
        assert!(!view.cancel_requested);
    }
}
