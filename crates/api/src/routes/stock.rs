//! Stock endpoints: query and inbound receipts.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use common::SkuId;
use inventory_store::Store;
use ledger::StockLevel;
use serde::Deserialize;

use super::idempotency::{Claim, IdempotencyKey, claim};
use crate::AppState;
use crate::error::{ApiError, Result};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReceiptBody {
    pub qty: u32,
}

fn sku(raw: String) -> Result<SkuId> {
    let sku = SkuId::new(raw);
    if sku.is_blank() {
        return Err(ApiError::BadRequest("sku_id must not be blank".to_string()));
    }
    Ok(sku)
}

/// GET /stock/{sku}: available and reserved counters. Unknown SKUs read
/// as zero.
pub async fn query<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(raw): Path<String>,
) -> Result<Json<StockLevel>> {
    let level = state.ledger.query(&sku(raw)?).await?;
    Ok(Json(level))
}

/// POST /stock/{sku}/receipts: add received units to `available`.
#[tracing::instrument(skip(state, key, body), fields(key = %key.0))]
pub async fn receive<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(raw): Path<String>,
    key: IdempotencyKey,
    body: std::result::Result<Json<ReceiptBody>, JsonRejection>,
) -> Result<Response> {
    let sku_id = sku(raw)?;
    let Json(body) = body?;
    if body.qty == 0 {
        return Err(ApiError::BadRequest("qty must be positive".to_string()));
    }

    let idem = match claim(
        &state.store,
        "receive",
        key,
        sku_id.as_str(),
        true,
        state.clock().now(),
    )
    .await?
    {
        Claim::Replay(response) => return Ok(response),
        Claim::Proceed(idem) => idem,
    };

    let level = state.ledger.receive_stock(&sku_id, body.qty).await?;
    idem.finish(&state.store, StatusCode::OK, level).await
}
