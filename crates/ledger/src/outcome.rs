//! Requests and business outcomes of ledger operations.

use std::collections::HashSet;

use chrono::Duration;
use common::{CheckoutId, ReservationId, SkuId};
use inventory_store::{Reservation, ReservationLine, ReservationState, Topic};
use serde::{Deserialize, Serialize};

/// A request to hold stock for one checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveRequest {
    pub reservation_id: ReservationId,
    pub checkout_id: CheckoutId,
    pub lines: Vec<ReservationLine>,
    pub ttl: Duration,
}

impl ReserveRequest {
    pub fn new(
        reservation_id: ReservationId,
        checkout_id: CheckoutId,
        lines: Vec<ReservationLine>,
        ttl: Duration,
    ) -> Self {
        Self {
            reservation_id,
            checkout_id,
            lines,
            ttl,
        }
    }

    /// Checks the lines and returns them sorted by `sku_id`.
    ///
    /// Rejects empty requests, zero quantities, blank or repeated SKUs,
    /// and non-positive TTLs.
    pub fn normalized_lines(&self) -> Result<Vec<ReservationLine>, String> {
        if self.lines.is_empty() {
            return Err("reservation has no lines".to_string());
        }
        if self.ttl <= Duration::zero() {
            return Err("ttl must be positive".to_string());
        }

        let mut seen = HashSet::with_capacity(self.lines.len());
        for line in &self.lines {
            if line.sku_id.is_blank() {
                return Err("sku_id must not be blank".to_string());
            }
            if line.qty == 0 {
                return Err(format!("qty for sku {} must be positive", line.sku_id));
            }
            if !seen.insert(&line.sku_id) {
                return Err(format!("sku {} appears more than once", line.sku_id));
            }
        }

        let mut lines = self.lines.clone();
        lines.sort_by(|a, b| a.sku_id.cmp(&b.sku_id));
        Ok(lines)
    }
}

/// Result of `Reserve`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Stock is now held.
    Held(Reservation),
    /// The id was already used with the same lines; carries the reservation
    /// in its current state.
    Duplicate(Reservation),
    /// The first SKU, in lexical order, that could not cover its quantity.
    OutOfStock(SkuId),
    Invalid(String),
}

impl ReserveOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReserveOutcome::Held(_) => "HELD",
            ReserveOutcome::Duplicate(_) => "DUPLICATE",
            ReserveOutcome::OutOfStock(_) => "OUT_OF_STOCK",
            ReserveOutcome::Invalid(_) => "INVALID",
        }
    }

    /// Returns true if the reservation exists and is (or was) held.
    pub fn is_held(&self) -> bool {
        matches!(self, ReserveOutcome::Held(_) | ReserveOutcome::Duplicate(_))
    }

    pub fn reservation(&self) -> Option<&Reservation> {
        match self {
            ReserveOutcome::Held(r) | ReserveOutcome::Duplicate(r) => Some(r),
            _ => None,
        }
    }
}

/// Result of `Commit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitOutcome {
    Ok,
    NotFound,
    AlreadyCommitted,
    AlreadyReleased,
    Expired,
}

impl CommitOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitOutcome::Ok => "OK",
            CommitOutcome::NotFound => "NOT_FOUND",
            CommitOutcome::AlreadyCommitted => "ALREADY_COMMITTED",
            CommitOutcome::AlreadyReleased => "ALREADY_RELEASED",
            CommitOutcome::Expired => "EXPIRED",
        }
    }

    /// Returns true if the reservation ends up committed.
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Ok | CommitOutcome::AlreadyCommitted)
    }
}

/// Result of `Rollback`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RollbackOutcome {
    Ok,
    NotFound,
    AlreadyCommitted,
    AlreadyReleased,
}

impl RollbackOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackOutcome::Ok => "OK",
            RollbackOutcome::NotFound => "NOT_FOUND",
            RollbackOutcome::AlreadyCommitted => "ALREADY_COMMITTED",
            RollbackOutcome::AlreadyReleased => "ALREADY_RELEASED",
        }
    }

    /// Returns true if the held stock is back in `available`, by this call
    /// or an earlier one. `NotFound` counts: nothing is held.
    pub fn is_released(&self) -> bool {
        matches!(
            self,
            RollbackOutcome::Ok | RollbackOutcome::AlreadyReleased | RollbackOutcome::NotFound
        )
    }
}

/// Who is releasing a reservation. Decides the terminal state and topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseCause {
    /// Explicit rollback by the checkout coordinator or a client.
    Rollback,
    /// The expiry reaper, or a commit that found the deadline passed.
    Expiry,
}

impl ReleaseCause {
    pub(crate) fn target_state(&self) -> ReservationState {
        match self {
            ReleaseCause::Rollback => ReservationState::Released,
            ReleaseCause::Expiry => ReservationState::Expired,
        }
    }

    pub(crate) fn topic(&self) -> Topic {
        match self {
            ReleaseCause::Rollback => Topic::ReservationReleased,
            ReleaseCause::Expiry => Topic::ReservationExpired,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseCause::Rollback => "rollback",
            ReleaseCause::Expiry => "expiry",
        }
    }
}

/// Read-only snapshot of one SKU's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub sku_id: SkuId,
    pub available: i64,
    pub reserved: i64,
}
