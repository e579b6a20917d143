//! Reservations and their audit history.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{CheckoutId, ReservationId, SkuId};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a reservation.
///
/// ```text
/// HELD ──┬──► COMMITTED
///        ├──► RELEASED
///        └──► EXPIRED
/// ```
///
/// Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationState {
    Held,
    Committed,
    Released,
    Expired,
}

impl ReservationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationState::Held)
    }

    /// Returns true if `self → next` is a legal transition.
    pub fn can_transition_to(&self, next: ReservationState) -> bool {
        matches!(self, ReservationState::Held) && next.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Held => "HELD",
            ReservationState::Committed => "COMMITTED",
            ReservationState::Released => "RELEASED",
            ReservationState::Expired => "EXPIRED",
        }
    }
}

impl std::fmt::Display for ReservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HELD" => Ok(ReservationState::Held),
            "COMMITTED" => Ok(ReservationState::Committed),
            "RELEASED" => Ok(ReservationState::Released),
            "EXPIRED" => Ok(ReservationState::Expired),
            other => Err(format!("unknown reservation state {other:?}")),
        }
    }
}

/// One SKU and quantity held by a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReservationLine {
    pub sku_id: SkuId,
    pub qty: u32,
}

impl ReservationLine {
    pub fn new(sku_id: impl Into<SkuId>, qty: u32) -> Self {
        Self {
            sku_id: sku_id.into(),
            qty,
        }
    }
}

/// A time-bounded hold of stock for one checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: ReservationId,
    pub checkout_id: CheckoutId,
    /// Lines sorted by `sku_id`; SKUs are distinct.
    pub lines: Vec<ReservationLine>,
    pub state: ReservationState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub terminal_at: Option<DateTime<Utc>>,
}

impl Reservation {
    /// Returns true if the hold is still live but its deadline has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == ReservationState::Held && self.expires_at <= now
    }

    /// Returns true if `lines` describe the same hold, regardless of order.
    pub fn has_lines(&self, lines: &[ReservationLine]) -> bool {
        let mut sorted = lines.to_vec();
        sorted.sort_by(|a, b| a.sku_id.cmp(&b.sku_id));
        self.lines == sorted
    }
}

/// Audit record of one terminal transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub reservation_id: ReservationId,
    pub from_state: ReservationState,
    pub to_state: ReservationState,
    /// Who drove the transition (`commit`, `rollback`, `expiry`).
    pub cause: String,
    pub at: DateTime<Utc>,
}
