//! Durable checkout saga records.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{CheckoutId, ReservationId, SkuId, UserId};
use serde::{Deserialize, Serialize};

use crate::Version;
use crate::reservation::ReservationLine;

/// The state of a checkout saga.
///
/// State transitions:
/// ```text
/// INIT ──► STOCK_HELD ──► PAID ──► ORDERED ──► DONE
///   │          │            │         │
///   ▼          └────────────┴─────────┴──► COMPENSATING ──► FAILED
/// FAILED
/// ```
///
/// Forward moves go one step at a time. Any non-terminal state may jump to
/// `COMPENSATING`, which may only move to `FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckoutState {
    #[default]
    Init,
    StockHeld,
    Paid,
    Ordered,
    Done,
    Compensating,
    Failed,
}

impl CheckoutState {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CheckoutState::Done | CheckoutState::Failed)
    }

    /// Returns true if a client may still cancel the checkout.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, CheckoutState::Init | CheckoutState::StockHeld)
    }

    /// Returns true if `self → next` is a legal transition.
    pub fn can_transition_to(&self, next: CheckoutState) -> bool {
        use CheckoutState::*;
        match (self, next) {
            (Init, StockHeld) | (StockHeld, Paid) | (Paid, Ordered) | (Ordered, Done) => true,
            (Init, Failed) | (Compensating, Failed) => true,
            (from, Compensating) => !from.is_terminal() && *from != Compensating,
            _ => false,
        }
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckoutState::Init => "INIT",
            CheckoutState::StockHeld => "STOCK_HELD",
            CheckoutState::Paid => "PAID",
            CheckoutState::Ordered => "ORDERED",
            CheckoutState::Done => "DONE",
            CheckoutState::Compensating => "COMPENSATING",
            CheckoutState::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for CheckoutState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckoutState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INIT" => Ok(CheckoutState::Init),
            "STOCK_HELD" => Ok(CheckoutState::StockHeld),
            "PAID" => Ok(CheckoutState::Paid),
            "ORDERED" => Ok(CheckoutState::Ordered),
            "DONE" => Ok(CheckoutState::Done),
            "COMPENSATING" => Ok(CheckoutState::Compensating),
            "FAILED" => Ok(CheckoutState::Failed),
            other => Err(format!("unknown checkout state {other:?}")),
        }
    }
}

/// One line of the cart as priced at checkout time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CartLine {
    pub sku_id: SkuId,
    pub qty: u32,
    pub unit_price_cents: i64,
}

/// The cart contents frozen when the checkout started.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CartSnapshot {
    pub lines: Vec<CartLine>,
}

impl CartSnapshot {
    pub fn new(lines: Vec<CartLine>) -> Self {
        Self { lines }
    }

    /// Total charge in cents, or `None` if it does not fit in an `i64`.
    pub fn total_cents(&self) -> Option<i64> {
        self.lines.iter().try_fold(0i64, |total, l| {
            l.unit_price_cents
                .checked_mul(i64::from(l.qty))
                .and_then(|line| total.checked_add(line))
        })
    }

    /// The stock to hold for this cart.
    pub fn reservation_lines(&self) -> Vec<ReservationLine> {
        self.lines
            .iter()
            .map(|l| ReservationLine::new(l.sku_id.clone(), l.qty))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Durable record of one checkout saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutRecord {
    pub checkout_id: CheckoutId,
    pub user_id: UserId,
    pub cart: CartSnapshot,
    pub payment_method: String,
    pub shipping_address: Option<String>,
    pub ttl_secs: u64,
    pub state: CheckoutState,
    /// Chosen when the checkout is created so a replayed reserve step is idempotent.
    pub reservation_id: ReservationId,
    pub payment_id: Option<String>,
    pub order_id: Option<String>,
    pub last_error: Option<String>,
    /// Step whose peer call is in flight (written before the call).
    pub pending_step: Option<String>,
    pub cancel_requested: bool,
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CheckoutRecord {
    /// Creates a record in `INIT`, not yet persisted.
    pub fn new(
        user_id: UserId,
        cart: CartSnapshot,
        payment_method: impl Into<String>,
        shipping_address: Option<String>,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            checkout_id: CheckoutId::new(),
            user_id,
            cart,
            payment_method: payment_method.into(),
            shipping_address,
            ttl_secs,
            state: CheckoutState::Init,
            reservation_id: ReservationId::new(),
            payment_id: None,
            order_id: None,
            last_error: None,
            pending_step: None,
            cancel_requested: false,
            version: Version::initial(),
            created_at: now,
            updated_at: now,
        }
    }
}
