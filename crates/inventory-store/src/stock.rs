//! Stock rows and the atomic batch that mutates them.

use chrono::{DateTime, Utc};
use common::{ReservationId, SkuId};
use serde::{Deserialize, Serialize};

use crate::Version;
use crate::outbox::NewOutboxEntry;
use crate::reservation::{Reservation, ReservationState};

/// Authoritative counters for one SKU.
///
/// `available + reserved` is the physical quantity on hand. Both counters
/// are non-negative at every stable point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRow {
    pub sku_id: SkuId,
    pub available: i64,
    pub reserved: i64,
    pub version: Version,
    pub updated_at: DateTime<Utc>,
}

impl StockRow {
    /// Physical units on hand: free plus held.
    pub fn on_hand(&self) -> i64 {
        self.available + self.reserved
    }
}

/// New counter values for one SKU, guarded by the version they were read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockChange {
    pub sku_id: SkuId,
    /// Version observed before the change. `None` means the row must not
    /// exist yet and is created at [`Version::first`].
    pub expected_version: Option<Version>,
    pub available: i64,
    pub reserved: i64,
}

/// Reservation write carried by a [`LedgerBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationWrite {
    /// Creates a new reservation; fails with a conflict if the id exists.
    Insert(Reservation),
    /// Moves a reservation between states; fails with a conflict if the
    /// stored state is not `from`. Appends one history row.
    Transition {
        reservation_id: ReservationId,
        from: ReservationState,
        to: ReservationState,
        cause: String,
    },
}

/// All writes of one ledger operation, applied atomically.
///
/// Counter updates, the reservation write, and the outbox entries either
/// all land or none do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerBatch {
    pub stock: Vec<StockChange>,
    pub reservation: Option<ReservationWrite>,
    pub outbox: Vec<NewOutboxEntry>,
    pub at: DateTime<Utc>,
}

impl LedgerBatch {
    /// Creates an empty batch stamped with `at`.
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            stock: Vec::new(),
            reservation: None,
            outbox: Vec::new(),
            at,
        }
    }

    pub fn with_stock(mut self, change: StockChange) -> Self {
        self.stock.push(change);
        self
    }

    pub fn with_reservation(mut self, write: ReservationWrite) -> Self {
        self.reservation = Some(write);
        self
    }

    pub fn with_outbox(mut self, entry: NewOutboxEntry) -> Self {
        self.outbox.push(entry);
        self
    }

    /// Rejects changes that would drive a counter negative.
    pub fn validate(&self) -> Result<(), String> {
        for change in &self.stock {
            if change.available < 0 || change.reserved < 0 {
                return Err(format!(
                    "negative counters for sku {}: available {}, reserved {}",
                    change.sku_id, change.available, change.reserved
                ));
            }
        }
        Ok(())
    }
}
