//! Stock ledger for the inventory reservation service.
//!
//! This crate owns the per-SKU stock counters:
//! - [`StockLedger`]: Reserve / Commit / Rollback / Query / ReceiveStock
//! - [`SkuGuards`]: per-SKU serialization points, locked in lexical order
//! - [`ExpiryReaper`]: background release of reservations past their TTL

pub mod error;
pub mod guard;
pub mod ledger;
pub mod outcome;
pub mod reaper;

pub use error::{LedgerError, Result};
pub use guard::{HeldGuards, SkuGuards};
pub use ledger::{DEFAULT_MAX_ATTEMPTS, StockLedger};
pub use outcome::{
    CommitOutcome, ReleaseCause, ReserveOutcome, ReserveRequest, RollbackOutcome, StockLevel,
};
pub use reaper::{ExpiryReaper, REAPER_LEASE, ReapReport, ReaperConfig};
