//! Ledger error types.

use common::{ErrorKind, SkuId};
use inventory_store::StoreError;
use thiserror::Error;

/// Errors that can occur during ledger operations.
///
/// Business outcomes such as `OUT_OF_STOCK` are not errors; see
/// [`ReserveOutcome`](crate::ReserveOutcome) and friends.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// An error occurred in the store.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A request was malformed.
    #[error("Invalid request: {0}")]
    Invalid(String),

    /// A batch kept losing optimistic-concurrency races.
    #[error("Gave up after {attempts} conflicting attempts")]
    Contention { attempts: u32 },

    /// A held reservation references a SKU with no stock row.
    #[error("Stock row missing for held sku {0}")]
    MissingStock(SkuId),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::Store(e) => e.kind(),
            LedgerError::Invalid(_) => ErrorKind::Invalid,
            LedgerError::Contention { .. } => ErrorKind::Unavailable,
            LedgerError::MissingStock(_) => ErrorKind::Internal,
        }
    }
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
