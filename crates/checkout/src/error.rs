//! Checkout error types.

use common::{CheckoutId, ErrorKind};
use inventory_store::{CheckoutState, StoreError};
use ledger::LedgerError;
use thiserror::Error;

/// A failed call to a peer service (payment, order, cart).
///
/// The kind decides what the coordinator does next: `Unavailable` and
/// `Timeout` are retried within the step budget, anything else fails the
/// step at once.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct PeerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl PeerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A transient failure.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    /// The peer refused the request; retrying will not help.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Invalid, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<LedgerError> for PeerError {
    fn from(e: LedgerError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

/// Errors returned by the checkout coordinator.
///
/// Saga failures are not errors: a checkout that could not complete ends
/// in `FAILED` with `last_error` set.
#[derive(Debug, Error)]
pub enum CheckoutError {
    /// The user already has a checkout that has not finished.
    #[error("Checkout already in progress for this user")]
    InProgress { existing: Option<CheckoutId> },

    /// The admission token bucket is empty.
    #[error("Checkout admission limit reached")]
    Overloaded,

    #[error("Checkout not found: {0}")]
    NotFound(CheckoutId),

    /// Cancellation is only accepted in `INIT` and `STOCK_HELD`.
    #[error("Checkout {id} cannot be cancelled in state {state}")]
    NotCancellable { id: CheckoutId, state: CheckoutState },

    #[error("Invalid checkout request: {0}")]
    Invalid(String),

    /// The coordinator tried a move the state machine forbids.
    #[error("Illegal checkout transition {from} -> {to}")]
    IllegalTransition {
        from: CheckoutState,
        to: CheckoutState,
    },

    /// Fetching the cart for a checkout without a snapshot failed.
    #[error("Cart service error: {0}")]
    Cart(#[source] PeerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CheckoutError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CheckoutError::InProgress { .. } | CheckoutError::NotCancellable { .. } => {
                ErrorKind::Conflict
            }
            CheckoutError::Overloaded => ErrorKind::Unavailable,
            CheckoutError::NotFound(_) | CheckoutError::Invalid(_) => ErrorKind::Invalid,
            CheckoutError::Cart(e) => e.kind,
            CheckoutError::Store(e) => e.kind(),
            CheckoutError::Ledger(e) => e.kind(),
            CheckoutError::IllegalTransition { .. } | CheckoutError::Serialization(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Stable code surfaced to clients. Same as the kind's code except for
    /// the cases that have their own.
    pub fn code(&self) -> &'static str {
        match self {
            CheckoutError::InProgress { .. } => "CHECKOUT_IN_PROGRESS",
            CheckoutError::NotFound(_) => "NOT_FOUND",
            CheckoutError::NotCancellable { .. } => "NOT_CANCELLABLE",
            other => other.kind().code(),
        }
    }
}

/// Convenience type alias for checkout results.
pub type Result<T> = std::result::Result<T, CheckoutError>;
