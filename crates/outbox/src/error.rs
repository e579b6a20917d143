//! Dispatcher error types.

use common::ErrorKind;
use inventory_store::StoreError;
use thiserror::Error;

/// A bus refused or failed to take a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Publish failed: {0}")]
pub struct PublishError(pub String);

/// Errors that can occur while dispatching the outbox.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// An error occurred in the store.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Publishing an entry failed.
    #[error("Failed to publish seq {seq}: {source}")]
    Publish {
        seq: i64,
        #[source]
        source: PublishError,
    },
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Store(e) => e.kind(),
            DispatchError::Publish { .. } => ErrorKind::Unavailable,
        }
    }
}

/// Result type for dispatcher operations.
pub type Result<T> = std::result::Result<T, DispatchError>;
