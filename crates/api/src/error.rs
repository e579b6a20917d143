//! API error types with HTTP response mapping.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use checkout::CheckoutError;
use common::ErrorKind;
use inventory_store::StoreError;
use ledger::LedgerError;
use serde::Serialize;
use thiserror::Error;

/// API-level error type that maps to HTTP responses.
///
/// Clients see a stable `code` and a message; store and internal error
/// text stays in the logs.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    /// The `Idempotency-Key` is already bound to another resource.
    #[error("Idempotency-Key already used for {bound_to}")]
    IdempotencyMismatch { bound_to: String },

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Checkout(#[from] CheckoutError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::BadRequest(_) | ApiError::NotFound(_) => ErrorKind::Invalid,
            ApiError::IdempotencyMismatch { .. } => ErrorKind::Conflict,
            ApiError::Internal(_) => ErrorKind::Internal,
            ApiError::Ledger(e) => e.kind(),
            ApiError::Checkout(e) => e.kind(),
            ApiError::Store(e) => e.kind(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) | ApiError::Checkout(CheckoutError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Checkout(CheckoutError::Overloaded) => StatusCode::TOO_MANY_REQUESTS,
            other => status_for(other.kind()),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::IdempotencyMismatch { .. } => "IDEMPOTENCY_KEY_REUSED",
            ApiError::Checkout(e) => e.code(),
            other => other.kind().code(),
        }
    }

    /// Message safe to show a client.
    fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::Internal => "internal error".to_string(),
            ErrorKind::Unavailable
                if !matches!(self, ApiError::Checkout(CheckoutError::Overloaded)) =>
            {
                "service temporarily unavailable".to_string()
            }
            ErrorKind::Timeout => "request timed out".to_string(),
            _ if matches!(self, ApiError::Store(_)) => "storage error".to_string(),
            _ => self.to_string(),
        }
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Invalid => StatusCode::BAD_REQUEST,
        ErrorKind::OutOfStock | ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "request failed");
        } else {
            tracing::debug!(error = %self, code = self.code(), "request rejected");
        }

        let body = ErrorBody {
            code: self.code(),
            message: self.public_message(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
