//! Payment service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use common::UserId;

use super::{Faults, injected_delay};
use crate::error::PeerError;

/// Result of a successful payment charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentResult {
    /// The payment ID assigned by the payment service.
    pub payment_id: String,
}

/// Payment processing peer.
///
/// Both calls carry an idempotency key; repeating a call with the same key
/// must not charge or refund twice.
#[async_trait]
pub trait PaymentService: Send + Sync {
    async fn charge(
        &self,
        user_id: UserId,
        amount_cents: i64,
        method: &str,
        idem_key: &str,
    ) -> Result<PaymentResult, PeerError>;

    async fn refund(&self, payment_id: &str, idem_key: &str) -> Result<(), PeerError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    pub user_id: UserId,
    pub amount_cents: i64,
    pub method: String,
    pub refunded: bool,
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    payments: HashMap<String, Payment>,
    by_key: HashMap<String, String>,
    next_id: u32,
    charge_calls: u32,
    charge_faults: Faults,
    refund_faults: Faults,
}

/// In-memory payment service for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentService {
    /// Creates a new in-memory payment service.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> RwLockWriteGuard<'_, InMemoryPaymentState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes the next `n` charges fail with `UNAVAILABLE`.
    pub fn fail_next_charges(&self, n: u32) {
        self.state().charge_faults.fail_next(n);
    }

    /// Declines every charge until reset.
    pub fn set_decline(&self, decline: bool) {
        self.state().charge_faults.set_reject(decline);
    }

    /// Delays every charge, to exercise step deadlines.
    pub fn set_charge_delay(&self, delay: Option<Duration>) {
        self.state().charge_faults.set_delay(delay);
    }

    /// Makes the next `n` refunds fail with `UNAVAILABLE`.
    pub fn fail_next_refunds(&self, n: u32) {
        self.state().refund_faults.fail_next(n);
    }

    /// Number of charge calls received, including failed ones.
    pub fn charge_calls(&self) -> u32 {
        self.state().charge_calls
    }

    pub fn payment(&self, payment_id: &str) -> Option<Payment> {
        self.state().payments.get(payment_id).cloned()
    }

    /// Returns the number of payments not refunded.
    pub fn active_payments(&self) -> usize {
        self.state().payments.values().filter(|p| !p.refunded).count()
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn charge(
        &self,
        user_id: UserId,
        amount_cents: i64,
        method: &str,
        idem_key: &str,
    ) -> Result<PaymentResult, PeerError> {
        let delay = self.state().charge_faults.delay();
        injected_delay(delay).await;

        let mut state = self.state();
        state.charge_calls += 1;
        state.charge_faults.check("payment")?;

        if let Some(payment_id) = state.by_key.get(idem_key) {
            return Ok(PaymentResult {
                payment_id: payment_id.clone(),
            });
        }
        if amount_cents <= 0 {
            return Err(PeerError::rejected("amount must be positive"));
        }

        state.next_id += 1;
        let payment_id = format!("PAY-{:04}", state.next_id);
        state.payments.insert(
            payment_id.clone(),
            Payment {
                user_id,
                amount_cents,
                method: method.to_string(),
                refunded: false,
            },
        );
        state
            .by_key
            .insert(idem_key.to_string(), payment_id.clone());

        Ok(PaymentResult { payment_id })
    }

    async fn refund(&self, payment_id: &str, _idem_key: &str) -> Result<(), PeerError> {
        let mut state = self.state();
        state.refund_faults.check("refund")?;
        match state.payments.get_mut(payment_id) {
            Some(payment) => {
                payment.refunded = true;
                Ok(())
            }
            None => Err(PeerError::rejected(format!(
                "unknown payment {payment_id}"
            ))),
        }
    }
}
