//! Peer service traits and in-memory implementations for checkout steps.

pub mod cart;
pub mod order;
pub mod payment;

use std::time::Duration;

pub use cart::{CartService, InMemoryCartService};
pub use order::{InMemoryOrderService, OrderResult, OrderService};
pub use payment::{InMemoryPaymentService, PaymentResult, PaymentService};

use crate::error::PeerError;

/// Failures injected into an in-memory peer.
#[derive(Debug, Clone, Default)]
pub(crate) struct Faults {
    /// Calls still to fail with `Unavailable`.
    transient: u32,
    /// Fail every call with a non-retryable rejection.
    reject: bool,
    /// Delay applied before answering.
    delay: Option<Duration>,
}

impl Faults {
    pub(crate) fn fail_next(&mut self, n: u32) {
        self.transient = n;
    }

    pub(crate) fn set_reject(&mut self, reject: bool) {
        self.reject = reject;
    }

    pub(crate) fn set_delay(&mut self, delay: Option<Duration>) {
        self.delay = delay;
    }

    pub(crate) fn delay(&self) -> Option<Duration> {
        self.delay
    }

    /// Consumes one injected failure, if any is armed.
    pub(crate) fn check(&mut self, what: &str) -> Result<(), PeerError> {
        if self.reject {
            return Err(PeerError::rejected(format!("{what} rejected")));
        }
        if self.transient > 0 {
            self.transient -= 1;
            return Err(PeerError::unavailable(format!("{what} unavailable")));
        }
        Ok(())
    }
}

/// Sleeps for the injected delay, if any.
pub(crate) async fn injected_delay(delay: Option<Duration>) {
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
}
