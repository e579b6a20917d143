//! Coordinator settings.

use std::time::Duration;

use crate::admission::AdmissionConfig;
use crate::retry::RetryPolicy;

/// Deadline applied to each attempt of a step, plus the budget for the
/// step as a whole.
#[derive(Debug, Clone)]
pub struct StepTimeouts {
    pub reserve: Duration,
    pub payment: Duration,
    pub order: Duration,
    pub cart: Duration,
    /// Wall time one step may spend across all its attempts and backoff.
    pub step_budget: Duration,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            reserve: Duration::from_secs(5),
            payment: Duration::from_secs(10),
            order: Duration::from_secs(5),
            cart: Duration::from_secs(3),
            step_budget: Duration::from_secs(20),
        }
    }
}

impl StepTimeouts {
    /// Budget for the charge step of a checkout holding stock for
    /// `ttl_secs`.
    ///
    /// Capped at half the TTL so the remaining steps can commit the
    /// reservation before it lapses.
    pub fn charge_budget(&self, ttl_secs: u64) -> Duration {
        self.step_budget.min(Duration::from_secs(ttl_secs) / 2)
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub timeouts: StepTimeouts,
    /// Retry policy for forward steps and compensations alike.
    pub retry: RetryPolicy,
    /// Reservation TTL used when a request does not name one.
    pub default_ttl_secs: u64,
    pub admission: AdmissionConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            timeouts: StepTimeouts::default(),
            retry: RetryPolicy::default(),
            default_ttl_secs: reservation_ttl_secs(
                Duration::from_secs(2),
                Duration::from_secs(30),
            ),
            admission: AdmissionConfig::default(),
        }
    }
}

/// Reservation TTL long enough that a hold cannot lapse while payment is
/// in flight: `2 × payment p99 + margin`, rounded up to whole seconds.
pub fn reservation_ttl_secs(payment_p99: Duration, safety_margin: Duration) -> u64 {
    let total = payment_p99 * 2 + safety_margin;
    total.as_secs() + u64::from(total.subsec_nanos() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_rounds_up() {
        assert_eq!(
            reservation_ttl_secs(Duration::from_secs(2), Duration::from_secs(30)),
            34
        );
        assert_eq!(
            reservation_ttl_secs(Duration::from_millis(1250), Duration::ZERO),
            3
        );
    }
}
