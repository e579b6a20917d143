//! Names of the checkout saga's forward and compensating steps.

use common::CheckoutId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    FetchCart,
    Reserve,
    Charge,
    CreateOrder,
    Commit,
    ClearCart,
    Refund,
    CancelOrder,
    Rollback,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::FetchCart => "fetch_cart",
            Step::Reserve => "reserve",
            Step::Charge => "charge",
            Step::CreateOrder => "create_order",
            Step::Commit => "commit",
            Step::ClearCart => "clear_cart",
            Step::Refund => "refund",
            Step::CancelOrder => "cancel_order",
            Step::Rollback => "rollback",
        }
    }

    /// Idempotency key sent to the peer for this step of this checkout.
    /// Replaying a step after a crash sends the same key.
    pub fn idem_key(&self, checkout_id: CheckoutId) -> String {
        format!("{checkout_id}:{}", self.as_str())
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idem_key_is_stable_per_checkout_and_step() {
        let id = CheckoutId::new();
        assert_eq!(Step::Charge.idem_key(id), Step::Charge.idem_key(id));
        assert_ne!(Step::Charge.idem_key(id), Step::Refund.idem_key(id));
        assert!(Step::Charge.idem_key(id).ends_with(":charge"));
    }
}
