//! Checkout saga coordination.
//!
//! A checkout moves through these steps:
//! 1. Reserve stock in the ledger
//! 2. Charge payment
//! 3. Create the order
//! 4. Commit the reservation and clear the cart
//!
//! If a step fails after stock is held, the completed steps are
//! compensated (refund, cancel order, roll the reservation back) and the
//! checkout ends in `FAILED`.

pub mod admission;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gc;
pub mod retry;
pub mod services;
pub mod step;

pub use admission::{Admission, AdmissionConfig};
pub use config::{CoordinatorConfig, StepTimeouts, reservation_ttl_secs};
pub use coordinator::{CheckoutCoordinator, MAX_TTL_SECS, REPAIR_REASON, StartCheckout};
pub use error::{CheckoutError, PeerError, Result};
pub use gc::{CheckoutGc, GcConfig};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use services::{
    CartService, InMemoryCartService, InMemoryOrderService, InMemoryPaymentService, OrderResult,
    OrderService, PaymentResult, PaymentService,
};
pub use step::Step;
