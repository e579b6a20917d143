//! Shared types for the inventory reservation service.
//!
//! Identifiers are 128-bit values rendered in their canonical string form;
//! SKUs are opaque strings. The [`Clock`] trait lets every time-dependent
//! component run against a controllable clock in tests.

pub mod clock;
pub mod kind;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock, from_millis, to_millis};
pub use kind::ErrorKind;
pub use types::{CheckoutId, EventId, IdParseError, ReservationId, SkuId, UserId};
