//! Outbox dispatch for the inventory reservation service.
//!
//! Ledger and checkout writes append outbox entries in the same transaction
//! as the state change. This crate moves them to the event bus:
//! - [`EventBus`]: publish seam, with [`InMemoryEventBus`] and [`LogEventBus`]
//! - [`OutboxDispatcher`]: leased background loop, at-least-once, per-key ordered

pub mod bus;
pub mod dispatcher;
pub mod error;

pub use bus::{EventBus, InMemoryEventBus, LogEventBus, Published};
pub use dispatcher::{DISPATCHER_LEASE, DispatchReport, DispatcherConfig, OutboxDispatcher};
pub use error::{DispatchError, PublishError, Result};
