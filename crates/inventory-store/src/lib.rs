//! Persistence for the inventory reservation service.
//!
//! One table per entity: stock rows, reservations, reservation history,
//! checkouts, and the outbox, plus leases and idempotency keys. Two
//! implementations share the same traits: [`InMemoryStore`] for tests and
//! single-node use, and [`PostgresStore`] backed by sqlx.

pub mod checkout;
pub mod error;
pub mod idempotency;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod reservation;
pub mod stock;
pub mod store;
pub mod version;

pub use checkout::{CartLine, CartSnapshot, CheckoutRecord, CheckoutState};
pub use error::{Result, StoreError};
pub use idempotency::{IdempotencyRecord, StoredResponse};
pub use memory::InMemoryStore;
pub use outbox::{EventPayload, NewOutboxEntry, OutboxEntry, Topic};
pub use postgres::PostgresStore;
pub use reservation::{HistoryEntry, Reservation, ReservationLine, ReservationState};
pub use stock::{LedgerBatch, ReservationWrite, StockChange, StockRow};
pub use store::{CheckoutStore, IdempotencyStore, LeaseStore, OutboxStore, StockStore, Store};
pub use version::Version;
