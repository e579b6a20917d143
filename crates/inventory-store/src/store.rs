use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{CheckoutId, ReservationId, SkuId, UserId};

use crate::{
    CheckoutRecord, HistoryEntry, IdempotencyRecord, LedgerBatch, NewOutboxEntry, OutboxEntry,
    Reservation, Result, StockRow, StoredResponse, Version,
};

/// Stock counters and reservations, owned by the stock ledger.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait StockStore: Send + Sync {
    /// Reads one stock row.
    async fn get_stock(&self, sku: &SkuId) -> Result<Option<StockRow>>;

    /// Reads several stock rows; missing SKUs are simply absent.
    async fn get_stocks(&self, skus: &[SkuId]) -> Result<Vec<StockRow>>;

    /// Reads one reservation, in any state.
    async fn get_reservation(&self, id: ReservationId) -> Result<Option<Reservation>>;

    /// Returns the audit trail of a reservation, oldest first.
    async fn reservation_history(&self, id: ReservationId) -> Result<Vec<HistoryEntry>>;

    /// Returns up to `limit` reservations still `HELD` whose `expires_at`
    /// is at or before `now`, in ascending `expires_at` order.
    async fn due_reservations(&self, now: DateTime<Utc>, limit: usize)
    -> Result<Vec<Reservation>>;

    /// Applies a batch atomically.
    ///
    /// Every stock change is checked against its expected version and the
    /// reservation write against the stored state; any mismatch fails the
    /// whole batch with `Conflict` and nothing is written. Returns the
    /// outbox sequence numbers assigned to the batch's entries.
    async fn apply_batch(&self, batch: LedgerBatch) -> Result<Vec<i64>>;
}

/// Durable checkout records, owned by the checkout coordinator.
#[async_trait]
pub trait CheckoutStore: Send + Sync {
    /// Persists a new record at [`Version::first`]; fails with `Conflict`
    /// if the id already exists.
    async fn insert_checkout(&self, record: &CheckoutRecord) -> Result<Version>;

    async fn get_checkout(&self, id: CheckoutId) -> Result<Option<CheckoutRecord>>;

    /// Overwrites a record whose stored version equals `record.version`
    /// and appends `events` to the outbox in the same transaction.
    /// Returns the new version.
    async fn save_checkout(
        &self,
        record: &CheckoutRecord,
        events: Vec<NewOutboxEntry>,
    ) -> Result<Version>;

    /// Returns the user's non-terminal checkout, if any.
    async fn active_checkout_for_user(&self, user_id: UserId) -> Result<Option<CheckoutId>>;

    /// Returns every non-terminal checkout, oldest first.
    async fn incomplete_checkouts(&self) -> Result<Vec<CheckoutRecord>>;

    /// Deletes terminal checkouts last updated before `cutoff`.
    async fn purge_checkouts(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Read side of the outbox, used by the dispatcher.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Returns up to `limit` undispatched entries in `seq` order.
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>>;

    /// Marks entries dispatched. Already-dispatched entries are untouched.
    async fn mark_dispatched(&self, seqs: &[i64], at: DateTime<Utc>) -> Result<()>;

    /// Returns entries with `seq > after`, dispatched or not, in `seq` order.
    async fn outbox_since(&self, after: i64, limit: usize) -> Result<Vec<OutboxEntry>>;
}

/// Named leases that keep background loops single-instance.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Takes or renews the lease. Succeeds if the lease is free, expired,
    /// or already held by `holder`.
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Gives the lease up if `holder` owns it.
    async fn release_lease(&self, name: &str, holder: &str) -> Result<()>;
}

/// Idempotency-Key bookkeeping for the request façade.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Binds `key` to `candidate` unless it is already bound, and returns
    /// the binding in force.
    async fn claim_key(
        &self,
        scope: &str,
        key: &str,
        candidate: &str,
        now: DateTime<Utc>,
    ) -> Result<IdempotencyRecord>;

    /// Records the first response for `key`. Later calls are ignored.
    async fn complete_key(&self, scope: &str, key: &str, response: StoredResponse) -> Result<()>;

    /// Deletes keys claimed before `cutoff`. Returns how many were removed.
    async fn purge_keys(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Everything the service needs from one backing store.
pub trait Store:
    StockStore + CheckoutStore + OutboxStore + LeaseStore + IdempotencyStore + Clone + 'static
{
}

impl<T> Store for T where
    T: StockStore + CheckoutStore + OutboxStore + LeaseStore + IdempotencyStore + Clone + 'static
{
}
