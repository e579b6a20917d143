//! The stock ledger: authoritative per-SKU counters and reservations.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{Clock, ReservationId, SkuId, SystemClock};
use inventory_store::{
    EventPayload, HistoryEntry, LedgerBatch, Reservation, ReservationLine, ReservationState,
    ReservationWrite, StockChange, StockRow, StockStore, StoreError, Topic,
};

use crate::error::{LedgerError, Result};
use crate::guard::SkuGuards;
use crate::outcome::{
    CommitOutcome, ReleaseCause, ReserveOutcome, ReserveRequest, RollbackOutcome, StockLevel,
};

/// How many times a batch that lost an optimistic-concurrency race is
/// rebuilt from fresh reads before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Owner of all stock counters.
///
/// Every mutation holds the per-SKU guards of the SKUs it touches, reads
/// the rows, and writes one [`LedgerBatch`] carrying the counter updates,
/// the reservation write, and the outbox entry. The guards serialize
/// writers inside this process; the expected versions in the batch catch
/// writers in other processes, and a conflicting batch is rebuilt.
#[derive(Clone)]
pub struct StockLedger<S> {
    store: S,
    guards: Arc<SkuGuards>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl<S: StockStore> StockLedger<S> {
    /// Creates a ledger over `store` using wall-clock time.
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            guards: Arc::new(SkuGuards::new()),
            clock,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Holds stock for every line, or for none.
    ///
    /// Idempotent on `reservation_id`: a repeat with the same lines returns
    /// `Duplicate` with the reservation's current state; a repeat with
    /// different lines is `Invalid`. A SKU the ledger has never seen is
    /// reported as `OutOfStock`.
    #[tracing::instrument(
        skip(self, request),
        fields(reservation_id = %request.reservation_id, checkout_id = %request.checkout_id)
    )]
    pub async fn reserve(&self, request: ReserveRequest) -> Result<ReserveOutcome> {
        let lines = match request.normalized_lines() {
            Ok(lines) => lines,
            Err(reason) => {
                tracing::debug!(%reason, "Rejected reserve request");
                let outcome = ReserveOutcome::Invalid(reason);
                metrics::counter!("ledger_reserve_total", "outcome" => outcome.as_str())
                    .increment(1);
                return Ok(outcome);
            }
        };

        let _held = self
            .guards
            .lock_all(lines.iter().map(|line| &line.sku_id))
            .await;
        let outcome = self
            .retry_conflicts(|| self.try_reserve(&request, &lines))
            .await?;

        metrics::counter!("ledger_reserve_total", "outcome" => outcome.as_str()).increment(1);
        match &outcome {
            ReserveOutcome::Held(r) => {
                tracing::info!(lines = r.lines.len(), expires_at = %r.expires_at, "Reservation held");
            }
            ReserveOutcome::OutOfStock(sku) => {
                tracing::info!(%sku, "Reservation refused: out of stock");
            }
            other => tracing::debug!(outcome = other.as_str(), "Reserve finished"),
        }
        Ok(outcome)
    }

    async fn try_reserve(
        &self,
        request: &ReserveRequest,
        lines: &[ReservationLine],
    ) -> Result<ReserveOutcome> {
        if let Some(existing) = self.store.get_reservation(request.reservation_id).await? {
            if existing.has_lines(lines) {
                return Ok(ReserveOutcome::Duplicate(existing));
            }
            return Ok(ReserveOutcome::Invalid(format!(
                "reservation {} already exists with different lines",
                request.reservation_id
            )));
        }

        let rows = self.load_rows(lines).await?;
        let now = self.clock.now();
        let mut batch = LedgerBatch::new(now);

        for line in lines {
            let qty = i64::from(line.qty);
            let Some(row) = rows
                .get(&line.sku_id)
                .filter(|row| row.available >= qty)
            else {
                return Ok(ReserveOutcome::OutOfStock(line.sku_id.clone()));
            };
            batch = batch.with_stock(StockChange {
                sku_id: line.sku_id.clone(),
                expected_version: Some(row.version),
                available: row.available - qty,
                reserved: row.reserved + qty,
            });
        }

        let reservation = Reservation {
            reservation_id: request.reservation_id,
            checkout_id: request.checkout_id,
            lines: lines.to_vec(),
            state: ReservationState::Held,
            created_at: now,
            expires_at: now + request.ttl,
            terminal_at: None,
        };
        let event = EventPayload::new(now)
            .reservation(reservation.reservation_id)
            .checkout(reservation.checkout_id)
            .lines(reservation.lines.clone())
            .into_entry(Topic::ReservationHeld, reservation.reservation_id.to_string())
            .map_err(StoreError::from)?;

        self.store
            .apply_batch(
                batch
                    .with_reservation(ReservationWrite::Insert(reservation.clone()))
                    .with_outbox(event),
            )
            .await?;

        Ok(ReserveOutcome::Held(reservation))
    }

    /// Turns a hold into a sale: `reserved` drops by each line's quantity
    /// and `available` is untouched.
    ///
    /// A held reservation whose deadline has passed is expired on the spot
    /// and reported as `Expired`.
    #[tracing::instrument(skip(self))]
    pub async fn commit(&self, reservation_id: ReservationId) -> Result<CommitOutcome> {
        let outcome = match self.store.get_reservation(reservation_id).await? {
            None => CommitOutcome::NotFound,
            Some(found) => {
                let _held = self
                    .guards
                    .lock_all(found.lines.iter().map(|line| &line.sku_id))
                    .await;
                self.retry_conflicts(|| self.try_commit(reservation_id))
                    .await?
            }
        };

        metrics::counter!("ledger_commit_total", "outcome" => outcome.as_str()).increment(1);
        tracing::info!(outcome = outcome.as_str(), "Commit finished");
        Ok(outcome)
    }

    async fn try_commit(&self, reservation_id: ReservationId) -> Result<CommitOutcome> {
        let Some(reservation) = self.store.get_reservation(reservation_id).await? else {
            return Ok(CommitOutcome::NotFound);
        };

        match reservation.state {
            ReservationState::Held => {}
            ReservationState::Committed => return Ok(CommitOutcome::AlreadyCommitted),
            ReservationState::Released => return Ok(CommitOutcome::AlreadyReleased),
            ReservationState::Expired => return Ok(CommitOutcome::Expired),
        }

        let now = self.clock.now();
        if reservation.expires_at <= now {
            self.release_held(&reservation, ReleaseCause::Expiry, now)
                .await?;
            return Ok(CommitOutcome::Expired);
        }

        let rows = self.load_rows(&reservation.lines).await?;
        let mut batch = LedgerBatch::new(now);
        for line in &reservation.lines {
            let row = rows
                .get(&line.sku_id)
                .ok_or_else(|| LedgerError::MissingStock(line.sku_id.clone()))?;
            batch = batch.with_stock(StockChange {
                sku_id: line.sku_id.clone(),
                expected_version: Some(row.version),
                available: row.available,
                reserved: row.reserved - i64::from(line.qty),
            });
        }

        let event = EventPayload::new(now)
            .reservation(reservation.reservation_id)
            .checkout(reservation.checkout_id)
            .lines(reservation.lines.clone())
            .into_entry(
                Topic::ReservationCommitted,
                reservation.reservation_id.to_string(),
            )
            .map_err(StoreError::from)?;

        self.store
            .apply_batch(
                batch
                    .with_reservation(ReservationWrite::Transition {
                        reservation_id,
                        from: ReservationState::Held,
                        to: ReservationState::Committed,
                        cause: "commit".to_string(),
                    })
                    .with_outbox(event),
            )
            .await?;

        Ok(CommitOutcome::Ok)
    }

    /// Returns held stock to `available`.
    ///
    /// `cause` picks the terminal state: `Released` for an explicit
    /// rollback, `Expired` for the reaper. A reservation that already left
    /// `HELD` through either path reports `AlreadyReleased` and emits
    /// nothing.
    #[tracing::instrument(skip(self, cause), fields(cause = cause.as_str()))]
    pub async fn rollback(
        &self,
        reservation_id: ReservationId,
        cause: ReleaseCause,
    ) -> Result<RollbackOutcome> {
        let outcome = match self.store.get_reservation(reservation_id).await? {
            None => RollbackOutcome::NotFound,
            Some(found) => {
                let _held = self
                    .guards
                    .lock_all(found.lines.iter().map(|line| &line.sku_id))
                    .await;
                self.retry_conflicts(|| self.try_rollback(reservation_id, cause))
                    .await?
            }
        };

        metrics::counter!(
            "ledger_rollback_total",
            "outcome" => outcome.as_str(),
            "cause" => cause.as_str()
        )
        .increment(1);
        tracing::info!(outcome = outcome.as_str(), "Rollback finished");
        Ok(outcome)
    }

    async fn try_rollback(
        &self,
        reservation_id: ReservationId,
        cause: ReleaseCause,
    ) -> Result<RollbackOutcome> {
        let Some(reservation) = self.store.get_reservation(reservation_id).await? else {
            return Ok(RollbackOutcome::NotFound);
        };

        match reservation.state {
            ReservationState::Held => {
                self.release_held(&reservation, cause, self.clock.now())
                    .await?;
                Ok(RollbackOutcome::Ok)
            }
            ReservationState::Committed => Ok(RollbackOutcome::AlreadyCommitted),
            ReservationState::Released | ReservationState::Expired => {
                Ok(RollbackOutcome::AlreadyReleased)
            }
        }
    }

    /// Writes the release of a held reservation. Caller holds the guards.
    async fn release_held(
        &self,
        reservation: &Reservation,
        cause: ReleaseCause,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let rows = self.load_rows(&reservation.lines).await?;
        let mut batch = LedgerBatch::new(now);
        for line in &reservation.lines {
            let row = rows
                .get(&line.sku_id)
                .ok_or_else(|| LedgerError::MissingStock(line.sku_id.clone()))?;
            let qty = i64::from(line.qty);
            batch = batch.with_stock(StockChange {
                sku_id: line.sku_id.clone(),
                expected_version: Some(row.version),
                available: row.available + qty,
                reserved: row.reserved - qty,
            });
        }

        let event = EventPayload::new(now)
            .reservation(reservation.reservation_id)
            .checkout(reservation.checkout_id)
            .lines(reservation.lines.clone())
            .reason(cause.as_str())
            .into_entry(cause.topic(), reservation.reservation_id.to_string())
            .map_err(StoreError::from)?;

        self.store
            .apply_batch(
                batch
                    .with_reservation(ReservationWrite::Transition {
                        reservation_id: reservation.reservation_id,
                        from: ReservationState::Held,
                        to: cause.target_state(),
                        cause: cause.as_str().to_string(),
                    })
                    .with_outbox(event),
            )
            .await?;
        Ok(())
    }

    /// Read-only snapshot of one SKU. Unknown SKUs read as zero so the
    /// response does not reveal which SKUs exist.
    #[tracing::instrument(skip(self))]
    pub async fn query(&self, sku_id: &SkuId) -> Result<StockLevel> {
        let level = match self.store.get_stock(sku_id).await? {
            Some(row) => StockLevel {
                sku_id: row.sku_id,
                available: row.available,
                reserved: row.reserved,
            },
            None => StockLevel {
                sku_id: sku_id.clone(),
                available: 0,
                reserved: 0,
            },
        };
        Ok(level)
    }

    /// Records an inbound warehouse movement: `available` grows by `qty`,
    /// creating the row on first receipt.
    #[tracing::instrument(skip(self))]
    pub async fn receive_stock(&self, sku_id: &SkuId, qty: u32) -> Result<StockLevel> {
        if sku_id.is_blank() {
            return Err(LedgerError::Invalid("sku_id must not be blank".to_string()));
        }
        if qty == 0 {
            return Err(LedgerError::Invalid("qty must be positive".to_string()));
        }

        let _held = self.guards.lock_all([sku_id]).await;
        let level = self
            .retry_conflicts(|| self.try_receive(sku_id, qty))
            .await?;

        metrics::counter!("ledger_received_units_total").increment(u64::from(qty));
        tracing::info!(available = level.available, "Stock received");
        Ok(level)
    }

    async fn try_receive(&self, sku_id: &SkuId, qty: u32) -> Result<StockLevel> {
        let now = self.clock.now();
        let change = match self.store.get_stock(sku_id).await? {
            Some(row) => StockChange {
                sku_id: sku_id.clone(),
                expected_version: Some(row.version),
                available: row.available + i64::from(qty),
                reserved: row.reserved,
            },
            None => StockChange {
                sku_id: sku_id.clone(),
                expected_version: None,
                available: i64::from(qty),
                reserved: 0,
            },
        };
        let level = StockLevel {
            sku_id: sku_id.clone(),
            available: change.available,
            reserved: change.reserved,
        };

        let event = EventPayload::new(now)
            .lines(vec![ReservationLine::new(sku_id.clone(), qty)])
            .into_entry(Topic::StockReceived, sku_id.as_str())
            .map_err(StoreError::from)?;

        self.store
            .apply_batch(LedgerBatch::new(now).with_stock(change).with_outbox(event))
            .await?;
        Ok(level)
    }

    /// Looks a reservation up in any state.
    pub async fn reservation(&self, reservation_id: ReservationId) -> Result<Option<Reservation>> {
        Ok(self.store.get_reservation(reservation_id).await?)
    }

    /// Audit trail of a reservation's terminal transition.
    pub async fn history(&self, reservation_id: ReservationId) -> Result<Vec<HistoryEntry>> {
        Ok(self.store.reservation_history(reservation_id).await?)
    }

    async fn load_rows(&self, lines: &[ReservationLine]) -> Result<HashMap<SkuId, StockRow>> {
        let skus: Vec<SkuId> = lines.iter().map(|line| line.sku_id.clone()).collect();
        Ok(self
            .store
            .get_stocks(&skus)
            .await?
            .into_iter()
            .map(|row| (row.sku_id.clone(), row))
            .collect())
    }

    /// Re-runs `op` while its batch loses optimistic-concurrency races.
    async fn retry_conflicts<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        for attempt in 1..=self.max_attempts {
            match op().await {
                Err(LedgerError::Store(e)) if e.is_conflict() => {
                    metrics::counter!("ledger_batch_conflicts_total").increment(1);
                    tracing::debug!(attempt, error = %e, "Ledger batch conflicted, rebuilding");
                }
                other => return other,
            }
        }
        tracing::warn!(attempts = self.max_attempts, "Ledger batch kept conflicting");
        Err(LedgerError::Contention {
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use common::{CheckoutId, ManualClock};
    use inventory_store::{InMemoryStore, OutboxStore};

    fn ledger() -> (StockLedger<InMemoryStore>, InMemoryStore, ManualClock) {
        let store = InMemoryStore::new();
        let clock = ManualClock::default();
        let ledger = StockLedger::with_clock(store.clone(), Arc::new(clock.clone()));
        (ledger, store, clock)
    }

    fn request(id: ReservationId, lines: Vec<ReservationLine>) -> ReserveRequest {
        ReserveRequest::new(id, CheckoutId::new(), lines, Duration::seconds(60))
    }

    async fn level(ledger: &StockLedger<InMemoryStore>, sku: &str) -> (i64, i64) {
        let level = ledger.query(&SkuId::new(sku)).await.unwrap();
        (level.available, level.reserved)
    }

    async fn topics(store: &InMemoryStore) -> Vec<Topic> {
        store
            .outbox_since(0, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.topic)
            .collect()
    }

    #[tokio::test]
    async fn unknown_sku_reserves_do_not_grow_guard_table() {
        let (ledger, _, _) = ledger();
        for i in 0..10_000 {
            let outcome = ledger
                .reserve(request(
                    ReservationId::new(),
                    vec![ReservationLine::new(format!("GHOST-{i}"), 1)],
                ))
                .await
                .unwrap();
            assert!(matches!(outcome, ReserveOutcome::OutOfStock(_)));
        }
        assert!(ledger.guards.is_empty());
    }

    #[tokio::test]
    async fn reserve_moves_available_to_reserved() {
        let (ledger, store, _) = ledger();
        ledger.receive_stock(&SkuId::new("A"), 3).await.unwrap();

        let outcome = ledger
            .reserve(request(ReservationId::new(), vec![ReservationLine::new("A", 2)]))
            .await
            .unwrap();
        assert!(matches!(outcome, ReserveOutcome::Held(_)));
        assert_eq!(level(&ledger, "A").await, (1, 2));
        assert_eq!(
            topics(&store).await,
            vec![Topic::StockReceived, Topic::ReservationHeld]
        );
    }

    #[tokio::test]
    async fn duplicate_reserve_changes_nothing() {
        let (ledger, store, _) = ledger();
        ledger.receive_stock(&SkuId::new("A"), 5).await.unwrap();
        ledger.receive_stock(&SkuId::new("B"), 5).await.unwrap();

        let id = ReservationId::new();
        let lines = vec![ReservationLine::new("A", 1), ReservationLine::new("B", 2)];
        ledger.reserve(request(id, lines)).await.unwrap();

        // Same lines in another order
        let again = ledger
            .reserve(request(
                id,
                vec![ReservationLine::new("B", 2), ReservationLine::new("A", 1)],
            ))
            .await
            .unwrap();
        match again {
            ReserveOutcome::Duplicate(r) => assert_eq!(r.state, ReservationState::Held),
            other => panic!("expected duplicate, got {other:?}"),
        }
        assert_eq!(level(&ledger, "A").await, (4, 1));
        assert_eq!(level(&ledger, "B").await, (3, 2));
        assert_eq!(store.outbox_len().await, 3);

        let different = ledger
            .reserve(request(id, vec![ReservationLine::new("A", 2)]))
            .await
            .unwrap();
        assert!(matches!(different, ReserveOutcome::Invalid(_)));
    }

    #[tokio::test]
    async fn duplicate_after_commit_reports_current_state() {
        let (ledger, _, _) = ledger();
        ledger.receive_stock(&SkuId::new("A"), 5).await.unwrap();
        let id = ReservationId::new();
        ledger
            .reserve(request(id, vec![ReservationLine::new("A", 1)]))
            .await
            .unwrap();
        ledger.commit(id).await.unwrap();

        let again = ledger
            .reserve(request(id, vec![ReservationLine::new("A", 1)]))
            .await
            .unwrap();
        assert_eq!(
            again.reservation().map(|r| r.state),
            Some(ReservationState::Committed)
        );
        assert_eq!(level(&ledger, "A").await, (4, 0));
    }

    #[tokio::test]
    async fn unknown_sku_is_out_of_stock() {
        let (ledger, store, _) = ledger();
        let outcome = ledger
            .reserve(request(ReservationId::new(), vec![ReservationLine::new("NOPE", 1)]))
            .await
            .unwrap();
        assert_eq!(outcome, ReserveOutcome::OutOfStock(SkuId::new("NOPE")));
        assert_eq!(store.outbox_len().await, 0);
    }

    #[tokio::test]
    async fn malformed_requests_are_invalid() {
        let (ledger, _, _) = ledger();
        ledger.receive_stock(&SkuId::new("A"), 5).await.unwrap();

        for lines in [
            vec![],
            vec![ReservationLine::new("A", 0)],
            vec![ReservationLine::new("A", 1), ReservationLine::new("A", 1)],
        ] {
            let outcome = ledger
                .reserve(request(ReservationId::new(), lines))
                .await
                .unwrap();
            assert!(matches!(outcome, ReserveOutcome::Invalid(_)));
        }
        assert_eq!(level(&ledger, "A").await, (5, 0));
    }

    #[tokio::test]
    async fn commit_is_idempotent() {
        let (ledger, store, _) = ledger();
        ledger.receive_stock(&SkuId::new("A"), 3).await.unwrap();
        let id = ReservationId::new();
        ledger
            .reserve(request(id, vec![ReservationLine::new("A", 2)]))
            .await
            .unwrap();

        assert_eq!(ledger.commit(id).await.unwrap(), CommitOutcome::Ok);
        assert_eq!(
            ledger.commit(id).await.unwrap(),
            CommitOutcome::AlreadyCommitted
        );
        assert_eq!(level(&ledger, "A").await, (1, 0));
        assert_eq!(
            ledger
                .rollback(id, ReleaseCause::Rollback)
                .await
                .unwrap(),
            RollbackOutcome::AlreadyCommitted
        );
        assert_eq!(
            topics(&store).await,
            vec![
                Topic::StockReceived,
                Topic::ReservationHeld,
                Topic::ReservationCommitted
            ]
        );
    }

    #[tokio::test]
    async fn rollback_is_idempotent() {
        let (ledger, store, _) = ledger();
        ledger.receive_stock(&SkuId::new("A"), 3).await.unwrap();
        let id = ReservationId::new();
        ledger
            .reserve(request(id, vec![ReservationLine::new("A", 2)]))
            .await
            .unwrap();

        assert_eq!(
            ledger.rollback(id, ReleaseCause::Rollback).await.unwrap(),
            RollbackOutcome::Ok
        );
        assert_eq!(
            ledger.rollback(id, ReleaseCause::Rollback).await.unwrap(),
            RollbackOutcome::AlreadyReleased
        );
        assert_eq!(level(&ledger, "A").await, (3, 0));
        assert_eq!(
            ledger.commit(id).await.unwrap(),
            CommitOutcome::AlreadyReleased
        );
        assert_eq!(store.outbox_len().await, 3);

        let history = ledger.history(id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].to_state, ReservationState::Released);
        assert_eq!(history[0].cause, "rollback");
    }

    #[tokio::test]
    async fn unknown_reservation_is_not_found() {
        let (ledger, _, _) = ledger();
        let id = ReservationId::new();
        assert_eq!(ledger.commit(id).await.unwrap(), CommitOutcome::NotFound);
        assert_eq!(
            ledger.rollback(id, ReleaseCause::Rollback).await.unwrap(),
            RollbackOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn commit_past_deadline_expires() {
        let (ledger, store, clock) = ledger();
        ledger.receive_stock(&SkuId::new("A"), 3).await.unwrap();
        let id = ReservationId::new();
        ledger
            .reserve(request(id, vec![ReservationLine::new("A", 2)]))
            .await
            .unwrap();

        clock.advance(Duration::seconds(61));
        assert_eq!(ledger.commit(id).await.unwrap(), CommitOutcome::Expired);
        assert_eq!(level(&ledger, "A").await, (3, 0));
        assert_eq!(
            topics(&store).await.last(),
            Some(&Topic::ReservationExpired)
        );
        assert_eq!(
            ledger.rollback(id, ReleaseCause::Rollback).await.unwrap(),
            RollbackOutcome::AlreadyReleased
        );
    }

    #[tokio::test]
    async fn expiry_cause_sets_expired_state() {
        let (ledger, _, _) = ledger();
        ledger.receive_stock(&SkuId::new("A"), 1).await.unwrap();
        let id = ReservationId::new();
        ledger
            .reserve(request(id, vec![ReservationLine::new("A", 1)]))
            .await
            .unwrap();

        ledger.rollback(id, ReleaseCause::Expiry).await.unwrap();
        let stored = ledger.reservation(id).await.unwrap().unwrap();
        assert_eq!(stored.state, ReservationState::Expired);
        assert!(stored.terminal_at.is_some());
    }

    #[tokio::test]
    async fn receive_stock_creates_then_increments() {
        let (ledger, _, _) = ledger();
        let sku = SkuId::new("A");
        assert_eq!(ledger.query(&sku).await.unwrap().available, 0);

        ledger.receive_stock(&sku, 2).await.unwrap();
        let level = ledger.receive_stock(&sku, 3).await.unwrap();
        assert_eq!(level.available, 5);

        let err = ledger.receive_stock(&sku, 0).await.unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_conflicts() {
        use conflicting::ConflictingStore;

        let ledger = StockLedger::new(ConflictingStore::default()).with_max_attempts(3);
        let err = ledger
            .receive_stock(&SkuId::new("A"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Contention { attempts: 3 }));
        assert_eq!(err.kind(), common::ErrorKind::Unavailable);
    }

    /// A store whose batches always lose the race.
    mod conflicting {
        use super::*;

        #[derive(Clone, Default)]
        pub struct ConflictingStore {
            inner: InMemoryStore,
        }

        #[async_trait::async_trait]
        impl StockStore for ConflictingStore {
            async fn get_stock(&self, sku: &SkuId) -> inventory_store::Result<Option<StockRow>> {
                self.inner.get_stock(sku).await
            }

            async fn get_stocks(&self, skus: &[SkuId]) -> inventory_store::Result<Vec<StockRow>> {
                self.inner.get_stocks(skus).await
            }

            async fn get_reservation(
                &self,
                id: ReservationId,
            ) -> inventory_store::Result<Option<Reservation>> {
                self.inner.get_reservation(id).await
            }

            async fn reservation_history(
                &self,
                id: ReservationId,
            ) -> inventory_store::Result<Vec<HistoryEntry>> {
                self.inner.reservation_history(id).await
            }

            async fn due_reservations(
                &self,
                now: DateTime<Utc>,
                limit: usize,
            ) -> inventory_store::Result<Vec<Reservation>> {
                self.inner.due_reservations(now, limit).await
            }

            async fn apply_batch(&self, _batch: LedgerBatch) -> inventory_store::Result<Vec<i64>> {
                Err(StoreError::Conflict {
                    entity: "stock",
                    id: "A".to_string(),
                    reason: "always stale".to_string(),
                })
            }
        }
    }
}
