use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{CheckoutId, ReservationId, SkuId, UserId};
use tokio::sync::RwLock;

use crate::{
    CheckoutRecord, HistoryEntry, IdempotencyRecord, LedgerBatch, NewOutboxEntry, OutboxEntry,
    Reservation, ReservationWrite, Result, StockRow, StoreError, StoredResponse, Version,
    store::{CheckoutStore, IdempotencyStore, LeaseStore, OutboxStore, StockStore},
};

#[derive(Default)]
struct Tables {
    stock: HashMap<SkuId, StockRow>,
    reservations: HashMap<ReservationId, Reservation>,
    history: Vec<HistoryEntry>,
    checkouts: HashMap<CheckoutId, CheckoutRecord>,
    outbox: Vec<OutboxEntry>,
    leases: HashMap<String, (String, DateTime<Utc>)>,
    idempotency: HashMap<(String, String), (IdempotencyRecord, DateTime<Utc>)>,
}

impl Tables {
    fn append_outbox(&mut self, entries: Vec<NewOutboxEntry>, at: DateTime<Utc>) -> Vec<i64> {
        let mut seqs = Vec::with_capacity(entries.len());
        for entry in entries {
            let seq = self.outbox.len() as i64 + 1;
            self.outbox.push(OutboxEntry {
                seq,
                topic: entry.topic,
                key: entry.key,
                payload: entry.payload,
                created_at: at,
                dispatched_at: None,
            });
            seqs.push(seq);
        }
        metrics::counter!("outbox_entries_written_total").increment(seqs.len() as u64);
        seqs
    }
}

/// In-memory store for tests and single-node deployments.
///
/// Every table lives behind one lock, so a batch is applied atomically and
/// readers never observe a half-applied batch.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of outbox entries, dispatched or not.
    pub async fn outbox_len(&self) -> usize {
        self.tables.read().await.outbox.len()
    }

    /// Returns every stock row, ordered by SKU.
    pub async fn all_stock(&self) -> Vec<StockRow> {
        let tables = self.tables.read().await;
        let mut rows: Vec<_> = tables.stock.values().cloned().collect();
        rows.sort_by(|a, b| a.sku_id.cmp(&b.sku_id));
        rows
    }

    /// Returns every reservation.
    pub async fn all_reservations(&self) -> Vec<Reservation> {
        self.tables
            .read()
            .await
            .reservations
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StockStore for InMemoryStore {
    async fn get_stock(&self, sku: &SkuId) -> Result<Option<StockRow>> {
        Ok(self.tables.read().await.stock.get(sku).cloned())
    }

    async fn get_stocks(&self, skus: &[SkuId]) -> Result<Vec<StockRow>> {
        let tables = self.tables.read().await;
        Ok(skus
            .iter()
            .filter_map(|sku| tables.stock.get(sku).cloned())
            .collect())
    }

    async fn get_reservation(&self, id: ReservationId) -> Result<Option<Reservation>> {
        Ok(self.tables.read().await.reservations.get(&id).cloned())
    }

    async fn reservation_history(&self, id: ReservationId) -> Result<Vec<HistoryEntry>> {
        let tables = self.tables.read().await;
        Ok(tables
            .history
            .iter()
            .filter(|h| h.reservation_id == id)
            .cloned()
            .collect())
    }

    async fn due_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>> {
        let tables = self.tables.read().await;
        let mut due: Vec<_> = tables
            .reservations
            .values()
            .filter(|r| r.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.expires_at
                .cmp(&b.expires_at)
                .then(a.reservation_id.cmp(&b.reservation_id))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn apply_batch(&self, batch: LedgerBatch) -> Result<Vec<i64>> {
        batch.validate().map_err(StoreError::InvalidBatch)?;

        let mut tables = self.tables.write().await;

        // Check every guard before writing anything
        for change in &batch.stock {
            let actual = tables.stock.get(&change.sku_id).map(|row| row.version);
            if actual != change.expected_version {
                return Err(StoreError::conflict(
                    "stock",
                    &change.sku_id,
                    format!(
                        "expected version {:?}, found {:?}",
                        change.expected_version, actual
                    ),
                ));
            }
        }

        match &batch.reservation {
            Some(ReservationWrite::Insert(reservation)) => {
                if tables
                    .reservations
                    .contains_key(&reservation.reservation_id)
                {
                    return Err(StoreError::conflict(
                        "reservation",
                        reservation.reservation_id,
                        "already exists",
                    ));
                }
            }
            Some(ReservationWrite::Transition {
                reservation_id,
                from,
                to,
                ..
            }) => {
                let actual = tables.reservations.get(reservation_id).map(|r| r.state);
                if actual != Some(*from) || !from.can_transition_to(*to) {
                    return Err(StoreError::conflict(
                        "reservation",
                        reservation_id,
                        format!("expected {from}, found {actual:?}, target {to}"),
                    ));
                }
            }
            None => {}
        }

        // Apply
        for change in batch.stock {
            let version = change
                .expected_version
                .map(|v| v.next())
                .unwrap_or(Version::first());
            tables.stock.insert(
                change.sku_id.clone(),
                StockRow {
                    sku_id: change.sku_id,
                    available: change.available,
                    reserved: change.reserved,
                    version,
                    updated_at: batch.at,
                },
            );
        }

        match batch.reservation {
            Some(ReservationWrite::Insert(reservation)) => {
                tables
                    .reservations
                    .insert(reservation.reservation_id, reservation);
            }
            Some(ReservationWrite::Transition {
                reservation_id,
                from,
                to,
                cause,
            }) => {
                if let Some(reservation) = tables.reservations.get_mut(&reservation_id) {
                    reservation.state = to;
                    reservation.terminal_at = Some(batch.at);
                }
                tables.history.push(HistoryEntry {
                    reservation_id,
                    from_state: from,
                    to_state: to,
                    cause,
                    at: batch.at,
                });
            }
            None => {}
        }

        Ok(tables.append_outbox(batch.outbox, batch.at))
    }
}

#[async_trait]
impl CheckoutStore for InMemoryStore {
    async fn insert_checkout(&self, record: &CheckoutRecord) -> Result<Version> {
        let mut tables = self.tables.write().await;
        if tables.checkouts.contains_key(&record.checkout_id) {
            return Err(StoreError::conflict(
                "checkout",
                record.checkout_id,
                "already exists",
            ));
        }
        let mut stored = record.clone();
        stored.version = Version::first();
        tables.checkouts.insert(stored.checkout_id, stored);
        Ok(Version::first())
    }

    async fn get_checkout(&self, id: CheckoutId) -> Result<Option<CheckoutRecord>> {
        Ok(self.tables.read().await.checkouts.get(&id).cloned())
    }

    async fn save_checkout(
        &self,
        record: &CheckoutRecord,
        events: Vec<NewOutboxEntry>,
    ) -> Result<Version> {
        let mut tables = self.tables.write().await;
        let actual = tables
            .checkouts
            .get(&record.checkout_id)
            .map(|c| c.version);
        if actual != Some(record.version) {
            return Err(StoreError::conflict(
                "checkout",
                record.checkout_id,
                format!("expected version {}, found {actual:?}", record.version),
            ));
        }

        let mut stored = record.clone();
        stored.version = record.version.next();
        let version = stored.version;
        let at = stored.updated_at;
        tables.checkouts.insert(stored.checkout_id, stored);
        tables.append_outbox(events, at);
        Ok(version)
    }

    async fn active_checkout_for_user(&self, user_id: UserId) -> Result<Option<CheckoutId>> {
        let tables = self.tables.read().await;
        Ok(tables
            .checkouts
            .values()
            .find(|c| c.user_id == user_id && !c.state.is_terminal())
            .map(|c| c.checkout_id))
    }

    async fn incomplete_checkouts(&self) -> Result<Vec<CheckoutRecord>> {
        let tables = self.tables.read().await;
        let mut records: Vec<_> = tables
            .checkouts
            .values()
            .filter(|c| !c.state.is_terminal())
            .cloned()
            .collect();
        records.sort_by_key(|c| c.created_at);
        Ok(records)
    }

    async fn purge_checkouts(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.checkouts.len();
        tables
            .checkouts
            .retain(|_, c| !(c.state.is_terminal() && c.updated_at < cutoff));
        Ok((before - tables.checkouts.len()) as u64)
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let tables = self.tables.read().await;
        Ok(tables
            .outbox
            .iter()
            .filter(|e| !e.is_dispatched())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_dispatched(&self, seqs: &[i64], at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.write().await;
        for seq in seqs {
            let index = (*seq - 1) as usize;
            if let Some(entry) = tables.outbox.get_mut(index)
                && entry.dispatched_at.is_none()
            {
                entry.dispatched_at = Some(at);
            }
        }
        Ok(())
    }

    async fn outbox_since(&self, after: i64, limit: usize) -> Result<Vec<OutboxEntry>> {
        let tables = self.tables.read().await;
        Ok(tables
            .outbox
            .iter()
            .filter(|e| e.seq > after)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LeaseStore for InMemoryStore {
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let acquired = match tables.leases.get(name) {
            Some((current, expires_at)) => current == holder || *expires_at <= now,
            None => true,
        };
        if acquired {
            tables
                .leases
                .insert(name.to_string(), (holder.to_string(), now + ttl));
        }
        Ok(acquired)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables
            .leases
            .get(name)
            .is_some_and(|(current, _)| current == holder)
        {
            tables.leases.remove(name);
        }
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryStore {
    async fn claim_key(
        &self,
        scope: &str,
        key: &str,
        candidate: &str,
        now: DateTime<Utc>,
    ) -> Result<IdempotencyRecord> {
        let mut tables = self.tables.write().await;
        let (record, _) = tables
            .idempotency
            .entry((scope.to_string(), key.to_string()))
            .or_insert_with(|| {
                let record = IdempotencyRecord {
                    resource_id: candidate.to_string(),
                    response: None,
                };
                (record, now)
            });
        Ok(record.clone())
    }

    async fn complete_key(&self, scope: &str, key: &str, response: StoredResponse) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some((record, _)) = tables
            .idempotency
            .get_mut(&(scope.to_string(), key.to_string()))
            && record.response.is_none()
        {
            record.response = Some(response);
        }
        Ok(())
    }

    async fn purge_keys(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.idempotency.len();
        tables
            .idempotency
            .retain(|_, (_, created_at)| *created_at >= cutoff);
        Ok((before - tables.idempotency.len()) as u64)
    }
}
