use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{CheckoutId, ReservationId, SkuId, UserId, from_millis, to_millis};
use sqlx::{PgConnection, PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    CartSnapshot, CheckoutRecord, HistoryEntry, IdempotencyRecord, LedgerBatch, NewOutboxEntry,
    OutboxEntry, Reservation, ReservationLine, ReservationWrite, Result, StockRow, StoreError,
    StoredResponse, Version,
    store::{CheckoutStore, IdempotencyStore, LeaseStore, OutboxStore, StockStore},
};

const RESERVATION_COLUMNS: &str =
    "reservation_id, checkout_id, lines, state, created_at, expires_at, terminal_at";

const CHECKOUT_COLUMNS: &str = "checkout_id, user_id, cart, payment_method, shipping_address, \
     ttl_secs, state, reservation_id, payment_id, order_id, last_error, pending_step, \
     cancel_requested, version, created_at, updated_at";

/// PostgreSQL-backed store implementation.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_stock(row: PgRow) -> Result<StockRow> {
        Ok(StockRow {
            sku_id: SkuId::new(row.try_get::<String, _>("sku_id")?),
            available: row.try_get("available")?,
            reserved: row.try_get("reserved")?,
            version: Version::new(row.try_get("version")?),
            updated_at: from_millis(row.try_get("updated_at")?),
        })
    }

    fn row_to_reservation(row: PgRow) -> Result<Reservation> {
        let lines: Vec<ReservationLine> =
            serde_json::from_value(row.try_get::<serde_json::Value, _>("lines")?)?;
        let state: String = row.try_get("state")?;

        Ok(Reservation {
            reservation_id: ReservationId::from_uuid(row.try_get::<Uuid, _>("reservation_id")?),
            checkout_id: CheckoutId::from_uuid(row.try_get::<Uuid, _>("checkout_id")?),
            lines,
            state: state
                .parse()
                .map_err(|e: String| StoreError::corrupt("reservations", e))?,
            created_at: from_millis(row.try_get("created_at")?),
            expires_at: from_millis(row.try_get("expires_at")?),
            terminal_at: row
                .try_get::<Option<i64>, _>("terminal_at")?
                .map(from_millis),
        })
    }

    fn row_to_checkout(row: PgRow) -> Result<CheckoutRecord> {
        let cart: CartSnapshot = serde_json::from_value(row.try_get::<serde_json::Value, _>("cart")?)?;
        let state: String = row.try_get("state")?;
        let ttl_secs: i64 = row.try_get("ttl_secs")?;

        Ok(CheckoutRecord {
            checkout_id: CheckoutId::from_uuid(row.try_get::<Uuid, _>("checkout_id")?),
            user_id: UserId::from_uuid(row.try_get::<Uuid, _>("user_id")?),
            cart,
            payment_method: row.try_get("payment_method")?,
            shipping_address: row.try_get("shipping_address")?,
            ttl_secs: u64::try_from(ttl_secs)
                .map_err(|_| StoreError::corrupt("checkouts", format!("ttl_secs {ttl_secs}")))?,
            state: state
                .parse()
                .map_err(|e: String| StoreError::corrupt("checkouts", e))?,
            reservation_id: ReservationId::from_uuid(row.try_get::<Uuid, _>("reservation_id")?),
            payment_id: row.try_get("payment_id")?,
            order_id: row.try_get("order_id")?,
            last_error: row.try_get("last_error")?,
            pending_step: row.try_get("pending_step")?,
            cancel_requested: row.try_get("cancel_requested")?,
            version: Version::new(row.try_get("version")?),
            created_at: from_millis(row.try_get("created_at")?),
            updated_at: from_millis(row.try_get("updated_at")?),
        })
    }

    fn row_to_outbox(row: PgRow) -> Result<OutboxEntry> {
        let topic: String = row.try_get("topic")?;
        Ok(OutboxEntry {
            seq: row.try_get("seq")?,
            topic: topic
                .parse()
                .map_err(|e: String| StoreError::corrupt("outbox", e))?,
            key: row.try_get("key")?,
            payload: row.try_get("payload")?,
            created_at: from_millis(row.try_get("created_at")?),
            dispatched_at: row
                .try_get::<Option<i64>, _>("dispatched_at")?
                .map(from_millis),
        })
    }

    /// Allocates dense sequence numbers and inserts the entries.
    ///
    /// The sequence row is locked by the update until the surrounding
    /// transaction ends, so concurrent writers never interleave numbers.
    async fn append_outbox(
        conn: &mut PgConnection,
        entries: &[NewOutboxEntry],
        at: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let last: i64 = sqlx::query_scalar(
            "UPDATE outbox_sequence SET last_seq = last_seq + $1 WHERE id = 1 RETURNING last_seq",
        )
        .bind(entries.len() as i64)
        .fetch_one(&mut *conn)
        .await?;

        let first = last - entries.len() as i64 + 1;
        let mut seqs = Vec::with_capacity(entries.len());
        for (offset, entry) in entries.iter().enumerate() {
            let seq = first + offset as i64;
            sqlx::query(
                r#"
                INSERT INTO outbox (seq, topic, key, payload, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(seq)
            .bind(entry.topic.as_str())
            .bind(&entry.key)
            .bind(&entry.payload)
            .bind(to_millis(at))
            .execute(&mut *conn)
            .await?;
            seqs.push(seq);
        }

        metrics::counter!("outbox_entries_written_total").increment(seqs.len() as u64);
        tracing::debug!(first, last, "Allocated outbox sequence numbers");
        Ok(seqs)
    }
}

#[async_trait]
impl StockStore for PostgresStore {
    async fn get_stock(&self, sku: &SkuId) -> Result<Option<StockRow>> {
        let row = sqlx::query(
            "SELECT sku_id, available, reserved, version, updated_at FROM stock WHERE sku_id = $1",
        )
        .bind(sku.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_stock).transpose()
    }

    async fn get_stocks(&self, skus: &[SkuId]) -> Result<Vec<StockRow>> {
        let keys: Vec<String> = skus.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(
            r#"
            SELECT sku_id, available, reserved, version, updated_at
            FROM stock
            WHERE sku_id = ANY($1)
            ORDER BY sku_id ASC
            "#,
        )
        .bind(keys)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_stock).collect()
    }

    async fn get_reservation(&self, id: ReservationId) -> Result<Option<Reservation>> {
        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE reservation_id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_reservation).transpose()
    }

    async fn reservation_history(&self, id: ReservationId) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT reservation_id, from_state, to_state, cause, at
            FROM reservation_history
            WHERE reservation_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<HistoryEntry> {
                let from: String = row.try_get("from_state")?;
                let to: String = row.try_get("to_state")?;
                Ok(HistoryEntry {
                    reservation_id: ReservationId::from_uuid(row.try_get("reservation_id")?),
                    from_state: from
                        .parse()
                        .map_err(|e: String| StoreError::corrupt("reservation_history", e))?,
                    to_state: to
                        .parse()
                        .map_err(|e: String| StoreError::corrupt("reservation_history", e))?,
                    cause: row.try_get("cause")?,
                    at: from_millis(row.try_get("at")?),
                })
            })
            .collect()
    }

    async fn due_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RESERVATION_COLUMNS}
            FROM reservations
            WHERE state = 'HELD' AND expires_at <= $1
            ORDER BY expires_at ASC, reservation_id ASC
            LIMIT $2
            "#
        ))
        .bind(to_millis(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_reservation).collect()
    }

    #[tracing::instrument(
        skip(self, batch),
        fields(stock = batch.stock.len(), outbox = batch.outbox.len())
    )]
    async fn apply_batch(&self, batch: LedgerBatch) -> Result<Vec<i64>> {
        batch.validate().map_err(StoreError::InvalidBatch)?;
        let at = to_millis(batch.at);

        // Dropping the transaction on any early return rolls it back
        let mut tx = self.pool.begin().await?;

        for change in &batch.stock {
            let affected = match change.expected_version {
                Some(expected) => sqlx::query(
                    r#"
                    UPDATE stock
                    SET available = $1, reserved = $2, version = version + 1, updated_at = $3
                    WHERE sku_id = $4 AND version = $5
                    "#,
                )
                .bind(change.available)
                .bind(change.reserved)
                .bind(at)
                .bind(change.sku_id.as_str())
                .bind(expected.as_i64())
                .execute(&mut *tx)
                .await?
                .rows_affected(),
                None => sqlx::query(
                    r#"
                    INSERT INTO stock (sku_id, available, reserved, version, updated_at)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (sku_id) DO NOTHING
                    "#,
                )
                .bind(change.sku_id.as_str())
                .bind(change.available)
                .bind(change.reserved)
                .bind(Version::first().as_i64())
                .bind(at)
                .execute(&mut *tx)
                .await?
                .rows_affected(),
            };

            if affected == 0 {
                return Err(StoreError::conflict(
                    "stock",
                    &change.sku_id,
                    format!("expected version {:?}", change.expected_version),
                ));
            }
        }

        match &batch.reservation {
            Some(ReservationWrite::Insert(reservation)) => {
                let affected = sqlx::query(&format!(
                    r#"
                    INSERT INTO reservations ({RESERVATION_COLUMNS})
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (reservation_id) DO NOTHING
                    "#
                ))
                .bind(reservation.reservation_id.as_uuid())
                .bind(reservation.checkout_id.as_uuid())
                .bind(serde_json::to_value(&reservation.lines)?)
                .bind(reservation.state.as_str())
                .bind(to_millis(reservation.created_at))
                .bind(to_millis(reservation.expires_at))
                .bind(reservation.terminal_at.map(to_millis))
                .execute(&mut *tx)
                .await?
                .rows_affected();

                if affected == 0 {
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
                cause,
            }) => {
                if !from.can_transition_to(*to) {
                    return Err(StoreError::InvalidBatch(format!(
                        "illegal transition {from} -> {to}"
                    )));
                }

                let affected = sqlx::query(
                    r#"
                    UPDATE reservations
                    SET state = $1, terminal_at = $2
                    WHERE reservation_id = $3 AND state = $4
                    "#,
                )
                .bind(to.as_str())
                .bind(at)
                .bind(reservation_id.as_uuid())
                .bind(from.as_str())
                .execute(&mut *tx)
                .await?
                .rows_affected();

                if affected == 0 {
                    return Err(StoreError::conflict(
                        "reservation",
                        reservation_id,
                        format!("no longer {from}"),
                    ));
                }

                sqlx::query(
                    r#"
                    INSERT INTO reservation_history (reservation_id, from_state, to_state, cause, at)
                    VALUES ($1, $2, $3, $4, $5)
                    "#,
                )
                .bind(reservation_id.as_uuid())
                .bind(from.as_str())
                .bind(to.as_str())
                .bind(cause)
                .bind(at)
                .execute(&mut *tx)
                .await?;
            }
            None => {}
        }

        let seqs = Self::append_outbox(&mut *tx, &batch.outbox, batch.at).await?;

        tx.commit().await?;
        Ok(seqs)
    }
}

#[async_trait]
impl CheckoutStore for PostgresStore {
    async fn insert_checkout(&self, record: &CheckoutRecord) -> Result<Version> {
        let affected = sqlx::query(&format!(
            r#"
            INSERT INTO checkouts ({CHECKOUT_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (checkout_id) DO NOTHING
            "#
        ))
        .bind(record.checkout_id.as_uuid())
        .bind(record.user_id.as_uuid())
        .bind(serde_json::to_value(&record.cart)?)
        .bind(&record.payment_method)
        .bind(&record.shipping_address)
        .bind(record.ttl_secs as i64)
        .bind(record.state.as_str())
        .bind(record.reservation_id.as_uuid())
        .bind(&record.payment_id)
        .bind(&record.order_id)
        .bind(&record.last_error)
        .bind(&record.pending_step)
        .bind(record.cancel_requested)
        .bind(Version::first().as_i64())
        .bind(to_millis(record.created_at))
        .bind(to_millis(record.updated_at))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(StoreError::conflict(
                "checkout",
                record.checkout_id,
                "already exists",
            ));
        }
        Ok(Version::first())
    }

    async fn get_checkout(&self, id: CheckoutId) -> Result<Option<CheckoutRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {CHECKOUT_COLUMNS} FROM checkouts WHERE checkout_id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_checkout).transpose()
    }

    #[tracing::instrument(skip(self, record, events), fields(checkout_id = %record.checkout_id))]
    async fn save_checkout(
        &self,
        record: &CheckoutRecord,
        events: Vec<NewOutboxEntry>,
    ) -> Result<Version> {
        let next = record.version.next();
        let mut tx = self.pool.begin().await?;

        let affected = sqlx::query(
            r#"
            UPDATE checkouts
            SET state = $1, payment_id = $2, order_id = $3, last_error = $4,
                pending_step = $5, cancel_requested = $6, version = $7, updated_at = $8
            WHERE checkout_id = $9 AND version = $10
            "#,
        )
        .bind(record.state.as_str())
        .bind(&record.payment_id)
        .bind(&record.order_id)
        .bind(&record.last_error)
        .bind(&record.pending_step)
        .bind(record.cancel_requested)
        .bind(next.as_i64())
        .bind(to_millis(record.updated_at))
        .bind(record.checkout_id.as_uuid())
        .bind(record.version.as_i64())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(StoreError::conflict(
                "checkout",
                record.checkout_id,
                format!("expected version {}", record.version),
            ));
        }

        Self::append_outbox(&mut *tx, &events, record.updated_at).await?;
        tx.commit().await?;
        Ok(next)
    }

    async fn active_checkout_for_user(&self, user_id: UserId) -> Result<Option<CheckoutId>> {
        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT checkout_id FROM checkouts
            WHERE user_id = $1 AND state NOT IN ('DONE', 'FAILED')
            LIMIT 1
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        Ok(id.map(CheckoutId::from_uuid))
    }

    async fn incomplete_checkouts(&self) -> Result<Vec<CheckoutRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {CHECKOUT_COLUMNS} FROM checkouts
            WHERE state NOT IN ('DONE', 'FAILED')
            ORDER BY created_at ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_checkout).collect()
    }

    async fn purge_checkouts(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM checkouts WHERE state IN ('DONE', 'FAILED') AND updated_at < $1",
        )
        .bind(to_millis(cutoff))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl OutboxStore for PostgresStore {
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT seq, topic, key, payload, created_at, dispatched_at
            FROM outbox
            WHERE dispatched_at IS NULL
            ORDER BY seq ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }

    async fn mark_dispatched(&self, seqs: &[i64], at: DateTime<Utc>) -> Result<()> {
        if seqs.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "UPDATE outbox SET dispatched_at = $1 WHERE seq = ANY($2) AND dispatched_at IS NULL",
        )
        .bind(to_millis(at))
        .bind(seqs.to_vec())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn outbox_since(&self, after: i64, limit: usize) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT seq, topic, key, payload, created_at, dispatched_at
            FROM outbox
            WHERE seq > $1
            ORDER BY seq ASC
            LIMIT $2
            "#,
        )
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }
}

#[async_trait]
impl LeaseStore for PostgresStore {
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO leases (name, holder, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE
            SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
            WHERE leases.holder = EXCLUDED.holder OR leases.expires_at <= $4
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(to_millis(now + ttl))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM leases WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for PostgresStore {
    async fn claim_key(
        &self,
        scope: &str,
        key: &str,
        candidate: &str,
        now: DateTime<Utc>,
    ) -> Result<IdempotencyRecord> {
        sqlx::query(
            r#"
            INSERT INTO idempotency_keys (scope, key, resource_id, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (scope, key) DO NOTHING
            "#,
        )
        .bind(scope)
        .bind(key)
        .bind(candidate)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            r#"
            SELECT resource_id, response_status, response_body
            FROM idempotency_keys
            WHERE scope = $1 AND key = $2
            "#,
        )
        .bind(scope)
        .bind(key)
        .fetch_one(&self.pool)
        .await?;

        let status: Option<i32> = row.try_get("response_status")?;
        let body: Option<serde_json::Value> = row.try_get("response_body")?;
        let response = match (status, body) {
            (Some(status), Some(body)) => Some(StoredResponse {
                status: u16::try_from(status).map_err(|_| {
                    StoreError::corrupt("idempotency_keys", format!("status {status}"))
                })?,
                body,
            }),
            _ => None,
        };

        Ok(IdempotencyRecord {
            resource_id: row.try_get("resource_id")?,
            response,
        })
    }

    async fn complete_key(&self, scope: &str, key: &str, response: StoredResponse) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET response_status = $1, response_body = $2
            WHERE scope = $3 AND key = $4 AND response_status IS NULL
            "#,
        )
        .bind(i32::from(response.status))
        .bind(response.body)
        .bind(scope)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_keys(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE created_at < $1")
            .bind(to_millis(cutoff))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
