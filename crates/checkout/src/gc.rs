//! Background purge of finished checkouts and stale idempotency keys.

use std::sync::Arc;
use std::time::Duration;

use common::{Clock, SystemClock};
use inventory_store::{CheckoutStore, IdempotencyStore};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct GcConfig {
    pub tick: Duration,
    /// Terminal checkouts untouched for longer than this are deleted, as
    /// are idempotency keys claimed before it.
    pub retention: chrono::Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            retention: chrono::Duration::hours(24),
        }
    }
}

/// Deletes `DONE`/`FAILED` checkouts and idempotency keys older than the
/// retention window. Live checkouts are never touched.
pub struct CheckoutGc<S> {
    store: S,
    clock: Arc<dyn Clock>,
    config: GcConfig,
}

impl<S: CheckoutStore + IdempotencyStore> CheckoutGc<S> {
    pub fn new(store: S, config: GcConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, config: GcConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Runs one purge and returns how many checkouts were deleted.
    pub async fn tick(&self) -> Result<u64> {
        let cutoff = self.clock.now() - self.config.retention;
        let purged = self.store.purge_checkouts(cutoff).await?;
        if purged > 0 {
            metrics::counter!("checkout_purged_total").increment(purged);
            tracing::info!(purged, "Purged finished checkouts");
        }

        let keys = self.store.purge_keys(cutoff).await?;
        if keys > 0 {
            metrics::counter!("idempotency_keys_purged_total").increment(keys);
            tracing::info!(keys, "Purged idempotency keys");
        }
        Ok(purged)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            retention_secs = self.config.retention.num_seconds(),
            "Checkout GC started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "Checkout GC tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Checkout GC stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{ManualClock, SkuId, UserId};
    use inventory_store::{CartLine, CartSnapshot, CheckoutRecord, CheckoutState, InMemoryStore};

    fn gc(store: &InMemoryStore, clock: &ManualClock) -> CheckoutGc<InMemoryStore> {
        CheckoutGc::with_clock(
            store.clone(),
            GcConfig {
                retention: chrono::Duration::hours(1),
                ..GcConfig::default()
            },
            Arc::new(clock.clone()),
        )
    }

    fn record(now: chrono::DateTime<chrono::Utc>) -> CheckoutRecord {
        CheckoutRecord::new(
            UserId::new(),
            CartSnapshot::new(vec![CartLine {
                sku_id: SkuId::new("A"),
                qty: 1,
                unit_price_cents: 100,
            }]),
            "card",
            None,
            60,
            now,
        )
    }

    #[tokio::test]
    async fn purges_only_expired_terminal_checkouts() {
        let clock = ManualClock::default();
        let store = InMemoryStore::new();
        let gc = gc(&store, &clock);

        let mut done = record(clock.now());
        done.version = store.insert_checkout(&done).await.unwrap();
        done.state = CheckoutState::Done;
        store.save_checkout(&done, Vec::new()).await.unwrap();

        let live = record(clock.now());
        store.insert_checkout(&live).await.unwrap();

        assert_eq!(gc.tick().await.unwrap(), 0);
        clock.advance(chrono::Duration::hours(2));
        assert_eq!(gc.tick().await.unwrap(), 1);
        assert!(store.get_checkout(done.checkout_id).await.unwrap().is_none());
        assert!(store.get_checkout(live.checkout_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn purges_idempotency_keys_past_retention() {
        let clock = ManualClock::default();
        let store = InMemoryStore::new();
        let gc = gc(&store, &clock);

        store
            .claim_key("reserve", "old", "r-1", clock.now())
            .await
            .unwrap();
        clock.advance(chrono::Duration::minutes(90));
        store
            .claim_key("reserve", "new", "r-2", clock.now())
            .await
            .unwrap();

        gc.tick().await.unwrap();
        let old = store.claim_key("reserve", "old", "r-3", clock.now()).await.unwrap();
        assert_eq!(old.resource_id, "r-3");
        let new = store.claim_key("reserve", "new", "r-4", clock.now()).await.unwrap();
        assert_eq!(new.resource_id, "r-2");
    }
}
