//! Outbox dispatcher: drains undispatched entries to the bus.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{Clock, SystemClock};
use inventory_store::{LeaseStore, OutboxStore};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::bus::EventBus;
use crate::error::{DispatchError, Result};

/// Lease that keeps the dispatcher single-instance.
pub const DISPATCHER_LEASE: &str = "outbox-dispatcher";

/// Configuration for the outbox dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub tick: Duration,
    /// Maximum entries read per tick.
    pub batch_size: usize,
    pub lease_ttl: chrono::Duration,
    /// Lease holder identity, unique per process.
    pub holder: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(500),
            batch_size: 100,
            lease_ttl: chrono::Duration::seconds(5),
            holder: "local".to_string(),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// False if another holder owns the lease and the tick was skipped.
    pub leased: bool,
    pub published: usize,
    pub failed: usize,
    /// Entries held back because an earlier entry with the same key failed.
    pub deferred: usize,
}

/// Publishes outbox entries in `seq` order and marks them dispatched.
///
/// Delivery is at-least-once: an entry is marked only after the bus
/// accepted it, so a crash in between republishes it. When an entry fails,
/// every later entry with the same key waits for the next tick, which
/// keeps per-key order; entries with other keys still go out.
pub struct OutboxDispatcher<S, B> {
    store: S,
    bus: B,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
}

impl<S, B> OutboxDispatcher<S, B>
where
    S: OutboxStore + LeaseStore,
    B: EventBus,
{
    pub fn new(store: S, bus: B, config: DispatcherConfig) -> Self {
        Self::with_clock(store, bus, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: S,
        bus: B,
        config: DispatcherConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            config,
        }
    }

    /// Runs one pass over the pending entries.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self) -> Result<DispatchReport> {
        let now = self.clock.now();
        let leased = self
            .store
            .try_acquire_lease(
                DISPATCHER_LEASE,
                &self.config.holder,
                self.config.lease_ttl,
                now,
            )
            .await?;
        if !leased {
            tracing::debug!("Dispatcher lease held elsewhere, skipping tick");
            return Ok(DispatchReport::default());
        }

        let mut report = DispatchReport {
            leased: true,
            ..DispatchReport::default()
        };
        let pending = self.store.pending_outbox(self.config.batch_size).await?;
        let mut blocked: HashSet<String> = HashSet::new();
        let mut delivered = Vec::with_capacity(pending.len());

        for entry in &pending {
            if blocked.contains(&entry.key) {
                report.deferred += 1;
                continue;
            }
            match self.bus.publish(entry).await {
                Ok(()) => {
                    delivered.push(entry.seq);
                    report.published += 1;
                }
                Err(source) => {
                    let error = DispatchError::Publish {
                        seq: entry.seq,
                        source,
                    };
                    tracing::warn!(
                        key = %entry.key,
                        topic = entry.topic.as_str(),
                        error = %error,
                        "Publish failed, will retry next tick"
                    );
                    metrics::counter!("outbox_publish_failures_total").increment(1);
                    blocked.insert(entry.key.clone());
                    report.failed += 1;
                }
            }
        }

        self.store
            .mark_dispatched(&delivered, self.clock.now())
            .await?;
        metrics::counter!("outbox_dispatched_total").increment(delivered.len() as u64);

        if report.published > 0 || report.failed > 0 {
            tracing::debug!(
                published = report.published,
                failed = report.failed,
                deferred = report.deferred,
                "Dispatch tick complete"
            );
        }
        Ok(report)
    }

    /// Ticks until `shutdown` flips to true or its sender is dropped, runs
    /// one last pass to drain what is pending, then gives the lease up.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            tick_ms = self.config.tick.as_millis() as u64,
            "Outbox dispatcher started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "Dispatch tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.tick().await {
            tracing::warn!(error = %e, "Final dispatch pass failed");
        }
        if let Err(e) = self
            .store
            .release_lease(DISPATCHER_LEASE, &self.config.holder)
            .await
        {
            tracing::warn!(error = %e, "Failed to release dispatcher lease");
        }
        tracing::info!("Outbox dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryEventBus;
    use chrono::Utc;
    use inventory_store::{EventPayload, InMemoryStore, LedgerBatch, StockStore, Topic};

    async fn append(store: &InMemoryStore, topic: Topic, key: &str) {
        let entry = EventPayload::new(Utc::now()).into_entry(topic, key).unwrap();
        store
            .apply_batch(LedgerBatch::new(Utc::now()).with_outbox(entry))
            .await
            .unwrap();
    }

    fn dispatcher(
        store: &InMemoryStore,
        bus: &InMemoryEventBus,
        holder: &str,
    ) -> OutboxDispatcher<InMemoryStore, InMemoryEventBus> {
        OutboxDispatcher::new(
            store.clone(),
            bus.clone(),
            DispatcherConfig {
                holder: holder.to_string(),
                ..DispatcherConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn publishes_in_seq_order_and_marks() {
        let store = InMemoryStore::new();
        let bus = InMemoryEventBus::new();
        append(&store, Topic::ReservationHeld, "r1").await;
        append(&store, Topic::ReservationHeld, "r2").await;
        append(&store, Topic::ReservationCommitted, "r1").await;

        let report = dispatcher(&store, &bus, "n1").tick().await.unwrap();
        assert_eq!(report.published, 3);

        let seqs: Vec<_> = bus.published().await.iter().map(|p| p.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(store.pending_outbox(10).await.unwrap().is_empty());

        // Nothing is sent twice once marked
        dispatcher(&store, &bus, "n1").tick().await.unwrap();
        assert_eq!(bus.published().await.len(), 3);
    }

    #[tokio::test]
    async fn failed_key_is_held_back_others_continue() {
        let store = InMemoryStore::new();
        let bus = InMemoryEventBus::new();
        append(&store, Topic::ReservationHeld, "r1").await;
        append(&store, Topic::ReservationHeld, "r2").await;
        append(&store, Topic::ReservationReleased, "r1").await;

        bus.fail_key("r1").await;
        let dispatcher = dispatcher(&store, &bus, "n1");
        let report = dispatcher.tick().await.unwrap();
        assert_eq!(
            report,
            DispatchReport {
                leased: true,
                published: 1,
                failed: 1,
                deferred: 1,
            }
        );
        assert_eq!(store.pending_outbox(10).await.unwrap().len(), 2);

        bus.heal_key("r1").await;
        dispatcher.tick().await.unwrap();
        let topics: Vec<_> = bus
            .published_for("r1")
            .await
            .iter()
            .map(|p| p.topic)
            .collect();
        assert_eq!(
            topics,
            vec![Topic::ReservationHeld, Topic::ReservationReleased]
        );
        assert!(store.pending_outbox(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn only_lease_holder_dispatches() {
        let store = InMemoryStore::new();
        let bus = InMemoryEventBus::new();
        append(&store, Topic::StockReceived, "A").await;

        let first = dispatcher(&store, &bus, "n1");
        let second = dispatcher(&store, &bus, "n2");
        assert!(first.tick().await.unwrap().leased);
        append(&store, Topic::StockReceived, "A").await;
        let skipped = second.tick().await.unwrap();
        assert!(!skipped.leased);
        assert_eq!(bus.published().await.len(), 1);
    }

    #[tokio::test]
    async fn run_drains_before_stopping() {
        let store = InMemoryStore::new();
        let bus = InMemoryEventBus::new();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(dispatcher(&store, &bus, "n1").run(rx));

        append(&store, Topic::OrderCreated, "c1").await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(bus.published().await.len(), 1);
        assert!(store.pending_outbox(10).await.unwrap().is_empty());
    }
}
