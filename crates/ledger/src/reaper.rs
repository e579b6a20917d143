//! Background release of reservations whose TTL has passed.

use std::time::Duration;

use inventory_store::{LeaseStore, StockStore};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::error::Result;
use crate::ledger::StockLedger;
use crate::outcome::{ReleaseCause, RollbackOutcome};

/// Lease that keeps the reaper single-instance.
pub const REAPER_LEASE: &str = "expiry-reaper";

/// Configuration for the expiry reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub tick: Duration,
    /// Maximum reservations released per tick.
    pub batch_size: usize,
    pub lease_ttl: chrono::Duration,
    /// Lease holder identity, unique per process.
    pub holder: String,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            batch_size: 100,
            lease_ttl: chrono::Duration::seconds(5),
            holder: "local".to_string(),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// False if another holder owns the lease and the tick was skipped.
    pub leased: bool,
    pub expired: usize,
    /// Reservations that left `HELD` between the scan and the release.
    pub skipped: usize,
    pub failed: usize,
}

/// Releases `HELD` reservations whose `expires_at` has passed.
///
/// Each release goes through [`StockLedger::rollback`] with
/// [`ReleaseCause::Expiry`], so the reservation ends `EXPIRED` and the
/// outbox gets `reservation.expired`.
pub struct ExpiryReaper<S> {
    ledger: StockLedger<S>,
    config: ReaperConfig,
}

impl<S> ExpiryReaper<S>
where
    S: StockStore + LeaseStore,
{
    pub fn new(ledger: StockLedger<S>, config: ReaperConfig) -> Self {
        Self { ledger, config }
    }

    /// Runs one scan. Failures on one reservation do not stop the others.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self) -> Result<ReapReport> {
        let now = self.ledger.clock().now();
        let store = self.ledger.store();

        let leased = store
            .try_acquire_lease(
                REAPER_LEASE,
                &self.config.holder,
                self.config.lease_ttl,
                now,
            )
            .await?;
        if !leased {
            tracing::debug!("Reaper lease held elsewhere, skipping tick");
            return Ok(ReapReport::default());
        }

        let mut report = ReapReport {
            leased: true,
            ..ReapReport::default()
        };
        let due = store.due_reservations(now, self.config.batch_size).await?;

        for reservation in due {
            let id = reservation.reservation_id;
            match self.ledger.rollback(id, ReleaseCause::Expiry).await {
                Ok(RollbackOutcome::Ok) => {
                    report.expired += 1;
                    metrics::counter!("reaper_expired_total").increment(1);
                }
                Ok(outcome) => {
                    report.skipped += 1;
                    tracing::debug!(reservation_id = %id, outcome = outcome.as_str(), "Reservation no longer held");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(reservation_id = %id, error = %e, "Failed to expire reservation");
                }
            }
        }

        if report.expired > 0 || report.failed > 0 {
            tracing::info!(
                expired = report.expired,
                skipped = report.skipped,
                failed = report.failed,
                "Reaper tick complete"
            );
        }
        Ok(report)
    }

    /// Ticks until `shutdown` flips to true or its sender is dropped, then
    /// gives the lease up.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(tick_ms = self.config.tick.as_millis() as u64, "Expiry reaper started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "Reaper tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self
            .ledger
            .store()
            .release_lease(REAPER_LEASE, &self.config.holder)
            .await
        {
            tracing::warn!(error = %e, "Failed to release reaper lease");
        }
        tracing::info!("Expiry reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::ReserveRequest;
    use common::{CheckoutId, Clock, ManualClock, ReservationId, SkuId};
    use inventory_store::{InMemoryStore, ReservationLine, ReservationState};
    use std::sync::Arc;

    fn setup(holder: &str) -> (ExpiryReaper<InMemoryStore>, StockLedger<InMemoryStore>, ManualClock) {
        let clock = ManualClock::default();
        let ledger = StockLedger::with_clock(InMemoryStore::new(), Arc::new(clock.clone()));
        let reaper = ExpiryReaper::new(
            ledger.clone(),
            ReaperConfig {
                holder: holder.to_string(),
                ..ReaperConfig::default()
            },
        );
        (reaper, ledger, clock)
    }

    async fn hold(ledger: &StockLedger<InMemoryStore>, secs: i64) -> ReservationId {
        let id = ReservationId::new();
        ledger
            .reserve(ReserveRequest::new(
                id,
                CheckoutId::new(),
                vec![ReservationLine::new("A", 1)],
                chrono::Duration::seconds(secs),
            ))
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn expires_only_due_reservations() {
        let (reaper, ledger, clock) = setup("node-1");
        ledger.receive_stock(&SkuId::new("A"), 10).await.unwrap();
        let short = hold(&ledger, 1).await;
        let long = hold(&ledger, 60).await;

        clock.advance(chrono::Duration::seconds(2));
        let report = reaper.tick().await.unwrap();
        assert!(report.leased);
        assert_eq!(report.expired, 1);

        let short = ledger.reservation(short).await.unwrap().unwrap();
        assert_eq!(short.state, ReservationState::Expired);
        let long = ledger.reservation(long).await.unwrap().unwrap();
        assert_eq!(long.state, ReservationState::Held);

        let level = ledger.query(&SkuId::new("A")).await.unwrap();
        assert_eq!((level.available, level.reserved), (9, 1));

        // Nothing left to do
        assert_eq!(reaper.tick().await.unwrap().expired, 0);
    }

    #[tokio::test]
    async fn second_reaper_skips_while_lease_held() {
        let (first, ledger, clock) = setup("node-1");
        let second = ExpiryReaper::new(
            ledger.clone(),
            ReaperConfig {
                holder: "node-2".to_string(),
                ..ReaperConfig::default()
            },
        );
        ledger.receive_stock(&SkuId::new("A"), 10).await.unwrap();
        hold(&ledger, 1).await;
        clock.advance(chrono::Duration::seconds(2));

        assert!(first.tick().await.unwrap().leased);
        assert!(!second.tick().await.unwrap().leased);

        clock.advance(chrono::Duration::seconds(10));
        assert!(second.tick().await.unwrap().leased);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_and_releases_lease() {
        let (reaper, ledger, clock) = setup("node-1");
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(reaper.run(rx));

        tokio::task::yield_now().await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        let acquired = ledger
            .store()
            .try_acquire_lease(REAPER_LEASE, "node-2", chrono::Duration::seconds(5), clock.now())
            .await
            .unwrap();
        assert!(acquired);
    }
}
