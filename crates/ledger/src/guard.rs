//! Per-SKU serialization points.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use common::SkuId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Table of per-SKU mutexes.
///
/// Every mutation of a stock row runs while holding that SKU's guard, so
/// writes to one SKU are serialized within the process. Multi-SKU callers
/// must go through [`SkuGuards::lock_all`], which locks in ascending
/// `sku_id` order.
///
/// Entries only live while someone holds or waits on them; the last
/// release removes the SKU from the table.
#[derive(Default)]
pub struct SkuGuards {
    table: Mutex<HashMap<SkuId, Arc<AsyncMutex<()>>>>,
}

/// Guards held for the duration of one ledger operation.
///
/// Dropping it releases every SKU.
pub struct HeldGuards<'a> {
    owner: &'a SkuGuards,
    guards: Vec<(SkuId, OwnedMutexGuard<()>)>,
}

impl HeldGuards<'_> {
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

impl Drop for HeldGuards<'_> {
    fn drop(&mut self) {
        let released: Vec<SkuId> = self
            .guards
            .drain(..)
            .map(|(sku, guard)| {
                drop(guard);
                sku
            })
            .collect();
        self.owner.evict_idle(released);
    }
}

impl SkuGuards {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<SkuId, Arc<AsyncMutex<()>>>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handle(&self, sku: &SkuId) -> Arc<AsyncMutex<()>> {
        self.table()
            .entry(sku.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Drops the entries nobody holds or waits on. Handles are only cloned
    /// under the table lock, so a count of one cannot race a new locker.
    fn evict_idle(&self, skus: Vec<SkuId>) {
        let mut table = self.table();
        for sku in skus {
            if table.get(&sku).is_some_and(|m| Arc::strong_count(m) == 1) {
                table.remove(&sku);
            }
        }
    }

    /// Locks the given SKUs in lexical order, deduplicated.
    pub async fn lock_all<'s, I>(&self, skus: I) -> HeldGuards<'_>
    where
        I: IntoIterator<Item = &'s SkuId>,
    {
        let mut ordered: Vec<&SkuId> = skus.into_iter().collect();
        ordered.sort();
        ordered.dedup();

        let mut held = HeldGuards {
            owner: self,
            guards: Vec::with_capacity(ordered.len()),
        };
        for sku in ordered {
            let handle = self.handle(sku);
            let guard = handle.lock_owned().await;
            held.guards.push((sku.clone(), guard));
        }
        held
    }

    /// Number of SKUs currently held or waited on.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn dedups_and_locks_each_sku_once() {
        let guards = SkuGuards::new();
        let a = SkuId::new("A");
        let b = SkuId::new("B");
        let held = guards.lock_all([&b, &a, &b]).await;
        assert_eq!(held.len(), 2);
        assert_eq!(guards.len(), 2);
        drop(held);
        assert!(guards.is_empty());
    }

    #[tokio::test]
    async fn released_skus_leave_the_table() {
        let guards = SkuGuards::new();
        for i in 0..10_000 {
            let sku = SkuId::new(format!("SKU-{i}"));
            let _held = guards.lock_all([&sku]).await;
            assert_eq!(guards.len(), 1);
        }
        assert!(guards.is_empty());
    }

    #[tokio::test]
    async fn waiter_keeps_entry_until_it_releases() {
        let guards = Arc::new(SkuGuards::new());
        let a = SkuId::new("A");
        let held = guards.lock_all([&a]).await;

        let waiter = {
            let guards = guards.clone();
            tokio::spawn(async move {
                let a = SkuId::new("A");
                let _held = guards.lock_all([&a]).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(held);
        assert_eq!(guards.len(), 1);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(guards.is_empty());
    }

    #[tokio::test]
    async fn second_locker_waits_for_release() {
        let guards = Arc::new(SkuGuards::new());
        let a = SkuId::new("A");
        let held = guards.lock_all([&a]).await;

        let contender = {
            let guards = guards.clone();
            tokio::spawn(async move {
                let a = SkuId::new("A");
                let _held = guards.lock_all([&a]).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn opposite_orders_do_not_deadlock() {
        let guards = Arc::new(SkuGuards::new());
        let mut tasks = Vec::new();
        for i in 0..50 {
            let guards = guards.clone();
            tasks.push(tokio::spawn(async move {
                let a = SkuId::new("A");
                let b = SkuId::new("B");
                let _held = if i % 2 == 0 {
                    guards.lock_all([&a, &b]).await
                } else {
                    guards.lock_all([&b, &a]).await
                };
                tokio::task::yield_now().await;
            }));
        }
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
