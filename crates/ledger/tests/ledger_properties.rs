//! Property tests for the ledger's counter invariants.

use std::collections::HashMap;

use chrono::Duration;
use common::{CheckoutId, ReservationId, SkuId};
use inventory_store::{InMemoryStore, OutboxStore, ReservationLine, ReservationState, Topic};
use ledger::{ReleaseCause, ReserveOutcome, ReserveRequest, StockLedger};
use proptest::prelude::*;

const SKUS: [&str; 3] = ["A", "B", "C"];

#[derive(Debug, Clone)]
enum Op {
    Reserve(Vec<(usize, u32)>),
    Commit(usize),
    Rollback(usize),
    Expire(usize),
    Receive(usize, u32),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => prop::collection::vec((0..SKUS.len(), 1u32..4), 1..3).prop_map(Op::Reserve),
        2 => (0usize..16).prop_map(Op::Commit),
        2 => (0usize..16).prop_map(Op::Rollback),
        1 => (0usize..16).prop_map(Op::Expire),
        1 => (0..SKUS.len(), 1u32..5).prop_map(|(s, q)| Op::Receive(s, q)),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// After any sequence of operations:
    /// - counters are non-negative
    /// - `reserved` equals the sum of HELD lines per SKU
    /// - `available + reserved` equals receipts minus committed quantity
    /// - every terminal reservation has exactly one terminal event
    #[test]
    fn counters_match_reservations(
        initial in prop::collection::vec(0u32..6, SKUS.len()),
        ops in prop::collection::vec(op(), 1..40),
    ) {
        runtime().block_on(async {
            let store = InMemoryStore::new();
            let ledger = StockLedger::new(store.clone());
            let mut received: HashMap<&str, i64> = HashMap::new();
            let mut ids: Vec<ReservationId> = Vec::new();

            for (sku, qty) in SKUS.iter().zip(&initial) {
                if *qty > 0 {
                    ledger.receive_stock(&SkuId::new(*sku), *qty).await.unwrap();
                    *received.entry(*sku).or_default() += i64::from(*qty);
                }
            }

            for op in ops {
                match op {
                    Op::Reserve(raw) => {
                        let mut lines: Vec<ReservationLine> = Vec::new();
                        for (sku, qty) in raw {
                            if !lines.iter().any(|l| l.sku_id.as_str() == SKUS[sku]) {
                                lines.push(ReservationLine::new(SKUS[sku], qty));
                            }
                        }
                        let id = ReservationId::new();
                        let outcome = ledger
                            .reserve(ReserveRequest::new(id, CheckoutId::new(), lines, Duration::seconds(60)))
                            .await
                            .unwrap();
                        if matches!(outcome, ReserveOutcome::Held(_)) {
                            ids.push(id);
                        }
                    }
                    Op::Commit(i) if !ids.is_empty() => {
                        ledger.commit(ids[i % ids.len()]).await.unwrap();
                    }
                    Op::Rollback(i) if !ids.is_empty() => {
                        ledger.rollback(ids[i % ids.len()], ReleaseCause::Rollback).await.unwrap();
                    }
                    Op::Expire(i) if !ids.is_empty() => {
                        ledger.rollback(ids[i % ids.len()], ReleaseCause::Expiry).await.unwrap();
                    }
                    Op::Receive(sku, qty) => {
                        ledger.receive_stock(&SkuId::new(SKUS[sku]), qty).await.unwrap();
                        *received.entry(SKUS[sku]).or_default() += i64::from(qty);
                    }
                    _ => {}
                }
            }

            let mut held: HashMap<String, i64> = HashMap::new();
            let mut committed: HashMap<String, i64> = HashMap::new();
            for reservation in store.all_reservations().await {
                let bucket = match reservation.state {
                    ReservationState::Held => &mut held,
                    ReservationState::Committed => &mut committed,
                    _ => continue,
                };
                for line in &reservation.lines {
                    *bucket.entry(line.sku_id.to_string()).or_default() += i64::from(line.qty);
                }
            }

            for row in store.all_stock().await {
                let sku = row.sku_id.as_str();
                assert!(row.available >= 0 && row.reserved >= 0);
                assert_eq!(row.reserved, held.get(sku).copied().unwrap_or(0));
                assert_eq!(
                    row.on_hand(),
                    received.get(sku).copied().unwrap_or(0) - committed.get(sku).copied().unwrap_or(0)
                );
            }

            let events = store.outbox_since(0, 10_000).await.unwrap();
            for reservation in store.all_reservations().await {
                let key = reservation.reservation_id.to_string();
                let count = |topic: Topic| events.iter().filter(|e| e.key == key && e.topic == topic).count();
                assert_eq!(count(Topic::ReservationHeld), 1);
                let terminal = count(Topic::ReservationCommitted)
                    + count(Topic::ReservationReleased)
                    + count(Topic::ReservationExpired);
                assert_eq!(terminal, usize::from(reservation.state.is_terminal()));
            }
        });
    }

    /// N concurrent reserves against one SKU never hold more than its stock.
    #[test]
    fn concurrent_holds_never_exceed_stock(
        stock in 0u32..20,
        asks in prop::collection::vec(1u32..6, 1..12),
    ) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let ledger = StockLedger::new(InMemoryStore::new());
            let sku = SkuId::new("A");
            if stock > 0 {
                ledger.receive_stock(&sku, stock).await.unwrap();
            }

            let mut tasks = Vec::new();
            for qty in asks {
                let ledger = ledger.clone();
                tasks.push(tokio::spawn(async move {
                    let outcome = ledger
                        .reserve(ReserveRequest::new(
                            ReservationId::new(),
                            CheckoutId::new(),
                            vec![ReservationLine::new("A", qty)],
                            Duration::seconds(60),
                        ))
                        .await
                        .unwrap();
                    if outcome.is_held() { i64::from(qty) } else { 0 }
                }));
            }

            let mut total = 0;
            for task in tasks {
                total += task.await.unwrap();
            }
            assert!(total <= i64::from(stock));

            let level = ledger.query(&sku).await.unwrap();
            assert_eq!(level.reserved, total);
            assert_eq!(level.available, i64::from(stock) - total);
        });
    }
}
