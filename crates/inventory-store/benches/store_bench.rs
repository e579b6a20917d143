use chrono::{Duration, Utc};
use common::{CheckoutId, ReservationId, SkuId};
use criterion::{Criterion, criterion_group, criterion_main};
use inventory_store::{
    EventPayload, InMemoryStore, LedgerBatch, OutboxStore, Reservation, ReservationLine,
    ReservationState, ReservationWrite, StockChange, StockStore, Topic, Version,
};

fn seed(store: &InMemoryStore, rt: &tokio::runtime::Runtime, skus: usize) {
    rt.block_on(async {
        for i in 0..skus {
            store
                .apply_batch(LedgerBatch::new(Utc::now()).with_stock(StockChange {
                    sku_id: SkuId::new(format!("SKU-{i}")),
                    expected_version: None,
                    available: 1_000_000,
                    reserved: 0,
                }))
                .await
                .unwrap();
        }
    });
}

async fn reserve_batch(store: &InMemoryStore, lines: usize) -> LedgerBatch {
    let now = Utc::now();
    let lines_held: Vec<ReservationLine> = (0..lines)
        .map(|i| ReservationLine::new(format!("SKU-{i}"), 1))
        .collect();
    let reservation = Reservation {
        reservation_id: ReservationId::new(),
        checkout_id: CheckoutId::new(),
        lines: lines_held.clone(),
        state: ReservationState::Held,
        created_at: now,
        expires_at: now + Duration::seconds(60),
        terminal_at: None,
    };
    let key = reservation.reservation_id.to_string();

    let mut batch = LedgerBatch::new(now);
    for line in &lines_held {
        let row = store.get_stock(&line.sku_id).await.unwrap().unwrap();
        batch = batch.with_stock(StockChange {
            sku_id: line.sku_id.clone(),
            expected_version: Some(row.version),
            available: row.available - 1,
            reserved: row.reserved + 1,
        });
    }
    batch
        .with_reservation(ReservationWrite::Insert(reservation))
        .with_outbox(
            EventPayload::new(now)
                .lines(lines_held)
                .into_entry(Topic::ReservationHeld, &key)
                .unwrap(),
        )
}

fn bench_create_stock_row(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("store/create_stock_row", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryStore::new();
                store
                    .apply_batch(LedgerBatch::new(Utc::now()).with_stock(StockChange {
                        sku_id: SkuId::new("SKU"),
                        expected_version: None,
                        available: 10,
                        reserved: 0,
                    }))
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_reserve_batch(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    for lines in [1usize, 5, 20] {
        let store = InMemoryStore::new();
        seed(&store, &rt, lines);

        c.bench_function(&format!("store/reserve_batch_{lines}_lines"), |b| {
            b.iter(|| {
                rt.block_on(async {
                    let batch = reserve_batch(&store, lines).await;
                    store.apply_batch(batch).await.unwrap();
                });
            });
        });
    }
}

fn bench_stale_version_rejected(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryStore::new();
    seed(&store, &rt, 1);

    c.bench_function("store/stale_version_rejected", |b| {
        b.iter(|| {
            let batch = LedgerBatch::new(Utc::now()).with_stock(StockChange {
                sku_id: SkuId::new("SKU-0"),
                expected_version: Some(Version::new(-1)),
                available: 0,
                reserved: 0,
            });
            let err = rt.block_on(store.apply_batch(batch)).unwrap_err();
            assert!(err.is_conflict());
        });
    });
}

fn bench_pending_outbox(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryStore::new();
    rt.block_on(async {
        for i in 0..1000 {
            let entry = EventPayload::new(Utc::now())
                .into_entry(Topic::StockReceived, &format!("SKU-{i}"))
                .unwrap();
            store
                .apply_batch(LedgerBatch::new(Utc::now()).with_outbox(entry))
                .await
                .unwrap();
        }
    });

    c.bench_function("store/pending_outbox_100_of_1000", |b| {
        b.iter(|| {
            let pending = rt.block_on(store.pending_outbox(100)).unwrap();
            assert_eq!(pending.len(), 100);
        });
    });
}

criterion_group!(
    benches,
    bench_create_stock_row,
    bench_reserve_batch,
    bench_stale_version_rejected,
    bench_pending_outbox,
);
criterion_main!(benches);
