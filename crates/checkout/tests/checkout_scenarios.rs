//! End-to-end checkout sagas against the in-memory store and peers.

use std::time::Duration;

use checkout::{
    CheckoutCoordinator, CheckoutError, CoordinatorConfig, InMemoryCartService,
    InMemoryOrderService, InMemoryPaymentService, RetryPolicy, StartCheckout, StepTimeouts,
};
use common::{SkuId, UserId};
use inventory_store::{
    CartLine, CartSnapshot, CheckoutRecord, CheckoutState, CheckoutStore, EventPayload,
    InMemoryStore, OutboxStore, ReservationState, Topic,
};
use ledger::{ReserveRequest, StockLedger};

type Coordinator = CheckoutCoordinator<
    InMemoryStore,
    InMemoryPaymentService,
    InMemoryOrderService,
    InMemoryCartService,
>;

struct World {
    store: InMemoryStore,
    ledger: StockLedger<InMemoryStore>,
    payment: InMemoryPaymentService,
    orders: InMemoryOrderService,
    cart: InMemoryCartService,
}

impl World {
    async fn new(stock: u32) -> Self {
        let store = InMemoryStore::new();
        let ledger = StockLedger::new(store.clone());
        ledger.receive_stock(&SkuId::new("A"), stock).await.unwrap();
        Self {
            store,
            ledger,
            payment: InMemoryPaymentService::new(),
            orders: InMemoryOrderService::new(),
            cart: InMemoryCartService::new(),
        }
    }

    fn coordinator(&self, config: CoordinatorConfig) -> Coordinator {
        CheckoutCoordinator::new(
            self.ledger.clone(),
            self.payment.clone(),
            self.orders.clone(),
            self.cart.clone(),
            config,
        )
    }

    async fn counters(&self) -> (i64, i64) {
        let level = self.ledger.query(&SkuId::new("A")).await.unwrap();
        (level.available, level.reserved)
    }

    async fn events(&self, topic: Topic) -> Vec<EventPayload> {
        self.store
            .outbox_since(0, 1000)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.topic == topic)
            .map(|e| EventPayload::from_bytes(&e.payload).unwrap())
            .collect()
    }
}

fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        retry: RetryPolicy::immediate(6),
        ..CoordinatorConfig::default()
    }
}

fn cart(qty: u32) -> CartSnapshot {
    CartSnapshot::new(vec![CartLine {
        sku_id: SkuId::new("A"),
        qty,
        unit_price_cents: 2500,
    }])
}

async fn wait_terminal(coordinator: &Coordinator, record: &CheckoutRecord) -> CheckoutRecord {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let current = coordinator.get_checkout(record.checkout_id).await.unwrap();
            if current.state.is_terminal() {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("checkout did not finish")
}

#[tokio::test]
async fn transient_payment_failure_is_retried_to_done() {
    let world = World::new(3).await;
    world.payment.fail_next_charges(1);
    let coordinator = world.coordinator(fast_config());

    let record = coordinator
        .create_checkout(StartCheckout::new(UserId::new(), "card").with_cart(cart(2)))
        .await
        .unwrap();
    let done = coordinator.drive(record.checkout_id).await.unwrap();

    assert_eq!(done.state, CheckoutState::Done);
    assert_eq!(world.payment.charge_calls(), 2);
    assert_eq!(world.payment.active_payments(), 1);
    // Committed, not rolled back
    assert_eq!(world.counters().await, (1, 0));
    let reservation = world
        .ledger
        .reservation(done.reservation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reservation.state, ReservationState::Committed);

    let created = world.events(Topic::OrderCreated).await;
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].checkout_id, Some(done.checkout_id));
    assert_eq!(created[0].order_id, done.order_id);
}

#[tokio::test]
async fn terminal_payment_failure_rolls_back_and_emits_order_failed() {
    let world = World::new(3).await;
    world.payment.set_decline(true);
    let coordinator = world.coordinator(fast_config());

    let record = coordinator
        .create_checkout(StartCheckout::new(UserId::new(), "card").with_cart(cart(2)))
        .await
        .unwrap();
    let failed = coordinator.drive(record.checkout_id).await.unwrap();

    assert_eq!(failed.state, CheckoutState::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("payment_failed:INVALID"));
    assert_eq!(world.payment.charge_calls(), 1);
    assert_eq!(world.counters().await, (3, 0));

    let released = world.events(Topic::ReservationReleased).await;
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].reservation_id, Some(failed.reservation_id));

    let order_failed = world.events(Topic::OrderFailed).await;
    assert_eq!(order_failed.len(), 1);
    assert_eq!(order_failed[0].checkout_id, Some(failed.checkout_id));
    assert_eq!(order_failed[0].reason.as_deref(), Some("payment_failed:INVALID"));
    assert!(world.events(Topic::OrderCreated).await.is_empty());
}

#[tokio::test]
async fn payment_deadline_fails_the_step_and_compensates() {
    let world = World::new(3).await;
    world
        .payment
        .set_charge_delay(Some(Duration::from_millis(200)));
    let coordinator = world.coordinator(CoordinatorConfig {
        retry: RetryPolicy::immediate(2),
        timeouts: StepTimeouts {
            payment: Duration::from_millis(20),
            ..StepTimeouts::default()
        },
        ..CoordinatorConfig::default()
    });

    let record = coordinator
        .create_checkout(StartCheckout::new(UserId::new(), "card").with_cart(cart(1)))
        .await
        .unwrap();
    let failed = coordinator.drive(record.checkout_id).await.unwrap();

    assert_eq!(failed.state, CheckoutState::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("payment_failed:TIMEOUT"));
    assert_eq!(world.payment.active_payments(), 0);
    assert_eq!(world.counters().await, (3, 0));
}

#[tokio::test]
async fn started_checkout_runs_in_background() {
    let world = World::new(3).await;
    let user = UserId::new();
    world.cart.set_cart(user, cart(1));
    let coordinator = world.coordinator(fast_config());

    let record = coordinator
        .start_checkout(StartCheckout::new(user, "card").with_address("1 Main St"))
        .await
        .unwrap();
    let done = wait_terminal(&coordinator, &record).await;

    assert_eq!(done.state, CheckoutState::Done);
    assert!(world.cart.cart(user).is_empty());
    let order = world.orders.order(done.order_id.as_deref().unwrap()).unwrap();
    assert_eq!(order.address.as_deref(), Some("1 Main St"));

    // The user is free to check out again
    world.cart.set_cart(user, cart(1));
    assert!(
        coordinator
            .create_checkout(StartCheckout::new(user, "card"))
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn one_active_checkout_per_user() {
    let world = World::new(3).await;
    let coordinator = world.coordinator(fast_config());
    let user = UserId::new();

    coordinator
        .create_checkout(StartCheckout::new(user, "card").with_cart(cart(1)))
        .await
        .unwrap();
    let err = coordinator
        .create_checkout(StartCheckout::new(user, "card").with_cart(cart(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, CheckoutError::InProgress { .. }));

    // Another user is unaffected
    assert!(
        coordinator
            .create_checkout(StartCheckout::new(UserId::new(), "card").with_cart(cart(1)))
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn admission_bucket_rejects_when_empty() {
    let world = World::new(10).await;
    let mut config = fast_config();
    config.admission.capacity = 1;
    config.admission.refill_per_sec = 0.0;
    let coordinator = world.coordinator(config);

    coordinator
        .create_checkout(StartCheckout::new(UserId::new(), "card").with_cart(cart(1)))
        .await
        .unwrap();
    let err = coordinator
        .create_checkout(StartCheckout::new(UserId::new(), "card").with_cart(cart(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, CheckoutError::Overloaded));
    assert_eq!(err.code(), "UNAVAILABLE");
}

#[tokio::test]
async fn cancel_after_stock_held_releases_stock() {
    let world = World::new(3).await;
    let coordinator = world.coordinator(fast_config());
    let record = coordinator
        .create_checkout(StartCheckout::new(UserId::new(), "card").with_cart(cart(2)))
        .await
        .unwrap();

    // Simulate a driver that stopped right after holding stock
    let mut held = record.clone();
    world
        .ledger
        .reserve(ReserveRequest::new(
            held.reservation_id,
            held.checkout_id,
            held.cart.reservation_lines(),
            chrono::Duration::seconds(60),
        ))
        .await
        .unwrap();
    held.state = CheckoutState::StockHeld;
    world.store.save_checkout(&held, Vec::new()).await.unwrap();
    assert_eq!(world.counters().await, (1, 2));

    coordinator.cancel_checkout(record.checkout_id).await.unwrap();
    let failed = wait_terminal(&coordinator, &record).await;

    assert_eq!(failed.state, CheckoutState::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("cancelled"));
    assert_eq!(world.payment.charge_calls(), 0);
    assert_eq!(world.counters().await, (3, 0));
}

#[tokio::test]
async fn resume_picks_up_after_crash_mid_charge() {
    let world = World::new(3).await;
    let record = world
        .coordinator(fast_config())
        .create_checkout(StartCheckout::new(UserId::new(), "card").with_cart(cart(1)))
        .await
        .unwrap();

    // State as left by a process that died with the charge in flight
    let mut stuck = record.clone();
    world
        .ledger
        .reserve(ReserveRequest::new(
            stuck.reservation_id,
            stuck.checkout_id,
            stuck.cart.reservation_lines(),
            chrono::Duration::seconds(60),
        ))
        .await
        .unwrap();
    stuck.state = CheckoutState::StockHeld;
    stuck.pending_step = Some("charge".to_string());
    world.store.save_checkout(&stuck, Vec::new()).await.unwrap();

    let restarted = world.coordinator(fast_config());
    assert_eq!(restarted.resume_incomplete().await.unwrap(), 1);

    let done = restarted.get_checkout(record.checkout_id).await.unwrap();
    assert_eq!(done.state, CheckoutState::Done);
    assert_eq!(world.payment.active_payments(), 1);
    assert_eq!(world.counters().await, (2, 0));
    assert_eq!(restarted.resume_incomplete().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_during_active_charge_refunds_and_releases() {
    let world = World::new(3).await;
    world
        .payment
        .set_charge_delay(Some(Duration::from_millis(200)));
    let coordinator = world.coordinator(fast_config());

    let record = coordinator
        .start_checkout(StartCheckout::new(UserId::new(), "card").with_cart(cart(2)))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let current = coordinator.get_checkout(record.checkout_id).await.unwrap();
            if current.pending_step.as_deref() == Some("charge") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("charge did not start");
    assert_eq!(world.counters().await, (1, 2));

    // The background driver is still inside the charge
    let flagged = tokio::time::timeout(
        Duration::from_secs(5),
        coordinator.cancel_checkout(record.checkout_id),
    )
    .await
    .expect("cancel did not return while the driver was running")
    .unwrap();
    assert!(flagged.cancel_requested);
    assert_eq!(flagged.state, CheckoutState::StockHeld);

    let failed = wait_terminal(&coordinator, &record).await;
    assert_eq!(failed.state, CheckoutState::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("cancelled"));
    assert_eq!(world.payment.charge_calls(), 1);
    assert_eq!(world.payment.active_payments(), 0);
    assert_eq!(world.counters().await, (3, 0));

    let order_failed = world.events(Topic::OrderFailed).await;
    assert_eq!(order_failed.len(), 1);
    assert_eq!(order_failed[0].reason.as_deref(), Some("cancelled"));
    assert_eq!(world.events(Topic::ReservationReleased).await.len(), 1);
    assert!(world.events(Topic::OrderCreated).await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checkouts_for_one_user_admit_exactly_one() {
    let world = World::new(50).await;
    let coordinator = world.coordinator(fast_config());
    let user = UserId::new();

    let attempts: Vec<_> = (0..16)
        .map(|_| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .create_checkout(StartCheckout::new(user, "card").with_cart(cart(1)))
                    .await
            })
        })
        .collect();

    let mut admitted = Vec::new();
    for attempt in attempts {
        let result = tokio::time::timeout(Duration::from_secs(5), attempt)
            .await
            .expect("create_checkout hung")
            .unwrap();
        match result {
            Ok(record) => admitted.push(record),
            Err(err) => assert!(
                matches!(err, CheckoutError::InProgress { .. }),
                "unexpected error: {err}"
            ),
        }
    }

    assert_eq!(admitted.len(), 1);
    let active = world
        .store
        .active_checkout_for_user(user)
        .await
        .unwrap();
    assert_eq!(active, Some(admitted[0].checkout_id));
}
