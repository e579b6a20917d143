//! Checkout coordinator: drives the checkout saga.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{CheckoutId, Clock, ReservationId, UserId};
use futures_util::future::join_all;
use inventory_store::{
    CartSnapshot, CheckoutRecord, CheckoutState, CheckoutStore, EventPayload, NewOutboxEntry,
    ReservationState, StockStore, Topic,
};
use ledger::{ReleaseCause, ReserveOutcome, ReserveRequest, RollbackOutcome, StockLedger};

use crate::admission::Admission;
use crate::config::CoordinatorConfig;
use crate::error::{CheckoutError, PeerError, Result};
use crate::retry::retry_with_backoff;
use crate::services::{CartService, OrderService, PaymentService};
use crate::step::Step;

/// Longest reservation TTL a checkout may ask for.
pub const MAX_TTL_SECS: u64 = 7 * 24 * 3600;

/// Failure noted when compensation finds the reservation already committed.
pub const REPAIR_REASON: &str = "reservation_needs_manual_repair";

/// A request to start a checkout.
#[derive(Debug, Clone)]
pub struct StartCheckout {
    /// Chosen by the caller so a replayed request maps to the same checkout.
    pub checkout_id: CheckoutId,
    pub user_id: UserId,
    /// `None` fetches the cart from the cart service.
    pub cart: Option<CartSnapshot>,
    pub payment_method: String,
    pub shipping_address: Option<String>,
    /// `None` uses the configured default.
    pub ttl_secs: Option<u64>,
}

impl StartCheckout {
    pub fn new(user_id: UserId, payment_method: impl Into<String>) -> Self {
        Self {
            checkout_id: CheckoutId::new(),
            user_id,
            cart: None,
            payment_method: payment_method.into(),
            shipping_address: None,
            ttl_secs: None,
        }
    }

    pub fn with_id(mut self, checkout_id: CheckoutId) -> Self {
        self.checkout_id = checkout_id;
        self
    }

    pub fn with_cart(mut self, cart: CartSnapshot) -> Self {
        self.cart = Some(cart);
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.shipping_address = Some(address.into());
        self
    }

    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = Some(ttl_secs);
        self
    }
}

struct Inner<S, P, O, C> {
    store: S,
    ledger: StockLedger<S>,
    payment: P,
    orders: O,
    cart: C,
    admission: Admission,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
    driving: Mutex<HashSet<CheckoutId>>,
}

/// Orchestrates checkout sagas.
///
/// Forward steps: reserve stock, charge payment, create the order, commit
/// the reservation, clear the cart. A failure after stock is held moves the
/// checkout to `COMPENSATING`, which refunds, cancels the order and rolls
/// the reservation back before ending in `FAILED`.
///
/// The record is saved before every peer call (`pending_step`) and after
/// every step, so [`resume_incomplete`](Self::resume_incomplete) can pick a
/// checkout up from its last recorded state. Peer calls carry a per-step
/// idempotency key, which makes replaying a half-finished step safe.
pub struct CheckoutCoordinator<S, P, O, C> {
    inner: Arc<Inner<S, P, O, C>>,
}

impl<S, P, O, C> Clone for CheckoutCoordinator<S, P, O, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, P, O, C> CheckoutCoordinator<S, P, O, C>
where
    S: StockStore + CheckoutStore + Clone + 'static,
    P: PaymentService + 'static,
    O: OrderService + 'static,
    C: CartService + 'static,
{
    /// Creates a coordinator sharing the ledger's store and clock.
    pub fn new(
        ledger: StockLedger<S>,
        payment: P,
        orders: O,
        cart: C,
        config: CoordinatorConfig,
    ) -> Self {
        let store = ledger.store().clone();
        let clock = Arc::clone(ledger.clock());
        Self {
            inner: Arc::new(Inner {
                store,
                ledger,
                payment,
                orders,
                cart,
                admission: Admission::new(config.admission.clone()),
                clock,
                config,
                driving: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Creates the checkout in `INIT` and starts driving it in the
    /// background.
    pub async fn start_checkout(&self, request: StartCheckout) -> Result<CheckoutRecord> {
        let record = self.create_checkout(request).await?;
        if !record.state.is_terminal() {
            self.spawn_drive(record.checkout_id);
        }
        Ok(record)
    }

    /// Admits and persists a checkout without driving it.
    ///
    /// A request whose `checkout_id` already exists returns the stored
    /// record unchanged.
    #[tracing::instrument(
        skip(self, request),
        fields(checkout_id = %request.checkout_id, user_id = %request.user_id)
    )]
    pub async fn create_checkout(&self, request: StartCheckout) -> Result<CheckoutRecord> {
        if let Some(existing) = self.inner.store.get_checkout(request.checkout_id).await? {
            return Ok(existing);
        }
        if request.payment_method.trim().is_empty() {
            return Err(CheckoutError::Invalid(
                "payment_method is required".to_string(),
            ));
        }
        let ttl_secs = request
            .ttl_secs
            .unwrap_or(self.inner.config.default_ttl_secs);
        if ttl_secs == 0 || ttl_secs > MAX_TTL_SECS {
            return Err(CheckoutError::Invalid(format!(
                "ttl_secs must be between 1 and {MAX_TTL_SECS}"
            )));
        }

        let _slot = self
            .inner
            .admission
            .enter(request.user_id)
            .ok_or(CheckoutError::InProgress { existing: None })?;
        if let Some(existing) = self
            .inner
            .store
            .active_checkout_for_user(request.user_id)
            .await?
        {
            return Err(CheckoutError::InProgress {
                existing: Some(existing),
            });
        }
        if !self.inner.admission.try_acquire() {
            return Err(CheckoutError::Overloaded);
        }

        let cart = match request.cart {
            Some(cart) => cart,
            None => self
                .fetch_cart(request.user_id)
                .await
                .map_err(CheckoutError::Cart)?,
        };
        let total_cents = validate_cart(request.checkout_id, &cart, ttl_secs)?;

        let mut record = CheckoutRecord::new(
            request.user_id,
            cart,
            request.payment_method,
            request.shipping_address,
            ttl_secs,
            self.inner.clock.now(),
        );
        record.checkout_id = request.checkout_id;
        record.version = match self.inner.store.insert_checkout(&record).await {
            Ok(version) => version,
            Err(e) if e.is_conflict() => return self.get_checkout(record.checkout_id).await,
            Err(e) => return Err(e.into()),
        };

        metrics::counter!("checkout_started_total").increment(1);
        tracing::info!(total_cents, ttl_secs, "Checkout created");
        Ok(record)
    }

    pub async fn get_checkout(&self, checkout_id: CheckoutId) -> Result<CheckoutRecord> {
        self.inner
            .store
            .get_checkout(checkout_id)
            .await?
            .ok_or(CheckoutError::NotFound(checkout_id))
    }

    /// Flags the checkout for cancellation.
    ///
    /// Accepted only while the checkout is in `INIT` or `STOCK_HELD`; the
    /// driver honors the flag at its next step boundary and compensates
    /// whatever was done so far.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_checkout(&self, checkout_id: CheckoutId) -> Result<CheckoutRecord> {
        const ATTEMPTS: u32 = 3;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut record = self.get_checkout(checkout_id).await?;
            if record.cancel_requested {
                return Ok(record);
            }
            if !record.state.is_cancellable() {
                return Err(CheckoutError::NotCancellable {
                    id: checkout_id,
                    state: record.state,
                });
            }

            record.cancel_requested = true;
            record.updated_at = self.inner.clock.now();
            match self.inner.store.save_checkout(&record, Vec::new()).await {
                Ok(version) => {
                    record.version = version;
                    tracing::info!(state = %record.state, "Checkout cancellation requested");
                    self.spawn_drive(checkout_id);
                    return Ok(record);
                }
                Err(e) if e.is_conflict() && attempt < ATTEMPTS => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Drives every non-terminal checkout to a terminal state. Returns how
    /// many were found.
    pub async fn resume_incomplete(&self) -> Result<usize> {
        let pending = self.inner.store.incomplete_checkouts().await?;
        if pending.is_empty() {
            return Ok(0);
        }
        tracing::info!(count = pending.len(), "Resuming incomplete checkouts");

        let results = join_all(pending.iter().map(|r| self.drive(r.checkout_id))).await;
        for (record, result) in pending.iter().zip(results) {
            if let Err(e) = result {
                tracing::error!(
                    checkout_id = %record.checkout_id,
                    error = %e,
                    "Failed to resume checkout"
                );
            }
        }
        Ok(pending.len())
    }

    /// Runs the saga for one checkout until it is terminal.
    ///
    /// If this process is already driving the checkout, returns its current
    /// record instead. A store failure stops the drive and leaves the
    /// checkout where it was; driving it again resumes from there.
    #[tracing::instrument(skip(self))]
    pub async fn drive(&self, checkout_id: CheckoutId) -> Result<CheckoutRecord> {
        let Some(_slot) = self.claim_driver(checkout_id) else {
            return self.get_checkout(checkout_id).await;
        };

        let mut record = self.get_checkout(checkout_id).await?;
        loop {
            let state = record.state;
            record = match state {
                CheckoutState::Init => self.reserve_step(record).await?,
                CheckoutState::StockHeld => self.charge_step(record).await?,
                CheckoutState::Paid => self.order_step(record).await?,
                CheckoutState::Ordered => self.complete_step(record).await?,
                CheckoutState::Compensating => self.compensate_step(record).await?,
                CheckoutState::Done | CheckoutState::Failed => return Ok(record),
            };
        }
    }

    fn spawn_drive(&self, checkout_id: CheckoutId) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.drive(checkout_id).await {
                tracing::error!(%checkout_id, error = %e, "Checkout driver stopped");
            }
        });
    }

    fn claim_driver(&self, checkout_id: CheckoutId) -> Option<DriverSlot<'_>> {
        let claimed = self
            .inner
            .driving
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(checkout_id);
        // Built only once the lock is released; dropping a slot relocks it.
        claimed.then(|| DriverSlot {
            driving: &self.inner.driving,
            checkout_id,
        })
    }

    async fn reserve_step(&self, mut record: CheckoutRecord) -> Result<CheckoutRecord> {
        if record.cancel_requested {
            return self.abort(record, "cancelled").await;
        }
        self.mark_pending(&mut record, Step::Reserve).await?;

        let request = ReserveRequest::new(
            record.reservation_id,
            record.checkout_id,
            record.cart.reservation_lines(),
            ttl(record.ttl_secs),
        );
        let ledger = &self.inner.ledger;
        let outcome = self
            .call(Step::Reserve, self.inner.config.timeouts.reserve, || {
                let request = request.clone();
                async move { ledger.reserve(request).await.map_err(PeerError::from) }
            })
            .await;

        match outcome {
            Ok(ReserveOutcome::Held(_)) => {
                self.advance(&mut record, CheckoutState::StockHeld, Vec::new())
                    .await?;
                Ok(record)
            }
            Ok(ReserveOutcome::Duplicate(existing)) if existing.state == ReservationState::Held => {
                self.advance(&mut record, CheckoutState::StockHeld, Vec::new())
                    .await?;
                Ok(record)
            }
            Ok(ReserveOutcome::Duplicate(existing)) => {
                record.pending_step = None;
                let reason = format!("reservation_{}", existing.state.as_str().to_lowercase());
                self.finish_failed(record, reason).await
            }
            Ok(ReserveOutcome::OutOfStock(sku)) => {
                record.pending_step = None;
                self.finish_failed(record, format!("out_of_stock:{sku}")).await
            }
            Ok(ReserveOutcome::Invalid(_)) => {
                record.pending_step = None;
                self.finish_failed(record, "invalid_cart").await
            }
            Err(e) => {
                self.abort(record, format!("reserve_failed:{}", e.kind.code()))
                    .await
            }
        }
    }

    async fn charge_step(&self, mut record: CheckoutRecord) -> Result<CheckoutRecord> {
        self.mark_pending(&mut record, Step::Charge).await?;
        if record.cancel_requested {
            return self.abort(record, "cancelled").await;
        }

        let Some(amount) = record.cart.total_cents() else {
            return self.abort(record, "invalid_cart").await;
        };

        let payment = &self.inner.payment;
        let key = Step::Charge.idem_key(record.checkout_id);
        let user_id = record.user_id;
        let (method, key) = (record.payment_method.as_str(), key.as_str());
        let timeouts = &self.inner.config.timeouts;
        let result = self
            .call_within(
                Step::Charge,
                timeouts.payment,
                timeouts.charge_budget(record.ttl_secs),
                || payment.charge(user_id, amount, method, key),
            )
            .await;

        match result {
            Ok(charged) => {
                record.payment_id = Some(charged.payment_id);
                self.advance(&mut record, CheckoutState::Paid, Vec::new())
                    .await?;
                Ok(record)
            }
            Err(e) => {
                self.abort(record, format!("payment_failed:{}", e.kind.code()))
                    .await
            }
        }
    }

    async fn order_step(&self, mut record: CheckoutRecord) -> Result<CheckoutRecord> {
        if record.cancel_requested {
            return self.abort(record, "cancelled").await;
        }
        self.mark_pending(&mut record, Step::CreateOrder).await?;

        let orders = &self.inner.orders;
        let key = Step::CreateOrder.idem_key(record.checkout_id);
        let user_id = record.user_id;
        let (lines, address, key) = (
            record.cart.lines.as_slice(),
            record.shipping_address.as_deref(),
            key.as_str(),
        );
        let result = self
            .call(Step::CreateOrder, self.inner.config.timeouts.order, || {
                orders.create(user_id, lines, address, key)
            })
            .await;

        match result {
            Ok(created) => {
                record.order_id = Some(created.order_id);
                self.advance(&mut record, CheckoutState::Ordered, Vec::new())
                    .await?;
                Ok(record)
            }
            Err(e) => {
                self.abort(record, format!("order_failed:{}", e.kind.code()))
                    .await
            }
        }
    }

    /// Commits the reservation, clears the cart, and ends in `DONE`.
    async fn complete_step(&self, mut record: CheckoutRecord) -> Result<CheckoutRecord> {
        self.mark_pending(&mut record, Step::Commit).await?;

        let ledger = &self.inner.ledger;
        let reservation_id = record.reservation_id;
        let committed = self
            .call(Step::Commit, self.inner.config.timeouts.reserve, || async move {
                ledger.commit(reservation_id).await.map_err(PeerError::from)
            })
            .await;
        match committed {
            Ok(outcome) if outcome.is_committed() => {}
            Ok(outcome) => {
                tracing::warn!(outcome = outcome.as_str(), "Reservation commit refused");
                return self.abort(record, "reservation_commit_failed").await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Reservation commit failed");
                return self.abort(record, "reservation_commit_failed").await;
            }
        }

        let cart = &self.inner.cart;
        let key = Step::ClearCart.idem_key(record.checkout_id);
        let (user_id, key) = (record.user_id, key.as_str());
        if let Err(e) = self
            .call(Step::ClearCart, self.inner.config.timeouts.cart, || {
                cart.clear(user_id, key)
            })
            .await
        {
            tracing::warn!(error = %e, "Cart not cleared after successful checkout");
        }

        let mut payload = EventPayload::new(self.inner.clock.now())
            .checkout(record.checkout_id)
            .user(record.user_id)
            .reservation(record.reservation_id)
            .lines(record.cart.reservation_lines());
        if let Some(order_id) = &record.order_id {
            payload = payload.order(order_id.clone());
        }
        let event = payload.into_entry(Topic::OrderCreated, record.checkout_id.to_string())?;

        self.advance(&mut record, CheckoutState::Done, vec![event])
            .await?;
        metrics::counter!("checkout_completed_total").increment(1);
        self.record_duration(&record);
        tracing::info!(order_id = ?record.order_id, "Checkout completed");
        Ok(record)
    }

    /// Undoes the forward steps that succeeded, then ends in `FAILED`.
    ///
    /// Each compensation is retried with backoff; one that still fails is
    /// noted in `last_error` and the others run anyway. A reservation that
    /// cannot be rolled back is left for the expiry reaper; one found already
    /// committed is published on `reservation.repair_needed`.
    async fn compensate_step(&self, mut record: CheckoutRecord) -> Result<CheckoutRecord> {
        let mut failures: Vec<String> = Vec::new();
        let mut repair: Vec<NewOutboxEntry> = Vec::new();
        let checkout_id = record.checkout_id;

        if let Some(payment_id) = record.payment_id.clone() {
            let payment = &self.inner.payment;
            let key = Step::Refund.idem_key(checkout_id);
            let (payment_id, key) = (payment_id.as_str(), key.as_str());
            if let Err(e) = self
                .call(Step::Refund, self.inner.config.timeouts.payment, || {
                    payment.refund(payment_id, key)
                })
                .await
            {
                tracing::error!(payment_id, error = %e, "Refund failed");
                failures.push(format!("refund:{}", e.kind.code()));
            }
        }

        if let Some(order_id) = record.order_id.clone() {
            let orders = &self.inner.orders;
            let key = Step::CancelOrder.idem_key(checkout_id);
            let (order_id, key) = (order_id.as_str(), key.as_str());
            if let Err(e) = self
                .call(Step::CancelOrder, self.inner.config.timeouts.order, || {
                    orders.cancel(order_id, key)
                })
                .await
            {
                tracing::error!(order_id, error = %e, "Order cancel failed");
                failures.push(format!("cancel_order:{}", e.kind.code()));
            }
        }

        let ledger = &self.inner.ledger;
        let reservation_id = record.reservation_id;
        match self
            .call(Step::Rollback, self.inner.config.timeouts.reserve, || async move {
                ledger
                    .rollback(reservation_id, ReleaseCause::Rollback)
                    .await
                    .map_err(PeerError::from)
            })
            .await
        {
            Ok(RollbackOutcome::AlreadyCommitted) => {
                tracing::error!(
                    %reservation_id,
                    "Reservation already committed, needs manual repair"
                );
                metrics::counter!("checkout_repair_needed_total").increment(1);
                failures.push(REPAIR_REASON.to_string());
                repair.push(
                    EventPayload::new(self.inner.clock.now())
                        .checkout(checkout_id)
                        .user(record.user_id)
                        .reservation(reservation_id)
                        .lines(record.cart.reservation_lines())
                        .reason(REPAIR_REASON)
                        .into_entry(Topic::ReservationRepairNeeded, reservation_id.to_string())?,
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    %reservation_id,
                    error = %e,
                    "Rollback failed, leaving reservation to expiry"
                );
                failures.push(format!("rollback:{}", e.kind.code()));
            }
        }

        let mut reason = record
            .last_error
            .take()
            .unwrap_or_else(|| "failed".to_string());
        if !failures.is_empty() {
            reason = format!("{reason}; compensation failed: {}", failures.join(", "));
        }
        self.finish_failed_with(record, reason, repair).await
    }

    /// Fails the checkout, compensating first unless nothing could have
    /// been done yet.
    async fn abort(
        &self,
        mut record: CheckoutRecord,
        reason: impl Into<String>,
    ) -> Result<CheckoutRecord> {
        let reason = reason.into();
        if record.state == CheckoutState::Init && record.pending_step.is_none() {
            return self.finish_failed(record, reason).await;
        }
        tracing::warn!(state = %record.state, reason = %reason, "Checkout compensating");
        record.last_error = Some(reason);
        self.advance(&mut record, CheckoutState::Compensating, Vec::new())
            .await?;
        Ok(record)
    }

    async fn finish_failed(
        &self,
        record: CheckoutRecord,
        reason: impl Into<String>,
    ) -> Result<CheckoutRecord> {
        self.finish_failed_with(record, reason.into(), Vec::new())
            .await
    }

    /// Ends in `FAILED`, publishing `extra` ahead of `order.failed`.
    async fn finish_failed_with(
        &self,
        mut record: CheckoutRecord,
        reason: String,
        mut extra: Vec<NewOutboxEntry>,
    ) -> Result<CheckoutRecord> {
        let event = EventPayload::new(self.inner.clock.now())
            .checkout(record.checkout_id)
            .user(record.user_id)
            .reservation(record.reservation_id)
            .reason(reason.clone())
            .into_entry(Topic::OrderFailed, record.checkout_id.to_string())?;
        extra.push(event);

        record.last_error = Some(reason);
        self.advance(&mut record, CheckoutState::Failed, extra)
            .await?;
        metrics::counter!("checkout_failed_total").increment(1);
        self.record_duration(&record);
        tracing::warn!(reason = ?record.last_error, "Checkout failed");
        Ok(record)
    }

    /// Moves to `next` and saves, clearing the pending step.
    async fn advance(
        &self,
        record: &mut CheckoutRecord,
        next: CheckoutState,
        events: Vec<NewOutboxEntry>,
    ) -> Result<()> {
        if !record.state.can_transition_to(next) {
            return Err(CheckoutError::IllegalTransition {
                from: record.state,
                to: next,
            });
        }
        tracing::debug!(from = %record.state, to = %next, "Checkout transition");
        record.state = next;
        record.pending_step = None;
        self.save(record, events).await
    }

    /// Records the intent to call a peer before calling it.
    async fn mark_pending(&self, record: &mut CheckoutRecord, step: Step) -> Result<()> {
        record.pending_step = Some(step.as_str().to_string());
        self.save(record, Vec::new()).await
    }

    /// Saves the record, absorbing one concurrent cancellation request.
    ///
    /// The driver is the only writer apart from `cancel_checkout`, which
    /// bumps the version by one and sets `cancel_requested`. Any other
    /// conflict is returned.
    async fn save(&self, record: &mut CheckoutRecord, events: Vec<NewOutboxEntry>) -> Result<()> {
        record.updated_at = self.inner.clock.now();
        match self
            .inner
            .store
            .save_checkout(record, events.clone())
            .await
        {
            Ok(version) => {
                record.version = version;
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                let stored = self.get_checkout(record.checkout_id).await?;
                if !stored.cancel_requested
                    || record.cancel_requested
                    || stored.version != record.version.next()
                {
                    return Err(e.into());
                }
                record.cancel_requested = true;
                record.version = stored.version;
                record.version = self.inner.store.save_checkout(record, events).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Calls a peer with a per-attempt deadline, retrying transient failures
    /// within the configured step budget.
    async fn call<T, F, Fut>(
        &self,
        step: Step,
        deadline: Duration,
        operation: F,
    ) -> std::result::Result<T, PeerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, PeerError>>,
    {
        let budget = self.inner.config.timeouts.step_budget;
        self.call_within(step, deadline, budget, operation).await
    }

    /// Like [`call`](Self::call), but the attempts and the backoff between
    /// them must all finish within `budget`.
    async fn call_within<T, F, Fut>(
        &self,
        step: Step,
        deadline: Duration,
        budget: Duration,
        mut operation: F,
    ) -> std::result::Result<T, PeerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, PeerError>>,
    {
        let attempts = retry_with_backoff(&self.inner.config.retry, step.as_str(), || {
            let attempt = operation();
            async move {
                match tokio::time::timeout(deadline, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(PeerError::timeout(format!(
                        "{step} exceeded {}ms",
                        deadline.as_millis()
                    ))),
                }
            }
        });
        match tokio::time::timeout(budget, attempts).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    step = step.as_str(),
                    budget_ms = budget.as_millis() as u64,
                    "Step budget exhausted"
                );
                Err(PeerError::timeout(format!(
                    "{step} exceeded its {}ms budget",
                    budget.as_millis()
                )))
            }
        }
    }

    async fn fetch_cart(&self, user_id: UserId) -> std::result::Result<CartSnapshot, PeerError> {
        let cart = &self.inner.cart;
        self.call(Step::FetchCart, self.inner.config.timeouts.cart, || {
            cart.get(user_id)
        })
        .await
    }

    fn record_duration(&self, record: &CheckoutRecord) {
        let elapsed = self.inner.clock.now() - record.created_at;
        metrics::histogram!("checkout_duration_seconds")
            .record(elapsed.num_milliseconds().max(0) as f64 / 1000.0);
    }
}

/// Marks a checkout as driven by this process until dropped.
struct DriverSlot<'a> {
    driving: &'a Mutex<HashSet<CheckoutId>>,
    checkout_id: CheckoutId,
}

impl Drop for DriverSlot<'_> {
    fn drop(&mut self) {
        self.driving
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.checkout_id);
    }
}

fn ttl(ttl_secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(ttl_secs.min(MAX_TTL_SECS) as i64)
}

/// Checks the cart can be reserved and charged; returns its total.
fn validate_cart(checkout_id: CheckoutId, cart: &CartSnapshot, ttl_secs: u64) -> Result<i64> {
    if cart.is_empty() {
        return Err(CheckoutError::Invalid("cart is empty".to_string()));
    }
    if cart.lines.iter().any(|l| l.unit_price_cents < 0) {
        return Err(CheckoutError::Invalid(
            "unit_price_cents must not be negative".to_string(),
        ));
    }
    let total_cents = cart
        .total_cents()
        .ok_or_else(|| CheckoutError::Invalid("cart total overflows".to_string()))?;
    ReserveRequest::new(
        ReservationId::new(),
        checkout_id,
        cart.reservation_lines(),
        ttl(ttl_secs),
    )
    .normalized_lines()
    .map_err(CheckoutError::Invalid)?;
    Ok(total_cents)
}
