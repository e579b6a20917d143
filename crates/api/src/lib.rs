//! HTTP façade and server wiring for the inventory reservation service.
//!
//! Exposes the stock ledger (reserve, commit, rollback, query, receipts)
//! and the checkout coordinator over REST, with structured logging
//! (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use checkout::{
    CheckoutCoordinator, CoordinatorConfig, InMemoryCartService, InMemoryOrderService,
    InMemoryPaymentService,
};
use common::{Clock, SystemClock};
use inventory_store::Store;
use ledger::StockLedger;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// The coordinator as wired by the server: in-process peers.
pub type Coordinator<S> =
    CheckoutCoordinator<S, InMemoryPaymentService, InMemoryOrderService, InMemoryCartService>;

/// Shared application state accessible from all handlers.
pub struct AppState<S: Store> {
    pub store: S,
    pub ledger: StockLedger<S>,
    pub checkout: Coordinator<S>,
    pub payment: InMemoryPaymentService,
    pub orders: InMemoryOrderService,
    pub cart: InMemoryCartService,
    /// TTL applied to `POST /reservations` requests that omit `ttl_secs`.
    pub default_ttl_secs: u64,
}

impl<S: Store> AppState<S> {
    pub fn clock(&self) -> &Arc<dyn Clock> {
        self.ledger.clock()
    }
}

/// Creates the application state on the wall clock.
pub fn create_state<S: Store>(store: S, config: CoordinatorConfig) -> Arc<AppState<S>> {
    create_state_with_clock(store, config, Arc::new(SystemClock))
}

/// Creates the application state; every component shares `clock`.
pub fn create_state_with_clock<S: Store>(
    store: S,
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
) -> Arc<AppState<S>> {
    let ledger = StockLedger::with_clock(store.clone(), clock);
    let payment = InMemoryPaymentService::new();
    let orders = InMemoryOrderService::new();
    let cart = InMemoryCartService::new();
    let default_ttl_secs = config.default_ttl_secs;
    let checkout = CheckoutCoordinator::new(
        ledger.clone(),
        payment.clone(),
        orders.clone(),
        cart.clone(),
        config,
    );

    Arc::new(AppState {
        store,
        ledger,
        checkout,
        payment,
        orders,
        cart,
        default_ttl_secs,
    })
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: Store>(state: Arc<AppState<S>>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<S>))
        .route("/reservations", post(routes::reservations::reserve::<S>))
        .route("/reservations/{id}", get(routes::reservations::get::<S>))
        .route(
            "/reservations/{id}/commit",
            post(routes::reservations::commit::<S>),
        )
        .route(
            "/reservations/{id}/rollback",
            post(routes::reservations::rollback::<S>),
        )
        .route("/stock/{sku}", get(routes::stock::query::<S>))
        .route("/stock/{sku}/receipts", post(routes::stock::receive::<S>))
        .route("/checkouts", post(routes::checkouts::start::<S>))
        .route("/checkouts/{id}", get(routes::checkouts::get::<S>))
        .route("/checkouts/{id}/cancel", post(routes::checkouts::cancel::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
