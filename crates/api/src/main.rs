//! API server entry point.
//!
//! Exit codes: 0 normal shutdown, 64 config error, 69 store unavailable at
//! startup, 70 internal fatal, 130 stopped by a signal.

use std::process::ExitCode;
use std::time::Duration;

use api::config::{Config, LogFormat};
use checkout::CheckoutGc;
use inventory_store::{InMemoryStore, PostgresStore, Store};
use ledger::ExpiryReaper;
use metrics_exporter_prometheus::PrometheusHandle;
use outbox::{LogEventBus, OutboxDispatcher};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const EXIT_CONFIG: u8 = 64;
const EXIT_UNAVAILABLE: u8 = 69;
const EXIT_INTERNAL: u8 = 70;
const EXIT_SIGNALLED: u8 = 130;

/// How long background loops get to finish their last tick.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let json = config.log_format == LogFormat::Json;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    // 1. Load configuration
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    // 2. Initialize tracing
    init_tracing(&config);

    // 3. Install Prometheus metrics recorder
    let metrics_handle = match metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
    {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "failed to install Prometheus recorder");
            return ExitCode::from(EXIT_INTERNAL);
        }
    };

    // 4. Open the store and run the service on it
    match config.database_url.clone() {
        Some(url) => {
            let pool = match PgPoolOptions::new()
                .max_connections(config.database_max_connections)
                .connect(&url)
                .await
            {
                Ok(pool) => pool,
                Err(e) => {
                    tracing::error!(error = %e, "failed to connect to Postgres");
                    return ExitCode::from(EXIT_UNAVAILABLE);
                }
            };
            let store = PostgresStore::new(pool);
            if let Err(e) = store.run_migrations().await {
                tracing::error!(error = %e, "failed to run migrations");
                return ExitCode::from(EXIT_UNAVAILABLE);
            }
            tracing::info!("using Postgres store");
            serve(store, config, metrics_handle).await
        }
        None => {
            tracing::info!("DATABASE_URL not set, using in-memory store");
            serve(InMemoryStore::new(), config, metrics_handle).await
        }
    }
}

async fn serve<S: Store>(store: S, config: Config, metrics_handle: PrometheusHandle) -> ExitCode {
    // 5. Build state and background loops
    let state = api::create_state(store.clone(), config.coordinator_config());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let loops = vec![
        tokio::spawn(
            ExpiryReaper::new(state.ledger.clone(), config.reaper_config())
                .run(shutdown_rx.clone()),
        ),
        tokio::spawn(
            OutboxDispatcher::new(store.clone(), LogEventBus, config.dispatcher_config())
                .run(shutdown_rx.clone()),
        ),
        tokio::spawn(CheckoutGc::new(store, config.gc_config()).run(shutdown_rx.clone())),
    ];

    // 6. Resume checkouts left mid-saga by a previous process
    let coordinator = state.checkout.clone();
    tokio::spawn(async move {
        match coordinator.resume_incomplete().await {
            Ok(0) => {}
            Ok(resumed) => tracing::info!(resumed, "resumed incomplete checkouts"),
            Err(e) => tracing::error!(error = %e, "failed to resume incomplete checkouts"),
        }
    });

    // 7. Start server
    let app = api::create_app(state, metrics_handle);
    let addr = config.addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(%addr, error = %e, "failed to bind address");
            let _ = shutdown_tx.send(true);
            return ExitCode::from(EXIT_INTERNAL);
        }
    };
    tracing::info!(%addr, node_id = %config.node_id, "starting API server");

    let signal_tx = shutdown_tx.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = signal_tx.send(true);
        })
        .await;
    let signalled = *shutdown_rx.borrow();

    // 8. Stop the background loops and let them drain
    let _ = shutdown_tx.send(true);
    let drain = join_loops(loops);
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("background loops did not stop in time");
    }

    match served {
        Err(e) => {
            tracing::error!(error = %e, "server error");
            ExitCode::from(EXIT_INTERNAL)
        }
        Ok(()) if signalled => {
            tracing::info!("server shut down gracefully");
            ExitCode::from(EXIT_SIGNALLED)
        }
        Ok(()) => ExitCode::SUCCESS,
    }
}

async fn join_loops(loops: Vec<tokio::task::JoinHandle<()>>) {
    for handle in loops {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "background loop panicked");
        }
    }
}
