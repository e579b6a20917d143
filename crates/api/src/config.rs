//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use checkout::{
    AdmissionConfig, CoordinatorConfig, GcConfig, RetryPolicy, StepTimeouts,
    reservation_ttl_secs,
};
use ledger::ReaperConfig;
use outbox::DispatcherConfig;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err("expected `text` or `json`".to_string()),
        }
    }
}

/// Server configuration with sensible defaults.
///
/// Every field maps to one environment variable; see [`Config::from_env`].
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    /// `None` runs on the in-memory store.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub reaper_tick: Duration,
    pub reaper_batch_size: usize,
    pub dispatch_tick: Duration,
    pub dispatch_batch_size: usize,
    pub lease_ttl: Duration,
    /// Lease holder identity of this process.
    pub node_id: String,
    pub payment_timeout: Duration,
    pub order_timeout: Duration,
    pub cart_timeout: Duration,
    /// Cap on one saga step including retries.
    pub step_budget: Duration,
    pub payment_p99: Duration,
    pub ttl_safety_margin: Duration,
    pub admission_capacity: u32,
    pub admission_refill_per_sec: f64,
    pub checkout_retention: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            database_max_connections: 10,
            reaper_tick: Duration::from_millis(1000),
            reaper_batch_size: 100,
            dispatch_tick: Duration::from_millis(500),
            dispatch_batch_size: 100,
            lease_ttl: Duration::from_millis(5000),
            node_id: uuid::Uuid::new_v4().to_string(),
            payment_timeout: Duration::from_millis(10_000),
            order_timeout: Duration::from_millis(5_000),
            cart_timeout: Duration::from_millis(3_000),
            step_budget: Duration::from_millis(20_000),
            payment_p99: Duration::from_millis(2_000),
            ttl_safety_margin: Duration::from_millis(30_000),
            admission_capacity: 100,
            admission_refill_per_sec: 50.0,
            checkout_retention: Duration::from_secs(86_400),
        }
    }
}

impl Config {
    /// Loads configuration from the process environment.
    ///
    /// Reads `HOST`, `PORT`, `RUST_LOG`, `LOG_FORMAT`, `DATABASE_URL`,
    /// `DATABASE_MAX_CONNECTIONS`, `REAPER_TICK_MS`, `REAPER_BATCH_SIZE`,
    /// `DISPATCH_TICK_MS`, `DISPATCH_BATCH_SIZE`, `LEASE_TTL_MS`, `NODE_ID`,
    /// `PAYMENT_TIMEOUT_MS`, `ORDER_TIMEOUT_MS`, `CART_TIMEOUT_MS`,
    /// `STEP_BUDGET_MS`, `PAYMENT_P99_MS`, `TTL_SAFETY_MARGIN_MS`, `ADMISSION_CAPACITY`,
    /// `ADMISSION_REFILL_PER_SEC` and `CHECKOUT_RETENTION_SECS`. Unset
    /// variables keep their defaults; unparsable ones are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`Config::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = Config::default();

        let config = Self {
            host: env.string("HOST").unwrap_or(defaults.host),
            port: env.parse("PORT")?.unwrap_or(defaults.port),
            log_level: env.string("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: env.parse("LOG_FORMAT")?.unwrap_or(defaults.log_format),
            database_url: env.string("DATABASE_URL"),
            database_max_connections: env
                .parse("DATABASE_MAX_CONNECTIONS")?
                .unwrap_or(defaults.database_max_connections),
            reaper_tick: env.millis("REAPER_TICK_MS")?.unwrap_or(defaults.reaper_tick),
            reaper_batch_size: env
                .parse("REAPER_BATCH_SIZE")?
                .unwrap_or(defaults.reaper_batch_size),
            dispatch_tick: env
                .millis("DISPATCH_TICK_MS")?
                .unwrap_or(defaults.dispatch_tick),
            dispatch_batch_size: env
                .parse("DISPATCH_BATCH_SIZE")?
                .unwrap_or(defaults.dispatch_batch_size),
            lease_ttl: env.millis("LEASE_TTL_MS")?.unwrap_or(defaults.lease_ttl),
            node_id: env.string("NODE_ID").unwrap_or(defaults.node_id),
            payment_timeout: env
                .millis("PAYMENT_TIMEOUT_MS")?
                .unwrap_or(defaults.payment_timeout),
            order_timeout: env
                .millis("ORDER_TIMEOUT_MS")?
                .unwrap_or(defaults.order_timeout),
            cart_timeout: env
                .millis("CART_TIMEOUT_MS")?
                .unwrap_or(defaults.cart_timeout),
            step_budget: env.millis("STEP_BUDGET_MS")?.unwrap_or(defaults.step_budget),
            payment_p99: env.millis("PAYMENT_P99_MS")?.unwrap_or(defaults.payment_p99),
            ttl_safety_margin: env
                .millis("TTL_SAFETY_MARGIN_MS")?
                .unwrap_or(defaults.ttl_safety_margin),
            admission_capacity: env
                .parse("ADMISSION_CAPACITY")?
                .unwrap_or(defaults.admission_capacity),
            admission_refill_per_sec: env
                .parse("ADMISSION_REFILL_PER_SEC")?
                .unwrap_or(defaults.admission_refill_per_sec),
            checkout_retention: env
                .parse::<u64>("CHECKOUT_RETENTION_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.checkout_retention),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("DATABASE_MAX_CONNECTIONS", self.database_max_connections == 0),
            ("REAPER_TICK_MS", self.reaper_tick.is_zero()),
            ("REAPER_BATCH_SIZE", self.reaper_batch_size == 0),
            ("DISPATCH_TICK_MS", self.dispatch_tick.is_zero()),
            ("DISPATCH_BATCH_SIZE", self.dispatch_batch_size == 0),
            ("LEASE_TTL_MS", self.lease_ttl.is_zero()),
            ("PAYMENT_TIMEOUT_MS", self.payment_timeout.is_zero()),
            ("ORDER_TIMEOUT_MS", self.order_timeout.is_zero()),
            ("CART_TIMEOUT_MS", self.cart_timeout.is_zero()),
            ("STEP_BUDGET_MS", self.step_budget.is_zero()),
            ("ADMISSION_CAPACITY", self.admission_capacity == 0),
        ];
        if let Some((var, _)) = positive.iter().find(|(_, bad)| *bad) {
            return Err(ConfigError::Invalid {
                var,
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if !self.admission_refill_per_sec.is_finite() || self.admission_refill_per_sec < 0.0 {
            return Err(ConfigError::Invalid {
                var: "ADMISSION_REFILL_PER_SEC",
                value: self.admission_refill_per_sec.to_string(),
                reason: "must be a non-negative number".to_string(),
            });
        }
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::Invalid {
                var: "NODE_ID",
                value: self.node_id.clone(),
                reason: "must not be blank".to_string(),
            });
        }
        Ok(())
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Default reservation TTL: `2 × payment p99 + safety margin`.
    pub fn reservation_ttl_secs(&self) -> u64 {
        reservation_ttl_secs(self.payment_p99, self.ttl_safety_margin)
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            timeouts: StepTimeouts {
                payment: self.payment_timeout,
                order: self.order_timeout,
                cart: self.cart_timeout,
                step_budget: self.step_budget,
                ..StepTimeouts::default()
            },
            retry: RetryPolicy::default(),
            default_ttl_secs: self.reservation_ttl_secs(),
            admission: AdmissionConfig {
                capacity: self.admission_capacity,
                refill_per_sec: self.admission_refill_per_sec,
            },
        }
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            tick: self.reaper_tick,
            batch_size: self.reaper_batch_size,
            lease_ttl: lease_ttl(self.lease_ttl),
            holder: self.node_id.clone(),
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            tick: self.dispatch_tick,
            batch_size: self.dispatch_batch_size,
            lease_ttl: lease_ttl(self.lease_ttl),
            holder: self.node_id.clone(),
        }
    }

    pub fn gc_config(&self) -> GcConfig {
        GcConfig {
            retention: chrono::Duration::from_std(self.checkout_retention)
                .unwrap_or(chrono::Duration::days(1)),
            ..GcConfig::default()
        }
    }
}

fn lease_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(5))
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, var: &str) -> Option<String> {
        (self.0)(var).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(var) {
            None => Ok(None),
            Some(value) => match value.trim().parse() {
                Ok(parsed) => Ok(Some(parsed)),
                Err(e) => Err(ConfigError::Invalid {
                    var,
                    value,
                    reason: e.to_string(),
                }),
            },
        }
    }

    fn millis(&self, var: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(var)?.map(Duration::from_millis))
    }
}
