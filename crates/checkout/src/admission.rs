//! Checkout admission control.
//!
//! Two gates run before a checkout is created:
//! - a token bucket sized from downstream capacity caps the global rate
//! - a per-user slot keeps a user to one checkout being admitted at a time
//!
//! The per-user slot only covers the window between the "any active
//! checkout?" lookup and the insert; after that the stored record itself
//! marks the user busy.

use std::collections::HashSet;
use std::sync::Mutex;

use common::UserId;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Burst capacity in checkouts.
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            refill_per_sec: 50.0,
        }
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket plus the set of users currently being admitted.
pub struct Admission {
    config: AdmissionConfig,
    bucket: Mutex<Bucket>,
    admitting: Mutex<HashSet<UserId>>,
}

impl Admission {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                tokens: f64::from(config.capacity),
                last_refill: Instant::now(),
            }),
            admitting: Mutex::new(HashSet::new()),
            config,
        }
    }

    /// Takes one token if available.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens =
            (bucket.tokens + elapsed * self.config.refill_per_sec).min(f64::from(self.config.capacity));
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            tracing::warn!(
                available = bucket.tokens,
                "Checkout admission limit reached"
            );
            false
        }
    }

    /// Claims the user's admission slot; `None` if another request for the
    /// same user holds it.
    pub fn enter(&self, user_id: UserId) -> Option<UserSlot<'_>> {
        let inserted = self
            .admitting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_id);
        // The slot must be built after the lock is released: its drop
        // takes the same lock.
        inserted.then(|| UserSlot {
            admission: self,
            user_id,
        })
    }

    pub fn available_tokens(&self) -> f64 {
        self.bucket.lock().unwrap_or_else(|e| e.into_inner()).tokens
    }
}

/// Releases the user's slot when dropped.
pub struct UserSlot<'a> {
    admission: &'a Admission,
    user_id: UserId,
}

impl Drop for UserSlot<'_> {
    fn drop(&mut self) {
        self.admission
            .admitting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.user_id);
    }
}
