//! Event bus abstraction and the buses shipped with the service.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use inventory_store::{OutboxEntry, Topic};
use tokio::sync::RwLock;

use crate::error::PublishError;

/// Destination of dispatched outbox entries.
///
/// `entry.key` is the partition key; a bus must deliver messages with the
/// same key in the order they are published.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, entry: &OutboxEntry) -> Result<(), PublishError>;
}

#[async_trait]
impl<B: EventBus + ?Sized> EventBus for Arc<B> {
    async fn publish(&self, entry: &OutboxEntry) -> Result<(), PublishError> {
        (**self).publish(entry).await
    }
}

/// A message as the bus received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub seq: i64,
    pub topic: Topic,
    pub key: String,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct BusState {
    published: Vec<Published>,
    fail_next: usize,
    failing_keys: HashSet<String>,
}

/// In-process bus that records every message. Failures can be injected
/// for tests.
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    state: Arc<RwLock<BusState>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` publishes fail, whatever their key.
    pub async fn fail_next(&self, n: usize) {
        self.state.write().await.fail_next = n;
    }

    /// Makes every publish for `key` fail until [`Self::heal_key`].
    pub async fn fail_key(&self, key: impl Into<String>) {
        self.state.write().await.failing_keys.insert(key.into());
    }

    pub async fn heal_key(&self, key: &str) {
        self.state.write().await.failing_keys.remove(key);
    }

    /// Every message delivered so far, in delivery order.
    pub async fn published(&self) -> Vec<Published> {
        self.state.read().await.published.clone()
    }

    /// Messages delivered for one partition key.
    pub async fn published_for(&self, key: &str) -> Vec<Published> {
        self.state
            .read()
            .await
            .published
            .iter()
            .filter(|p| p.key == key)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, entry: &OutboxEntry) -> Result<(), PublishError> {
        let mut state = self.state.write().await;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(PublishError("injected failure".to_string()));
        }
        if state.failing_keys.contains(&entry.key) {
            return Err(PublishError(format!("key {} unavailable", entry.key)));
        }
        state.published.push(Published {
            seq: entry.seq,
            topic: entry.topic,
            key: entry.key.clone(),
            payload: entry.payload.clone(),
        });
        Ok(())
    }
}

/// Bus that writes each message to the tracing log. Used when no broker
/// is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEventBus;

#[async_trait]
impl EventBus for LogEventBus {
    async fn publish(&self, entry: &OutboxEntry) -> Result<(), PublishError> {
        tracing::info!(
            seq = entry.seq,
            topic = entry.topic.as_str(),
            key = %entry.key,
            payload = %String::from_utf8_lossy(&entry.payload),
            "Event published"
        );
        Ok(())
    }
}
