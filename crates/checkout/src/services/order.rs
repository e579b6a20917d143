//! Order service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use async_trait::async_trait;
use common::UserId;
use inventory_store::CartLine;

use super::{Faults, injected_delay};
use crate::error::PeerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderResult {
    pub order_id: String,
}

/// Order management peer.
#[async_trait]
pub trait OrderService: Send + Sync {
    async fn create(
        &self,
        user_id: UserId,
        lines: &[CartLine],
        address: Option<&str>,
        idem_key: &str,
    ) -> Result<OrderResult, PeerError>;

    async fn cancel(&self, order_id: &str, idem_key: &str) -> Result<(), PeerError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub user_id: UserId,
    pub lines: Vec<CartLine>,
    pub address: Option<String>,
    pub cancelled: bool,
}

#[derive(Debug, Default)]
struct InMemoryOrderState {
    orders: HashMap<String, Order>,
    by_key: HashMap<String, String>,
    next_id: u32,
    create_faults: Faults,
    cancel_faults: Faults,
}

/// In-memory order service for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderService {
    state: Arc<RwLock<InMemoryOrderState>>,
}

impl InMemoryOrderService {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> RwLockWriteGuard<'_, InMemoryOrderState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail_next_creates(&self, n: u32) {
        self.state().create_faults.fail_next(n);
    }

    /// Rejects every create until reset.
    pub fn set_reject(&self, reject: bool) {
        self.state().create_faults.set_reject(reject);
    }

    pub fn fail_next_cancels(&self, n: u32) {
        self.state().cancel_faults.fail_next(n);
    }

    pub fn order(&self, order_id: &str) -> Option<Order> {
        self.state().orders.get(order_id).cloned()
    }

    /// Returns the number of orders not cancelled.
    pub fn open_orders(&self) -> usize {
        self.state().orders.values().filter(|o| !o.cancelled).count()
    }
}

#[async_trait]
impl OrderService for InMemoryOrderService {
    async fn create(
        &self,
        user_id: UserId,
        lines: &[CartLine],
        address: Option<&str>,
        idem_key: &str,
    ) -> Result<OrderResult, PeerError> {
        let delay = self.state().create_faults.delay();
        injected_delay(delay).await;

        let mut state = self.state();
        state.create_faults.check("order")?;
        if let Some(order_id) = state.by_key.get(idem_key) {
            return Ok(OrderResult {
                order_id: order_id.clone(),
            });
        }

        state.next_id += 1;
        let order_id = format!("ORD-{:04}", state.next_id);
        state.orders.insert(
            order_id.clone(),
            Order {
                user_id,
                lines: lines.to_vec(),
                address: address.map(str::to_string),
                cancelled: false,
            },
        );
        state.by_key.insert(idem_key.to_string(), order_id.clone());
        Ok(OrderResult { order_id })
    }

    async fn cancel(&self, order_id: &str, _idem_key: &str) -> Result<(), PeerError> {
        let mut state = self.state();
        state.cancel_faults.check("order cancel")?;
        match state.orders.get_mut(order_id) {
            Some(order) => {
                order.cancelled = true;
                Ok(())
            }
            None => Err(PeerError::rejected(format!("unknown order {order_id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SkuId;

    fn lines() -> Vec<CartLine> {
        vec![CartLine {
            sku_id: SkuId::new("A"),
            qty: 1,
            unit_price_cents: 100,
        }]
    }

    #[tokio::test]
    async fn test_create_and_cancel() {
        let service = InMemoryOrderService::new();
        let result = service
            .create(UserId::new(), &lines(), Some("1 Main St"), "c:create_order")
            .await
            .unwrap();
        assert_eq!(result.order_id, "ORD-0001");
        assert_eq!(service.open_orders(), 1);

        service.cancel(&result.order_id, "c:cancel_order").await.unwrap();
        assert_eq!(service.open_orders(), 0);
    }

    #[tokio::test]
    async fn test_create_replays_by_key() {
        let service = InMemoryOrderService::new();
        let user = UserId::new();
        let a = service.create(user, &lines(), None, "k").await.unwrap();
        let b = service.create(user, &lines(), None, "k").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(service.open_orders(), 1);
    }

    #[tokio::test]
    async fn test_reject() {
        let service = InMemoryOrderService::new();
        service.set_reject(true);
        let err = service
            .create(UserId::new(), &lines(), None, "k")
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
