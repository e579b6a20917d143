//! Cart service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use async_trait::async_trait;
use common::UserId;
use inventory_store::CartSnapshot;

use super::Faults;
use crate::error::PeerError;

/// Shopping cart peer.
#[async_trait]
pub trait CartService: Send + Sync {
    /// Returns the user's cart; an unknown user has an empty cart.
    async fn get(&self, user_id: UserId) -> Result<CartSnapshot, PeerError>;

    async fn clear(&self, user_id: UserId, idem_key: &str) -> Result<(), PeerError>;
}

#[derive(Debug, Default)]
struct InMemoryCartState {
    carts: HashMap<UserId, CartSnapshot>,
    get_faults: Faults,
    clear_faults: Faults,
}

/// In-memory cart service for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCartService {
    state: Arc<RwLock<InMemoryCartState>>,
}

impl InMemoryCartService {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> RwLockWriteGuard<'_, InMemoryCartState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_cart(&self, user_id: UserId, cart: CartSnapshot) {
        self.state().carts.insert(user_id, cart);
    }

    pub fn cart(&self, user_id: UserId) -> CartSnapshot {
        self.state().carts.get(&user_id).cloned().unwrap_or_default()
    }

    pub fn fail_next_gets(&self, n: u32) {
        self.state().get_faults.fail_next(n);
    }

    /// Fails every clear until reset.
    pub fn set_clear_broken(&self, broken: bool) {
        self.state().clear_faults.set_reject(broken);
    }
}

#[async_trait]
impl CartService for InMemoryCartService {
    async fn get(&self, user_id: UserId) -> Result<CartSnapshot, PeerError> {
        let mut state = self.state();
        state.get_faults.check("cart")?;
        Ok(state.carts.get(&user_id).cloned().unwrap_or_default())
    }

    async fn clear(&self, user_id: UserId, _idem_key: &str) -> Result<(), PeerError> {
        let mut state = self.state();
        state.clear_faults.check("cart clear")?;
        state.carts.remove(&user_id);
        Ok(())
    }
}
