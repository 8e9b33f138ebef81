//! Application state shared across all HTTP handlers

use std::sync::Arc;

use crate::pool::PoolManager;
use crate::store::DesiredStore;

/// Shared application state passed to all Axum handlers
#[derive(Clone)]
pub struct AppState {
    inner: Arc<StateInner>,
}

struct StateInner {
    store: DesiredStore,
    pool: Arc<PoolManager>,
}

impl AppState {
    pub fn new(store: DesiredStore, pool: Arc<PoolManager>) -> Self {
        AppState {
            inner: Arc::new(StateInner { store, pool }),
        }
    }

    pub fn store(&self) -> &DesiredStore {
        &self.inner.store
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.inner.pool
    }
}
