//! HTTP control API router.

use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers;
use crate::state::AppState;

/// Build the control-plane router over the shared state.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/vms", post(handlers::create_vm))
        .route("/vms/{id}", get(handlers::get_vm).delete(handlers::delete_vm))
        .route("/stats", get(handlers::stats))
        .route("/metrics", get(handlers::metrics_scrape))
        .with_state(state)
}
