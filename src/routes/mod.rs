use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod health;

/// Probe endpoints served next to the worker.
pub fn create_router(state: AppState) -> Router<()> {
    Router::new()
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
