use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

pub mod health;
pub mod model;
pub mod predict;

/// Assemble the full route tree.
pub fn build(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(health::router())
        .merge(model::router())
        .merge(predict::router())
        .with_state(state)
}
