//! HTTP surface: the provider webhook, the operator WebSocket, and a
//! health probe.

use axum::routing::get;
use axum::Router;

use crate::state::AppState;

pub mod health;
pub mod operators;
pub mod webhook;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", get(webhook::verify).post(webhook::receive))
        .route("/ws/operators", get(operators::operator_ws))
        .route("/health", get(health::health))
        .with_state(state)
}
