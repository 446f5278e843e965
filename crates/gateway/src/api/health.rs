//! Liveness endpoint for load balancers and the operator dashboard.

use axum::extract::State;
use axum::response::{IntoResponse, Json};
use chrono::Utc;

use crate::state::AppState;

/// GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let uptime_secs = (Utc::now() - state.started_at).num_seconds().max(0);
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime_secs,
        "operator_sessions": state.bus.session_count(),
        "active_lanes": state.lanes.lane_count(),
    }))
}
