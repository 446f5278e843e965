use std::sync::Arc;

use chrono::{DateTime, Utc};

use lf_domain::config::Config;
use lf_store::Store;

use crate::api::webhook::DedupeStore;
use crate::runtime::{ConversationLaneMap, OperatorBus, Orchestrator};

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub orchestrator: Arc<Orchestrator>,
    pub bus: Arc<OperatorBus>,
    pub lanes: Arc<ConversationLaneMap>,
    /// Idempotency store for inbound provider message ids.
    pub dedupe: Arc<DedupeStore>,
    /// SHA-256 hash of the operator token (read once at startup).
    /// `None` = dev mode (no auth enforced).
    pub operator_token_hash: Option<Vec<u8>>,
    pub started_at: DateTime<Utc>,
}
