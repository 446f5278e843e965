//! Operator WebSocket channel.
//!
//! Flow:
//! 1. Operator connects to `/ws/operators?token=<tok>&user_id=&org_id=`
//! 2. The session is registered on the bus, scoped to its organization
//! 3. Server pushes `{event, payload}` objects as the orchestrator
//!    publishes them
//! 4. Client messages are best-effort takeover commands
//!    (`resolve_attention`, `set_mode`)

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use uuid::Uuid;

use lf_domain::model::ConversationMode;

use crate::state::AppState;

/// Constant-time token comparison via SHA-256 digest.
/// Hashing normalizes lengths so ct_eq always compares 32 bytes.
fn token_matches(provided: &str, expected_hash: &[u8]) -> bool {
    let provided_hash = Sha256::digest(provided.as_bytes());
    provided_hash.as_slice().ct_eq(expected_hash).into()
}

#[derive(Debug, Deserialize)]
pub struct OperatorQuery {
    pub token: Option<String>,
    pub user_id: Uuid,
    pub org_id: Uuid,
}

/// A best-effort command from an operator session.
#[derive(Debug, Deserialize)]
struct OperatorCommand {
    action: String,
    #[serde(default)]
    conversation_id: Option<Uuid>,
    #[serde(default)]
    mode: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// GET /ws/operators — upgrade to WebSocket.
///
/// Auth: when an operator token is configured the `token` query param
/// must match (constant-time). Unset = dev mode, open access.
pub async fn operator_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<OperatorQuery>,
) -> impl IntoResponse {
    if let Some(ref expected_hash) = state.operator_token_hash {
        let provided = query.token.as_deref().unwrap_or("");
        if !token_matches(provided, expected_hash) {
            return (StatusCode::UNAUTHORIZED, "invalid or missing operator token")
                .into_response();
        }
    }

    let user_id = query.user_id;
    let org_id = query.org_id;
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id, org_id))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: Uuid, org_id: Uuid) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let (event_tx, mut event_rx) = mpsc::channel(64);
    let session = state.bus.connect(user_id, org_id, event_tx);
    tracing::info!(%user_id, %org_id, "operator connected");

    // Writer task: forward bus events to the socket.
    let writer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let Ok(json) = serde_json::to_string(&event) else {
                continue;
            };
            if ws_sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // Reader loop: best-effort operator commands.
    while let Some(Ok(message)) = ws_stream.next().await {
        match message {
            Message::Text(text) => {
                match serde_json::from_str::<OperatorCommand>(&text) {
                    Ok(command) => handle_command(&state, command).await,
                    Err(_) => {
                        tracing::debug!(%user_id, "ignoring unparseable operator message");
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    state.bus.disconnect(user_id, org_id, session);
    tracing::info!(%user_id, "operator disconnected");
}

async fn handle_command(state: &AppState, command: OperatorCommand) {
    let Some(conversation_id) = command.conversation_id else {
        tracing::debug!(action = %command.action, "operator command without conversation_id");
        return;
    };

    let result = match command.action.as_str() {
        "resolve_attention" => state
            .orchestrator
            .resolve_attention(conversation_id)
            .await
            .map(|_| ()),
        "set_mode" => {
            let mode = command
                .mode
                .as_deref()
                .map(ConversationMode::parse_loose)
                .unwrap_or(ConversationMode::Human);
            state
                .orchestrator
                .set_mode(conversation_id, mode)
                .await
                .map(|_| ())
        }
        other => {
            tracing::debug!(action = %other, "unknown operator command");
            Ok(())
        }
    };

    if let Err(e) = result {
        // Best-effort by contract: log and move on.
        tracing::warn!(
            conversation_id = %conversation_id,
            action = %command.action,
            error = %e,
            "operator command failed"
        );
    }
}
