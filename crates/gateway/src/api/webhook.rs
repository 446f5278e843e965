//! Messaging-provider webhook.
//!
//! `GET /webhook` answers the provider's subscription handshake;
//! `POST /webhook` accepts delivery envelopes, deduplicates by provider
//! message id, and hands each text message to the orchestrator
//! asynchronously — the provider gets its 200 immediately.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::runtime::InboundUserMessage;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dedupe store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-memory idempotency store. Tracks seen provider message ids with a
/// TTL to absorb webhook retries and redeliveries.
pub struct DedupeStore {
    seen: parking_lot::Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl DedupeStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: parking_lot::Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Returns `true` if this message id was already seen (duplicate).
    pub fn check_and_insert(&self, message_id: &str) -> bool {
        let mut map = self.seen.lock();
        let now = Instant::now();

        // Lazy cleanup when the map grows large.
        if map.len() > 10_000 {
            map.retain(|_, ts| now.duration_since(*ts) < self.ttl);
        }

        if let Some(ts) = map.get(message_id) {
            if now.duration_since(*ts) < self.ttl {
                return true;
            }
        }

        map.insert(message_id.to_string(), now);
        false
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /webhook — subscription handshake
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

pub async fn verify(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> impl IntoResponse {
    let (Some(mode), Some(token)) = (query.mode.as_deref(), query.verify_token.as_deref()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "status": "error", "message": "Missing parameters" })),
        )
            .into_response();
    };

    if mode == "subscribe" {
        if let Some(challenge) = query.challenge {
            let accepted = match state.config.verify_token() {
                Some(expected) => token == expected,
                // Dev mode: no token configured, accept the handshake.
                None => true,
            };
            if accepted {
                tracing::info!("webhook verification successful");
                return challenge.into_response();
            }
            tracing::warn!("webhook verify token mismatch");
        }
    }

    (
        StatusCode::FORBIDDEN,
        Json(serde_json::json!({ "status": "error", "message": "Verification failed" })),
    )
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /webhook — delivery envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub entry: Vec<Entry>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Entry {
    #[serde(default)]
    pub changes: Vec<Change>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Change {
    #[serde(default)]
    pub value: ChangeValue,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChangeValue {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub contacts: Vec<Contact>,
    #[serde(default)]
    pub messages: Vec<ProviderMessage>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub phone_number_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct Contact {
    #[serde(default)]
    pub wa_id: String,
    #[serde(default)]
    pub profile: Profile,
}

#[derive(Debug, Default, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProviderMessage {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub id: String,
    /// Epoch seconds, as a string, per the provider contract.
    #[serde(default)]
    pub timestamp: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<TextBody>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TextBody {
    #[serde(default)]
    pub body: String,
}

/// Parse the provider's epoch-seconds-as-string timestamp; a missing or
/// malformed value falls back to now.
fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    raw.parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now)
}

/// Flatten the envelope into inbound user messages, skipping non-text
/// entries.
fn extract_messages(envelope: &WebhookEnvelope) -> Vec<(String, InboundUserMessage)> {
    let mut out = Vec::new();
    for entry in &envelope.entry {
        for change in &entry.changes {
            let value = &change.value;
            for message in &value.messages {
                let Some(text) = message.text.as_ref() else {
                    tracing::debug!(kind = %message.kind, "skipping non-text message");
                    continue;
                };
                let sender_name = value
                    .contacts
                    .iter()
                    .find(|c| c.wa_id == message.from)
                    .or_else(|| value.contacts.first())
                    .map(|c| c.profile.name.clone())
                    .unwrap_or_default();
                out.push((
                    message.id.clone(),
                    InboundUserMessage {
                        phone_number_id: value.metadata.phone_number_id.clone(),
                        from_phone: message.from.clone(),
                        sender_name,
                        text: text.body.clone(),
                        timestamp: parse_timestamp(&message.timestamp),
                    },
                ));
            }
        }
    }
    out
}

pub async fn receive(
    State(state): State<AppState>,
    Json(raw): Json<serde_json::Value>,
) -> impl IntoResponse {
    let envelope: WebhookEnvelope = match serde_json::from_value(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            // Malformed payloads are dropped — a non-200 would make the
            // provider redeliver the same garbage forever.
            tracing::warn!(error = %e, "malformed webhook payload dropped");
            return Json(serde_json::json!({ "status": "ignored" })).into_response();
        }
    };

    let mut accepted = 0usize;
    for (provider_msg_id, inbound) in extract_messages(&envelope) {
        if !provider_msg_id.is_empty() && state.dedupe.check_and_insert(&provider_msg_id) {
            tracing::debug!(provider_msg_id = %provider_msg_id, "duplicate delivery suppressed");
            continue;
        }
        accepted += 1;

        let orchestrator = state.orchestrator.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.handle_user_message(inbound).await {
                tracing::error!(error = %e, "inbound message processing failed");
            }
        });
    }

    Json(serde_json::json!({ "status": "received", "accepted": accepted })).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
