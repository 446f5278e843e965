//! Outbound messaging transport.
//!
//! One operation: deliver a text to a lead's phone through the
//! WhatsApp-style provider API. The orchestrator records the outbound
//! message *before* calling this, and maps a send failure to the
//! human-attention flag instead of retrying (a retry could double-send).

use serde_json::Value;

use lf_domain::model::Integration;
use lf_domain::{Error, Result};

/// Provider acknowledgement for one delivered message.
#[derive(Debug, Clone)]
pub struct SentReceipt {
    pub provider_message_id: String,
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        integration: &Integration,
        to_phone: &str,
        text: &str,
    ) -> Result<SentReceipt>;
}

/// Reqwest-backed transport speaking the Graph messages API.
pub struct WhatsAppTransport {
    client: reqwest::Client,
    base_url: String,
}

impl WhatsAppTransport {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait::async_trait]
impl Transport for WhatsAppTransport {
    async fn send(
        &self,
        integration: &Integration,
        to_phone: &str,
        text: &str,
    ) -> Result<SentReceipt> {
        let url = format!(
            "{}/{}/{}/messages",
            self.base_url, integration.api_version, integration.phone_number_id
        );
        let body = serde_json::json!({
            "messaging_product": "whatsapp",
            "to": to_phone,
            "type": "text",
            "text": { "body": text },
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", integration.access_token))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status();
        let payload = response
            .text()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(Error::Transport(format!(
                "provider returned {status}: {payload}"
            )));
        }

        let parsed: Value = serde_json::from_str(&payload)
            .map_err(|e| Error::Transport(format!("bad send response: {e}")))?;
        let provider_message_id = parsed["messages"][0]["id"]
            .as_str()
            .unwrap_or_default()
            .to_owned();

        Ok(SentReceipt {
            provider_message_id,
        })
    }
}
