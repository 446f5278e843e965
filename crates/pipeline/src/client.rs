//! OpenAI-compatible chat client.
//!
//! Works with Groq, OpenAI, Ollama, vLLM and any other endpoint that
//! follows the chat completions contract. One request per pipeline
//! stage, non-streaming, JSON mode when the stage expects structured
//! output.

use serde_json::Value;

use lf_domain::config::LlmConfig;
use lf_domain::{Error, Result};

/// A single chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    /// Ask the provider for a JSON-only response.
    pub json_mode: bool,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Minimal chat interface the pipeline stages call.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    /// Send the request and return the assistant message content.
    async fn chat(&self, req: ChatRequest) -> Result<String>;
}

/// Reqwest-backed [`LlmClient`] speaking the OpenAI wire format.
pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpLlmClient {
    /// Build from config; the per-call deadline is baked into the
    /// reqwest client so a hung provider surfaces as [`Error::Timeout`].
    pub fn from_config(config: &LlmConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
        })
    }
}

#[async_trait::async_trait]
impl LlmClient for HttpLlmClient {
    async fn chat(&self, req: ChatRequest) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": req.system },
                { "role": "user", "content": req.user },
            ],
        });
        if req.json_mode {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("LLM call exceeded deadline: {e}"))
                } else {
                    Error::Http(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if !status.is_success() {
            // The body is kept verbatim — Groq-style providers embed the
            // model's malformed output as `failed_generation`, which the
            // extraction ladder can often still salvage.
            return Err(Error::Provider(text));
        }

        let parsed: Value =
            serde_json::from_str(&text).map_err(|e| Error::Provider(format!("bad envelope: {e}")))?;
        parsed["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_owned())
            .ok_or_else(|| Error::Provider("response carried no message content".into()))
    }
}
