//! Runtime configuration.
//!
//! Deserialized from an optional `leadflow.toml`; every field has a
//! serde default so an empty file (or none at all) yields a working dev
//! configuration. Secrets are never stored in the file — each secret
//! field names the environment variable it is read from at startup.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::model::{CtaOption, Integration};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub followups: FollowupConfig,
    #[serde(default)]
    pub reply: ReplyConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Connected messaging accounts, seeded into the store at startup.
    #[serde(default)]
    pub integrations: Vec<IntegrationConfig>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// Allowed CORS origins for the operator dashboard. `"*"` allows all.
    #[serde(default = "d_origins")]
    pub allowed_origins: Vec<String>,
    /// Env var holding the operator WebSocket token. Unset = dev mode.
    #[serde(default = "d_api_token_env")]
    pub api_token_env: String,
    #[serde(default = "d_max_concurrent")]
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            allowed_origins: d_origins(),
            api_token_env: d_api_token_env(),
            max_concurrent_requests: d_max_concurrent(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messaging transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Env var holding the webhook verify token.
    #[serde(default = "d_verify_token_env")]
    pub verify_token_env: String,
    #[serde(default = "d_graph_url")]
    pub base_url: String,
    #[serde(default = "d_api_version")]
    pub api_version: String,
    #[serde(default = "d_transport_timeout")]
    pub timeout_secs: u64,
    /// TTL for the inbound provider-message-id seen-set.
    #[serde(default = "d_dedupe_ttl")]
    pub dedupe_ttl_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            verify_token_env: d_verify_token_env(),
            base_url: d_graph_url(),
            api_version: d_api_version(),
            timeout_secs: d_transport_timeout(),
            dedupe_ttl_secs: d_dedupe_ttl(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "d_llm_url")]
    pub base_url: String,
    #[serde(default = "d_llm_key_env")]
    pub api_key_env: String,
    #[serde(default = "d_llm_model")]
    pub model: String,
    /// Hard deadline per call; a timeout behaves as a protocol failure.
    #[serde(default = "d_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "d_llm_retries")]
    pub max_retries: u32,
    #[serde(default = "d_backoff_ms")]
    pub backoff_base_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: d_llm_url(),
            api_key_env: d_llm_key_env(),
            model: d_llm_model(),
            timeout_secs: d_llm_timeout(),
            max_retries: d_llm_retries(),
            backoff_base_ms: d_backoff_ms(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Follow-up ladder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowupConfig {
    /// Static ladder offsets from the user's message, in minutes.
    #[serde(default = "d_offsets")]
    pub offsets_minutes: Vec<i64>,
    #[serde(default = "d_poll_interval")]
    pub poll_interval_secs: u64,
    /// Max actions claimed per poll.
    #[serde(default = "d_claim_limit")]
    pub claim_limit: usize,
}

impl Default for FollowupConfig {
    fn default() -> Self {
        Self {
            offsets_minutes: d_offsets(),
            poll_interval_secs: d_poll_interval(),
            claim_limit: d_claim_limit(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reply constraints
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyConfig {
    #[serde(default = "d_max_words")]
    pub max_words: usize,
    #[serde(default = "d_questions")]
    pub questions_per_message: usize,
    #[serde(default = "d_language")]
    pub language_pref: String,
    /// How many recent messages the pipeline sees.
    #[serde(default = "d_context_messages")]
    pub context_messages: usize,
    #[serde(default = "d_summary_max")]
    pub summary_max_chars: usize,
    /// Cap for the dirty-append fallback summary.
    #[serde(default = "d_dirty_summary_max")]
    pub dirty_summary_max_chars: usize,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            max_words: d_max_words(),
            questions_per_message: d_questions(),
            language_pref: d_language(),
            context_messages: d_context_messages(),
            summary_max_chars: d_summary_max(),
            dirty_summary_max_chars: d_dirty_summary_max(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "d_state_path")]
    pub state_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_path: d_state_path(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Integrations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One connected messaging account. The access token itself never
/// appears in the file — only the env var that holds it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationConfig {
    pub phone_number_id: String,
    pub organization_id: Uuid,
    pub organization_name: String,
    #[serde(default = "d_access_token_env")]
    pub access_token_env: String,
    #[serde(default = "d_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub business_description: String,
    #[serde(default)]
    pub ctas: Vec<CtaOption>,
}

impl IntegrationConfig {
    /// Resolve into a store record, reading the access token from the
    /// environment (empty in dev mode — outbound sends will fail loudly).
    pub fn to_integration(&self) -> Integration {
        Integration {
            phone_number_id: self.phone_number_id.clone(),
            organization_id: self.organization_id,
            organization_name: self.organization_name.clone(),
            access_token: read_env(&self.access_token_env).unwrap_or_default(),
            api_version: self.api_version.clone(),
            business_description: self.business_description.clone(),
            ctas: self.ctas.clone(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl Config {
    /// Sanity-check the configuration. Errors abort startup; warnings are
    /// logged and tolerated.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let mut error = |message: String| {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message,
            })
        };

        if self.followups.offsets_minutes.is_empty() {
            error("followups.offsets_minutes must not be empty".into());
        }
        if self.followups.offsets_minutes.iter().any(|m| *m <= 0) {
            error("followups.offsets_minutes must all be positive".into());
        }
        if self.reply.max_words == 0 {
            error("reply.max_words must be at least 1".into());
        }
        if self.reply.summary_max_chars > self.reply.dirty_summary_max_chars {
            error("reply.summary_max_chars must not exceed reply.dirty_summary_max_chars".into());
        }
        if self.llm.timeout_secs == 0 {
            error("llm.timeout_secs must be at least 1".into());
        }

        if std::env::var(&self.transport.verify_token_env).is_err() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: format!(
                    "webhook verification disabled — set {} to enable",
                    self.transport.verify_token_env
                ),
            });
        }
        if std::env::var(&self.llm.api_key_env).is_err() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: format!(
                    "LLM API key missing — set {} before handling traffic",
                    self.llm.api_key_env
                ),
            });
        }
        for integration in &self.integrations {
            if std::env::var(&integration.access_token_env).is_err() {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Warning,
                    message: format!(
                        "integration {} has no access token — set {}",
                        integration.phone_number_id, integration.access_token_env
                    ),
                });
            }
        }

        issues
    }

    /// Webhook verify token, read from the configured env var.
    pub fn verify_token(&self) -> Option<String> {
        read_env(&self.transport.verify_token_env)
    }

    /// LLM provider API key.
    pub fn llm_api_key(&self) -> Option<String> {
        read_env(&self.llm.api_key_env)
    }

    /// Operator WebSocket token. `None` = dev mode (no auth).
    pub fn operator_token(&self) -> Option<String> {
        read_env(&self.server.api_token_env)
    }
}

fn read_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

// ── serde default helpers ──────────────────────────────────────────

fn d_state_path() -> PathBuf {
    PathBuf::from("./state")
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    8460
}
fn d_origins() -> Vec<String> {
    vec!["http://localhost:*".into()]
}
fn d_api_token_env() -> String {
    "LF_API_TOKEN".into()
}
fn d_max_concurrent() -> usize {
    256
}
fn d_verify_token_env() -> String {
    "LF_VERIFY_TOKEN".into()
}
fn d_access_token_env() -> String {
    "LF_WA_ACCESS_TOKEN".into()
}
fn d_graph_url() -> String {
    "https://graph.facebook.com".into()
}
fn d_api_version() -> String {
    "v18.0".into()
}
fn d_transport_timeout() -> u64 {
    10
}
fn d_dedupe_ttl() -> u64 {
    3_600
}
fn d_llm_url() -> String {
    "https://api.groq.com/openai/v1".into()
}
fn d_llm_key_env() -> String {
    "LF_LLM_API_KEY".into()
}
fn d_llm_model() -> String {
    "llama-3.3-70b-versatile".into()
}
fn d_llm_timeout() -> u64 {
    15
}
fn d_llm_retries() -> u32 {
    2
}
fn d_backoff_ms() -> u64 {
    500
}
fn d_offsets() -> Vec<i64> {
    vec![10, 180, 360]
}
fn d_poll_interval() -> u64 {
    5
}
fn d_claim_limit() -> usize {
    16
}
fn d_max_words() -> usize {
    80
}
fn d_questions() -> usize {
    1
}
fn d_language() -> String {
    "en".into()
}
fn d_context_messages() -> usize {
    3
}
fn d_summary_max() -> usize {
    500
}
fn d_dirty_summary_max() -> usize {
    2_000
}
