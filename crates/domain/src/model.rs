//! Conversation data model.
//!
//! One `Conversation` exists per (organization, lead). Messages are
//! append-only; `ScheduledAction`s form the pending follow-up ladder.
//! All enums carry a `parse_loose` constructor so strings coming back
//! from an LLM never crash the orchestrator — unknown values degrade to
//! the safest variant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loose enum parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Normalize a raw LLM string for enum matching: lowercase, trim,
/// collapse separators to `_`, drop other punctuation.
/// `"Send Now!"` → `"send_now"`, `"WAIT-SCHEDULE"` → `"wait_schedule"`.
pub fn slug(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if (c.is_whitespace() || c == '-' || c == '_' || c == '.') && !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation enums
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Who drives the conversation. `Human` fully mutes the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationMode {
    Bot,
    Human,
}

impl ConversationMode {
    pub fn parse_loose(raw: &str) -> Self {
        match slug(raw).as_str() {
            "human" | "agent" | "operator" => ConversationMode::Human,
            _ => ConversationMode::Bot,
        }
    }
}

/// Sales funnel stage. Ordered; a conversation never moves to a
/// strictly-earlier stage except via explicit operator action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Greeting,
    Qualification,
    Pricing,
    Cta,
    Followup,
    Closed,
    Lost,
    Ghosted,
}

impl Stage {
    /// Ordinal used by the no-regression rule.
    /// `Cta` and `Followup` share an ordinal; terminal stages share the top.
    pub fn order(self) -> u8 {
        match self {
            Stage::Greeting => 0,
            Stage::Qualification => 1,
            Stage::Pricing => 2,
            Stage::Cta | Stage::Followup => 3,
            Stage::Closed | Stage::Lost | Stage::Ghosted => 4,
        }
    }

    /// Terminal stages never receive nudges.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Closed | Stage::Lost | Stage::Ghosted)
    }

    pub fn parse_loose(raw: &str, fallback: Stage) -> Stage {
        match slug(raw).as_str() {
            "greeting" | "greet" | "new" => Stage::Greeting,
            "qualification" | "qualifying" | "qualify" | "qualified" => Stage::Qualification,
            "pricing" | "price" | "quote" => Stage::Pricing,
            "cta" | "call_to_action" => Stage::Cta,
            "followup" | "follow_up" => Stage::Followup,
            "closed" | "close" | "won" => Stage::Closed,
            "lost" => Stage::Lost,
            "ghosted" | "ghost" => Stage::Ghosted,
            _ => fallback,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Greeting => "greeting",
            Stage::Qualification => "qualification",
            Stage::Pricing => "pricing",
            Stage::Cta => "cta",
            Stage::Followup => "followup",
            Stage::Closed => "closed",
            Stage::Lost => "lost",
            Stage::Ghosted => "ghosted",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How close the lead looks to buying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentLevel {
    Unknown,
    Low,
    Medium,
    High,
}

impl IntentLevel {
    pub fn parse_loose(raw: &str) -> Self {
        match slug(raw).as_str() {
            "low" => IntentLevel::Low,
            "medium" | "mid" | "med" => IntentLevel::Medium,
            "high" | "hot" => IntentLevel::High,
            _ => IntentLevel::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Negative,
    Neutral,
    Positive,
}

impl Sentiment {
    pub fn parse_loose(raw: &str) -> Self {
        match slug(raw).as_str() {
            "negative" | "angry" | "frustrated" | "bad" => Sentiment::Negative,
            "positive" | "happy" | "good" => Sentiment::Positive,
            _ => Sentiment::Neutral,
        }
    }
}

/// Risk grading on the Classify output. Unknown strings grade `High` so
/// a confused model can only ever escalate, never slip through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Med,
    High,
}

impl RiskLevel {
    pub fn parse_loose(raw: &str) -> Self {
        match slug(raw).as_str() {
            "low" | "none" | "ok" => RiskLevel::Low,
            "med" | "medium" | "mid" => RiskLevel::Med,
            _ => RiskLevel::High,
        }
    }
}

/// What the Classify stage decided to do with this turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    SendNow,
    WaitSchedule,
    InitiateCta,
    FlagAttention,
    HandoffHuman,
}

impl DecisionAction {
    /// Unknown actions degrade to `WaitSchedule` — the system prefers
    /// under-responding to mis-responding.
    pub fn parse_loose(raw: &str) -> Self {
        match slug(raw).as_str() {
            "send_now" | "send" | "sendnow" | "respond" | "reply" => DecisionAction::SendNow,
            "initiate_cta" | "cta" => DecisionAction::InitiateCta,
            "flag_attention" | "flag" | "attention" => DecisionAction::FlagAttention,
            "handoff_human" | "handoff" | "human" | "escalate" => DecisionAction::HandoffHuman,
            _ => DecisionAction::WaitSchedule,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    Lead,
    Bot,
    Human,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Aggregates
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The central aggregate — one per (organization, lead).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub lead_id: Uuid,
    pub mode: ConversationMode,
    pub stage: Stage,
    pub intent_level: IntentLevel,
    pub user_sentiment: Sentiment,
    /// Compact rolling summary the pipeline reads back each turn.
    #[serde(default)]
    pub rolling_summary: String,
    #[serde(default)]
    pub needs_human_attention: bool,
    #[serde(default)]
    pub human_attention_resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_user_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_bot_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub followup_count_24h: u32,
    #[serde(default)]
    pub total_nudges: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(organization_id: Uuid, lead_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id,
            lead_id,
            mode: ConversationMode::Bot,
            stage: Stage::Greeting,
            intent_level: IntentLevel::Unknown,
            user_sentiment: Sentiment::Neutral,
            rolling_summary: String::new(),
            needs_human_attention: false,
            human_attention_resolved_at: None,
            last_user_message_at: None,
            last_bot_message_at: None,
            followup_count_24h: 0,
            total_nudges: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether follow-up nudges may be enrolled or fired right now.
    pub fn nudges_suppressed(&self) -> bool {
        self.mode == ConversationMode::Human
            || self.needs_human_attention
            || self.stage.is_terminal()
    }
}

/// An atomic field-set applied to a conversation in one store update.
///
/// `needs_human_attention` OR-merges with the existing flag: once raised,
/// only `resolve_attention` (an explicit operator action) clears it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationPatch {
    pub mode: Option<ConversationMode>,
    pub stage: Option<Stage>,
    pub intent_level: Option<IntentLevel>,
    pub user_sentiment: Option<Sentiment>,
    pub rolling_summary: Option<String>,
    pub needs_human_attention: Option<bool>,
    /// Clears the attention flag and stamps the resolution time.
    pub resolve_attention: Option<DateTime<Utc>>,
    pub last_user_message_at: Option<DateTime<Utc>>,
    pub last_bot_message_at: Option<DateTime<Utc>>,
    pub followup_count_24h: Option<u32>,
    pub total_nudges: Option<u32>,
}

impl ConversationPatch {
    pub fn apply(&self, conv: &mut Conversation, now: DateTime<Utc>) {
        if let Some(mode) = self.mode {
            conv.mode = mode;
        }
        if let Some(stage) = self.stage {
            conv.stage = stage;
        }
        if let Some(intent) = self.intent_level {
            conv.intent_level = intent;
        }
        if let Some(sentiment) = self.user_sentiment {
            conv.user_sentiment = sentiment;
        }
        if let Some(ref summary) = self.rolling_summary {
            conv.rolling_summary = summary.clone();
        }
        if let Some(flag) = self.needs_human_attention {
            conv.needs_human_attention = conv.needs_human_attention || flag;
        }
        if let Some(resolved_at) = self.resolve_attention {
            conv.needs_human_attention = false;
            conv.human_attention_resolved_at = Some(resolved_at);
        }
        if let Some(ts) = self.last_user_message_at {
            conv.last_user_message_at = Some(ts);
        }
        if let Some(ts) = self.last_bot_message_at {
            conv.last_bot_message_at = Some(ts);
        }
        if let Some(n) = self.followup_count_24h {
            conv.followup_count_24h = n;
        }
        if let Some(n) = self.total_nudges {
            conv.total_nudges = n;
        }
        conv.updated_at = now;
    }
}

/// Append-only transcript entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender: Sender,
    pub direction: Direction,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// A durable pending task — currently only follow-up nudges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledAction {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub kind: ActionKind,
    pub fire_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status: ActionStatus,
    /// Human-readable reason, e.g. `"nudge +10m"`.
    pub context: String,
}

impl ScheduledAction {
    /// A user message newer than the action makes it obsolete — the lead
    /// has already spoken since it was scheduled.
    pub fn is_stale(&self, last_user_message_at: Option<DateTime<Utc>>) -> bool {
        matches!(last_user_message_at, Some(ts) if self.created_at < ts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Followup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Claimed,
    Fired,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub phone: String,
    pub display_name: String,
}

/// A connected messaging account: maps the provider's phone number id to
/// an organization and carries the outbound credentials plus the business
/// context the pipeline speaks from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    pub phone_number_id: String,
    pub organization_id: Uuid,
    pub organization_name: String,
    pub access_token: String,
    pub api_version: String,
    pub business_description: String,
    #[serde(default)]
    pub ctas: Vec<CtaOption>,
}

/// A call-to-action the pipeline may select for the lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CtaOption {
    pub id: String,
    pub label: String,
    pub kind: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_normalizes_llm_strings() {
        assert_eq!(slug("Send Now!"), "send_now");
        assert_eq!(slug("  WAIT-SCHEDULE "), "wait_schedule");
        assert_eq!(slug("handoff_human"), "handoff_human");
        assert_eq!(slug("\"high\""), "high");
    }

    #[test]
    fn stage_order_is_monotone_through_the_funnel() {
        assert!(Stage::Greeting.order() < Stage::Qualification.order());
        assert!(Stage::Qualification.order() < Stage::Pricing.order());
        assert!(Stage::Pricing.order() < Stage::Cta.order());
        assert_eq!(Stage::Cta.order(), Stage::Followup.order());
        assert!(Stage::Followup.order() < Stage::Closed.order());
        assert_eq!(Stage::Closed.order(), Stage::Lost.order());
    }

    #[test]
    fn terminal_stages() {
        assert!(Stage::Closed.is_terminal());
        assert!(Stage::Lost.is_terminal());
        assert!(Stage::Ghosted.is_terminal());
        assert!(!Stage::Cta.is_terminal());
    }

    #[test]
    fn action_parse_falls_back_to_wait() {
        assert_eq!(DecisionAction::parse_loose("SEND_NOW"), DecisionAction::SendNow);
        assert_eq!(DecisionAction::parse_loose("Initiate CTA"), DecisionAction::InitiateCta);
        assert_eq!(
            DecisionAction::parse_loose("something weird"),
            DecisionAction::WaitSchedule
        );
    }

    #[test]
    fn risk_parse_defaults_to_high() {
        assert_eq!(RiskLevel::parse_loose("low"), RiskLevel::Low);
        assert_eq!(RiskLevel::parse_loose("MEDIUM"), RiskLevel::Med);
        assert_eq!(RiskLevel::parse_loose("???"), RiskLevel::High);
    }

    #[test]
    fn stage_parse_keeps_fallback_for_unknown() {
        assert_eq!(Stage::parse_loose("Pricing", Stage::Greeting), Stage::Pricing);
        assert_eq!(
            Stage::parse_loose("negotiation", Stage::Qualification),
            Stage::Qualification
        );
    }

    #[test]
    fn attention_flag_or_merges_and_only_resolve_clears() {
        let now = Utc::now();
        let mut conv = Conversation::new(Uuid::new_v4(), Uuid::new_v4(), now);

        let raise = ConversationPatch {
            needs_human_attention: Some(true),
            ..Default::default()
        };
        raise.apply(&mut conv, now);
        assert!(conv.needs_human_attention);

        // A later classify saying "false" must not clear the flag.
        let lower = ConversationPatch {
            needs_human_attention: Some(false),
            ..Default::default()
        };
        lower.apply(&mut conv, now);
        assert!(conv.needs_human_attention);

        let resolve = ConversationPatch {
            resolve_attention: Some(now),
            ..Default::default()
        };
        resolve.apply(&mut conv, now);
        assert!(!conv.needs_human_attention);
        assert_eq!(conv.human_attention_resolved_at, Some(now));
    }

    #[test]
    fn stale_action_detection() {
        let now = Utc::now();
        let action = ScheduledAction {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            kind: ActionKind::Followup,
            fire_at: now + chrono::Duration::minutes(10),
            created_at: now,
            status: ActionStatus::Pending,
            context: "nudge +10m".into(),
        };

        assert!(!action.is_stale(None));
        assert!(!action.is_stale(Some(now - chrono::Duration::minutes(5))));
        assert!(action.is_stale(Some(now + chrono::Duration::minutes(5))));
    }

    #[test]
    fn conversation_serde_round_trip() {
        let conv = Conversation::new(Uuid::new_v4(), Uuid::new_v4(), Utc::now());
        let json = serde_json::to_string(&conv).unwrap();
        let back: Conversation = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, conv.id);
        assert_eq!(back.stage, Stage::Greeting);
        assert_eq!(back.mode, ConversationMode::Bot);
    }
}
