//! Typed stage outputs.
//!
//! Raw LLM JSON is converted through `from_value` constructors that
//! parse every enum loosely and normalize out-of-range numbers, so the
//! orchestrator only ever sees well-formed payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use lf_domain::model::{DecisionAction, IntentLevel, RiskLevel, Sentiment, Stage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Classify
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskFlags {
    #[serde(default = "low")]
    pub spam: RiskLevel,
    #[serde(default = "low")]
    pub policy: RiskLevel,
    #[serde(default = "low")]
    pub hallucination: RiskLevel,
}

fn low() -> RiskLevel {
    RiskLevel::Low
}

impl RiskFlags {
    pub fn any_high(&self) -> bool {
        self.spam == RiskLevel::High
            || self.policy == RiskLevel::High
            || self.hallucination == RiskLevel::High
    }

    fn from_value(v: Option<&Value>) -> Self {
        let Some(v) = v else { return Self::default() };
        let level = |key: &str| {
            v.get(key)
                .and_then(Value::as_str)
                .map(RiskLevel::parse_loose)
                .unwrap_or(RiskLevel::Low)
        };
        Self {
            spam: level("spam"),
            policy: level("policy"),
            hallucination: level("hallucination"),
        }
    }
}

/// Output of the Classify stage — the per-turn decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyOutput {
    pub thought_process: String,
    pub situation_summary: String,
    pub intent_level: IntentLevel,
    pub user_sentiment: Sentiment,
    pub risk_flags: RiskFlags,
    pub action: DecisionAction,
    pub new_stage: Stage,
    pub should_respond: bool,
    pub selected_cta_id: Option<String>,
    pub cta_scheduled_at: Option<String>,
    pub followup_in_minutes: i64,
    pub followup_reason: String,
    pub confidence: f32,
    pub needs_human_attention: bool,
}

impl ClassifyOutput {
    /// Build from raw model JSON. `current_stage` is the fallback for an
    /// unparseable stage; `default_cta` backs an `initiate_cta` decision
    /// that forgot to pick one.
    pub fn from_value(v: &Value, current_stage: Stage, default_cta: Option<&str>) -> Self {
        let s = |key: &str| v.get(key).and_then(Value::as_str).unwrap_or("");
        let opt = |key: &str| {
            v.get(key)
                .and_then(Value::as_str)
                .filter(|raw| !raw.is_empty() && *raw != "null")
                .map(str::to_owned)
        };

        let action = DecisionAction::parse_loose(s("action"));
        let new_stage = Stage::parse_loose(s("new_stage"), current_stage);

        // Follow-up delay normalization: immediate sends wait for
        // nothing; a wait with no usable delay defaults to two hours.
        let raw_followup = v
            .get("followup_in_minutes")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let followup_in_minutes = match action {
            DecisionAction::SendNow => 0,
            DecisionAction::WaitSchedule if raw_followup <= 0 => 120,
            _ => raw_followup.max(0),
        };

        let mut selected_cta_id = opt("selected_cta_id");
        if action == DecisionAction::InitiateCta && selected_cta_id.is_none() {
            selected_cta_id = default_cta.map(str::to_owned);
        }

        let confidence = v
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 1.0) as f32;

        Self {
            thought_process: truncate_chars(s("thought_process"), 600),
            situation_summary: truncate_chars(s("situation_summary"), 300),
            intent_level: IntentLevel::parse_loose(s("intent_level")),
            user_sentiment: Sentiment::parse_loose(s("user_sentiment")),
            risk_flags: RiskFlags::from_value(v.get("risk_flags")),
            action,
            new_stage,
            should_respond: v
                .get("should_respond")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            selected_cta_id,
            cta_scheduled_at: opt("cta_scheduled_at"),
            followup_in_minutes,
            followup_reason: truncate_chars(s("followup_reason"), 100),
            confidence,
            needs_human_attention: v
                .get("needs_human_attention")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }

    /// Safe fallback applied when the stage fails on a user message:
    /// stay silent, keep the stage, let the ladder carry the thread.
    pub fn fallback(current_stage: Stage) -> Self {
        Self {
            thought_process: String::new(),
            situation_summary: "pipeline fallback".into(),
            intent_level: IntentLevel::Unknown,
            user_sentiment: Sentiment::Neutral,
            risk_flags: RiskFlags::default(),
            action: DecisionAction::WaitSchedule,
            new_stage: current_stage,
            should_respond: false,
            selected_cta_id: None,
            cta_scheduled_at: None,
            followup_in_minutes: 120,
            followup_reason: "system fallback".into(),
            confidence: 0.0,
            needs_human_attention: false,
        }
    }

    /// A turn this uncertain (or this risky) must reach a human instead
    /// of producing outbound text.
    pub fn high_risk_or_low_confidence(&self) -> bool {
        self.risk_flags.any_high() || self.confidence < 0.3
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Generate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Output of the Generate stage — the drafted reply plus self-check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateOutput {
    pub message_text: String,
    pub message_language: String,
    pub self_check_passed: bool,
    pub violations: Vec<String>,
}

impl GenerateOutput {
    pub fn from_value(v: &Value) -> Self {
        Self {
            message_text: v
                .get("message_text")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_owned(),
            message_language: v
                .get("message_language")
                .and_then(Value::as_str)
                .unwrap_or("en")
                .to_owned(),
            self_check_passed: v
                .get("self_check_passed")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            violations: v
                .get("violations")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// Deterministic post-check: a draft over the word budget or asking
    /// too many questions fails regardless of what the model claimed.
    pub fn enforce_constraints(&mut self, max_words: usize, questions_per_message: usize) {
        let words = self.message_text.split_whitespace().count();
        if words > max_words {
            self.self_check_passed = false;
            self.violations.push(format!("reply has {words} words, limit {max_words}"));
        }
        let questions = self.message_text.matches('?').count();
        if questions > questions_per_message {
            self.self_check_passed = false;
            self.violations.push(format!(
                "reply asks {questions} questions, limit {questions_per_message}"
            ));
        }
    }

    /// Whether the orchestrator may dispatch this draft.
    pub fn sendable(&self) -> bool {
        self.self_check_passed && !self.message_text.is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Summarize
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryOutput {
    pub updated_rolling_summary: String,
}

impl SummaryOutput {
    pub fn from_value(v: &Value, max_chars: usize) -> Self {
        Self {
            updated_rolling_summary: truncate_chars(
                v.get("updated_rolling_summary")
                    .and_then(Value::as_str)
                    .unwrap_or(""),
                max_chars,
            ),
        }
    }
}

/// Char-boundary-safe truncation.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_owned()
    } else {
        text.chars().take(max_chars).collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_parses_a_clean_payload() {
        let v = serde_json::json!({
            "thought_process": "user greeted us",
            "situation_summary": "fresh lead says hi",
            "intent_level": "unknown",
            "user_sentiment": "neutral",
            "risk_flags": {"spam": "low", "policy": "low", "hallucination": "low"},
            "action": "send_now",
            "new_stage": "greeting",
            "should_respond": true,
            "followup_in_minutes": 30,
            "followup_reason": "keep momentum",
            "confidence": 0.92,
            "needs_human_attention": false,
        });
        let out = ClassifyOutput::from_value(&v, Stage::Greeting, None);
        assert_eq!(out.action, DecisionAction::SendNow);
        assert!(out.should_respond);
        // SendNow never waits.
        assert_eq!(out.followup_in_minutes, 0);
        assert!((out.confidence - 0.92).abs() < 1e-6);
    }

    #[test]
    fn classify_survives_messy_enums_and_missing_fields() {
        let v = serde_json::json!({
            "action": "Wait & Schedule",
            "new_stage": "The Pricing Stage??",
            "confidence": 3.5,
        });
        let out = ClassifyOutput::from_value(&v, Stage::Qualification, None);
        assert_eq!(out.action, DecisionAction::WaitSchedule);
        // Unknown stage text keeps the current stage.
        assert_eq!(out.new_stage, Stage::Qualification);
        assert!(!out.should_respond);
        assert_eq!(out.followup_in_minutes, 120);
        assert_eq!(out.confidence, 1.0);
    }

    #[test]
    fn initiate_cta_defaults_to_first_available() {
        let v = serde_json::json!({
            "action": "initiate_cta",
            "should_respond": true,
        });
        let out = ClassifyOutput::from_value(&v, Stage::Cta, Some("book_call"));
        assert_eq!(out.selected_cta_id.as_deref(), Some("book_call"));
    }

    #[test]
    fn risk_and_confidence_gate() {
        let mut out = ClassifyOutput::fallback(Stage::Greeting);
        out.confidence = 0.9;
        assert!(!out.high_risk_or_low_confidence());

        out.risk_flags.policy = RiskLevel::High;
        assert!(out.high_risk_or_low_confidence());

        out.risk_flags.policy = RiskLevel::Low;
        out.confidence = 0.2;
        assert!(out.high_risk_or_low_confidence());
    }

    #[test]
    fn unknown_risk_strings_grade_high() {
        let v = serde_json::json!({
            "action": "send_now",
            "risk_flags": {"spam": "catastrophic", "policy": "low"},
        });
        let out = ClassifyOutput::from_value(&v, Stage::Greeting, None);
        assert_eq!(out.risk_flags.spam, RiskLevel::High);
        assert!(out.risk_flags.any_high());
    }

    #[test]
    fn generate_word_budget_is_enforced() {
        let mut out = GenerateOutput {
            message_text: "one two three four five six".into(),
            message_language: "en".into(),
            self_check_passed: true,
            violations: vec![],
        };
        out.enforce_constraints(5, 1);
        assert!(!out.self_check_passed);
        assert!(!out.sendable());
        assert!(out.violations[0].contains("6 words"));
    }

    #[test]
    fn generate_question_budget_is_enforced() {
        let mut out = GenerateOutput {
            message_text: "How are you? What do you import? When?".into(),
            message_language: "en".into(),
            self_check_passed: true,
            violations: vec![],
        };
        out.enforce_constraints(80, 1);
        assert!(!out.self_check_passed);
    }

    #[test]
    fn generate_within_budget_stays_sendable() {
        let mut out = GenerateOutput {
            message_text: "Happy to help — what do you import?".into(),
            message_language: "en".into(),
            self_check_passed: true,
            violations: vec![],
        };
        out.enforce_constraints(80, 1);
        assert!(out.sendable());
    }

    #[test]
    fn summary_is_truncated_to_bound() {
        let long = "x".repeat(800);
        let v = serde_json::json!({ "updated_rolling_summary": long });
        let out = SummaryOutput::from_value(&v, 500);
        assert_eq!(out.updated_rolling_summary.chars().count(), 500);
    }

    #[test]
    fn outputs_round_trip_through_serde() {
        let out = ClassifyOutput::fallback(Stage::Pricing);
        let json = serde_json::to_string(&out).unwrap();
        let back: ClassifyOutput = serde_json::from_str(&json).unwrap();
        assert_eq!(back.action, out.action);
        assert_eq!(back.new_stage, Stage::Pricing);
        assert_eq!(back.followup_in_minutes, 120);

        let gen = GenerateOutput {
            message_text: "hello".into(),
            message_language: "en".into(),
            self_check_passed: true,
            violations: vec!["v".into()],
        };
        let json = serde_json::to_string(&gen).unwrap();
        let back: GenerateOutput = serde_json::from_str(&json).unwrap();
        assert_eq!(back.message_text, "hello");
        assert_eq!(back.violations, vec!["v".to_string()]);
    }
}
