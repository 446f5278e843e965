//! Stage execution: retry, backoff, extraction, typed outputs.
//!
//! Every stage is one JSON-mode chat call. Failures retry with
//! exponential backoff; whatever still fails after the last attempt
//! surfaces as a protocol error the orchestrator maps to its safe
//! fallback (timeouts included — a hung provider and an unparseable
//! reply look the same from here).

use serde_json::Value;

use lf_domain::config::LlmConfig;
use lf_domain::{Error, Result};

use crate::client::{ChatRequest, LlmClient};
use crate::extract::{extract_from_error_body, extract_json};
use crate::input::PipelineInput;
use crate::prompts;
use crate::schema::{truncate_chars, ClassifyOutput, GenerateOutput, SummaryOutput};

/// Bound on a clean rolling summary.
pub const SUMMARY_MAX_CHARS: usize = 500;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared call-with-retry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn call_json(
    client: &dyn LlmClient,
    config: &LlmConfig,
    step: &'static str,
    system: &str,
    user: &str,
    max_tokens: Option<u32>,
) -> Result<Value> {
    let attempts = config.max_retries.max(1);
    let mut last_error = String::new();

    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = config.backoff_base_ms * 2u64.pow(attempt - 1);
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }

        let request = ChatRequest {
            system: system.to_owned(),
            user: user.to_owned(),
            json_mode: true,
            temperature: Some(0.7),
            max_tokens,
        };

        match client.chat(request).await {
            Ok(content) => match extract_json(&content) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::warn!(step, attempt, error = %e, "unparseable stage reply");
                    last_error = e.to_string();
                }
            },
            Err(Error::Provider(body)) => {
                // A JSON-mode validation reject may still carry the
                // model's raw output — salvage it before burning a retry.
                if let Some(value) = extract_from_error_body(&body) {
                    tracing::info!(step, attempt, "salvaged payload from provider error body");
                    return Ok(value);
                }
                tracing::warn!(step, attempt, "provider error: {}", truncate_chars(&body, 200));
                last_error = truncate_chars(&body, 200);
            }
            Err(e) => {
                tracing::warn!(step, attempt, error = %e, "stage call failed");
                last_error = e.to_string();
            }
        }
    }

    Err(Error::Protocol(format!(
        "{step} failed after {attempts} attempt(s): {last_error}"
    )))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn classify(
    client: &dyn LlmClient,
    config: &LlmConfig,
    input: &PipelineInput,
) -> Result<ClassifyOutput> {
    let user = prompts::classify_user(input);
    let value = call_json(client, config, "classify", prompts::CLASSIFY_SYSTEM, &user, None).await?;

    let default_cta = input.available_ctas.first().map(|c| c.id.as_str());
    let output = ClassifyOutput::from_value(&value, input.stage, default_cta);
    tracing::info!(
        action = ?output.action,
        stage = %output.new_stage,
        confidence = output.confidence,
        should_respond = output.should_respond,
        "classify complete"
    );
    Ok(output)
}

pub async fn generate(
    client: &dyn LlmClient,
    config: &LlmConfig,
    input: &PipelineInput,
    classification: &ClassifyOutput,
) -> Result<GenerateOutput> {
    let user = prompts::generate_user(input, classification);
    let value = call_json(client, config, "generate", prompts::GENERATE_SYSTEM, &user, None).await?;

    let mut output = GenerateOutput::from_value(&value);
    output.enforce_constraints(
        input.constraints.max_words,
        input.constraints.questions_per_message,
    );
    if !output.self_check_passed {
        tracing::warn!(violations = ?output.violations, "generated reply failed self-check");
    }
    Ok(output)
}

pub async fn summarize(
    client: &dyn LlmClient,
    config: &LlmConfig,
    input: &PipelineInput,
    user_message: &str,
    bot_message: Option<&str>,
) -> Result<SummaryOutput> {
    let user = prompts::summarize_user(input, user_message, bot_message);
    let value = call_json(
        client,
        config,
        "summarize",
        prompts::SUMMARIZE_SYSTEM,
        &user,
        Some(1_000),
    )
    .await?;
    Ok(SummaryOutput::from_value(&value, SUMMARY_MAX_CHARS))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Summary fallback
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Dirty-append fallback when Summarize fails: keep the raw exchange so
/// nothing is lost, bounded by `max_chars`. The next successful
/// summarize compacts the `[PENDING]` lines away.
pub fn dirty_append(
    current: &str,
    user_message: &str,
    bot_message: Option<&str>,
    max_chars: usize,
) -> String {
    let appended = format!(
        "{current}\n[PENDING] User: {user} | Bot: {bot}",
        user = user_message,
        bot = bot_message.unwrap_or("(no response sent)"),
    );
    truncate_chars(&appended, max_chars)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lf_domain::model::{
        ConversationMode, DecisionAction, IntentLevel, Sender, Sentiment, Stage,
    };
    use std::sync::Mutex;

    use crate::input::{MessageContext, NudgeContext, ReplyConstraints, TimingContext};

    /// Scripted client: pops one canned result per call.
    struct ScriptedClient {
        replies: Mutex<Vec<Result<String>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<Result<String>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                calls: Mutex::new(0),
            }
        }

        fn call_count(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl LlmClient for ScriptedClient {
        async fn chat(&self, _req: ChatRequest) -> Result<String> {
            *self.calls.lock().unwrap() += 1;
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                Err(Error::Provider("script exhausted".into()))
            } else {
                replies.remove(0)
            }
        }
    }

    fn fast_config() -> LlmConfig {
        LlmConfig {
            backoff_base_ms: 1,
            ..Default::default()
        }
    }

    fn sample_input() -> PipelineInput {
        PipelineInput {
            business_name: "Acme".into(),
            business_description: "advisory".into(),
            available_ctas: vec![],
            rolling_summary: "lead asked about pricing".into(),
            recent_messages: vec![MessageContext {
                sender: Sender::Lead,
                text: "Hi".into(),
                timestamp: Utc::now(),
            }],
            stage: Stage::Greeting,
            mode: ConversationMode::Bot,
            intent_level: IntentLevel::Unknown,
            user_sentiment: Sentiment::Neutral,
            timing: TimingContext {
                now: Utc::now(),
                last_user_message_at: Some(Utc::now()),
                last_bot_message_at: None,
                reply_window_open: true,
            },
            nudges: NudgeContext::default(),
            constraints: ReplyConstraints {
                max_words: 80,
                questions_per_message: 1,
                language_pref: "en".into(),
            },
        }
    }

    #[tokio::test]
    async fn classify_retries_then_succeeds() {
        let client = ScriptedClient::new(vec![
            Ok("not json at all".into()),
            Ok(r#"{"action": "send_now", "should_respond": true, "confidence": 0.9}"#.into()),
        ]);
        let out = classify(&client, &fast_config(), &sample_input())
            .await
            .unwrap();
        assert_eq!(out.action, DecisionAction::SendNow);
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn classify_gives_up_after_max_retries() {
        let client = ScriptedClient::new(vec![
            Ok("garbage".into()),
            Ok("more garbage".into()),
            Ok(r#"{"action": "send_now"}"#.into()),
        ]);
        let err = classify(&client, &fast_config(), &sample_input())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        // max_retries = 2 → exactly two calls, the third reply is never read.
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn failed_generation_body_short_circuits_the_retry() {
        let body = r#"{"error": {"code": "json_validate_failed",
            "failed_generation": "{\"action\": \"wait_schedule\", \"followup_in_minutes\": 45}"}}"#;
        let client = ScriptedClient::new(vec![Err(Error::Provider(body.into()))]);
        let out = classify(&client, &fast_config(), &sample_input())
            .await
            .unwrap();
        assert_eq!(out.action, DecisionAction::WaitSchedule);
        assert_eq!(out.followup_in_minutes, 45);
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn timeout_surfaces_as_protocol_error() {
        let client = ScriptedClient::new(vec![
            Err(Error::Timeout("deadline".into())),
            Err(Error::Timeout("deadline".into())),
        ]);
        let err = classify(&client, &fast_config(), &sample_input())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn generate_applies_the_deterministic_post_check() {
        let long_reply: String = std::iter::repeat("word").take(100).collect::<Vec<_>>().join(" ");
        let client = ScriptedClient::new(vec![Ok(format!(
            r#"{{"message_text": "{long_reply}", "self_check_passed": true}}"#
        ))]);
        let classification = ClassifyOutput::fallback(Stage::Greeting);
        let out = generate(&client, &fast_config(), &sample_input(), &classification)
            .await
            .unwrap();
        assert!(!out.sendable());
    }

    #[tokio::test]
    async fn summarize_truncates_to_bound() {
        let long = "s".repeat(900);
        let client = ScriptedClient::new(vec![Ok(format!(
            r#"{{"updated_rolling_summary": "{long}"}}"#
        ))]);
        let out = summarize(&client, &fast_config(), &sample_input(), "hi", Some("hello"))
            .await
            .unwrap();
        assert_eq!(out.updated_rolling_summary.chars().count(), SUMMARY_MAX_CHARS);
    }

    #[test]
    fn dirty_append_preserves_the_exchange() {
        let result = dirty_append("prior summary", "still here", Some("on it"), 2_000);
        assert_eq!(
            result,
            "prior summary\n[PENDING] User: still here | Bot: on it"
        );
    }

    #[test]
    fn dirty_append_without_bot_reply() {
        let result = dirty_append("", "hello?", None, 2_000);
        assert_eq!(result, "\n[PENDING] User: hello? | Bot: (no response sent)");
    }

    #[test]
    fn dirty_append_respects_cap() {
        let current = "c".repeat(1_990);
        let result = dirty_append(&current, "a long user message", None, 2_000);
        assert_eq!(result.chars().count(), 2_000);
        assert!(result.starts_with("cccc"));
    }
}
