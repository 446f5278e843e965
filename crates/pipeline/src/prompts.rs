//! Prompt assembly for the three stages.
//!
//! Each stage pairs a static system prompt with a user prompt rendered
//! from the [`PipelineInput`]. Context JSON is compact (no pretty
//! printing) to keep token usage down.

use lf_domain::model::Sender;

use crate::input::PipelineInput;
use crate::schema::ClassifyOutput;

pub const CLASSIFY_SYSTEM: &str = "\
You are the decision brain of a WhatsApp sales assistant. Read the \
conversation context and decide what to do with the latest user turn. \
Respond with a single JSON object and nothing else, with exactly these \
fields: thought_process, situation_summary, intent_level \
(unknown|low|medium|high), user_sentiment (negative|neutral|positive), \
risk_flags {spam, policy, hallucination: low|med|high}, action \
(send_now|wait_schedule|initiate_cta|flag_attention|handoff_human), \
new_stage (greeting|qualification|pricing|cta|followup|closed|lost|ghosted), \
should_respond (bool), selected_cta_id (string or null), cta_scheduled_at \
(ISO timestamp or null), followup_in_minutes (int), followup_reason, \
confidence (0..1), needs_human_attention (bool). \
Flag attention whenever the user asks for a human, is upset, or the \
request falls outside the business description. Never invent facts \
about the business.";

pub const GENERATE_SYSTEM: &str = "\
You are the voice of a WhatsApp sales assistant. Draft the next reply \
following the decision you are given. Stay strictly inside the business \
description, match the user's language, keep within the word budget and \
question budget. Respond with a single JSON object: message_text, \
message_language, self_check_passed (bool — false if you could not meet \
every constraint), violations (array of strings).";

pub const SUMMARIZE_SYSTEM: &str = "\
You maintain the memory of a WhatsApp sales conversation. Merge the \
latest exchange into the rolling summary, keeping names, numbers, \
objections and commitments. Compact any [PENDING] lines into the \
narrative. Respond with a single JSON object: updated_rolling_summary \
(at most 500 characters).";

fn transcript(input: &PipelineInput) -> String {
    input
        .recent_messages
        .iter()
        .map(|m| {
            let who = match m.sender {
                Sender::Lead => "user",
                Sender::Bot => "bot",
                Sender::Human => "agent",
            };
            format!("{who}: {}", m.text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn cta_list(input: &PipelineInput) -> String {
    if input.available_ctas.is_empty() {
        "none".into()
    } else {
        input
            .available_ctas
            .iter()
            .map(|c| format!("{} ({})", c.id, c.label))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub fn classify_user(input: &PipelineInput) -> String {
    format!(
        "BUSINESS: {name}\n{description}\n\n\
         AVAILABLE CTAS: {ctas}\n\n\
         ROLLING SUMMARY: {summary}\n\n\
         RECENT MESSAGES (oldest first):\n{messages}\n\n\
         STATE: stage={stage} intent={intent:?} sentiment={sentiment:?}\n\
         TIMING: now={now} last_user={last_user} last_bot={last_bot} \
         reply_window_open={window}\n\
         NUDGES: last_24h={count_24h} total={total}",
        name = input.business_name,
        description = input.business_description,
        ctas = cta_list(input),
        summary = if input.rolling_summary.is_empty() {
            "none yet"
        } else {
            &input.rolling_summary
        },
        messages = transcript(input),
        stage = input.stage,
        intent = input.intent_level,
        sentiment = input.user_sentiment,
        now = input.timing.now.to_rfc3339(),
        last_user = input
            .timing
            .last_user_message_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".into()),
        last_bot = input
            .timing
            .last_bot_message_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".into()),
        window = input.timing.reply_window_open,
        count_24h = input.nudges.followup_count_24h,
        total = input.nudges.total_nudges,
    )
}

pub fn generate_user(input: &PipelineInput, classification: &ClassifyOutput) -> String {
    let decision = serde_json::json!({
        "action": classification.action,
        "stage": classification.new_stage,
        "situation": classification.situation_summary,
        "selected_cta_id": classification.selected_cta_id,
    });
    format!(
        "BUSINESS: {name}\n{description}\n\n\
         ROLLING SUMMARY: {summary}\n\n\
         RECENT MESSAGES (oldest first):\n{messages}\n\n\
         DECISION: {decision}\n\n\
         CONSTRAINTS: at most {max_words} words, at most {questions} \
         question(s), preferred language \"{language}\".",
        name = input.business_name,
        description = input.business_description,
        summary = input.rolling_summary,
        messages = transcript(input),
        decision = decision,
        max_words = input.constraints.max_words,
        questions = input.constraints.questions_per_message,
        language = input.constraints.language_pref,
    )
}

pub fn summarize_user(input: &PipelineInput, user_message: &str, bot_message: Option<&str>) -> String {
    format!(
        "CURRENT SUMMARY: {summary}\n\n\
         LATEST USER MESSAGE: {user}\n\
         LATEST BOT MESSAGE: {bot}",
        summary = if input.rolling_summary.is_empty() {
            "no prior summary"
        } else {
            &input.rolling_summary
        },
        user = user_message,
        bot = bot_message.unwrap_or("(no response sent)"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lf_domain::model::{ConversationMode, IntentLevel, Sentiment, Stage};

    use crate::input::{MessageContext, NudgeContext, ReplyConstraints, TimingContext};

    fn sample_input() -> PipelineInput {
        PipelineInput {
            business_name: "Acme Duty Advisors".into(),
            business_description: "Import duty advisory for manufacturers.".into(),
            available_ctas: vec![],
            rolling_summary: String::new(),
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

    #[test]
    fn classify_prompt_carries_state_and_transcript() {
        let prompt = classify_user(&sample_input());
        assert!(prompt.contains("Acme Duty Advisors"));
        assert!(prompt.contains("user: Hi"));
        assert!(prompt.contains("stage=greeting"));
        assert!(prompt.contains("reply_window_open=true"));
    }

    #[test]
    fn summarize_prompt_marks_missing_bot_reply() {
        let prompt = summarize_user(&sample_input(), "still there?", None);
        assert!(prompt.contains("(no response sent)"));
        assert!(prompt.contains("no prior summary"));
    }
}
