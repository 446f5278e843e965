//! The immutable context bundle every pipeline stage reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lf_domain::model::{ConversationMode, CtaOption, IntentLevel, Sender, Sentiment, Stage};

/// One transcript line shown to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageContext {
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingContext {
    pub now: DateTime<Utc>,
    pub last_user_message_at: Option<DateTime<Utc>>,
    pub last_bot_message_at: Option<DateTime<Utc>>,
    /// Free-form outbound is only allowed inside the 24-hour window
    /// after the user's last message.
    pub reply_window_open: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NudgeContext {
    pub followup_count_24h: u32,
    pub total_nudges: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyConstraints {
    pub max_words: usize,
    pub questions_per_message: usize,
    pub language_pref: String,
}

/// Everything the pipeline knows about one turn. Assembled by the
/// context builder; never mutated by the stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineInput {
    pub business_name: String,
    pub business_description: String,
    pub available_ctas: Vec<CtaOption>,
    pub rolling_summary: String,
    /// Last K messages, oldest-first.
    pub recent_messages: Vec<MessageContext>,
    pub stage: Stage,
    pub mode: ConversationMode,
    pub intent_level: IntentLevel,
    pub user_sentiment: Sentiment,
    pub timing: TimingContext,
    pub nudges: NudgeContext,
    pub constraints: ReplyConstraints,
}

impl PipelineInput {
    /// The newest lead message in the window, if any — what Generate
    /// replies to and Summarize folds in.
    pub fn latest_user_text(&self) -> Option<&str> {
        self.recent_messages
            .iter()
            .rev()
            .find(|m| m.sender == Sender::Lead)
            .map(|m| m.text.as_str())
    }
}
