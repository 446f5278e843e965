//! Context builder — assembles the immutable input bundle the pipeline
//! consumes for one turn.

use chrono::{DateTime, Duration, Utc};

use lf_domain::config::ReplyConfig;
use lf_domain::model::{Conversation, Integration};
use lf_domain::Result;
use lf_pipeline::input::{
    MessageContext, NudgeContext, PipelineInput, ReplyConstraints, TimingContext,
};
use lf_store::Store;

/// The 24-hour free-form reply window: open iff the user has spoken and
/// `now` is within 24h of that message. No user message = no window.
pub fn reply_window_open(now: DateTime<Utc>, last_user_message_at: Option<DateTime<Utc>>) -> bool {
    match last_user_message_at {
        Some(last) => now < last + Duration::hours(24),
        None => false,
    }
}

pub async fn build_context(
    store: &dyn Store,
    reply: &ReplyConfig,
    integration: &Integration,
    conversation: &Conversation,
    now: DateTime<Utc>,
) -> Result<PipelineInput> {
    let recent = store
        .list_recent_messages(conversation.id, reply.context_messages)
        .await?;

    Ok(PipelineInput {
        business_name: integration.organization_name.clone(),
        business_description: integration.business_description.clone(),
        available_ctas: integration.ctas.clone(),
        rolling_summary: conversation.rolling_summary.clone(),
        recent_messages: recent
            .into_iter()
            .map(|m| MessageContext {
                sender: m.sender,
                text: m.text,
                timestamp: m.timestamp,
            })
            .collect(),
        stage: conversation.stage,
        mode: conversation.mode,
        intent_level: conversation.intent_level,
        user_sentiment: conversation.user_sentiment,
        timing: TimingContext {
            now,
            last_user_message_at: conversation.last_user_message_at,
            last_bot_message_at: conversation.last_bot_message_at,
            reply_window_open: reply_window_open(now, conversation.last_user_message_at),
        },
        nudges: NudgeContext {
            followup_count_24h: conversation.followup_count_24h,
            total_nudges: conversation.total_nudges,
        },
        constraints: ReplyConstraints {
            max_words: reply.max_words,
            questions_per_message: reply.questions_per_message,
            language_pref: reply.language_pref.clone(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lf_domain::model::{Sender, Stage};
    use lf_store::FileStore;
    use uuid::Uuid;

    #[test]
    fn window_closed_without_user_message() {
        assert!(!reply_window_open(Utc::now(), None));
    }

    #[test]
    fn window_open_within_24_hours() {
        let now = Utc::now();
        assert!(reply_window_open(now, Some(now - Duration::hours(23))));
        assert!(!reply_window_open(now, Some(now - Duration::hours(25))));
    }

    #[tokio::test]
    async fn context_carries_last_k_messages_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let org = Uuid::new_v4();
        let lead = store.upsert_lead(org, "15550001111", "Asha").await.unwrap();
        let (conv, _) = store
            .get_or_create_conversation(org, lead.id, Utc::now())
            .await
            .unwrap();

        let base = Utc::now();
        for i in 0..5 {
            store
                .append_message(
                    conv.id,
                    Sender::Lead,
                    &format!("m{i}"),
                    base + Duration::seconds(i),
                )
                .await
                .unwrap();
        }

        let integration = lf_domain::model::Integration {
            phone_number_id: "pn1".into(),
            organization_id: org,
            organization_name: "Acme".into(),
            access_token: String::new(),
            api_version: "v18.0".into(),
            business_description: "advisory".into(),
            ctas: vec![],
        };
        let reply = ReplyConfig::default();
        let input = build_context(&store, &reply, &integration, &conv, Utc::now())
            .await
            .unwrap();

        assert_eq!(input.recent_messages.len(), 3);
        assert_eq!(input.recent_messages[0].text, "m2");
        assert_eq!(input.recent_messages[2].text, "m4");
        assert_eq!(input.stage, Stage::Greeting);
        assert_eq!(input.business_name, "Acme");
    }
}
