//! Follow-up ladder enrolment and the timer-fire runner.
//!
//! The ladder is a static set of nudges at fixed offsets from the
//! user's turn, owned exclusively by user-message handling. The runner
//! only claims due actions and feeds them back into the orchestrator —
//! it never enrols new ones, which is what keeps nudging bounded.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use lf_domain::config::FollowupConfig;
use lf_domain::model::{ActionKind, Conversation};
use lf_domain::Result;
use lf_store::Store;

use crate::runtime::orchestrator::Orchestrator;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Ladder enrolment
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Replace any pending ladder with a fresh one. Returns how many rungs
/// were enrolled (0 when the conversation suppresses nudges).
///
/// Cancellation always runs first so a suppressed conversation also
/// ends up with zero pending actions.
pub async fn enrol_ladder(
    store: &dyn Store,
    config: &FollowupConfig,
    conversation: &Conversation,
    now: DateTime<Utc>,
) -> Result<usize> {
    store.cancel_pending_actions(conversation.id).await?;

    if conversation.nudges_suppressed() {
        tracing::debug!(
            conversation_id = %conversation.id,
            mode = ?conversation.mode,
            stage = %conversation.stage,
            needs_attention = conversation.needs_human_attention,
            "ladder suppressed"
        );
        return Ok(0);
    }

    for offset in &config.offsets_minutes {
        store
            .create_scheduled_action(
                conversation.id,
                ActionKind::Followup,
                now + Duration::minutes(*offset),
                now,
                &format!("nudge +{offset}m"),
            )
            .await?;
    }

    tracing::info!(
        conversation_id = %conversation.id,
        rungs = config.offsets_minutes.len(),
        "follow-up ladder enrolled"
    );
    Ok(config.offsets_minutes.len())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Polls the store for due actions and hands each to the orchestrator.
/// The atomic claim makes each action fire at most once even with
/// several runner instances.
pub struct FollowupRunner {
    orchestrator: Arc<Orchestrator>,
    config: FollowupConfig,
}

impl FollowupRunner {
    pub fn new(orchestrator: Arc<Orchestrator>, config: FollowupConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// One poll: claim due actions, dispatch each on its own task (the
    /// conversation lane inside the orchestrator provides ordering).
    pub async fn tick(&self) {
        let claimed = match self
            .orchestrator
            .store()
            .claim_due_actions(Utc::now(), self.config.claim_limit)
            .await
        {
            Ok(actions) => actions,
            Err(e) => {
                tracing::warn!(error = %e, "claiming due follow-ups failed");
                return;
            }
        };

        for action in claimed {
            let orchestrator = self.orchestrator.clone();
            tokio::spawn(async move {
                orchestrator.handle_timer_fire(action).await;
            });
        }
    }

    /// Run the poll loop forever.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                self.config.poll_interval_secs.max(1),
            ));
            loop {
                interval.tick().await;
                self.tick().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lf_domain::model::{ConversationMode, Stage};
    use lf_store::FileStore;
    use uuid::Uuid;

    async fn conversation(store: &FileStore) -> Conversation {
        let org = Uuid::new_v4();
        let lead = store.upsert_lead(org, "15550001111", "Asha").await.unwrap();
        let (conv, _) = store
            .get_or_create_conversation(org, lead.id, Utc::now())
            .await
            .unwrap();
        conv
    }

    #[tokio::test]
    async fn ladder_enrols_one_rung_per_offset() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let conv = conversation(&store).await;
        let config = FollowupConfig::default();

        let enrolled = enrol_ladder(&store, &config, &conv, Utc::now()).await.unwrap();
        assert_eq!(enrolled, 3);
        assert_eq!(store.count_pending_actions(conv.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn re_enrolment_replaces_the_old_ladder() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let conv = conversation(&store).await;
        let config = FollowupConfig::default();

        enrol_ladder(&store, &config, &conv, Utc::now()).await.unwrap();
        enrol_ladder(&store, &config, &conv, Utc::now()).await.unwrap();
        // Still exactly one ladder pending.
        assert_eq!(store.count_pending_actions(conv.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn human_mode_suppresses_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let mut conv = conversation(&store).await;
        let config = FollowupConfig::default();

        enrol_ladder(&store, &config, &conv, Utc::now()).await.unwrap();
        conv.mode = ConversationMode::Human;
        let enrolled = enrol_ladder(&store, &config, &conv, Utc::now()).await.unwrap();
        assert_eq!(enrolled, 0);
        assert_eq!(store.count_pending_actions(conv.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn attention_and_terminal_stage_suppress() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let mut conv = conversation(&store).await;
        let config = FollowupConfig::default();

        conv.needs_human_attention = true;
        assert_eq!(
            enrol_ladder(&store, &config, &conv, Utc::now()).await.unwrap(),
            0
        );

        conv.needs_human_attention = false;
        conv.stage = Stage::Closed;
        assert_eq!(
            enrol_ladder(&store, &config, &conv, Utc::now()).await.unwrap(),
            0
        );
    }
}
