//! JSON-file-backed store.
//!
//! All state lives in one in-memory [`StoreState`] guarded by a
//! `tokio::sync::RwLock`; every mutation snapshots the whole state to
//! `store.json` via `spawn_blocking` so the executor never blocks on
//! disk. The single write lock is what makes claims and patches atomic.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use lf_domain::model::{
    ActionKind, ActionStatus, Conversation, ConversationPatch, Direction, Integration, Lead,
    Message, ScheduledAction, Sender,
};
use lf_domain::{Error, Result};

use crate::Store;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    /// Keyed by provider phone-number id.
    integrations: HashMap<String, Integration>,
    leads: HashMap<Uuid, Lead>,
    conversations: HashMap<Uuid, Conversation>,
    /// Per-conversation transcript, append-only.
    messages: HashMap<Uuid, Vec<Message>>,
    actions: HashMap<Uuid, ScheduledAction>,
}

pub struct FileStore {
    inner: RwLock<StoreState>,
    persist_path: PathBuf,
}

impl FileStore {
    /// Load or create the store at `state_path/store.json`.
    pub fn new(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path).map_err(Error::Io)?;
        let persist_path = state_path.join("store.json");

        let state = if persist_path.exists() {
            let raw = std::fs::read_to_string(&persist_path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            StoreState::default()
        };

        tracing::info!(
            conversations = state.conversations.len(),
            pending_actions = state
                .actions
                .values()
                .filter(|a| a.status == ActionStatus::Pending)
                .count(),
            path = %persist_path.display(),
            "store loaded"
        );

        Ok(Self {
            inner: RwLock::new(state),
            persist_path,
        })
    }

    async fn persist(&self) {
        let json = {
            let state = self.inner.read().await;
            match serde_json::to_string_pretty(&*state) {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to serialize store state");
                    return;
                }
            }
        };
        let path = self.persist_path.clone();
        let _ = tokio::task::spawn_blocking(move || {
            if let Err(e) = std::fs::write(&path, json) {
                tracing::warn!(error = %e, path = %path.display(), "failed to persist store");
            }
        })
        .await;
    }
}

fn direction_for(sender: Sender) -> Direction {
    match sender {
        Sender::Lead => Direction::Inbound,
        Sender::Bot | Sender::Human => Direction::Outbound,
    }
}

#[async_trait::async_trait]
impl Store for FileStore {
    async fn resolve_integration(&self, phone_number_id: &str) -> Result<Integration> {
        self.inner
            .read()
            .await
            .integrations
            .get(phone_number_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("integration for {phone_number_id}")))
    }

    async fn upsert_integration(&self, integration: Integration) -> Result<()> {
        {
            let mut state = self.inner.write().await;
            state
                .integrations
                .insert(integration.phone_number_id.clone(), integration);
        }
        self.persist().await;
        Ok(())
    }

    async fn integration_for_organization(&self, organization_id: Uuid) -> Result<Integration> {
        self.inner
            .read()
            .await
            .integrations
            .values()
            .find(|i| i.organization_id == organization_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("integration for org {organization_id}")))
    }

    async fn get_lead(&self, id: Uuid) -> Result<Lead> {
        self.inner
            .read()
            .await
            .leads
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("lead {id}")))
    }

    async fn upsert_lead(
        &self,
        organization_id: Uuid,
        phone: &str,
        display_name: &str,
    ) -> Result<Lead> {
        let lead = {
            let mut state = self.inner.write().await;
            let existing = state
                .leads
                .values()
                .find(|l| l.organization_id == organization_id && l.phone == phone)
                .map(|l| l.id);

            match existing {
                Some(id) => {
                    let lead = state.leads.get_mut(&id).ok_or_else(|| {
                        Error::Store("lead index out of sync".into())
                    })?;
                    if !display_name.is_empty() && lead.display_name != display_name {
                        lead.display_name = display_name.to_owned();
                    }
                    lead.clone()
                }
                None => {
                    let lead = Lead {
                        id: Uuid::new_v4(),
                        organization_id,
                        phone: phone.to_owned(),
                        display_name: display_name.to_owned(),
                    };
                    state.leads.insert(lead.id, lead.clone());
                    lead
                }
            }
        };
        self.persist().await;
        Ok(lead)
    }

    async fn get_or_create_conversation(
        &self,
        organization_id: Uuid,
        lead_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(Conversation, bool)> {
        let (conv, created) = {
            let mut state = self.inner.write().await;
            let existing = state
                .conversations
                .values()
                .find(|c| c.organization_id == organization_id && c.lead_id == lead_id)
                .cloned();

            match existing {
                Some(conv) => (conv, false),
                None => {
                    let conv = Conversation::new(organization_id, lead_id, now);
                    state.conversations.insert(conv.id, conv.clone());
                    (conv, true)
                }
            }
        };
        if created {
            self.persist().await;
        }
        Ok((conv, created))
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Conversation> {
        self.inner
            .read()
            .await
            .conversations
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("conversation {id}")))
    }

    async fn append_message(
        &self,
        conversation_id: Uuid,
        sender: Sender,
        text: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Message> {
        let message = {
            let mut state = self.inner.write().await;
            if !state.conversations.contains_key(&conversation_id) {
                return Err(Error::NotFound(format!("conversation {conversation_id}")));
            }
            let message = Message {
                id: Uuid::new_v4(),
                conversation_id,
                sender,
                direction: direction_for(sender),
                text: text.to_owned(),
                timestamp,
            };
            state
                .messages
                .entry(conversation_id)
                .or_default()
                .push(message.clone());
            message
        };
        self.persist().await;
        Ok(message)
    }

    async fn update_conversation(
        &self,
        id: Uuid,
        patch: &ConversationPatch,
        now: DateTime<Utc>,
    ) -> Result<Conversation> {
        let conv = {
            let mut state = self.inner.write().await;
            let conv = state
                .conversations
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("conversation {id}")))?;
            patch.apply(conv, now);
            conv.clone()
        };
        self.persist().await;
        Ok(conv)
    }

    async fn list_recent_messages(&self, conversation_id: Uuid, n: usize) -> Result<Vec<Message>> {
        let state = self.inner.read().await;
        let all = state
            .messages
            .get(&conversation_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[]);
        let skip = all.len().saturating_sub(n);
        Ok(all[skip..].to_vec())
    }

    async fn cancel_pending_actions(&self, conversation_id: Uuid) -> Result<usize> {
        let cancelled = {
            let mut state = self.inner.write().await;
            let mut cancelled = 0usize;
            for action in state.actions.values_mut() {
                if action.conversation_id == conversation_id
                    && action.status == ActionStatus::Pending
                {
                    action.status = ActionStatus::Cancelled;
                    cancelled += 1;
                }
            }
            cancelled
        };
        if cancelled > 0 {
            self.persist().await;
        }
        Ok(cancelled)
    }

    async fn create_scheduled_action(
        &self,
        conversation_id: Uuid,
        kind: ActionKind,
        fire_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
        context: &str,
    ) -> Result<ScheduledAction> {
        let action = {
            let mut state = self.inner.write().await;
            if !state.conversations.contains_key(&conversation_id) {
                return Err(Error::NotFound(format!("conversation {conversation_id}")));
            }
            let action = ScheduledAction {
                id: Uuid::new_v4(),
                conversation_id,
                kind,
                fire_at,
                created_at,
                status: ActionStatus::Pending,
                context: context.to_owned(),
            };
            state.actions.insert(action.id, action.clone());
            action
        };
        self.persist().await;
        Ok(action)
    }

    async fn claim_due_actions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledAction>> {
        let claimed = {
            let mut state = self.inner.write().await;
            let mut due: Vec<Uuid> = state
                .actions
                .values()
                .filter(|a| a.status == ActionStatus::Pending && a.fire_at <= now)
                .map(|a| a.id)
                .collect();
            due.sort_by_key(|id| state.actions[id].fire_at);
            due.truncate(limit);

            let mut claimed = Vec::with_capacity(due.len());
            for id in due {
                if let Some(action) = state.actions.get_mut(&id) {
                    action.status = ActionStatus::Claimed;
                    claimed.push(action.clone());
                }
            }
            claimed
        };
        if !claimed.is_empty() {
            self.persist().await;
        }
        Ok(claimed)
    }

    async fn delete_scheduled_action(&self, id: Uuid) -> Result<()> {
        let removed = self.inner.write().await.actions.remove(&id).is_some();
        if removed {
            self.persist().await;
        }
        Ok(())
    }

    async fn count_pending_actions(&self, conversation_id: Uuid) -> Result<usize> {
        Ok(self
            .inner
            .read()
            .await
            .actions
            .values()
            .filter(|a| {
                a.conversation_id == conversation_id && a.status == ActionStatus::Pending
            })
            .count())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use lf_domain::model::Stage;

    async fn store() -> (FileStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (FileStore::new(dir.path()).unwrap(), dir)
    }

    async fn seeded_conversation(store: &FileStore) -> Conversation {
        let org = Uuid::new_v4();
        let lead = store.upsert_lead(org, "15550001111", "Asha").await.unwrap();
        let (conv, created) = store
            .get_or_create_conversation(org, lead.id, Utc::now())
            .await
            .unwrap();
        assert!(created);
        conv
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let (store, _dir) = store().await;
        let org = Uuid::new_v4();
        let lead = store.upsert_lead(org, "15550001111", "Asha").await.unwrap();

        let (first, created) = store
            .get_or_create_conversation(org, lead.id, Utc::now())
            .await
            .unwrap();
        assert!(created);

        let (second, created) = store
            .get_or_create_conversation(org, lead.id, Utc::now())
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn upsert_lead_refreshes_display_name() {
        let (store, _dir) = store().await;
        let org = Uuid::new_v4();
        let first = store.upsert_lead(org, "15550001111", "").await.unwrap();
        let second = store.upsert_lead(org, "15550001111", "Asha").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.display_name, "Asha");
    }

    #[tokio::test]
    async fn recent_messages_are_oldest_first_window() {
        let (store, _dir) = store().await;
        let conv = seeded_conversation(&store).await;

        let base = Utc::now();
        for i in 0..5 {
            store
                .append_message(
                    conv.id,
                    Sender::Lead,
                    &format!("msg-{i}"),
                    base + chrono::Duration::seconds(i),
                )
                .await
                .unwrap();
        }

        let recent = store.list_recent_messages(conv.id, 3).await.unwrap();
        let texts: Vec<_> = recent.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["msg-2", "msg-3", "msg-4"]);
    }

    #[tokio::test]
    async fn cancel_pending_leaves_claimed_untouched() {
        let (store, _dir) = store().await;
        let conv = seeded_conversation(&store).await;
        let now = Utc::now();

        for offset in [10i64, 180, 360] {
            store
                .create_scheduled_action(
                    conv.id,
                    ActionKind::Followup,
                    now + chrono::Duration::minutes(offset),
                    now,
                    &format!("nudge +{offset}m"),
                )
                .await
                .unwrap();
        }
        // One already due and claimed.
        store
            .create_scheduled_action(conv.id, ActionKind::Followup, now, now, "nudge due")
            .await
            .unwrap();
        let claimed = store.claim_due_actions(now, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let cancelled = store.cancel_pending_actions(conv.id).await.unwrap();
        assert_eq!(cancelled, 3);
        assert_eq!(store.count_pending_actions(conv.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn claim_is_at_most_once() {
        let (store, _dir) = store().await;
        let conv = seeded_conversation(&store).await;
        let now = Utc::now();

        store
            .create_scheduled_action(
                conv.id,
                ActionKind::Followup,
                now - chrono::Duration::seconds(1),
                now - chrono::Duration::minutes(10),
                "nudge +10m",
            )
            .await
            .unwrap();

        let first = store.claim_due_actions(now, 10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].status, ActionStatus::Claimed);

        // A second poll must come up empty.
        let second = store.claim_due_actions(now, 10).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn claim_respects_limit_and_fire_order() {
        let (store, _dir) = store().await;
        let conv = seeded_conversation(&store).await;
        let now = Utc::now();

        for i in 0..4i64 {
            store
                .create_scheduled_action(
                    conv.id,
                    ActionKind::Followup,
                    now - chrono::Duration::minutes(10 - i),
                    now - chrono::Duration::hours(1),
                    &format!("nudge {i}"),
                )
                .await
                .unwrap();
        }

        let claimed = store.claim_due_actions(now, 2).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(claimed[0].fire_at <= claimed[1].fire_at);
        assert_eq!(store.claim_due_actions(now, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn patch_applies_atomically() {
        let (store, _dir) = store().await;
        let conv = seeded_conversation(&store).await;
        let now = Utc::now();

        let patch = ConversationPatch {
            stage: Some(Stage::Qualification),
            needs_human_attention: Some(true),
            last_user_message_at: Some(now),
            ..Default::default()
        };
        let updated = store.update_conversation(conv.id, &patch, now).await.unwrap();
        assert_eq!(updated.stage, Stage::Qualification);
        assert!(updated.needs_human_attention);
        assert_eq!(updated.last_user_message_at, Some(now));
    }

    #[tokio::test]
    async fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let conv_id = {
            let store = FileStore::new(dir.path()).unwrap();
            let conv = seeded_conversation(&store).await;
            store
                .append_message(conv.id, Sender::Lead, "hello", Utc::now())
                .await
                .unwrap();
            conv.id
        };

        let store = FileStore::new(dir.path()).unwrap();
        let conv = store.get_conversation(conv_id).await.unwrap();
        assert_eq!(conv.stage, Stage::Greeting);
        let messages = store.list_recent_messages(conv_id, 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "hello");
    }

    #[tokio::test]
    async fn unknown_integration_is_not_found() {
        let (store, _dir) = store().await;
        let err = store.resolve_integration("nope").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
