//! Persistence port.
//!
//! The orchestrator depends on the narrow [`Store`] trait only; the
//! bundled [`FileStore`] keeps everything in memory behind a single
//! `RwLock` and snapshots to JSON on every mutation. A SQL-backed
//! implementation plugs in at the same seam.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use lf_domain::model::{
    ActionKind, Conversation, ConversationPatch, Integration, Lead, Message, ScheduledAction,
    Sender,
};
use lf_domain::Result;

pub mod file;

pub use file::FileStore;

/// The narrow persistence interface the orchestrator depends on.
///
/// Implementations must make `update_conversation` and
/// `claim_due_actions` atomic: a patch is applied as one field-set, and a
/// due action is handed to exactly one caller (`Pending → Claimed` under
/// a single critical section).
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Map a provider phone-number id to its integration.
    async fn resolve_integration(&self, phone_number_id: &str) -> Result<Integration>;

    /// Register or replace an integration (wiring and tests).
    async fn upsert_integration(&self, integration: Integration) -> Result<()>;

    /// The integration owned by an organization — timer fires start from
    /// a conversation, not a webhook, and need the transport credentials
    /// back.
    async fn integration_for_organization(&self, organization_id: Uuid) -> Result<Integration>;

    async fn get_lead(&self, id: Uuid) -> Result<Lead>;

    /// Find a lead by (organization, phone) or create it. A non-empty
    /// display name refreshes a previously stored one.
    async fn upsert_lead(&self, organization_id: Uuid, phone: &str, display_name: &str)
        -> Result<Lead>;

    /// Returns `(conversation, created)` — created lazily on first
    /// inbound message.
    async fn get_or_create_conversation(
        &self,
        organization_id: Uuid,
        lead_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(Conversation, bool)>;

    async fn get_conversation(&self, id: Uuid) -> Result<Conversation>;

    async fn append_message(
        &self,
        conversation_id: Uuid,
        sender: Sender,
        text: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Message>;

    /// Apply a patch atomically; returns the updated conversation.
    async fn update_conversation(
        &self,
        id: Uuid,
        patch: &ConversationPatch,
        now: DateTime<Utc>,
    ) -> Result<Conversation>;

    /// Last `n` messages of the conversation, oldest-first.
    async fn list_recent_messages(&self, conversation_id: Uuid, n: usize) -> Result<Vec<Message>>;

    /// Cancel every pending action for the conversation; returns how many.
    async fn cancel_pending_actions(&self, conversation_id: Uuid) -> Result<usize>;

    async fn create_scheduled_action(
        &self,
        conversation_id: Uuid,
        kind: ActionKind,
        fire_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
        context: &str,
    ) -> Result<ScheduledAction>;

    /// Atomically claim up to `limit` due pending actions
    /// (`status: Pending → Claimed`), earliest `fire_at` first. Two
    /// concurrent pollers never receive the same action.
    async fn claim_due_actions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledAction>>;

    async fn delete_scheduled_action(&self, id: Uuid) -> Result<()>;

    /// Count of pending actions for a conversation (invariant checks and
    /// operator views).
    async fn count_pending_actions(&self, conversation_id: Uuid) -> Result<usize>;
}
