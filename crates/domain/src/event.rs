//! Operator-facing events published on the in-process bus.
//!
//! Delivery is best-effort; the store already records the ground truth,
//! so the bus carries no durability obligations.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::model::{Conversation, Message};

/// A state change pushed to connected operator sessions, filtered by
/// organization. Wire shape: `{"event": "...", "payload": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload")]
pub enum OperatorEvent {
    #[serde(rename = "message.created")]
    MessageCreated {
        organization_id: Uuid,
        conversation_id: Uuid,
        message: Message,
    },
    #[serde(rename = "conversation.updated")]
    ConversationUpdated {
        organization_id: Uuid,
        conversation: Conversation,
    },
    #[serde(rename = "conversation.attention_raised")]
    AttentionRaised {
        organization_id: Uuid,
        conversation_id: Uuid,
        reason: String,
    },
    #[serde(rename = "conversation.attention_resolved")]
    AttentionResolved {
        organization_id: Uuid,
        conversation_id: Uuid,
        resolved_at: DateTime<Utc>,
    },
}

impl OperatorEvent {
    /// Routing key for org-scoped fan-out.
    pub fn organization_id(&self) -> Uuid {
        match self {
            OperatorEvent::MessageCreated { organization_id, .. }
            | OperatorEvent::ConversationUpdated { organization_id, .. }
            | OperatorEvent::AttentionRaised { organization_id, .. }
            | OperatorEvent::AttentionResolved { organization_id, .. } => *organization_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Conversation;

    #[test]
    fn events_serialize_with_dotted_names() {
        let org = Uuid::new_v4();
        let conv = Conversation::new(org, Uuid::new_v4(), Utc::now());

        let event = OperatorEvent::AttentionRaised {
            organization_id: org,
            conversation_id: conv.id,
            reason: "user asked for a human".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "conversation.attention_raised");
        assert_eq!(json["payload"]["conversation_id"], conv.id.to_string());

        let event = OperatorEvent::ConversationUpdated {
            organization_id: org,
            conversation: conv,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "conversation.updated");
        assert_eq!(json["payload"]["organization_id"], org.to_string());
    }
}
