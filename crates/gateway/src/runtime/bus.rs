//! In-process operator event bus.
//!
//! Fan-out is org-scoped: a session registers under its user, users
//! register under their org, and every published event is routed to the
//! sessions of the event's organization. Delivery is best-effort —
//! a slow or gone session just misses the event; the store holds the
//! ground truth.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use lf_domain::event::OperatorEvent;

/// Handle returned on connect; used to deregister the exact session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionId(Uuid);

pub struct OperatorBus {
    /// user id → (session id → sink).
    sessions: Mutex<HashMap<Uuid, HashMap<Uuid, mpsc::Sender<OperatorEvent>>>>,
    /// org id → user ids with at least one session.
    org_users: Mutex<HashMap<Uuid, HashSet<Uuid>>>,
}

impl Default for OperatorBus {
    fn default() -> Self {
        Self::new()
    }
}

impl OperatorBus {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            org_users: Mutex::new(HashMap::new()),
        }
    }

    /// Register a session sink for `(user, org)`.
    pub fn connect(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        sink: mpsc::Sender<OperatorEvent>,
    ) -> SessionId {
        let session_id = Uuid::new_v4();
        self.sessions
            .lock()
            .entry(user_id)
            .or_default()
            .insert(session_id, sink);
        self.org_users
            .lock()
            .entry(organization_id)
            .or_default()
            .insert(user_id);
        tracing::debug!(%user_id, %organization_id, "operator session connected");
        SessionId(session_id)
    }

    /// Deregister one session; the user leaves the org set with their
    /// last session.
    pub fn disconnect(&self, user_id: Uuid, organization_id: Uuid, session: SessionId) {
        let mut sessions = self.sessions.lock();
        let user_gone = match sessions.get_mut(&user_id) {
            Some(user_sessions) => {
                user_sessions.remove(&session.0);
                user_sessions.is_empty()
            }
            None => true,
        };
        if user_gone {
            sessions.remove(&user_id);
            let mut org_users = self.org_users.lock();
            if let Some(users) = org_users.get_mut(&organization_id) {
                users.remove(&user_id);
                if users.is_empty() {
                    org_users.remove(&organization_id);
                }
            }
        }
    }

    /// Publish to every session of the event's organization.
    pub fn publish(&self, event: OperatorEvent) {
        let org = event.organization_id();
        let users: Vec<Uuid> = self
            .org_users
            .lock()
            .get(&org)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        if users.is_empty() {
            return;
        }

        let sessions = self.sessions.lock();
        for user in users {
            if let Some(user_sessions) = sessions.get(&user) {
                for sink in user_sessions.values() {
                    // try_send: a full buffer means a stalled dashboard,
                    // not a reason to block the orchestrator.
                    let _ = sink.try_send(event.clone());
                }
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().values().map(HashMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn attention_event(org: Uuid) -> OperatorEvent {
        OperatorEvent::AttentionRaised {
            organization_id: org,
            conversation_id: Uuid::new_v4(),
            reason: "test".into(),
        }
    }

    #[tokio::test]
    async fn events_reach_sessions_of_the_same_org_only() {
        let bus = OperatorBus::new();
        let org_a = Uuid::new_v4();
        let org_b = Uuid::new_v4();

        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        bus.connect(Uuid::new_v4(), org_a, tx_a);
        bus.connect(Uuid::new_v4(), org_b, tx_b);

        bus.publish(attention_event(org_a));

        let got = rx_a.try_recv().unwrap();
        assert_eq!(got.organization_id(), org_a);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn all_sessions_of_a_user_receive_the_event() {
        let bus = OperatorBus::new();
        let org = Uuid::new_v4();
        let user = Uuid::new_v4();

        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        bus.connect(user, org, tx1);
        bus.connect(user, org, tx2);

        bus.publish(attention_event(org));
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn disconnect_removes_the_session() {
        let bus = OperatorBus::new();
        let org = Uuid::new_v4();
        let user = Uuid::new_v4();

        let (tx, mut rx) = mpsc::channel(8);
        let session = bus.connect(user, org, tx);
        bus.disconnect(user, org, session);
        assert_eq!(bus.session_count(), 0);

        bus.publish(attention_event(org));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_sink_is_skipped_not_blocked() {
        let bus = OperatorBus::new();
        let org = Uuid::new_v4();

        let (tx, _rx) = mpsc::channel(1);
        bus.connect(Uuid::new_v4(), org, tx);

        // Second publish overflows the 1-slot buffer; must not block.
        bus.publish(attention_event(org));
        bus.publish(OperatorEvent::AttentionResolved {
            organization_id: org,
            conversation_id: Uuid::new_v4(),
            resolved_at: Utc::now(),
        });
    }
}
