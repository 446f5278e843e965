//! Per-conversation concurrency control.
//!
//! Each conversation gets a serial lane: user messages and timer fires
//! for the same conversation never run concurrently, while different
//! conversations proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

/// Manages per-conversation lanes.
///
/// Each conversation id maps to a `Semaphore(1)`. Holding the permit
/// grants exclusive access for one event (it auto-releases on drop).
/// Waiters queue in arrival order, which gives in-order processing of
/// user messages per conversation.
pub struct ConversationLaneMap {
    lanes: Mutex<HashMap<Uuid, Arc<Semaphore>>>,
}

impl Default for ConversationLaneMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationLaneMap {
    pub fn new() -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the lane for a conversation, waiting behind any event
    /// already running on it.
    pub async fn acquire(&self, conversation_id: Uuid) -> OwnedSemaphorePermit {
        let sem = {
            let mut lanes = self.lanes.lock();
            lanes
                .entry(conversation_id)
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        // The semaphore is never closed, so acquire cannot fail.
        sem.acquire_owned()
            .await
            .expect("conversation lane semaphore closed")
    }

    /// Number of tracked lanes (for monitoring).
    pub fn lane_count(&self) -> usize {
        self.lanes.lock().len()
    }

    /// Drop lanes that are not currently held.
    pub fn prune_idle(&self) {
        let mut lanes = self.lanes.lock();
        lanes.retain(|_, sem| sem.available_permits() == 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequential_acquire_on_one_lane() {
        let map = ConversationLaneMap::new();
        let id = Uuid::new_v4();

        let p1 = map.acquire(id).await;
        drop(p1);
        let p2 = map.acquire(id).await;
        drop(p2);
    }

    #[tokio::test]
    async fn different_conversations_run_in_parallel() {
        let map = ConversationLaneMap::new();
        let _p1 = map.acquire(Uuid::new_v4()).await;
        let _p2 = map.acquire(Uuid::new_v4()).await;
        assert_eq!(map.lane_count(), 2);
    }

    #[tokio::test]
    async fn same_conversation_waits_for_the_running_event() {
        let map = Arc::new(ConversationLaneMap::new());
        let id = Uuid::new_v4();

        let permit = map.acquire(id).await;
        let map2 = map.clone();
        let waiter = tokio::spawn(async move {
            let _p = map2.acquire(id).await;
            7
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        assert_eq!(waiter.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn prune_keeps_held_lanes() {
        let map = ConversationLaneMap::new();
        let held = Uuid::new_v4();
        let _permit = map.acquire(held).await;

        let released = map.acquire(Uuid::new_v4()).await;
        drop(released);

        map.prune_idle();
        assert_eq!(map.lane_count(), 1);
    }
}
