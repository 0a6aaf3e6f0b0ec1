// Optimistic send tracking — UI-local placeholders for in-flight sends
//
// A thin adapter outside the store's transactional guarantees: it holds
// placeholders for sends that have not committed yet, applies receive-driven
// updates to them once their real interaction id is known, and drops each
// placeholder exactly once when the database-backed row shows up in a page.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::trace;

use crate::store::records::Interaction;

/// Lifecycle of one optimistic placeholder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimisticState {
    /// Send issued; no durable row yet
    Pending,
    /// Durable row exists under `interaction_id`
    Committed,
    /// Send failed before commit
    Failed,
}

/// A placeholder shown in place of a not-yet-committed send
#[derive(Debug, Clone)]
pub struct OptimisticMessage {
    pub optimistic_id: String,
    pub thread_id: String,
    pub body: Option<String>,
    pub timestamp_ms: u64,
    pub state: OptimisticState,
    /// Set once the send commits
    pub interaction_id: Option<u64>,
    /// Why the send failed, for `Failed` placeholders
    pub failure_text: Option<String>,
}

#[derive(Default)]
struct Inner {
    by_optimistic_id: HashMap<String, OptimisticMessage>,
    /// Committed interaction id back to its placeholder
    by_interaction_id: HashMap<u64, String>,
}

/// Tracks optimistic placeholders for one view of a thread
#[derive(Default)]
pub struct OptimisticTracker {
    inner: RwLock<Inner>,
}

impl OptimisticTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a placeholder for a send that was just issued
    pub fn register(
        &self,
        thread_id: impl Into<String>,
        body: Option<String>,
        timestamp_ms: u64,
    ) -> String {
        let optimistic_id = uuid::Uuid::new_v4().to_string();
        let message = OptimisticMessage {
            optimistic_id: optimistic_id.clone(),
            thread_id: thread_id.into(),
            body,
            timestamp_ms,
            state: OptimisticState::Pending,
            interaction_id: None,
            failure_text: None,
        };
        self.inner
            .write()
            .by_optimistic_id
            .insert(optimistic_id.clone(), message);
        optimistic_id
    }

    /// The send committed: bind the placeholder to its durable id so later
    /// receive-driven updates reach it.
    pub fn mark_committed(&self, optimistic_id: &str, interaction_id: u64) {
        let mut inner = self.inner.write();
        if let Some(message) = inner.by_optimistic_id.get_mut(optimistic_id) {
            message.state = OptimisticState::Committed;
            message.interaction_id = Some(interaction_id);
            inner
                .by_interaction_id
                .insert(interaction_id, optimistic_id.to_string());
        }
    }

    pub fn mark_failed(&self, optimistic_id: &str, failure_text: impl Into<String>) {
        if let Some(message) = self.inner.write().by_optimistic_id.get_mut(optimistic_id) {
            message.state = OptimisticState::Failed;
            message.failure_text = Some(failure_text.into());
        }
    }

    /// Apply a receive-driven mutation to the placeholder bound to
    /// `interaction_id`, if one is still being tracked.
    pub fn apply_update(
        &self,
        interaction_id: u64,
        update: impl FnOnce(&mut OptimisticMessage),
    ) -> bool {
        let mut inner = self.inner.write();
        let Some(optimistic_id) = inner.by_interaction_id.get(&interaction_id).cloned() else {
            return false;
        };
        match inner.by_optimistic_id.get_mut(&optimistic_id) {
            Some(message) => {
                update(message);
                true
            }
            None => false,
        }
    }

    /// Merge a page of database rows: any placeholder whose committed row
    /// appears in the page is dropped (exactly once — it is gone from the
    /// tracker afterwards), and the placeholders that remain are returned
    /// for the view to append. This is what prevents the duplicate-then-
    /// disappear flicker when a send lands in the next page load.
    pub fn resolve_page(&self, thread_id: &str, page: &[Interaction]) -> Vec<OptimisticMessage> {
        let mut inner = self.inner.write();

        for interaction in page {
            if let Some(optimistic_id) = inner.by_interaction_id.remove(&interaction.id) {
                trace!(id = interaction.id, "Dropping optimistic placeholder");
                inner.by_optimistic_id.remove(&optimistic_id);
            }
        }

        let mut remaining: Vec<OptimisticMessage> = inner
            .by_optimistic_id
            .values()
            .filter(|m| m.thread_id == thread_id)
            .cloned()
            .collect();
        remaining.sort_by_key(|m| m.timestamp_ms);
        remaining
    }

    /// Drop a placeholder without resolving it (send abandoned by the user)
    pub fn discard(&self, optimistic_id: &str) {
        let mut inner = self.inner.write();
        if let Some(message) = inner.by_optimistic_id.remove(optimistic_id) {
            if let Some(id) = message.interaction_id {
                inner.by_interaction_id.remove(&id);
            }
        }
    }
}
