//! Sticky session bindings.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Binding {
    node_id: String,
    bound_at: Instant,
}

/// Maps session ids to the node that first served them.
///
/// Bindings expire `ttl` after they were made. Expired entries are ignored
/// on lookup and removed by [`SessionAffinity::purge_expired`].
#[derive(Debug)]
pub struct SessionAffinity {
    bindings: DashMap<String, Binding>,
    ttl: Duration,
}

impl SessionAffinity {
    /// Create an empty table.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            bindings: DashMap::new(),
            ttl,
        }
    }

    /// Node bound to `session_id`, if the binding is still live.
    #[must_use]
    pub fn lookup(&self, session_id: &str) -> Option<String> {
        let binding = self.bindings.get(session_id)?;
        if binding.bound_at.elapsed() < self.ttl {
            Some(binding.node_id.clone())
        } else {
            None
        }
    }

    /// Bind `session_id` to `node_id`, replacing any previous binding.
    pub fn bind(&self, session_id: &str, node_id: &str) {
        self.bindings.insert(
            session_id.to_string(),
            Binding {
                node_id: node_id.to_string(),
                bound_at: Instant::now(),
            },
        );
    }

    /// Drop every binding pointing at `node_id`.
    pub fn unbind_node(&self, node_id: &str) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|_, binding| binding.node_id != node_id);
        before.saturating_sub(self.bindings.len())
    }

    /// Remove expired bindings.
    pub fn purge_expired(&self) -> usize {
        let before = self.bindings.len();
        self.bindings
            .retain(|_, binding| binding.bound_at.elapsed() < self.ttl);
        before.saturating_sub(self.bindings.len())
    }

    /// Number of stored bindings, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether no bindings are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
