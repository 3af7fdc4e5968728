use std::collections::HashMap;

use crate::config::NodeId;

/// Identifies one store session.
pub type SessionId = u64;

/// Exclusive per-node lock slots, each bound to the session that took it.
///
/// A store keeps one table for all its sessions. Releasing a session (for
/// example when its connection drops) frees every slot it held.
#[derive(Debug, Default)]
pub struct NodeLockTable {
    holders: HashMap<NodeId, SessionId>,
}

impl NodeLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the slot for `node`. Re-acquiring a slot the session already
    /// holds succeeds.
    pub fn try_acquire(&mut self, node: NodeId, session: SessionId) -> bool {
        match self.holders.get(&node) {
            Some(holder) => *holder == session,
            None => {
                self.holders.insert(node, session);
                true
            }
        }
    }

    /// Free the slot if `session` holds it; otherwise nothing happens.
    pub fn release(&mut self, node: NodeId, session: SessionId) {
        if self.holders.get(&node) == Some(&session) {
            self.holders.remove(&node);
        }
    }

    /// Free every slot held by `session`.
    pub fn release_session(&mut self, session: SessionId) {
        self.holders.retain(|_, holder| *holder != session);
    }

    pub fn holder(&self, node: NodeId) -> Option<SessionId> {
        self.holders.get(&node).copied()
    }

    pub fn is_held_by(&self, node: NodeId, session: SessionId) -> bool {
        self.holder(node) == Some(session)
    }

    pub fn clear(&mut self) {
        self.holders.clear();
    }
}
