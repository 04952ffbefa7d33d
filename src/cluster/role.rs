//! Leader role resolution
//!
//! Election itself is external: something (an operator, a consensus layer,
//! a test) tells [`ClusterRole`] who leads. The write path only consumes
//! [`RoleResolver`], and resolves it once per request into a
//! [`RoleSnapshot`] so a leader change mid-operation cannot split it.

use std::sync::RwLock;

/// Node identifier, as listed in the membership configuration
pub type NodeId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Role as observed at one instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSnapshot {
    pub node_id: NodeId,
    pub leader: Option<NodeId>,
    pub term: u64,
}

impl RoleSnapshot {
    pub fn is_leader(&self) -> bool {
        self.leader.as_deref() == Some(self.node_id.as_str())
    }

    pub fn role(&self) -> Role {
        if self.is_leader() {
            Role::Leader
        } else {
            Role::Follower
        }
    }
}

pub trait RoleResolver: Send + Sync {
    fn node_id(&self) -> &str;
    fn resolve(&self) -> RoleSnapshot;

    fn is_leader(&self) -> bool {
        self.resolve().is_leader()
    }

    fn leader(&self) -> Option<NodeId> {
        self.resolve().leader
    }
}

#[derive(Debug)]
struct RoleState {
    term: u64,
    leader_id: Option<NodeId>,
}

/// Term-stamped leadership state of this node
pub struct ClusterRole {
    node_id: NodeId,
    state: RwLock<RoleState>,
}

impl ClusterRole {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            state: RwLock::new(RoleState {
                term: 0,
                leader_id: None,
            }),
        }
    }

    pub fn term(&self) -> u64 {
        self.state.read().unwrap_or_else(|e| e.into_inner()).term
    }

    /// Accept `leader_id` as leader for `term`. Older terms are ignored.
    /// Returns whether the announcement was applied.
    pub fn follow(&self, term: u64, leader_id: NodeId) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if term < state.term {
            tracing::warn!(
                "Ignoring leader {} for stale term {} (current {})",
                leader_id,
                term,
                state.term
            );
            return false;
        }
        state.term = term;
        state.leader_id = Some(leader_id);
        true
    }
}

impl RoleResolver for ClusterRole {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn resolve(&self) -> RoleSnapshot {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        RoleSnapshot {
            node_id: self.node_id.clone(),
            leader: state.leader_id.clone(),
            term: state.term,
        }
    }
}

/// Fixed role, for tests and single-node setups
pub struct StaticRole {
    node_id: NodeId,
    leader: Option<NodeId>,
}

impl StaticRole {
    pub fn leader(node_id: impl Into<NodeId>) -> Self {
        let node_id = node_id.into();
        Self {
            leader: Some(node_id.clone()),
            node_id,
        }
    }

    pub fn follower(node_id: impl Into<NodeId>, leader: Option<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            leader,
        }
    }
}

impl RoleResolver for StaticRole {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn resolve(&self) -> RoleSnapshot {
        RoleSnapshot {
            node_id: self.node_id.clone(),
            leader: self.leader.clone(),
            term: 0,
        }
    }
}
