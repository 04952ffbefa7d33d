//! One-way readiness flag
//!
//! Starts false and flips to true once: after the first full sync from the
//! leader, or immediately on the leader. Nothing resets it short of a
//! restart.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::cluster::peer::PeerClient;
use crate::cluster::role::RoleSnapshot;
use crate::common::{Error, Result};

#[derive(Debug, Default)]
pub struct ReadinessLatch {
    ready: AtomicBool,
}

impl ReadinessLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Latch. Returns true only for the call that flipped the flag.
    pub fn latch(&self) -> bool {
        !self.ready.swap(true, Ordering::AcqRel)
    }

    /// Answer a readiness probe. A follower that is not ready yet asks the
    /// leader and latches once the leader reports ready; after that no
    /// further query is made.
    pub async fn probe(&self, role: &RoleSnapshot, peers: &PeerClient) -> Result<bool> {
        if self.is_ready() {
            return Ok(true);
        }
        if role.is_leader() {
            self.latch();
            return Ok(true);
        }
        let leader = role
            .leader
            .as_deref()
            .ok_or_else(|| Error::LeaderUnavailable("no leader elected".into()))?;
        let leader_ready = peers.status(leader).await?;
        if leader_ready && self.latch() {
            tracing::info!("Node {} ready (leader {} reported ready)", role.node_id, leader);
        }
        Ok(self.is_ready())
    }
}
