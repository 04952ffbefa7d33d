//! Leader-side reconciliation sweep
//!
//! One batch checksum query per follower, all followers in parallel. Every
//! mount whose follower checksum differs from the leader's, or is missing,
//! is re-applied on that follower from the leader. Mounts the follower still
//! holds but the leader no longer has are removed there. A follower that
//! fails is logged and skipped; the next sweep retries it.

use futures_util::future::{join_all, try_join};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::membership::Membership;
use crate::cluster::peer::PeerClient;
use crate::cluster::role::{NodeId, RoleResolver};
use crate::common::{Error, NodeMetrics, Result};
use crate::services::installer::InstallOutcome;
use crate::services::registry::ServiceRegistry;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealReport {
    pub followers_checked: usize,
    /// Follower -> mounts re-applied from the leader
    pub repaired: BTreeMap<NodeId, Vec<String>>,
    /// Follower -> mounts removed because the leader no longer has them
    #[serde(default)]
    pub removed: BTreeMap<NodeId, Vec<String>>,
    /// Follower -> reason it was skipped, or per-mount apply failures
    pub failures: BTreeMap<NodeId, String>,
}

impl HealReport {
    pub fn repaired_count(&self) -> usize {
        self.repaired.values().map(Vec::len).sum()
    }

    pub fn removed_count(&self) -> usize {
        self.removed.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Default)]
struct FollowerHeal {
    repaired: Vec<String>,
    removed: Vec<String>,
    /// Per-mount failures
    failed: Vec<String>,
}

pub struct HealCoordinator {
    registry: Arc<ServiceRegistry>,
    peers: Arc<PeerClient>,
    membership: Arc<Membership>,
    role: Arc<dyn RoleResolver>,
    metrics: Arc<NodeMetrics>,
}

impl HealCoordinator {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        peers: Arc<PeerClient>,
        membership: Arc<Membership>,
        role: Arc<dyn RoleResolver>,
        metrics: Arc<NodeMetrics>,
    ) -> Self {
        Self {
            registry,
            peers,
            membership,
            role,
            metrics,
        }
    }

    /// Run one sweep. Only the leader heals.
    pub async fn heal(&self) -> Result<HealReport> {
        let role = self.role.resolve();
        if !role.is_leader() {
            return Err(Error::LeaderUnavailable(format!(
                "node {} is not the leader",
                role.node_id
            )));
        }
        self.metrics.heal_runs.inc();

        let canonical: BTreeMap<String, String> = self
            .registry
            .list()
            .into_iter()
            .map(|record| (record.mount, record.checksum))
            .collect();
        let mounts: Vec<String> = canonical.keys().cloned().collect();
        let followers = self.membership.others();

        let leader = &role.node_id;
        let (canonical_ref, mounts_ref) = (&canonical, &mounts);
        let results = join_all(followers.iter().map(|follower| async move {
            self.heal_follower(follower, leader, canonical_ref, mounts_ref)
                .await
        }))
        .await;

        let mut report = HealReport {
            followers_checked: followers.len(),
            ..Default::default()
        };
        for (follower, result) in followers.into_iter().zip(results) {
            match result {
                Ok(healed) => {
                    self.metrics
                        .heal_repairs
                        .add((healed.repaired.len() + healed.removed.len()) as u64);
                    if !healed.failed.is_empty() {
                        report.failures.insert(follower.clone(), healed.failed.join("; "));
                    }
                    if !healed.removed.is_empty() {
                        tracing::info!("Removed {} orphaned mounts on {}", healed.removed.len(), follower);
                        report.removed.insert(follower.clone(), healed.removed);
                    }
                    if !healed.repaired.is_empty() {
                        tracing::info!("Healed {} mounts on {}", healed.repaired.len(), follower);
                        report.repaired.insert(follower, healed.repaired);
                    }
                }
                Err(e) => {
                    tracing::warn!("Heal skipped follower {}: {}", follower, e);
                    self.metrics.peer_failures.inc();
                    report.failures.insert(follower, e.to_string());
                }
            }
        }
        Ok(report)
    }

    async fn heal_follower(
        &self,
        follower: &str,
        leader: &NodeId,
        canonical: &BTreeMap<String, String>,
        mounts: &[String],
    ) -> Result<FollowerHeal> {
        let (reported, held) = try_join(
            self.peers.checksums(follower, mounts),
            self.peers.list(follower),
        )
        .await?;
        let mut healed = FollowerHeal::default();

        // Re-checked against the live registry: the mount may have been
        // installed since the snapshot was taken
        let orphaned: Vec<String> = held
            .into_iter()
            .map(|summary| summary.mount)
            .filter(|mount| !canonical.contains_key(mount) && !self.registry.contains(mount))
            .collect();
        let removals =
            join_all(orphaned.iter().map(|mount| self.peers.remove_local(follower, mount))).await;
        for (mount, result) in orphaned.into_iter().zip(removals) {
            match result {
                Ok(()) => healed.removed.push(mount),
                Err(e) => healed.failed.push(format!("{}: {}", mount, e)),
            }
        }

        let stale: BTreeMap<String, Vec<NodeId>> = canonical
            .iter()
            .filter(|(mount, checksum)| reported.get(*mount) != Some(*checksum))
            .map(|(mount, _)| (mount.clone(), vec![leader.clone()]))
            .collect();
        if stale.is_empty() {
            return Ok(healed);
        }

        tracing::debug!("{} stale mounts on {}", stale.len(), follower);
        let outcomes = self.peers.install_local(follower, &stale).await?;
        for (mount, outcome) in outcomes {
            match outcome {
                InstallOutcome::Failed { error } => healed.failed.push(format!("{}: {}", mount, error)),
                _ => healed.repaired.push(mount),
            }
        }
        Ok(healed)
    }

    /// Sweep every `interval` while this node leads
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !self.role.is_leader() {
                continue;
            }
            if let Err(e) = self.heal().await {
                tracing::warn!("Periodic heal failed: {}", e);
            }
        }
    }
}
