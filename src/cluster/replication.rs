//! Push of leader-side changes to followers
//!
//! The gateway marks every mount it changed. A flush sends all pending
//! upserts to each follower as one `/_local` batch naming the leader as the
//! source, plus a local uninstall per removed mount. Pushes are best effort;
//! whatever a follower misses is repaired by the next heal.

use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use crate::cluster::membership::Membership;
use crate::cluster::peer::PeerClient;
use crate::cluster::role::{NodeId, RoleResolver};
use crate::common::NodeMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingChange {
    Upsert,
    Remove,
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct ReplicationReport {
    pub upserts: usize,
    pub removals: usize,
    pub followers: usize,
    pub failures: BTreeMap<NodeId, String>,
}

pub struct Replicator {
    pending: Mutex<BTreeMap<String, PendingChange>>,
    notify: Notify,
    immediate: bool,
    peers: Arc<PeerClient>,
    membership: Arc<Membership>,
    role: Arc<dyn RoleResolver>,
    metrics: Arc<NodeMetrics>,
}

impl Replicator {
    pub fn new(
        peers: Arc<PeerClient>,
        membership: Arc<Membership>,
        role: Arc<dyn RoleResolver>,
        metrics: Arc<NodeMetrics>,
        immediate: bool,
    ) -> Self {
        Self {
            pending: Mutex::new(BTreeMap::new()),
            notify: Notify::new(),
            immediate,
            peers,
            membership,
            role,
            metrics,
        }
    }

    /// Record a change; the latest mark for a mount wins
    pub fn mark(&self, mount: &str, change: PendingChange) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(mount.to_string(), change);
        if self.immediate {
            self.notify.notify_one();
        }
    }

    pub fn pending(&self) -> BTreeMap<String, PendingChange> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Drain pending changes and push them to every follower
    pub async fn flush(&self) -> ReplicationReport {
        let role = self.role.resolve();
        if !role.is_leader() {
            return ReplicationReport::default();
        }
        let drained = std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()));
        if drained.is_empty() {
            return ReplicationReport::default();
        }

        let upserts: BTreeMap<String, Vec<NodeId>> = drained
            .iter()
            .filter(|(_, change)| **change == PendingChange::Upsert)
            .map(|(mount, _)| (mount.clone(), vec![role.node_id.clone()]))
            .collect();
        let removals: Vec<&String> = drained
            .iter()
            .filter(|(_, change)| **change == PendingChange::Remove)
            .map(|(mount, _)| mount)
            .collect();

        let followers = self.membership.others();
        let (upserts_ref, removals_ref) = (&upserts, &removals);
        let results = join_all(followers.iter().map(|follower| async move {
            if !upserts_ref.is_empty() {
                self.peers.install_local(follower, upserts_ref).await?;
            }
            for mount in removals_ref {
                self.peers.remove_local(follower, mount).await?;
            }
            Ok::<_, crate::Error>(())
        }))
        .await;

        let mut report = ReplicationReport {
            upserts: upserts.len(),
            removals: removals.len(),
            followers: followers.len(),
            failures: BTreeMap::new(),
        };
        for (follower, result) in followers.into_iter().zip(results) {
            match result {
                Ok(()) => self.metrics.replication_pushes.inc(),
                Err(e) => {
                    tracing::warn!("Replication to {} failed: {}", follower, e);
                    self.metrics.peer_failures.inc();
                    report.failures.insert(follower, e.to_string());
                }
            }
        }
        tracing::debug!(
            "Replicated {} upserts and {} removals to {} followers",
            report.upserts,
            report.removals,
            report.followers
        );
        report
    }

    /// Flush on every mark (when immediate) and at least every `interval`
    pub async fn run(self: Arc<Self>, interval: Duration) {
        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }
            self.flush().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::role::StaticRole;
    use crate::cluster::transport::InProcessTransport;

    fn replicator(role: StaticRole) -> Replicator {
        let transport = Arc::new(InProcessTransport::new(Duration::from_millis(50)));
        let membership = Arc::new(
            Membership::new("n1")
                .with_node("n1", "http://n1")
                .with_node("n2", "http://n2"),
        );
        Replicator::new(
            Arc::new(PeerClient::new("n1", transport)),
            membership,
            Arc::new(role),
            Arc::new(NodeMetrics::new()),
            false,
        )
    }

    #[tokio::test]
    async fn test_latest_mark_wins_and_flush_drains() {
        let replicator = replicator(StaticRole::leader("n1"));
        replicator.mark("/a", PendingChange::Upsert);
        replicator.mark("/a", PendingChange::Remove);
        replicator.mark("/b", PendingChange::Upsert);
        assert_eq!(replicator.pending()["/a"], PendingChange::Remove);

        // n2 is not registered with the transport, so the push fails
        let report = replicator.flush().await;
        assert_eq!(report.upserts, 1);
        assert_eq!(report.removals, 1);
        assert!(report.failures.contains_key("n2"));
        assert!(replicator.pending().is_empty());
    }

    #[tokio::test]
    async fn test_followers_never_push() {
        let replicator = replicator(StaticRole::follower("n1", Some("n2".into())));
        replicator.mark("/a", PendingChange::Upsert);
        let report = replicator.flush().await;
        assert_eq!(report.followers, 0);
        assert_eq!(replicator.pending().len(), 1);
    }
}
