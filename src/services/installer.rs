//! Local installer: applies the authoritative copy of a mount to this node
//!
//! Content is pulled from the first reachable source node. The bundle is
//! requested with `If-Match` on the described checksum and verified again
//! after transfer, so a node never stores bytes that disagree with the
//! checksum it records. Applying the same content twice changes nothing.

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::cluster::locks::MountLockTable;
use crate::cluster::peer::PeerClient;
use crate::cluster::role::NodeId;
use crate::common::{timestamp_now, validate_mount, Error, NodeMetrics, Result};
use crate::services::record::{fingerprint, ServiceInfo, ServiceRecord};
use crate::services::registry::ServiceRegistry;
use crate::services::routing::RouterCache;

/// Per-mount result of a local apply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InstallOutcome {
    /// New content stored
    Installed { checksum: String },
    /// Same content, replicated options changed
    OptionsUpdated { checksum: String },
    Unchanged { checksum: String },
    /// The source no longer has the mount
    Removed,
    Failed { error: String },
}

/// Result of a full sync from the leader
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub applied: BTreeMap<String, InstallOutcome>,
    pub removed: Vec<String>,
}

impl SyncReport {
    pub fn failures(&self) -> usize {
        self.applied
            .values()
            .filter(|o| matches!(o, InstallOutcome::Failed { .. }))
            .count()
    }
}

pub struct LocalInstaller {
    node_id: NodeId,
    registry: Arc<ServiceRegistry>,
    locks: Arc<MountLockTable>,
    peers: Arc<PeerClient>,
    router: Arc<dyn RouterCache>,
    metrics: Arc<NodeMetrics>,
}

impl LocalInstaller {
    pub fn new(
        node_id: impl Into<NodeId>,
        registry: Arc<ServiceRegistry>,
        locks: Arc<MountLockTable>,
        peers: Arc<PeerClient>,
        router: Arc<dyn RouterCache>,
        metrics: Arc<NodeMetrics>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            registry,
            locks,
            peers,
            router,
            metrics,
        }
    }

    /// Apply one mount from `sources` and rebuild routing
    pub async fn apply_locally(&self, mount: &str, sources: &[NodeId]) -> Result<InstallOutcome> {
        let outcome = self.apply_one(mount, sources).await;
        self.router.rebuild();
        self.refresh_gauge();
        outcome
    }

    /// Apply several mounts concurrently. Failures are reported per mount;
    /// routing is rebuilt once at the end.
    pub async fn install_batch(
        &self,
        batch: &BTreeMap<String, Vec<NodeId>>,
    ) -> BTreeMap<String, InstallOutcome> {
        let results = join_all(
            batch
                .iter()
                .map(|(mount, sources)| self.apply_one(mount, sources)),
        )
        .await;

        let outcomes = batch
            .keys()
            .cloned()
            .zip(results)
            .map(|(mount, result)| {
                let outcome = result.unwrap_or_else(|e| {
                    tracing::warn!("Local install of {} failed: {}", mount, e);
                    InstallOutcome::Failed {
                        error: e.to_string(),
                    }
                });
                (mount, outcome)
            })
            .collect();

        self.router.rebuild();
        self.refresh_gauge();
        outcomes
    }

    /// Delete local state of `mount`. Returns whether anything was removed.
    pub async fn remove_locally(&self, mount: &str) -> Result<bool> {
        validate_mount(mount)?;
        let removed = self
            .locks
            .with_lock(mount, || async { self.registry.remove(mount) })
            .await?;
        self.locks.reclaim(mount);
        self.router.rebuild();
        self.refresh_gauge();
        if removed.is_some() {
            self.metrics.local_removals.inc();
            tracing::info!("Removed local copy of {}", mount);
        }
        Ok(removed.is_some())
    }

    /// Mirror `leader`: apply every mount it has, drop every mount it lacks
    pub async fn sync_from(&self, leader: &str) -> Result<SyncReport> {
        let listed = self.peers.list(leader).await?;
        let wanted: BTreeSet<String> = listed.into_iter().map(|s| s.mount).collect();
        let batch: BTreeMap<String, Vec<NodeId>> = wanted
            .iter()
            .map(|mount| (mount.clone(), vec![leader.to_string()]))
            .collect();

        let applied = self.install_batch(&batch).await;
        let mut removed = Vec::new();
        for mount in self.registry.mounts() {
            if !wanted.contains(&mount) && self.remove_locally(&mount).await? {
                removed.push(mount);
            }
        }
        Ok(SyncReport { applied, removed })
    }

    async fn apply_one(&self, mount: &str, sources: &[NodeId]) -> Result<InstallOutcome> {
        validate_mount(mount)?;
        let mut last_error = None;
        for source in sources {
            if *source == self.node_id {
                // This node is the source: its copy is authoritative already
                return Ok(match self.registry.checksum_of(mount) {
                    Some(checksum) => InstallOutcome::Unchanged { checksum },
                    None => InstallOutcome::Removed,
                });
            }
            let attempt = self
                .locks
                .with_lock(mount, || self.pull(mount, source))
                .await;
            match attempt {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() => {
                    tracing::warn!("Source {} failed for {}: {}", source, mount, e);
                    self.metrics.peer_failures.inc();
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| Error::LeaderUnavailable(format!("no source node for {}", mount))))
    }

    async fn pull(&self, mount: &str, source: &str) -> Result<InstallOutcome> {
        let Some(info) = self.peers.describe(source, mount).await? else {
            if self.registry.remove(mount)?.is_some() {
                self.metrics.local_removals.inc();
                tracing::info!("{} no longer on {}, removed local copy", mount, source);
            }
            return Ok(InstallOutcome::Removed);
        };

        let previous = self.registry.get(mount);
        if let Some(local) = &previous {
            if local.matches_replica(&info) {
                self.metrics.local_installs_unchanged.inc();
                tracing::debug!("{} already at {}", mount, info.checksum);
                return Ok(InstallOutcome::Unchanged {
                    checksum: info.checksum,
                });
            }
            if local.checksum == info.checksum
                && local.legacy == info.legacy
                && local.manifest == info.manifest
            {
                let mut updated = local.clone();
                updated.configuration = info.options.configuration;
                updated.dependencies = info.options.dependencies;
                updated.updated_at = timestamp_now();
                self.registry.write(updated, None)?;
                tracing::debug!("Updated options of {}", mount);
                return Ok(InstallOutcome::OptionsUpdated {
                    checksum: info.checksum,
                });
            }
        }

        let bytes = self.peers.fetch_bundle(source, mount, &info.checksum).await?;
        let actual = fingerprint(&info.manifest, &bytes, info.legacy)?;
        if actual != info.checksum {
            return Err(Error::ChecksumMismatch {
                mount: mount.to_string(),
                expected: info.checksum,
                actual,
            });
        }

        let checksum = info.checksum.clone();
        let record = replica_record(info, previous.as_ref());
        self.registry.write(record, Some(&bytes))?;
        self.metrics.local_installs.inc();
        tracing::info!("Installed {} from {} ({})", mount, source, checksum);
        Ok(InstallOutcome::Installed { checksum })
    }

    fn refresh_gauge(&self) {
        self.metrics.installed_services.set(self.registry.len() as u64);
    }
}

/// Local record for a replicated descriptor. Mode and install time survive
/// from the previous local copy.
fn replica_record(info: ServiceInfo, previous: Option<&ServiceRecord>) -> ServiceRecord {
    let now = timestamp_now();
    ServiceRecord {
        mount: info.mount,
        manifest: info.manifest,
        bundle_ref: None,
        checksum: info.checksum,
        legacy: info.legacy,
        mode: previous.map(|p| p.mode).unwrap_or_default(),
        configuration: info.options.configuration,
        dependencies: info.options.dependencies,
        installed_at: previous
            .map(|p| p.installed_at.clone())
            .unwrap_or_else(|| now.clone()),
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::record::{Manifest, ServiceMode, ServiceOptions};

    #[test]
    fn test_replica_record_keeps_local_mode() {
        let info = ServiceInfo {
            mount: "/app".into(),
            name: "app".into(),
            version: "1.0.0".into(),
            development: false,
            legacy: false,
            manifest: Manifest::new("app", "1.0.0"),
            checksum: "c2".into(),
            options: ServiceOptions::default(),
        };
        let mut previous = replica_record(info.clone(), None);
        previous.mode = ServiceMode::Development;
        previous.installed_at = "2026-01-01T00:00:00Z".into();

        let next = replica_record(info, Some(&previous));
        assert!(next.mode.is_development());
        assert_eq!(next.installed_at, "2026-01-01T00:00:00Z");
        assert_eq!(next.checksum, "c2");
    }

    #[test]
    fn test_outcome_wire_format() {
        let json = serde_json::to_value(InstallOutcome::Unchanged {
            checksum: "abc".into(),
        })
        .unwrap();
        assert_eq!(json["status"], "unchanged");
        assert_eq!(json["checksum"], "abc");
    }
}
