//! Request-routing table for installed mounts
//!
//! The table is a snapshot; it only changes on an explicit `rebuild()`, which
//! the local installer calls after every batch so new mounts become reachable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::services::registry::ServiceRegistry;

/// Routing collaborator invalidated after local installs
pub trait RouterCache: Send + Sync {
    fn rebuild(&self);
}

pub struct RoutingTable {
    registry: Arc<ServiceRegistry>,
    /// Mounts ordered longest first for prefix matching
    mounts: RwLock<Vec<String>>,
    generation: AtomicU64,
}

impl RoutingTable {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        let table = Self {
            registry,
            mounts: RwLock::new(Vec::new()),
            generation: AtomicU64::new(0),
        };
        table.rebuild();
        table
    }

    /// Mount serving `path`, by longest segment-aligned prefix
    pub fn resolve(&self, path: &str) -> Option<String> {
        let mounts = self.mounts.read().unwrap_or_else(|e| e.into_inner());
        mounts
            .iter()
            .find(|mount| {
                path == mount.as_str()
                    || (path.starts_with(mount.as_str())
                        && path.as_bytes().get(mount.len()) == Some(&b'/'))
            })
            .cloned()
    }

    /// Number of rebuilds so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn routes(&self) -> Vec<String> {
        self.mounts.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl RouterCache for RoutingTable {
    fn rebuild(&self) {
        let mut mounts = self.registry.mounts();
        mounts.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        let count = mounts.len();
        *self.mounts.write().unwrap_or_else(|e| e.into_inner()) = mounts;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!("Routing table rebuilt: {} mounts (generation {})", count, generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::record::Manifest;

    #[test]
    fn test_longest_prefix_after_rebuild() {
        let registry = Arc::new(ServiceRegistry::in_memory());
        let table = RoutingTable::new(registry.clone());
        assert_eq!(table.generation(), 1);
        assert!(table.resolve("/_api/x").is_none());

        registry.seed_internal("/_api", Manifest::new("api", "1.0.0")).unwrap();
        registry
            .seed_internal("/_api/v2", Manifest::new("api2", "1.0.0"))
            .unwrap();
        // not visible until rebuilt
        assert!(table.resolve("/_api/x").is_none());

        table.rebuild();
        assert_eq!(table.generation(), 2);
        assert_eq!(table.resolve("/_api/x").as_deref(), Some("/_api"));
        assert_eq!(table.resolve("/_api/v2/users").as_deref(), Some("/_api/v2"));
        assert_eq!(table.resolve("/_api").as_deref(), Some("/_api"));
        assert!(table.resolve("/_apix").is_none());
    }
}
