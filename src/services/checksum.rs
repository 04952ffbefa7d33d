//! Checksum registry: current content fingerprint per mount

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::common::Result;
use crate::services::record::ServiceSource;

#[derive(Debug, Default)]
pub struct ChecksumRegistry {
    checksums: RwLock<HashMap<String, String>>,
}

impl ChecksumRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fingerprint of a source as it would be installed
    pub fn compute(source: &ServiceSource, legacy: bool) -> Result<String> {
        source.fingerprint(legacy)
    }

    pub fn set(&self, mount: &str, checksum: &str) {
        self.checksums
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(mount.to_string(), checksum.to_string());
    }

    pub fn remove(&self, mount: &str) {
        self.checksums
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(mount);
    }

    pub fn checksum_of(&self, mount: &str) -> Option<String> {
        self.checksums
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(mount)
            .cloned()
    }

    /// Batch lookup. Mounts without a record are left out of the result.
    pub fn checksums<S: AsRef<str>>(&self, mounts: &[S]) -> BTreeMap<String, String> {
        let checksums = self.checksums.read().unwrap_or_else(|e| e.into_inner());
        mounts
            .iter()
            .filter_map(|mount| {
                let mount = mount.as_ref();
                checksums
                    .get(mount)
                    .map(|checksum| (mount.to_string(), checksum.clone()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.checksums.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_lookup_is_partial() {
        let registry = ChecksumRegistry::new();
        registry.set("/a", "aaa");
        registry.set("/b", "bbb");

        let found = registry.checksums(&["/a", "/missing", "/b"]);
        assert_eq!(found.len(), 2);
        assert_eq!(found["/a"], "aaa");
        assert!(!found.contains_key("/missing"));

        registry.remove("/a");
        assert!(registry.checksum_of("/a").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_repeated_reads_are_stable() {
        let registry = ChecksumRegistry::new();
        registry.set("/a", "aaa");
        let first = registry.checksum_of("/a");
        for _ in 0..10 {
            assert_eq!(registry.checksum_of("/a"), first);
        }
    }
}
