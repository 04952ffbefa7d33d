//! Node-local service registry
//!
//! Holds the mount -> record map of this node together with the checksum
//! registry and bundle store. On the leader this is the authoritative cluster
//! view; on followers it is the applied copy.
//!
//! Readers never take mount locks. Writers are expected to hold the mount's
//! lock (gateway) or to be the local installer applying a replica.

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::common::{timestamp_now, validate_mount, Error, Result};
use crate::services::bundle::{materialize, BundleStore};
use crate::services::checksum::ChecksumRegistry;
use crate::services::record::{fingerprint, Manifest, ServiceMode, ServiceRecord};
use crate::services::storage::{MemoryBackend, StateBackend};

pub struct ServiceRegistry {
    records: RwLock<HashMap<String, ServiceRecord>>,
    checksums: ChecksumRegistry,
    bundles: BundleStore,
    backend: Arc<dyn StateBackend>,
}

impl ServiceRegistry {
    /// Open a registry over a backend, loading any persisted records
    pub fn open(backend: Arc<dyn StateBackend>) -> Result<Self> {
        let records = backend.load_records()?;
        if !records.is_empty() {
            tracing::info!("Loaded {} persisted services", records.len());
        }
        Ok(Self::with_records(backend, records))
    }

    pub fn in_memory() -> Self {
        Self::with_records(Arc::new(MemoryBackend::new()), Vec::new())
    }

    fn with_records(backend: Arc<dyn StateBackend>, loaded: Vec<ServiceRecord>) -> Self {
        let checksums = ChecksumRegistry::new();
        let mut records = HashMap::new();
        for record in loaded {
            checksums.set(&record.mount, &record.checksum);
            records.insert(record.mount.clone(), record);
        }
        Self {
            records: RwLock::new(records),
            checksums,
            bundles: BundleStore::new(backend.clone()),
            backend,
        }
    }

    pub fn checksums(&self) -> &ChecksumRegistry {
        &self.checksums
    }

    pub fn bundles(&self) -> &BundleStore {
        &self.bundles
    }

    pub fn get(&self, mount: &str) -> Option<ServiceRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(mount)
            .cloned()
    }

    /// Like [`get`](Self::get) but absent mounts are an error
    pub fn require(&self, mount: &str) -> Result<ServiceRecord> {
        self.get(mount)
            .ok_or_else(|| Error::MountNotFound(mount.to_string()))
    }

    pub fn contains(&self, mount: &str) -> bool {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(mount)
    }

    /// All records ordered by mount
    pub fn list(&self) -> Vec<ServiceRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<ServiceRecord> = records.values().cloned().collect();
        list.sort_by(|a, b| a.mount.cmp(&b.mount));
        list
    }

    pub fn mounts(&self) -> Vec<String> {
        self.list().into_iter().map(|r| r.mount).collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn checksum_of(&self, mount: &str) -> Option<String> {
        self.checksums.checksum_of(mount)
    }

    pub fn checksums_of<S: AsRef<str>>(&self, mounts: &[S]) -> BTreeMap<String, String> {
        self.checksums.checksums(mounts)
    }

    /// Store a record, and its bundle when given. The bundle is written
    /// first and the record last, so an interrupted write leaves the old
    /// checksum in place and is detectable by comparison. A failed record
    /// write puts the previous bundle back.
    pub fn write(&self, mut record: ServiceRecord, bundle: Option<&[u8]>) -> Result<ServiceRecord> {
        let previous_bundle = match bundle {
            Some(bytes) => {
                let previous = self.backend.get_bundle(&record.mount)?;
                record.bundle_ref = Some(self.bundles.store(&record.mount, bytes)?);
                Some(previous)
            }
            None => None,
        };
        if let Err(e) = self.backend.put_record(&record) {
            if let Some(previous) = previous_bundle {
                if let Err(restore) = self.bundles.restore(&record.mount, previous) {
                    tracing::error!("Could not restore bundle of {}: {}", record.mount, restore);
                }
            }
            return Err(e);
        }
        self.checksums.set(&record.mount, &record.checksum);
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.mount.clone(), record.clone());
        Ok(record)
    }

    /// Remove a record and its bundle. Returns the removed record.
    pub fn remove(&self, mount: &str) -> Result<Option<ServiceRecord>> {
        self.backend.delete_record(mount)?;
        self.bundles.remove(mount)?;
        self.checksums.remove(mount);
        Ok(self
            .records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(mount))
    }

    /// Flip the local mode flag. Bundle and checksum stay untouched.
    pub fn set_mode(&self, mount: &str, mode: ServiceMode) -> Result<ServiceRecord> {
        let mut record = self.require(mount)?;
        if record.mode == mode {
            return Ok(record);
        }
        record.mode = mode;
        record.updated_at = timestamp_now();
        self.write(record, None)
    }

    /// Register a restricted internal service that ships no bundle; the
    /// bundle is materialized from the manifest on first fetch.
    pub fn seed_internal(&self, mount: &str, manifest: Manifest) -> Result<ServiceRecord> {
        validate_mount(mount)?;
        if !crate::common::is_internal_mount(mount) {
            return Err(Error::InvalidMount {
                mount: mount.to_string(),
                reason: "only /_ mounts can be seeded without a bundle".into(),
            });
        }
        if self.contains(mount) {
            return Err(Error::MountConflict(mount.to_string()));
        }
        let bytes = materialize(&manifest)?;
        let now = timestamp_now();
        let record = ServiceRecord {
            mount: mount.to_string(),
            checksum: fingerprint(&manifest, &bytes, false)?,
            manifest,
            bundle_ref: None,
            legacy: false,
            mode: ServiceMode::Production,
            configuration: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            installed_at: now.clone(),
            updated_at: now,
        };
        self.write(record, None)
    }

    pub fn load_bundle(&self, mount: &str) -> Result<Bytes> {
        let record = self.require(mount)?;
        self.bundles.load(&record)
    }
}
