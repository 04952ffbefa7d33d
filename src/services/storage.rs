//! Persistent and in-memory backends for node-local service state
//!
//! Records and bundle bytes are kept in two namespaces. The in-memory backend
//! is the default; RocksDB is available behind the `rocksdb` feature.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::common::Result;
use crate::services::record::ServiceRecord;

#[cfg(feature = "rocksdb")]
use rocksdb::{Options, DB};

/// Storage for the records and bundles of one node
pub trait StateBackend: Send + Sync {
    fn load_records(&self) -> Result<Vec<ServiceRecord>>;
    fn put_record(&self, record: &ServiceRecord) -> Result<()>;
    fn delete_record(&self, mount: &str) -> Result<()>;
    fn get_bundle(&self, mount: &str) -> Result<Option<Bytes>>;
    fn put_bundle(&self, mount: &str, bundle: &[u8]) -> Result<()>;
    fn delete_bundle(&self, mount: &str) -> Result<()>;
}

/// In-memory backend (default)
#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<HashMap<String, ServiceRecord>>,
    bundles: Mutex<HashMap<String, Bytes>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> crate::Error {
    crate::Error::Storage("state lock poisoned".into())
}

impl StateBackend for MemoryBackend {
    fn load_records(&self) -> Result<Vec<ServiceRecord>> {
        Ok(self.records.lock().map_err(poisoned)?.values().cloned().collect())
    }

    fn put_record(&self, record: &ServiceRecord) -> Result<()> {
        self.records
            .lock()
            .map_err(poisoned)?
            .insert(record.mount.clone(), record.clone());
        Ok(())
    }

    fn delete_record(&self, mount: &str) -> Result<()> {
        self.records.lock().map_err(poisoned)?.remove(mount);
        Ok(())
    }

    fn get_bundle(&self, mount: &str) -> Result<Option<Bytes>> {
        Ok(self.bundles.lock().map_err(poisoned)?.get(mount).cloned())
    }

    fn put_bundle(&self, mount: &str, bundle: &[u8]) -> Result<()> {
        self.bundles
            .lock()
            .map_err(poisoned)?
            .insert(mount.to_string(), Bytes::copy_from_slice(bundle));
        Ok(())
    }

    fn delete_bundle(&self, mount: &str) -> Result<()> {
        self.bundles.lock().map_err(poisoned)?.remove(mount);
        Ok(())
    }
}

#[cfg(feature = "rocksdb")]
const CF_SERVICES: &str = "services";
#[cfg(feature = "rocksdb")]
const CF_BUNDLES: &str = "bundles";

/// RocksDB backend
#[cfg(feature = "rocksdb")]
pub struct RocksBackend {
    db: DB,
}

#[cfg(feature = "rocksdb")]
impl RocksBackend {
    /// Open or create the state database
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_SERVICES, CF_BUNDLES])?;
        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| crate::Error::Storage(format!("missing column family {}", name)))
    }
}

#[cfg(feature = "rocksdb")]
impl StateBackend for RocksBackend {
    fn load_records(&self) -> Result<Vec<ServiceRecord>> {
        let cf = self.cf(CF_SERVICES)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (_, value) = item?;
            let record: ServiceRecord = serde_json::from_slice(&value)
                .map_err(|e| crate::Error::Storage(format!("corrupted record: {}", e)))?;
            records.push(record);
        }
        Ok(records)
    }

    fn put_record(&self, record: &ServiceRecord) -> Result<()> {
        let value = serde_json::to_vec(record)
            .map_err(|e| crate::Error::Storage(format!("Serialize error: {}", e)))?;
        self.db
            .put_cf(self.cf(CF_SERVICES)?, record.mount.as_bytes(), value)?;
        Ok(())
    }

    fn delete_record(&self, mount: &str) -> Result<()> {
        self.db.delete_cf(self.cf(CF_SERVICES)?, mount.as_bytes())?;
        Ok(())
    }

    fn get_bundle(&self, mount: &str) -> Result<Option<Bytes>> {
        Ok(self
            .db
            .get_cf(self.cf(CF_BUNDLES)?, mount.as_bytes())?
            .map(Bytes::from))
    }

    fn put_bundle(&self, mount: &str, bundle: &[u8]) -> Result<()> {
        self.db.put_cf(self.cf(CF_BUNDLES)?, mount.as_bytes(), bundle)?;
        Ok(())
    }

    fn delete_bundle(&self, mount: &str) -> Result<()> {
        self.db.delete_cf(self.cf(CF_BUNDLES)?, mount.as_bytes())?;
        Ok(())
    }
}
