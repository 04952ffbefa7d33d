//! Bundle store with conditional retrieval
//!
//! Bundles are served with the record checksum as a strong entity tag, so
//! followers and clients can revalidate cheaply (`If-None-Match`) or insist
//! on an exact version (`If-Match`).

use bytes::Bytes;
use std::sync::Arc;

use crate::common::{
    blake3_hash, bundle_filename, etag_matches, is_internal_mount, quote_etag, Error, Result,
};
use crate::services::record::{BundleRef, Manifest, ServiceRecord};
use crate::services::storage::StateBackend;

/// Outcome of a conditional fetch
#[derive(Debug, Clone, PartialEq)]
pub enum BundleFetch {
    /// `If-None-Match` matched the current checksum
    Unchanged { etag: String },
    Bundle {
        bytes: Bytes,
        etag: String,
        filename: String,
    },
}

pub struct BundleStore {
    backend: Arc<dyn StateBackend>,
}

impl BundleStore {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    /// Persist bundle bytes for a mount
    pub fn store(&self, mount: &str, bytes: &[u8]) -> Result<BundleRef> {
        self.backend.put_bundle(mount, bytes)?;
        Ok(BundleRef {
            digest: blake3_hash(bytes),
            size: bytes.len() as u64,
        })
    }

    pub fn remove(&self, mount: &str) -> Result<()> {
        self.backend.delete_bundle(mount)
    }

    /// Put back the bundle a mount had before a failed write
    pub fn restore(&self, mount: &str, previous: Option<Bytes>) -> Result<()> {
        match previous {
            Some(bytes) => self.backend.put_bundle(mount, &bytes),
            None => self.backend.delete_bundle(mount),
        }
    }

    /// Bundle bytes of a record, materialized on first use for internal
    /// mounts that were registered without one.
    pub fn load(&self, record: &ServiceRecord) -> Result<Bytes> {
        match self.backend.get_bundle(&record.mount)? {
            Some(bytes) => Ok(bytes),
            None => self.materialize_missing(record),
        }
    }

    fn materialize_missing(&self, record: &ServiceRecord) -> Result<Bytes> {
        if !is_internal_mount(&record.mount) {
            return Err(Error::BundleUnavailable(record.mount.clone()));
        }
        let bytes = Bytes::from(materialize(&record.manifest)?);
        self.backend.put_bundle(&record.mount, &bytes)?;
        tracing::info!("Materialized bundle for internal mount {}", record.mount);
        Ok(bytes)
    }

    /// Conditional fetch keyed on the record checksum
    pub fn fetch(
        &self,
        record: &ServiceRecord,
        if_none_match: Option<&str>,
        if_match: Option<&str>,
    ) -> Result<BundleFetch> {
        let etag = quote_etag(&record.checksum);

        let stored = self.backend.get_bundle(&record.mount)?;
        if stored.is_none() && !is_internal_mount(&record.mount) {
            return Err(Error::BundleUnavailable(record.mount.clone()));
        }

        if let Some(validator) = if_none_match {
            if etag_matches(validator, &record.checksum) {
                return Ok(BundleFetch::Unchanged { etag });
            }
        }
        if let Some(validator) = if_match {
            if !etag_matches(validator, &record.checksum) {
                return Err(Error::StaleReference(record.mount.clone()));
            }
        }

        let bytes = match stored {
            Some(bytes) => bytes,
            None => self.materialize_missing(record)?,
        };
        Ok(BundleFetch::Bundle {
            bytes,
            etag,
            filename: bundle_filename(&record.mount),
        })
    }
}

/// Deterministic bundle for services that only exist as a manifest
pub fn materialize(manifest: &Manifest) -> Result<Vec<u8>> {
    manifest.canonical_bytes()
}
