//! Service state of one node and the write path that changes it

pub mod bundle;
pub mod checksum;
pub mod gateway;
pub mod installer;
pub mod options;
pub mod record;
pub mod registry;
pub mod routing;
pub mod runtime;
pub mod storage;

pub use bundle::{BundleFetch, BundleStore};
pub use checksum::ChecksumRegistry;
pub use gateway::{
    InstallOptions, OptionsResponse, ServiceResponse, ServiceUpload, UninstallOptions,
    UpgradeOptions, UploadBody, WriteGateway, WriteOp, WriteOutcome,
};
pub use installer::{InstallOutcome, LocalInstaller, SyncReport};
pub use options::{Patched, ValidationWarning};
pub use record::{
    fingerprint, ConfigDefinition, ConfigType, DependencyDefinition, Manifest, ServiceInfo,
    ServiceMode, ServiceOptions, ServiceRecord, ServiceSource, ServiceSummary,
};
pub use registry::ServiceRegistry;
pub use routing::{RouterCache, RoutingTable};
pub use runtime::{NoopRuntime, Reporter, ServiceRuntime, TestReport};
pub use storage::{MemoryBackend, StateBackend};

#[cfg(feature = "rocksdb")]
pub use storage::RocksBackend;
