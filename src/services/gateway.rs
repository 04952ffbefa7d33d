//! Write gateway: every mutating service operation goes through here
//!
//! On the leader an operation runs under its mount's lock on a spawned task,
//! so a caller that goes away cannot cancel a half-applied mutation. On any
//! other node the operation is encoded as the same HTTP request the public
//! API accepts and relayed to the leader, whose answer is decoded back.
//! Development mode is the exception: it belongs to the node that received
//! the toggle and is applied there whatever its role.

use axum::http::Method;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cluster::locks::MountLockTable;
use crate::cluster::peer::PeerClient;
use crate::cluster::replication::{PendingChange, Replicator};
use crate::cluster::role::RoleSnapshot;
use crate::cluster::transport::{PeerRequest, PeerResponse};
use crate::common::{encode_query_value, timestamp_now, validate_mount, Error, NodeMetrics, Result};
use crate::services::options::{parse_option_map, patch_configuration, patch_dependencies, ValidationWarning};
use crate::services::record::{Manifest, ServiceInfo, ServiceMode, ServiceRecord, ServiceSource};
use crate::services::registry::ServiceRegistry;
use crate::services::routing::RouterCache;
use crate::services::runtime::ServiceRuntime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallOptions {
    pub development: bool,
    pub setup: bool,
    pub legacy: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            development: false,
            setup: true,
            legacy: false,
        }
    }
}

/// Options of upgrade and replace; they differ only in the teardown default
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeOptions {
    pub teardown: bool,
    pub setup: bool,
    pub legacy: bool,
}

impl UpgradeOptions {
    pub fn upgrade() -> Self {
        Self {
            teardown: false,
            setup: true,
            legacy: false,
        }
    }

    pub fn replace() -> Self {
        Self {
            teardown: true,
            ..Self::upgrade()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UninstallOptions {
    pub teardown: bool,
}

impl Default for UninstallOptions {
    fn default() -> Self {
        Self { teardown: true }
    }
}

/// Code plus the options sent alongside it
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceUpload {
    pub source: ServiceSource,
    pub configuration: BTreeMap<String, Value>,
    pub dependencies: BTreeMap<String, Value>,
}

impl ServiceUpload {
    pub fn new(source: ServiceSource) -> Self {
        Self {
            source,
            configuration: BTreeMap::new(),
            dependencies: BTreeMap::new(),
        }
    }

    pub fn with_configuration(mut self, values: BTreeMap<String, Value>) -> Self {
        self.configuration = values;
        self
    }

    pub fn with_dependencies(mut self, values: BTreeMap<String, Value>) -> Self {
        self.dependencies = values;
        self
    }

    /// Decode the JSON body of install/upgrade/replace
    pub fn from_body(body: UploadBody) -> Result<Self> {
        let bundle = BASE64
            .decode(body.bundle.as_bytes())
            .map_err(|e| Error::OptionsMalformed(format!("bundle is not valid base64: {}", e)))?;
        Ok(Self {
            source: ServiceSource::new(body.manifest, bundle),
            configuration: parse_option_map(&body.configuration)?,
            dependencies: parse_option_map(&body.dependencies)?,
        })
    }

    pub fn to_body(&self) -> UploadBody {
        UploadBody {
            manifest: self.source.manifest.clone(),
            bundle: BASE64.encode(&self.source.bundle),
            configuration: Value::Object(self.configuration.clone().into_iter().collect()),
            dependencies: Value::Object(self.dependencies.clone().into_iter().collect()),
        }
    }
}

/// Wire form of a [`ServiceUpload`]. Options may be objects or strings
/// holding JSON objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadBody {
    pub manifest: Manifest,
    /// Base64 bundle bytes
    pub bundle: String,
    #[serde(default)]
    pub configuration: Value,
    #[serde(default)]
    pub dependencies: Value,
}

/// Mutating operation, as executed on the leader or relayed to it
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Install {
        mount: String,
        upload: ServiceUpload,
        options: InstallOptions,
    },
    Upgrade {
        mount: String,
        upload: ServiceUpload,
        options: UpgradeOptions,
    },
    Replace {
        mount: String,
        upload: ServiceUpload,
        options: UpgradeOptions,
    },
    SetConfiguration {
        mount: String,
        values: BTreeMap<String, Value>,
        replace: bool,
    },
    SetDependencies {
        mount: String,
        values: BTreeMap<String, Value>,
        replace: bool,
    },
    Uninstall {
        mount: String,
        options: UninstallOptions,
    },
    SetDevelopmentMode {
        mount: String,
        enabled: bool,
    },
}

fn flag(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

impl WriteOp {
    pub fn mount(&self) -> &str {
        match self {
            WriteOp::Install { mount, .. }
            | WriteOp::Upgrade { mount, .. }
            | WriteOp::Replace { mount, .. }
            | WriteOp::SetConfiguration { mount, .. }
            | WriteOp::SetDependencies { mount, .. }
            | WriteOp::Uninstall { mount, .. }
            | WriteOp::SetDevelopmentMode { mount, .. } => mount,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WriteOp::Install { .. } => "install",
            WriteOp::Upgrade { .. } => "upgrade",
            WriteOp::Replace { .. } => "replace",
            WriteOp::SetConfiguration { .. } => "set_configuration",
            WriteOp::SetDependencies { .. } => "set_dependencies",
            WriteOp::Uninstall { .. } => "uninstall",
            WriteOp::SetDevelopmentMode { .. } => "set_development_mode",
        }
    }

    /// Applied on the receiving node and never relayed or replicated
    pub fn is_node_local(&self) -> bool {
        matches!(self, WriteOp::SetDevelopmentMode { .. })
    }

    /// The public API request that performs this operation
    pub fn to_peer_request(&self) -> Result<PeerRequest> {
        let mount = encode_query_value(self.mount());
        let request = match self {
            WriteOp::Install {
                upload, options, ..
            } => PeerRequest::post(format!(
                "/services?mount={}&development={}&setup={}&legacy={}",
                mount,
                flag(options.development),
                flag(options.setup),
                flag(options.legacy)
            ))
            .json(&upload.to_body())?,
            WriteOp::Upgrade {
                upload, options, ..
            }
            | WriteOp::Replace {
                upload, options, ..
            } => {
                let method = if matches!(self, WriteOp::Upgrade { .. }) {
                    Method::PATCH
                } else {
                    Method::PUT
                };
                PeerRequest::new(
                    method,
                    format!(
                        "/services/service?mount={}&teardown={}&setup={}&legacy={}",
                        mount,
                        flag(options.teardown),
                        flag(options.setup),
                        flag(options.legacy)
                    ),
                )
                .json(&upload.to_body())?
            }
            WriteOp::SetConfiguration { values, replace, .. }
            | WriteOp::SetDependencies { values, replace, .. } => {
                let method = if *replace { Method::PUT } else { Method::PATCH };
                let resource = if matches!(self, WriteOp::SetConfiguration { .. }) {
                    "configuration"
                } else {
                    "dependencies"
                };
                PeerRequest::new(method, format!("/services/{}?mount={}", resource, mount))
                    .json(values)?
            }
            WriteOp::Uninstall { options, .. } => PeerRequest::new(
                Method::DELETE,
                format!(
                    "/services/service?mount={}&teardown={}",
                    mount,
                    flag(options.teardown)
                ),
            ),
            WriteOp::SetDevelopmentMode { enabled, .. } => PeerRequest::new(
                if *enabled { Method::POST } else { Method::DELETE },
                format!("/services/development?mount={}", mount),
            ),
        };
        Ok(request)
    }

    /// Decode the leader's successful answer to this operation
    pub fn decode_response(&self, response: &PeerResponse) -> Result<WriteOutcome> {
        match self {
            WriteOp::Uninstall { .. } => Ok(WriteOutcome::Removed {
                mount: self.mount().to_string(),
            }),
            WriteOp::SetConfiguration { .. } | WriteOp::SetDependencies { .. } => {
                let body: OptionsResponse = response.json()?;
                Ok(WriteOutcome::Options(body))
            }
            _ => {
                let body: ServiceResponse = response.json()?;
                Ok(WriteOutcome::Service(body))
            }
        }
    }
}

/// A service descriptor plus any warnings its options produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    #[serde(flatten)]
    pub service: ServiceInfo,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ValidationWarning>,
}

/// Effective option values after a patch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionsResponse {
    pub values: BTreeMap<String, Value>,
    #[serde(default)]
    pub warnings: Vec<ValidationWarning>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Service(ServiceResponse),
    Options(OptionsResponse),
    Removed { mount: String },
}

#[derive(Clone)]
pub struct WriteGateway {
    registry: Arc<ServiceRegistry>,
    locks: Arc<MountLockTable>,
    runtime: Arc<dyn ServiceRuntime>,
    router: Arc<dyn RouterCache>,
    peers: Arc<PeerClient>,
    replicator: Arc<Replicator>,
    metrics: Arc<NodeMetrics>,
}

impl WriteGateway {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        locks: Arc<MountLockTable>,
        runtime: Arc<dyn ServiceRuntime>,
        router: Arc<dyn RouterCache>,
        peers: Arc<PeerClient>,
        replicator: Arc<Replicator>,
        metrics: Arc<NodeMetrics>,
    ) -> Self {
        Self {
            registry,
            locks,
            runtime,
            router,
            peers,
            replicator,
            metrics,
        }
    }

    /// Execute `op` given the role resolved for this request
    pub async fn execute(&self, role: &RoleSnapshot, op: WriteOp) -> Result<WriteOutcome> {
        validate_mount(op.mount())?;
        if !role.is_leader() && !op.is_node_local() {
            return self.forward(role, op).await;
        }

        let mount = op.mount().to_string();
        let name = op.name();
        let gateway = self.clone();
        let task = tokio::spawn(async move {
            let locks = gateway.locks.clone();
            let result = locks.with_lock(&mount, || gateway.apply(op)).await;
            if matches!(result, Ok(WriteOutcome::Removed { .. })) {
                locks.reclaim(&mount);
            }
            result
        });
        let result = task.await?;

        self.metrics.writes_total.inc();
        self.metrics
            .installed_services
            .set(self.registry.len() as u64);
        match &result {
            Ok(_) => tracing::info!("{} completed", name),
            Err(e) => {
                self.metrics.writes_failed.inc();
                tracing::warn!("{} failed: {}", name, e);
            }
        }
        result
    }

    async fn forward(&self, role: &RoleSnapshot, op: WriteOp) -> Result<WriteOutcome> {
        let leader = role
            .leader
            .as_deref()
            .ok_or_else(|| Error::LeaderUnavailable("no leader elected".into()))?;
        self.metrics.writes_forwarded.inc();
        tracing::debug!("Forwarding {} on {} to leader {}", op.name(), op.mount(), leader);

        let response = self.peers.forward(leader, op.to_peer_request()?).await?;
        if !response.is_success() {
            return Err(response.into_error());
        }
        op.decode_response(&response)
    }

    async fn apply(&self, op: WriteOp) -> Result<WriteOutcome> {
        match op {
            WriteOp::Install {
                mount,
                upload,
                options,
            } => self.install_locked(mount, upload, options).await,
            WriteOp::Upgrade {
                mount,
                upload,
                options,
            } => self.update_locked(mount, upload, options, false).await,
            WriteOp::Replace {
                mount,
                upload,
                options,
            } => self.update_locked(mount, upload, options, true).await,
            WriteOp::SetConfiguration {
                mount,
                values,
                replace,
            } => self.patch_locked(&mount, values, replace, true),
            WriteOp::SetDependencies {
                mount,
                values,
                replace,
            } => self.patch_locked(&mount, values, replace, false),
            WriteOp::Uninstall { mount, options } => self.uninstall_locked(mount, options).await,
            WriteOp::SetDevelopmentMode { mount, enabled } => {
                let mode = if enabled {
                    ServiceMode::Development
                } else {
                    ServiceMode::Production
                };
                // Node-local: applied here, never replicated
                let record = self.registry.set_mode(&mount, mode)?;
                Ok(service_outcome(&record, Vec::new()))
            }
        }
    }

    async fn install_locked(
        &self,
        mount: String,
        upload: ServiceUpload,
        options: InstallOptions,
    ) -> Result<WriteOutcome> {
        if self.registry.contains(&mount) {
            return Err(Error::MountConflict(mount));
        }
        let manifest = &upload.source.manifest;
        let configuration =
            patch_configuration(manifest, &BTreeMap::new(), &upload.configuration, true);
        let dependencies =
            patch_dependencies(manifest, &BTreeMap::new(), &upload.dependencies, true);
        let mut warnings = configuration.warnings;
        warnings.extend(dependencies.warnings);

        let now = timestamp_now();
        let record = ServiceRecord {
            mount: mount.clone(),
            checksum: upload.source.fingerprint(options.legacy)?,
            manifest: upload.source.manifest.clone(),
            bundle_ref: None,
            legacy: options.legacy,
            mode: if options.development {
                ServiceMode::Development
            } else {
                ServiceMode::Production
            },
            configuration: configuration.values,
            dependencies: dependencies.values,
            installed_at: now.clone(),
            updated_at: now,
        };
        let record = self.registry.write(record, Some(&upload.source.bundle))?;

        if options.setup {
            if let Err(e) = self.runtime.setup(&record).await {
                // Do not leave a service behind whose setup never ran
                self.registry.remove(&mount)?;
                return Err(e);
            }
        }

        self.router.rebuild();
        self.replicator.mark(&mount, PendingChange::Upsert);
        tracing::info!("Installed {} at {} ({})", record.manifest.name, mount, record.checksum);
        Ok(service_outcome(&record, warnings))
    }

    async fn update_locked(
        &self,
        mount: String,
        upload: ServiceUpload,
        options: UpgradeOptions,
        replace: bool,
    ) -> Result<WriteOutcome> {
        let existing = self.registry.require(&mount)?;
        if options.teardown {
            self.runtime.teardown(&existing).await?;
        }

        let manifest = &upload.source.manifest;
        let configuration = patch_configuration(
            manifest,
            &existing.configuration,
            &upload.configuration,
            replace,
        );
        let dependencies = patch_dependencies(
            manifest,
            &existing.dependencies,
            &upload.dependencies,
            replace,
        );
        let mut warnings = configuration.warnings;
        warnings.extend(dependencies.warnings);

        let record = ServiceRecord {
            checksum: upload.source.fingerprint(options.legacy)?,
            manifest: upload.source.manifest.clone(),
            legacy: options.legacy,
            configuration: configuration.values,
            dependencies: dependencies.values,
            updated_at: timestamp_now(),
            ..existing
        };
        let record = self.registry.write(record, Some(&upload.source.bundle))?;

        if options.setup {
            self.runtime.setup(&record).await?;
        }

        self.router.rebuild();
        self.replicator.mark(&mount, PendingChange::Upsert);
        tracing::info!(
            "{} {} to {} ({})",
            if replace { "Replaced" } else { "Upgraded" },
            mount,
            record.manifest.version,
            record.checksum
        );
        Ok(service_outcome(&record, warnings))
    }

    fn patch_locked(
        &self,
        mount: &str,
        values: BTreeMap<String, Value>,
        replace: bool,
        configuration: bool,
    ) -> Result<WriteOutcome> {
        let mut record = self.registry.require(mount)?;
        let patched = if configuration {
            patch_configuration(&record.manifest, &record.configuration, &values, replace)
        } else {
            patch_dependencies(&record.manifest, &record.dependencies, &values, replace)
        };
        if configuration {
            record.configuration = patched.values;
        } else {
            record.dependencies = patched.values;
        }
        record.updated_at = timestamp_now();
        let record = self.registry.write(record, None)?;
        self.replicator.mark(mount, PendingChange::Upsert);

        let values = if configuration {
            record.effective_configuration()
        } else {
            record.dependencies.clone()
        };
        Ok(WriteOutcome::Options(OptionsResponse {
            values,
            warnings: patched.warnings,
        }))
    }

    async fn uninstall_locked(
        &self,
        mount: String,
        options: UninstallOptions,
    ) -> Result<WriteOutcome> {
        let existing = self.registry.require(&mount)?;
        if options.teardown {
            self.runtime.teardown(&existing).await?;
        }
        self.registry.remove(&mount)?;
        self.router.rebuild();
        self.replicator.mark(&mount, PendingChange::Remove);
        tracing::info!("Uninstalled {}", mount);
        Ok(WriteOutcome::Removed { mount })
    }

    // Convenience entry points for library callers

    pub async fn install(
        &self,
        role: &RoleSnapshot,
        mount: &str,
        upload: ServiceUpload,
        options: InstallOptions,
    ) -> Result<WriteOutcome> {
        let op = WriteOp::Install {
            mount: mount.to_string(),
            upload,
            options,
        };
        self.execute(role, op).await
    }

    pub async fn upgrade(
        &self,
        role: &RoleSnapshot,
        mount: &str,
        upload: ServiceUpload,
        options: UpgradeOptions,
    ) -> Result<WriteOutcome> {
        let op = WriteOp::Upgrade {
            mount: mount.to_string(),
            upload,
            options,
        };
        self.execute(role, op).await
    }

    pub async fn replace(
        &self,
        role: &RoleSnapshot,
        mount: &str,
        upload: ServiceUpload,
        options: UpgradeOptions,
    ) -> Result<WriteOutcome> {
        let op = WriteOp::Replace {
            mount: mount.to_string(),
            upload,
            options,
        };
        self.execute(role, op).await
    }

    pub async fn set_configuration(
        &self,
        role: &RoleSnapshot,
        mount: &str,
        values: BTreeMap<String, Value>,
        replace: bool,
    ) -> Result<WriteOutcome> {
        let op = WriteOp::SetConfiguration {
            mount: mount.to_string(),
            values,
            replace,
        };
        self.execute(role, op).await
    }

    pub async fn set_dependencies(
        &self,
        role: &RoleSnapshot,
        mount: &str,
        values: BTreeMap<String, Value>,
        replace: bool,
    ) -> Result<WriteOutcome> {
        let op = WriteOp::SetDependencies {
            mount: mount.to_string(),
            values,
            replace,
        };
        self.execute(role, op).await
    }

    pub async fn uninstall(
        &self,
        role: &RoleSnapshot,
        mount: &str,
        options: UninstallOptions,
    ) -> Result<WriteOutcome> {
        let op = WriteOp::Uninstall {
            mount: mount.to_string(),
            options,
        };
        self.execute(role, op).await
    }

    pub async fn set_development_mode(
        &self,
        role: &RoleSnapshot,
        mount: &str,
        enabled: bool,
    ) -> Result<WriteOutcome> {
        let op = WriteOp::SetDevelopmentMode {
            mount: mount.to_string(),
            enabled,
        };
        self.execute(role, op).await
    }
}

fn service_outcome(record: &ServiceRecord, warnings: Vec<ValidationWarning>) -> WriteOutcome {
    WriteOutcome::Service(ServiceResponse {
        service: record.info(),
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upload() -> ServiceUpload {
        ServiceUpload::new(ServiceSource::new(Manifest::new("app", "1.0.0"), &b"zip"[..]))
            .with_configuration(BTreeMap::from([("a".to_string(), json!(1))]))
    }

    #[test]
    fn test_install_request_shape() {
        let op = WriteOp::Install {
            mount: "/my app".into(),
            upload: upload(),
            options: InstallOptions {
                development: true,
                ..Default::default()
            },
        };
        let request = op.to_peer_request().unwrap();
        assert_eq!(request.method, Method::POST);
        assert_eq!(
            request.path_and_query,
            "/services?mount=%2Fmy%20app&development=true&setup=true&legacy=false"
        );
        let body: UploadBody = serde_json::from_slice(&request.body).unwrap();
        let decoded = ServiceUpload::from_body(body).unwrap();
        assert_eq!(decoded, upload());
    }

    #[test]
    fn test_patch_and_mode_requests() {
        let merge = WriteOp::SetConfiguration {
            mount: "/a".into(),
            values: BTreeMap::new(),
            replace: false,
        };
        assert_eq!(merge.to_peer_request().unwrap().method, Method::PATCH);

        let replace = WriteOp::SetDependencies {
            mount: "/a".into(),
            values: BTreeMap::new(),
            replace: true,
        };
        let request = replace.to_peer_request().unwrap();
        assert_eq!(request.method, Method::PUT);
        assert_eq!(request.path_and_query, "/services/dependencies?mount=%2Fa");

        let disable = WriteOp::SetDevelopmentMode {
            mount: "/a".into(),
            enabled: false,
        };
        assert_eq!(disable.to_peer_request().unwrap().method, Method::DELETE);
    }

    #[test]
    fn test_upload_body_accepts_string_options() {
        let body: UploadBody = serde_json::from_value(json!({
            "manifest": {"name": "app", "version": "1.0.0"},
            "bundle": BASE64.encode(b"zip"),
            "configuration": "{\"a\": 1}",
        }))
        .unwrap();
        let upload = ServiceUpload::from_body(body).unwrap();
        assert_eq!(upload.configuration["a"], json!(1));
        assert!(upload.dependencies.is_empty());

        let broken: UploadBody = serde_json::from_value(json!({
            "manifest": {"name": "app", "version": "1.0.0"},
            "bundle": BASE64.encode(b"zip"),
            "dependencies": "{oops",
        }))
        .unwrap();
        assert!(matches!(
            ServiceUpload::from_body(broken),
            Err(Error::OptionsMalformed(_))
        ));
    }

    #[test]
    fn test_option_defaults() {
        assert!(!UpgradeOptions::upgrade().teardown);
        assert!(UpgradeOptions::replace().teardown);
        assert!(UninstallOptions::default().teardown);
        assert!(InstallOptions::default().setup);
    }
}
