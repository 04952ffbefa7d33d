//! Service records and manifests
//!
//! A [`ServiceRecord`] is the node-local view of one mounted service. The
//! leader's records are authoritative; followers hold applied copies.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::common::{Blake3Hasher, Error, Result};

/// Suffix mixed into the fingerprint of services installed in legacy mode
const LEGACY_MARKER: &[u8] = b"\0legacy";

/// Service manifest. Only identity and the option definitions matter here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub provides: BTreeMap<String, String>,
    #[serde(default)]
    pub configuration: BTreeMap<String, ConfigDefinition>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, DependencyDefinition>,
    /// Script name -> human readable title
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readme: Option<String>,
}

impl Manifest {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            provides: BTreeMap::new(),
            configuration: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            scripts: BTreeMap::new(),
            readme: None,
        }
    }

    /// Canonical encoding: field order is fixed and maps are ordered
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Internal(format!("manifest encode: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    #[default]
    String,
    Integer,
    Number,
    Boolean,
    Json,
}

impl ConfigType {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ConfigType::String => value.is_string(),
            ConfigType::Integer => value.is_i64() || value.is_u64(),
            ConfigType::Number => value.is_number(),
            ConfigType::Boolean => value.is_boolean(),
            ConfigType::Json => true,
        }
    }
}

impl std::fmt::Display for ConfigType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigType::String => write!(f, "string"),
            ConfigType::Integer => write!(f, "integer"),
            ConfigType::Number => write!(f, "number"),
            ConfigType::Boolean => write!(f, "boolean"),
            ConfigType::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigDefinition {
    #[serde(rename = "type", default)]
    pub kind: ConfigType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyDefinition {
    #[serde(default = "any_version")]
    pub version: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn any_version() -> String {
    "*".to_string()
}
fn default_required() -> bool {
    true
}

impl Default for DependencyDefinition {
    fn default() -> Self {
        Self {
            version: any_version(),
            required: default_required(),
            description: None,
        }
    }
}

/// Local execution mode. Never replicated between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    #[default]
    Production,
    Development,
}

impl ServiceMode {
    pub fn is_development(&self) -> bool {
        matches!(self, ServiceMode::Development)
    }
}

/// Code and manifest handed to install/upgrade/replace
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSource {
    pub manifest: Manifest,
    pub bundle: Bytes,
}

impl ServiceSource {
    pub fn new(manifest: Manifest, bundle: impl Into<Bytes>) -> Self {
        Self {
            manifest,
            bundle: bundle.into(),
        }
    }

    /// Content fingerprint: manifest, bundle bytes and the legacy flag
    pub fn fingerprint(&self, legacy: bool) -> Result<String> {
        fingerprint(&self.manifest, &self.bundle, legacy)
    }
}

/// BLAKE3 over the canonical manifest, a separator, the bundle bytes, and a
/// marker when installed in legacy mode.
pub fn fingerprint(manifest: &Manifest, bundle: &[u8], legacy: bool) -> Result<String> {
    let mut hasher = Blake3Hasher::new();
    hasher.update(&manifest.canonical_bytes()?);
    hasher.update(&[0]);
    hasher.update(bundle);
    if legacy {
        hasher.update(LEGACY_MARKER);
    }
    Ok(hasher.finalize())
}

/// Where the bundle bytes of a record live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRef {
    /// BLAKE3 of the raw bundle bytes
    pub digest: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub mount: String,
    pub manifest: Manifest,
    /// `None` for internal mounts whose bundle is materialized on demand
    pub bundle_ref: Option<BundleRef>,
    pub checksum: String,
    #[serde(default)]
    pub legacy: bool,
    #[serde(default)]
    pub mode: ServiceMode,
    #[serde(default)]
    pub configuration: BTreeMap<String, Value>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, Value>,
    pub installed_at: String,
    pub updated_at: String,
}

impl ServiceRecord {
    /// Stored configuration with manifest defaults filled in
    pub fn effective_configuration(&self) -> BTreeMap<String, Value> {
        let mut values: BTreeMap<String, Value> = self
            .manifest
            .configuration
            .iter()
            .filter_map(|(key, def)| def.default.clone().map(|v| (key.clone(), v)))
            .collect();
        values.extend(self.configuration.clone());
        values
    }

    /// Configuration definitions annotated with their current value
    pub fn configuration_details(&self) -> BTreeMap<String, Value> {
        let effective = self.effective_configuration();
        self.manifest
            .configuration
            .iter()
            .map(|(key, def)| {
                let mut entry = serde_json::to_value(def).unwrap_or(Value::Null);
                if let (Value::Object(map), Some(current)) = (&mut entry, effective.get(key)) {
                    map.insert("current".to_string(), current.clone());
                }
                (key.clone(), entry)
            })
            .collect()
    }

    /// Dependency definitions annotated with their current mount
    pub fn dependency_details(&self) -> BTreeMap<String, Value> {
        self.manifest
            .dependencies
            .iter()
            .map(|(name, def)| {
                let mut entry = serde_json::to_value(def).unwrap_or(Value::Null);
                if let (Value::Object(map), Some(current)) = (&mut entry, self.dependencies.get(name)) {
                    map.insert("current".to_string(), current.clone());
                }
                (name.clone(), entry)
            })
            .collect()
    }

    /// True when everything a follower replicates matches `info`
    pub fn matches_replica(&self, info: &ServiceInfo) -> bool {
        self.checksum == info.checksum
            && self.legacy == info.legacy
            && self.manifest == info.manifest
            && self.configuration == info.options.configuration
            && self.dependencies == info.options.dependencies
    }

    pub fn summary(&self) -> ServiceSummary {
        ServiceSummary {
            mount: self.mount.clone(),
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            provides: self.manifest.provides.clone(),
            development: self.mode.is_development(),
            legacy: self.legacy,
        }
    }

    pub fn info(&self) -> ServiceInfo {
        ServiceInfo {
            mount: self.mount.clone(),
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            development: self.mode.is_development(),
            legacy: self.legacy,
            manifest: self.manifest.clone(),
            checksum: self.checksum.clone(),
            options: ServiceOptions {
                configuration: self.configuration.clone(),
                dependencies: self.dependencies.clone(),
            },
        }
    }
}

/// List entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub mount: String,
    pub name: String,
    pub version: String,
    pub provides: BTreeMap<String, String>,
    pub development: bool,
    pub legacy: bool,
}

/// Full description, also the descriptor followers replicate from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub mount: String,
    pub name: String,
    pub version: String,
    pub development: bool,
    pub legacy: bool,
    pub manifest: Manifest,
    pub checksum: String,
    pub options: ServiceOptions,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServiceOptions {
    #[serde(default)]
    pub configuration: BTreeMap<String, Value>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, Value>,
}
