//! Configuration and dependency patches
//!
//! Patches never fail as a whole: keys the manifest does not declare, and
//! values of the wrong shape, are dropped and reported as warnings.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::common::{Error, Result};
use crate::services::record::Manifest;

/// Non-fatal per-key problem reported next to a successful patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub key: String,
    pub message: String,
}

impl ValidationWarning {
    fn new(key: &str, message: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Result of applying a patch
#[derive(Debug, Clone, PartialEq)]
pub struct Patched {
    pub values: BTreeMap<String, Value>,
    pub warnings: Vec<ValidationWarning>,
}

/// Accept either a JSON object or a string holding one, as uploads send
/// options as form fields.
pub fn parse_option_map(raw: &Value) -> Result<BTreeMap<String, Value>> {
    let parsed;
    let value = match raw {
        Value::String(text) => {
            parsed = serde_json::from_str::<Value>(text)
                .map_err(|e| Error::OptionsMalformed(format!("Details: {}", e)))?;
            &parsed
        }
        other => other,
    };
    match value {
        Value::Object(map) => Ok(map.clone().into_iter().collect()),
        Value::Null => Ok(BTreeMap::new()),
        other => Err(Error::OptionsMalformed(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

/// Merge or replace configuration values against the manifest definitions.
///
/// In merge mode `null` removes a key so its default applies again.
pub fn patch_configuration(
    manifest: &Manifest,
    existing: &BTreeMap<String, Value>,
    values: &BTreeMap<String, Value>,
    replace: bool,
) -> Patched {
    let mut result = if replace {
        BTreeMap::new()
    } else {
        existing.clone()
    };
    let mut warnings = Vec::new();

    for (key, value) in values {
        let Some(def) = manifest.configuration.get(key) else {
            warnings.push(ValidationWarning::new(key, "Unknown configuration option"));
            continue;
        };
        if value.is_null() {
            result.remove(key);
            continue;
        }
        if !def.kind.accepts(value) {
            warnings.push(ValidationWarning::new(
                key,
                format!("Expected a value of type {}", def.kind),
            ));
            continue;
        }
        result.insert(key.clone(), value.clone());
    }

    // Keys carried over from an older manifest that no longer declares them
    result.retain(|key, _| manifest.configuration.contains_key(key));

    Patched {
        values: result,
        warnings,
    }
}

/// Merge or replace dependency assignments. Values are mount paths.
pub fn patch_dependencies(
    manifest: &Manifest,
    existing: &BTreeMap<String, Value>,
    values: &BTreeMap<String, Value>,
    replace: bool,
) -> Patched {
    let mut result = if replace {
        BTreeMap::new()
    } else {
        existing.clone()
    };
    let mut warnings = Vec::new();

    for (name, value) in values {
        if !manifest.dependencies.contains_key(name) {
            warnings.push(ValidationWarning::new(name, "Unknown dependency"));
            continue;
        }
        match value {
            Value::Null => {
                result.remove(name);
            }
            Value::String(mount) if crate::common::validate_mount(mount).is_ok() => {
                result.insert(name.clone(), value.clone());
            }
            _ => warnings.push(ValidationWarning::new(
                name,
                "Expected the mount path of an installed service",
            )),
        }
    }

    result.retain(|name, _| manifest.dependencies.contains_key(name));

    Patched {
        values: result,
        warnings,
    }
}
