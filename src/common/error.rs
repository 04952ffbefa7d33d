//! Error types for minisvc

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Mount Errors ===
    #[error("Service already installed at mount path \"{0}\"")]
    MountConflict(String),

    #[error("No service installed at mount path \"{0}\"")]
    MountNotFound(String),

    #[error("Invalid mount path \"{mount}\": {reason}")]
    InvalidMount { mount: String, reason: String },

    #[error("Service options malformed: {0}")]
    OptionsMalformed(String),

    // === Bundle Errors ===
    #[error("No matching bundle available for \"{0}\"")]
    StaleReference(String),

    #[error("Bundle not available for \"{0}\"")]
    BundleUnavailable(String),

    #[error("Checksum mismatch for \"{mount}\": expected {expected}, got {actual}")]
    ChecksumMismatch {
        mount: String,
        expected: String,
        actual: String,
    },

    // === Runtime Errors ===
    #[error("Script \"{script}\" not declared by service at \"{mount}\"")]
    ScriptNotFound { mount: String, script: String },

    // === Cluster Errors ===
    #[error("Leader unavailable: {0}")]
    LeaderUnavailable(String),

    #[error("Peer {0} timed out")]
    PeerTimeout(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Peer responded {status}: {message}")]
    Remote { status: u16, message: String },

    // === Storage Errors ===
    #[error("Storage error: {0}")]
    Storage(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a peer-communication failure worth retrying later?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PeerTimeout(_)
                | Error::LeaderUnavailable(_)
                | Error::Http(_)
                | Error::StaleReference(_)
        )
    }

    /// Stable machine-readable name, used in error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::MountConflict(_) => "mount_conflict",
            Error::MountNotFound(_) => "mount_not_found",
            Error::InvalidMount { .. } => "invalid_mount",
            Error::OptionsMalformed(_) => "options_malformed",
            Error::StaleReference(_) => "stale_reference",
            Error::BundleUnavailable(_) => "bundle_unavailable",
            Error::ChecksumMismatch { .. } => "checksum_mismatch",
            Error::ScriptNotFound { .. } => "script_not_found",
            Error::LeaderUnavailable(_) => "leader_unavailable",
            Error::PeerTimeout(_) => "peer_timeout",
            Error::Http(_) => "http",
            Error::Remote { .. } => "remote",
            Error::Storage(_) => "storage",
            Error::InvalidConfig(_) => "invalid_config",
            Error::Internal(_) => "internal",
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> StatusCode {
        match self {
            Error::MountConflict(_) => StatusCode::CONFLICT,
            Error::MountNotFound(_)
            | Error::StaleReference(_)
            | Error::BundleUnavailable(_)
            | Error::ScriptNotFound { .. } => StatusCode::NOT_FOUND,
            Error::InvalidMount { .. } | Error::OptionsMalformed(_) | Error::InvalidConfig(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::LeaderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::PeerTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::ChecksumMismatch { .. } | Error::Http(_) => StatusCode::BAD_GATEWAY,
            Error::Remote { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Rebuild a typed error from a peer's JSON error body.
    ///
    /// Kinds that carry a single mount or message round-trip exactly; anything
    /// else is kept as [`Error::Remote`] with the original status.
    pub fn from_remote(status: u16, body: &[u8]) -> Self {
        let parsed: Option<serde_json::Value> = serde_json::from_slice(body).ok();
        let message = parsed
            .as_ref()
            .and_then(|v| v.get("error"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());
        let detail = parsed
            .as_ref()
            .and_then(|v| v.get("detail"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let kind = parsed
            .as_ref()
            .and_then(|v| v.get("kind"))
            .and_then(|v| v.as_str())
            .unwrap_or("");

        match (kind, detail) {
            ("mount_conflict", Some(mount)) => Error::MountConflict(mount),
            ("mount_not_found", Some(mount)) => Error::MountNotFound(mount),
            ("stale_reference", Some(mount)) => Error::StaleReference(mount),
            ("bundle_unavailable", Some(mount)) => Error::BundleUnavailable(mount),
            ("options_malformed", Some(detail)) => Error::OptionsMalformed(detail),
            ("leader_unavailable", Some(detail)) => Error::LeaderUnavailable(detail),
            ("peer_timeout", Some(peer)) => Error::PeerTimeout(peer),
            _ => Error::Remote { status, message },
        }
    }

    /// The single value a peer needs to rebuild this error with `from_remote`
    fn detail(&self) -> Option<String> {
        match self {
            Error::MountConflict(s)
            | Error::MountNotFound(s)
            | Error::StaleReference(s)
            | Error::BundleUnavailable(s)
            | Error::OptionsMalformed(s)
            | Error::LeaderUnavailable(s)
            | Error::PeerTimeout(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        let body = json!({
            "error": self.to_string(),
            "kind": self.kind(),
            "detail": self.detail(),
        });
        (status, axum::Json(body)).into_response()
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::OptionsMalformed(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("task failed: {}", e))
    }
}

#[cfg(feature = "rocksdb")]
impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Internal(e.to_string())
    }
}
