//! Common utilities and types shared across minisvc

pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod tracing_middleware;
pub mod utils;

pub use config::{Config, InternalServiceConfig, PeerConfig};
pub use error::{Error, Result};
pub use hash::{blake3_hash, etag_matches, quote_etag, Blake3Hasher};
pub use metrics::NodeMetrics;
pub use utils::{
    bundle_filename, encode_query_value, is_internal_mount, parse_flag, parse_query_pairs,
    timestamp_now, validate_mount,
};
