//! # minisvc
//!
//! Cluster-wide manager for service mounts:
//! - One leader executes every write; followers relay to it
//! - Per-mount locking, never a cluster-wide lock
//! - Content fingerprints (BLAKE3) decide what a follower must pull
//! - Heal compares checksums and repairs stale followers
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!              writes                    relay
//!   client ───────────► follower ─────────────────┐
//!                                                 ▼
//!   client ───────────────────────────────────► leader
//!                                                 │ POST /_local
//!                       ┌─────────────────────────┼───────────────┐
//!                       ▼                         ▼               ▼
//!                  follower A                follower B      follower C
//!             (pulls bundle + record from the leader, verifies checksum)
//! ```
//!
//! ## Usage
//!
//! ### Start a node
//! ```bash
//! minisvc-node serve \
//!   --id node-1 \
//!   --bind 0.0.0.0:7000 \
//!   --peer node-2=http://10.0.0.2:7000 \
//!   --leader node-1
//! ```
//!
//! ### Use the CLI
//! ```bash
//! minisvc install /app --manifest ./manifest.json --bundle ./app.zip
//! minisvc list
//! minisvc heal
//! minisvc uninstall /app
//! ```

pub mod cluster;
pub mod common;
pub mod node;
pub mod services;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use node::Node;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
