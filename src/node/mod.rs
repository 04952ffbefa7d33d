//! A minisvc node: component wiring and the HTTP API

pub mod http;
pub mod server;

pub use server::Node;
