//! In-process cluster for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use minisvc::cluster::{InProcessTransport, PeerRequest, PeerResponse, PeerTransport};
use minisvc::common::{encode_query_value, Config, PeerConfig};
use minisvc::services::{
    ConfigDefinition, ConfigType, DependencyDefinition, Manifest, MemoryBackend, NoopRuntime,
    ServiceRecord, ServiceRuntime, ServiceSource, ServiceUpload, TestReport,
};
use minisvc::Node;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const LEADER: &str = "node-1";

pub fn node_config(id: &str, size: usize, leader: Option<&str>) -> Config {
    Config {
        node_id: id.to_string(),
        peers: (1..=size)
            .map(|i| PeerConfig {
                id: format!("node-{}", i),
                url: format!("http://node-{}", i),
            })
            .collect(),
        leader: leader.map(String::from),
        // Tests flush replication explicitly
        replicate_on_write: false,
        ..Config::default()
    }
}

pub struct TestCluster {
    pub transport: Arc<InProcessTransport>,
    pub nodes: Vec<Arc<Node>>,
}

impl TestCluster {
    /// `size` nodes, node-1 leading
    pub fn start(size: usize) -> Self {
        Self::build(size, Some(LEADER), Duration::from_secs(5), Arc::new(NoopRuntime))
    }

    pub fn build(
        size: usize,
        leader: Option<&str>,
        peer_timeout: Duration,
        runtime: Arc<dyn ServiceRuntime>,
    ) -> Self {
        Self::assemble(size, leader, peer_timeout, runtime, |_| {})
    }

    /// node-1 leading, every config passed through `configure` first
    pub fn configured(size: usize, configure: impl Fn(&mut Config)) -> Self {
        Self::assemble(
            size,
            Some(LEADER),
            Duration::from_secs(5),
            Arc::new(NoopRuntime),
            configure,
        )
    }

    fn assemble(
        size: usize,
        leader: Option<&str>,
        peer_timeout: Duration,
        runtime: Arc<dyn ServiceRuntime>,
        configure: impl Fn(&mut Config),
    ) -> Self {
        let transport = Arc::new(InProcessTransport::new(peer_timeout));
        let nodes: Vec<Arc<Node>> = (1..=size)
            .map(|i| {
                let mut config = node_config(&format!("node-{}", i), size, leader);
                configure(&mut config);
                Node::with_parts(
                    config,
                    transport.clone(),
                    Arc::new(MemoryBackend::new()),
                    runtime.clone(),
                )
                .unwrap()
            })
            .collect();
        for node in &nodes {
            transport.register(node.node_id(), node.router());
        }
        Self { transport, nodes }
    }

    pub fn leader(&self) -> &Arc<Node> {
        &self.nodes[0]
    }

    /// node-N, 1-based like the ids
    pub fn node(&self, n: usize) -> &Arc<Node> {
        &self.nodes[n - 1]
    }

    pub async fn send(&self, node: &str, request: PeerRequest) -> PeerResponse {
        self.transport.send(node, request).await.unwrap()
    }
}

pub fn mount_query(mount: &str) -> String {
    format!("mount={}", encode_query_value(mount))
}

/// Manifest with integer options `a` and `b` and one dependency `db`
pub fn manifest(version: &str) -> Manifest {
    let mut manifest = Manifest::new("app", version);
    for key in ["a", "b"] {
        manifest.configuration.insert(
            key.to_string(),
            ConfigDefinition {
                kind: ConfigType::Integer,
                ..Default::default()
            },
        );
    }
    manifest
        .dependencies
        .insert("db".to_string(), DependencyDefinition::default());
    manifest
        .scripts
        .insert("migrate".to_string(), "Run migrations".to_string());
    manifest.readme = Some(format!("app {}", version));
    manifest
}

pub fn upload(version: &str, bundle: &[u8]) -> ServiceUpload {
    ServiceUpload::new(ServiceSource::new(manifest(version), bundle.to_vec()))
}

pub fn values(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Runtime whose setup takes a while and can be told to fail
#[derive(Default)]
pub struct SlowRuntime {
    pub setup_delay: Duration,
    pub fail_setup: bool,
    pub setups: AtomicUsize,
    pub teardowns: AtomicUsize,
}

impl SlowRuntime {
    pub fn delayed(delay: Duration) -> Self {
        Self {
            setup_delay: delay,
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_setup: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ServiceRuntime for SlowRuntime {
    async fn setup(&self, record: &ServiceRecord) -> minisvc::Result<()> {
        tokio::time::sleep(self.setup_delay).await;
        self.setups.fetch_add(1, Ordering::SeqCst);
        if self.fail_setup {
            return Err(minisvc::Error::Internal(format!(
                "setup of {} failed",
                record.mount
            )));
        }
        Ok(())
    }

    async fn teardown(&self, _record: &ServiceRecord) -> minisvc::Result<()> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn list_scripts(&self, record: &ServiceRecord) -> Vec<minisvc::services::runtime::ScriptInfo> {
        NoopRuntime.list_scripts(record)
    }

    async fn run_script(
        &self,
        record: &ServiceRecord,
        script: &str,
        args: Value,
    ) -> minisvc::Result<Value> {
        NoopRuntime.run_script(record, script, args).await
    }

    async fn run_tests(
        &self,
        record: &ServiceRecord,
        grep: Option<&str>,
    ) -> minisvc::Result<TestReport> {
        NoopRuntime.run_tests(record, grep).await
    }
}
