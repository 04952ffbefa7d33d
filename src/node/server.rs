//! Node server: wires the components of one process and runs them

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::cluster::{
    ClusterRole, HealCoordinator, HttpTransport, Membership, MountLockTable, PeerClient,
    PeerTransport, PendingChange, ReadinessLatch, Replicator, RoleResolver,
};
use crate::common::{Config, Error, NodeMetrics, Result};
use crate::node::http::create_router;
use crate::services::{
    LocalInstaller, Manifest, MemoryBackend, NoopRuntime, RouterCache, RoutingTable, ServiceRegistry,
    ServiceRuntime, StateBackend, WriteGateway,
};

pub struct Node {
    pub config: Config,
    pub role: Arc<ClusterRole>,
    pub membership: Arc<Membership>,
    pub registry: Arc<ServiceRegistry>,
    pub locks: Arc<MountLockTable>,
    pub routes: Arc<RoutingTable>,
    pub runtime: Arc<dyn ServiceRuntime>,
    pub peers: Arc<PeerClient>,
    pub installer: Arc<LocalInstaller>,
    pub gateway: WriteGateway,
    pub heal: Arc<HealCoordinator>,
    pub readiness: Arc<ReadinessLatch>,
    pub replicator: Arc<Replicator>,
    pub metrics: Arc<NodeMetrics>,
}

fn open_backend(config: &Config) -> Result<Arc<dyn StateBackend>> {
    match &config.data_dir {
        None => Ok(Arc::new(MemoryBackend::new())),
        #[cfg(feature = "rocksdb")]
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            Ok(Arc::new(crate::services::RocksBackend::open(dir.join("state"))?))
        }
        #[cfg(not(feature = "rocksdb"))]
        Some(dir) => Err(Error::InvalidConfig(format!(
            "data_dir {} needs the rocksdb feature",
            dir.display()
        ))),
    }
}

/// Register configured internal services the leader does not have yet.
/// Followers receive them through replication.
fn seed_internal_services(
    config: &Config,
    registry: &ServiceRegistry,
    replicator: &Replicator,
) -> Result<()> {
    for service in &config.internal_services {
        if registry.contains(&service.mount) {
            continue;
        }
        let manifest = Manifest::new(service.name.as_str(), service.version.as_str());
        let record = registry.seed_internal(&service.mount, manifest)?;
        replicator.mark(&record.mount, PendingChange::Upsert);
        tracing::info!("Seeded internal service {} ({})", record.mount, record.checksum);
    }
    Ok(())
}

impl Node {
    /// Build a node that talks to its peers over HTTP
    pub fn from_config(config: Config) -> Result<Arc<Self>> {
        let membership = Arc::new(Membership::from_config(&config));
        let transport = Arc::new(HttpTransport::new(
            membership.clone(),
            config.peer_timeout(),
        )?);
        let backend = open_backend(&config)?;
        Self::with_parts(config, transport, backend, Arc::new(NoopRuntime))
    }

    /// Build a node from explicit collaborators
    pub fn with_parts(
        config: Config,
        transport: Arc<dyn PeerTransport>,
        backend: Arc<dyn StateBackend>,
        runtime: Arc<dyn ServiceRuntime>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let role = Arc::new(ClusterRole::new(config.node_id.clone()));
        if let Some(leader) = &config.leader {
            role.follow(1, leader.clone());
        }
        let resolver: Arc<dyn RoleResolver> = role.clone();

        let metrics = Arc::new(NodeMetrics::new());
        let membership = Arc::new(Membership::from_config(&config));
        let registry = Arc::new(ServiceRegistry::open(backend)?);
        let locks = Arc::new(MountLockTable::new());
        let routes = Arc::new(RoutingTable::new(registry.clone()));
        let router: Arc<dyn RouterCache> = routes.clone();
        let peers = Arc::new(PeerClient::new(config.node_id.clone(), transport));

        let installer = Arc::new(LocalInstaller::new(
            config.node_id.clone(),
            registry.clone(),
            locks.clone(),
            peers.clone(),
            router.clone(),
            metrics.clone(),
        ));
        let replicator = Arc::new(Replicator::new(
            peers.clone(),
            membership.clone(),
            resolver.clone(),
            metrics.clone(),
            config.replicate_on_write,
        ));
        let gateway = WriteGateway::new(
            registry.clone(),
            locks.clone(),
            runtime.clone(),
            router,
            peers.clone(),
            replicator.clone(),
            metrics.clone(),
        );
        let heal = Arc::new(HealCoordinator::new(
            registry.clone(),
            peers.clone(),
            membership.clone(),
            resolver,
            metrics.clone(),
        ));

        let readiness = Arc::new(ReadinessLatch::new());
        if role.is_leader() {
            seed_internal_services(&config, &registry, &replicator)?;
            routes.rebuild();
            readiness.latch();
        }
        metrics.installed_services.set(registry.len() as u64);

        Ok(Arc::new(Self {
            config,
            role,
            membership,
            registry,
            locks,
            routes,
            runtime,
            peers,
            installer,
            gateway,
            heal,
            readiness,
            replicator,
            metrics,
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn router(self: &Arc<Self>) -> axum::Router {
        create_router(self.clone())
    }

    /// Mirror the leader once. The leader itself only latches.
    pub async fn initial_sync(&self) -> Result<()> {
        let role = self.role.resolve();
        if role.is_leader() {
            self.readiness.latch();
            return Ok(());
        }
        let leader = role
            .leader
            .ok_or_else(|| Error::LeaderUnavailable("no leader elected".into()))?;

        let report = self.installer.sync_from(&leader).await?;
        if report.failures() > 0 {
            return Err(Error::Internal(format!(
                "{} mounts failed to sync from {}",
                report.failures(),
                leader
            )));
        }
        if self.readiness.latch() {
            tracing::info!(
                "Node {} synced {} services from {} ({} removed)",
                self.node_id(),
                report.applied.len(),
                leader,
                report.removed.len()
            );
        }
        Ok(())
    }

    /// Retry the initial sync until it succeeds or the node is ready by
    /// other means
    async fn sync_until_ready(self: Arc<Self>) {
        let retry = self.config.replication_interval().max(Duration::from_millis(100));
        while !self.readiness.is_ready() {
            match self.initial_sync().await {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!("Initial sync failed, retrying in {:?}: {}", retry, e);
                    tokio::time::sleep(retry).await;
                }
            }
        }
    }

    /// Spawn initial sync, replication and periodic heal
    pub fn start_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = vec![tokio::spawn(self.clone().sync_until_ready())];
        handles.push(tokio::spawn(
            self.replicator
                .clone()
                .run(self.config.replication_interval()),
        ));
        if let Some(interval) = self.config.heal_interval() {
            handles.push(tokio::spawn(self.heal.clone().run(interval)));
        }
        handles
    }

    pub async fn serve(self: Arc<Self>) -> Result<()> {
        tracing::info!("Starting node: {}", self.node_id());
        tracing::info!("  HTTP API: {}", self.config.bind_addr);
        tracing::info!("  Peers: {}", self.membership.others().join(", "));
        match &self.config.data_dir {
            Some(dir) => tracing::info!("  State: {}", dir.display()),
            None => tracing::info!("  State: in-memory"),
        }

        let background = self.start_background();
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        let http_server = axum::serve(listener, self.router());

        tracing::info!("✓ Node ready ({})", self.role.resolve().role());

        tokio::select! {
            res = http_server => {
                if let Err(e) = res {
                    tracing::error!("HTTP server error: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down node {}", self.node_id());
            }
        }

        for handle in background {
            handle.abort();
        }
        Ok(())
    }
}
