//! Typed calls over the internal channel

use axum::http::{header, Method, StatusCode};
use bytes::Bytes;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cluster::role::NodeId;
use crate::cluster::transport::{PeerRequest, PeerResponse, PeerTransport, FORWARDED_HEADER};
use crate::common::{encode_query_value, quote_etag, Error, Result};
use crate::services::installer::InstallOutcome;
use crate::services::record::{ServiceInfo, ServiceSummary};

#[derive(Debug, Deserialize)]
struct StatusBody {
    ready: bool,
}

fn mount_query(mount: &str) -> String {
    format!("mount={}", encode_query_value(mount))
}

pub struct PeerClient {
    node_id: NodeId,
    transport: Arc<dyn PeerTransport>,
}

impl PeerClient {
    pub fn new(node_id: impl Into<NodeId>, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            node_id: node_id.into(),
            transport,
        }
    }

    async fn call(&self, node: &str, request: PeerRequest) -> Result<PeerResponse> {
        let response = self.transport.send(node, request).await?;
        if response.is_success() || response.status == StatusCode::NOT_MODIFIED {
            Ok(response)
        } else {
            Err(response.into_error())
        }
    }

    /// Relay a request verbatim to the leader and return its response as is,
    /// error statuses included.
    pub async fn forward(&self, leader: &str, request: PeerRequest) -> Result<PeerResponse> {
        let request = request.header(
            axum::http::HeaderName::from_static(FORWARDED_HEADER),
            &self.node_id,
        )?;
        self.transport
            .send(leader, request)
            .await
            .map_err(|e| match e {
                Error::Http(reason) => {
                    Error::LeaderUnavailable(format!("leader {} unreachable: {}", leader, reason))
                }
                other => other,
            })
    }

    pub async fn list(&self, node: &str) -> Result<Vec<ServiceSummary>> {
        self.call(node, PeerRequest::get("/services")).await?.json()
    }

    /// Full descriptor of `mount` on `node`; `None` when not installed there
    pub async fn describe(&self, node: &str, mount: &str) -> Result<Option<ServiceInfo>> {
        let request = PeerRequest::get(format!("/services/service?{}", mount_query(mount)));
        match self.call(node, request).await {
            Ok(response) => response.json().map(Some),
            Err(Error::MountNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Bundle bytes of `mount`, refusing any version other than `checksum`
    pub async fn fetch_bundle(&self, node: &str, mount: &str, checksum: &str) -> Result<Bytes> {
        let request = PeerRequest::get(format!("/services/bundle?{}", mount_query(mount)))
            .header(header::IF_MATCH, &quote_etag(checksum))?;
        Ok(self.call(node, request).await?.body)
    }

    /// Batch checksum query; absent mounts are left out
    pub async fn checksums(&self, node: &str, mounts: &[String]) -> Result<BTreeMap<String, String>> {
        if mounts.is_empty() {
            return Ok(BTreeMap::new());
        }
        let query = mounts
            .iter()
            .map(|m| mount_query(m))
            .collect::<Vec<_>>()
            .join("&");
        self.call(node, PeerRequest::get(format!("/_local/checksums?{}", query)))
            .await?
            .json()
    }

    /// Ask `node` to apply each mount from the listed source nodes
    pub async fn install_local(
        &self,
        node: &str,
        batch: &BTreeMap<String, Vec<NodeId>>,
    ) -> Result<BTreeMap<String, InstallOutcome>> {
        let request = PeerRequest::post("/_local").json(batch)?;
        self.call(node, request).await?.json()
    }

    pub async fn remove_local(&self, node: &str, mount: &str) -> Result<()> {
        let request = PeerRequest::new(
            Method::DELETE,
            format!("/_local/service?{}", mount_query(mount)),
        );
        self.call(node, request).await?;
        Ok(())
    }

    /// Readiness of `node`
    pub async fn status(&self, node: &str) -> Result<bool> {
        let body: StatusBody = self.call(node, PeerRequest::get("/_local/status")).await?.json()?;
        Ok(body.ready)
    }
}
