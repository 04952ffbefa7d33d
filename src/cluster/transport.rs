//! Internal channel between nodes
//!
//! Peer calls are plain HTTP exchanges described by [`PeerRequest`] and
//! [`PeerResponse`]. [`HttpTransport`] sends them over the network with
//! reqwest; [`InProcessTransport`] hands them straight to another node's
//! axum router, which lets a whole cluster live in one process.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tower::ServiceExt;

use crate::cluster::membership::Membership;
use crate::common::{Error, Result};

/// Set on requests a follower relays to the leader; the value is the
/// follower's node id. A node that is not the leader refuses to relay such a
/// request again.
pub const FORWARDED_HEADER: &str = "x-minisvc-forwarded-by";

/// Headers that describe one connection and must not be relayed
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "transfer-encoding"
            | "upgrade"
            | "te"
            | "trailer"
            | "host"
            | "content-length"
    )
}

#[derive(Debug, Clone)]
pub struct PeerRequest {
    pub method: Method,
    /// Path plus query string, e.g. `/services/service?mount=%2Fapp`
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl PeerRequest {
    pub fn new(method: Method, path_and_query: impl Into<String>) -> Self {
        Self {
            method,
            path_and_query: path_and_query.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(path_and_query: impl Into<String>) -> Self {
        Self::new(Method::GET, path_and_query)
    }

    pub fn post(path_and_query: impl Into<String>) -> Self {
        Self::new(Method::POST, path_and_query)
    }

    pub fn header(mut self, name: HeaderName, value: &str) -> Result<Self> {
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::Internal(format!("invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| Error::Internal(format!("request encode: {}", e)))?;
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.body = Bytes::from(bytes);
        Ok(self)
    }

    /// Capture an inbound request for relaying, keeping everything except
    /// connection-level headers
    pub fn from_parts(method: Method, path_and_query: String, headers: &HeaderMap, body: Bytes) -> Self {
        let mut relayed = HeaderMap::new();
        for (name, value) in headers {
            if !is_hop_by_hop(name) {
                relayed.append(name.clone(), value.clone());
            }
        }
        Self {
            method,
            path_and_query,
            headers: relayed,
            body,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl PeerResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::Http(format!("unexpected peer response: {}", e)))
    }

    /// Typed error carried by a non-success response
    pub fn into_error(self) -> Error {
        Error::from_remote(self.status.as_u16(), &self.body)
    }

    /// Convert into an axum response, dropping connection-level headers
    pub fn into_response(self) -> axum::response::Response {
        let mut response = axum::response::Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        for (name, value) in &self.headers {
            if !is_hop_by_hop(name) {
                response.headers_mut().append(name.clone(), value.clone());
            }
        }
        response
    }
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Deliver `request` to `node`. A missing deadline answer is
    /// [`Error::PeerTimeout`]; an unreachable node is [`Error::Http`].
    async fn send(&self, node: &str, request: PeerRequest) -> Result<PeerResponse>;
}

/// Network transport over reqwest
pub struct HttpTransport {
    client: reqwest::Client,
    membership: Arc<Membership>,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(membership: Arc<Membership>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            membership,
            timeout,
        })
    }
}

fn classify(node: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::PeerTimeout(node.to_string())
    } else {
        Error::Http(format!("{}: {}", node, err))
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn send(&self, node: &str, request: PeerRequest) -> Result<PeerResponse> {
        let base = self
            .membership
            .url_of(node)
            .ok_or_else(|| Error::Http(format!("unknown node {}", node)))?;
        let url = format!("{}{}", base, request.path_and_query);

        let mut builder = self
            .client
            .request(request.method, &url)
            .timeout(self.timeout)
            .body(request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| classify(node, e))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| classify(node, e))?;
        Ok(PeerResponse {
            status,
            headers,
            body,
        })
    }
}

/// Transport that calls other nodes' routers directly
pub struct InProcessTransport {
    routers: RwLock<HashMap<String, Router>>,
    timeout: Duration,
}

impl InProcessTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            routers: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Make `node` reachable. Routers are registered after the nodes are
    /// built since every node needs the transport first.
    pub fn register(&self, node: impl Into<String>, router: Router) {
        self.routers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node.into(), router);
    }

    /// Make `node` unreachable
    pub fn disconnect(&self, node: &str) {
        self.routers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(node);
    }
}

#[async_trait]
impl PeerTransport for InProcessTransport {
    async fn send(&self, node: &str, request: PeerRequest) -> Result<PeerResponse> {
        let router = self
            .routers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(node)
            .cloned()
            .ok_or_else(|| Error::Http(format!("{}: connection refused", node)))?;

        let mut builder = Request::builder()
            .method(request.method)
            .uri(request.path_and_query);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        let http_request = builder
            .body(Body::from(request.body))
            .map_err(|e| Error::Internal(format!("peer request: {}", e)))?;

        let response = match tokio::time::timeout(self.timeout, router.oneshot(http_request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(infallible)) => match infallible {},
            Err(_) => return Err(Error::PeerTimeout(node.to_string())),
        };

        let (parts, body) = response.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| Error::Http(format!("{}: {}", node, e)))?;
        Ok(PeerResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    #[tokio::test]
    async fn test_in_process_roundtrip() {
        let transport = InProcessTransport::new(Duration::from_secs(1));
        transport.register(
            "n1",
            Router::new().route("/ping", get(|| async { "pong" })),
        );

        let response = transport.send("n1", PeerRequest::get("/ping")).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from_static(b"pong"));

        transport.disconnect("n1");
        let err = transport.send("n1", PeerRequest::get("/ping")).await.unwrap_err();
        assert!(matches!(err, Error::Http(_)));
    }

    #[tokio::test]
    async fn test_in_process_timeout() {
        let transport = InProcessTransport::new(Duration::from_millis(20));
        transport.register(
            "slow",
            Router::new().route(
                "/ping",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            ),
        );
        let err = transport.send("slow", PeerRequest::get("/ping")).await.unwrap_err();
        assert!(matches!(err, Error::PeerTimeout(ref n) if n == "slow"));
    }

    #[test]
    fn test_from_parts_drops_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("n2:8529"));
        headers.insert(header::IF_MATCH, HeaderValue::from_static("\"abc\""));
        let request = PeerRequest::from_parts(
            Method::PUT,
            "/services/service?mount=%2Fa".into(),
            &headers,
            Bytes::new(),
        );
        assert!(request.headers.get(header::HOST).is_none());
        assert_eq!(request.headers.get(header::IF_MATCH).unwrap(), "\"abc\"");
    }
}
