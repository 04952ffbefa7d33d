//! HTTP API of a node
//!
//! Public routes under `/services`, the internal channel under `/_local`,
//! and operator endpoints (`/health`, `/_admin/*`, `/metrics`).
//!
//! Mutating routes pass through [`leader_gate`]: the role is resolved once
//! per request, and on a follower the raw request is relayed to the leader
//! with the leader's answer returned unchanged.

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, RawQuery, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

use crate::cluster::{NodeId, PeerRequest, RoleResolver, RoleSnapshot, FORWARDED_HEADER};
use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{parse_flag, parse_query_pairs, validate_mount, Error, Result};
use crate::node::server::Node;
use crate::services::options::parse_option_map;
use crate::services::runtime::render_report;
use crate::services::{
    BundleFetch, InstallOptions, Reporter, ServiceUpload, UninstallOptions, UpgradeOptions,
    UploadBody, WriteOp, WriteOutcome,
};

type AppState = Arc<Node>;

/// Decoded query string
struct Params(Vec<(String, String)>);

impl Params {
    fn parse(raw: Option<String>) -> Result<Self> {
        Ok(Self(parse_query_pairs(raw.as_deref())?))
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn all(&self, key: &str) -> Vec<String> {
        self.0
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn mount(&self) -> Result<String> {
        let mount = self.get("mount").ok_or_else(|| Error::InvalidMount {
            mount: String::new(),
            reason: "missing mount parameter".into(),
        })?;
        validate_mount(mount)?;
        Ok(mount.to_string())
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            Some(value) => parse_flag(value),
            None => Ok(default),
        }
    }
}

pub fn create_router(node: AppState) -> Router {
    let max_body = node.config.max_bundle_bytes;
    Router::new()
        // Public service API
        .route("/services", get(list_services).post(install_service))
        .route(
            "/services/service",
            get(describe_service)
                .patch(upgrade_service)
                .put(replace_service)
                .delete(uninstall_service),
        )
        .route(
            "/services/configuration",
            get(get_configuration)
                .patch(patch_configuration)
                .put(put_configuration),
        )
        .route(
            "/services/dependencies",
            get(get_dependencies)
                .patch(patch_dependencies)
                .put(put_dependencies),
        )
        .route(
            "/services/development",
            post(enable_development).delete(disable_development),
        )
        .route("/services/scripts", get(list_scripts))
        .route("/services/scripts/:name", post(run_script))
        .route("/services/tests", post(run_tests))
        .route("/services/download", post(download_bundle))
        .route("/services/bundle", get(fetch_bundle))
        .route("/services/readme", get(readme))
        // Internal channel
        .route("/_local", post(local_install))
        .route(
            "/_local/service",
            post(local_reload).delete(local_uninstall),
        )
        .route("/_local/status", get(local_status))
        .route("/_local/checksums", get(local_checksums))
        .route("/_local/heal", post(local_heal))
        // Operator endpoints
        .route("/health", get(health))
        .route("/_admin/status", get(admin_status))
        .route("/_admin/leader", axum::routing::put(admin_set_leader))
        .route("/metrics", get(metrics))
        .layer(middleware::from_fn_with_state(node.clone(), leader_gate))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body))
        .layer(middleware::from_fn(request_tracing_middleware))
        .with_state(node)
}

/// Routes that only the leader executes
fn requires_leader(method: &Method, path: &str) -> bool {
    match path {
        "/services" => method == Method::POST,
        "/services/service" => {
            method == Method::PATCH || method == Method::PUT || method == Method::DELETE
        }
        "/services/configuration" | "/services/dependencies" => {
            method == Method::PATCH || method == Method::PUT
        }
        "/_local/heal" => method == Method::POST,
        _ => false,
    }
}

/// Resolve the role once; run locally on the leader, relay otherwise
async fn leader_gate(State(node): State<AppState>, mut request: Request, next: Next) -> Response {
    if !requires_leader(request.method(), request.uri().path()) {
        return next.run(request).await;
    }

    let role = node.role.resolve();
    if role.is_leader() {
        request.extensions_mut().insert(role);
        return next.run(request).await;
    }

    if let Some(origin) = request.headers().get(FORWARDED_HEADER) {
        // Relayed by a node that took us for the leader
        let origin = origin.to_str().unwrap_or("?").to_string();
        return Error::LeaderUnavailable(format!(
            "{} is not the leader (request relayed by {})",
            role.node_id, origin
        ))
        .into_response();
    }
    let Some(leader) = role.leader.clone() else {
        return Error::LeaderUnavailable("no leader elected".into()).into_response();
    };

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, node.config.max_bundle_bytes).await {
        Ok(body) => body,
        Err(e) => return (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()).into_response(),
    };
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    node.metrics.writes_forwarded.inc();
    tracing::debug!("Relaying {} {} to leader {}", parts.method, path_and_query, leader);
    let relayed = PeerRequest::from_parts(parts.method, path_and_query, &parts.headers, body);
    match node.peers.forward(&leader, relayed).await {
        Ok(response) => response.into_response(),
        Err(e) => {
            tracing::warn!("Relay to leader {} failed: {}", leader, e);
            e.into_response()
        }
    }
}

fn outcome_response(outcome: WriteOutcome, success: StatusCode) -> Response {
    match outcome {
        WriteOutcome::Service(body) => (success, Json(body)).into_response(),
        WriteOutcome::Options(body) => (StatusCode::OK, Json(body)).into_response(),
        WriteOutcome::Removed { .. } => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn execute(node: &Node, role: &RoleSnapshot, op: WriteOp, success: StatusCode) -> Result<Response> {
    let outcome = node.gateway.execute(role, op).await?;
    Ok(outcome_response(outcome, success))
}

fn upload_from(body: &[u8]) -> Result<ServiceUpload> {
    let body: UploadBody = serde_json::from_slice(body)?;
    ServiceUpload::from_body(body)
}

fn option_values(body: &[u8]) -> Result<BTreeMap<String, Value>> {
    if body.is_empty() {
        return Ok(BTreeMap::new());
    }
    let value: Value = serde_json::from_slice(body)?;
    parse_option_map(&value)
}

// ============================================================================
// Service API
// ============================================================================

async fn list_services(State(node): State<AppState>) -> impl IntoResponse {
    let summaries: Vec<_> = node.registry.list().iter().map(|r| r.summary()).collect();
    Json(summaries)
}

async fn describe_service(State(node): State<AppState>, RawQuery(query): RawQuery) -> Result<Response> {
    let mount = Params::parse(query)?.mount()?;
    let record = node.registry.require(&mount)?;
    Ok(Json(record.info()).into_response())
}

async fn install_service(
    State(node): State<AppState>,
    Extension(role): Extension<RoleSnapshot>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response> {
    let params = Params::parse(query)?;
    let op = WriteOp::Install {
        mount: params.mount()?,
        upload: upload_from(&body)?,
        options: InstallOptions {
            development: params.flag("development", false)?,
            setup: params.flag("setup", true)?,
            legacy: params.flag("legacy", false)?,
        },
    };
    execute(&node, &role, op, StatusCode::CREATED).await
}

fn upgrade_options(params: &Params, defaults: UpgradeOptions) -> Result<UpgradeOptions> {
    Ok(UpgradeOptions {
        teardown: params.flag("teardown", defaults.teardown)?,
        setup: params.flag("setup", defaults.setup)?,
        legacy: params.flag("legacy", defaults.legacy)?,
    })
}

async fn upgrade_service(
    State(node): State<AppState>,
    Extension(role): Extension<RoleSnapshot>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response> {
    let params = Params::parse(query)?;
    let op = WriteOp::Upgrade {
        mount: params.mount()?,
        upload: upload_from(&body)?,
        options: upgrade_options(&params, UpgradeOptions::upgrade())?,
    };
    execute(&node, &role, op, StatusCode::OK).await
}

async fn replace_service(
    State(node): State<AppState>,
    Extension(role): Extension<RoleSnapshot>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response> {
    let params = Params::parse(query)?;
    let op = WriteOp::Replace {
        mount: params.mount()?,
        upload: upload_from(&body)?,
        options: upgrade_options(&params, UpgradeOptions::replace())?,
    };
    execute(&node, &role, op, StatusCode::OK).await
}

async fn uninstall_service(
    State(node): State<AppState>,
    Extension(role): Extension<RoleSnapshot>,
    RawQuery(query): RawQuery,
) -> Result<Response> {
    let params = Params::parse(query)?;
    let op = WriteOp::Uninstall {
        mount: params.mount()?,
        options: UninstallOptions {
            teardown: params.flag("teardown", true)?,
        },
    };
    execute(&node, &role, op, StatusCode::NO_CONTENT).await
}

async fn get_configuration(State(node): State<AppState>, RawQuery(query): RawQuery) -> Result<Response> {
    let mount = Params::parse(query)?.mount()?;
    let record = node.registry.require(&mount)?;
    Ok(Json(record.configuration_details()).into_response())
}

async fn get_dependencies(State(node): State<AppState>, RawQuery(query): RawQuery) -> Result<Response> {
    let mount = Params::parse(query)?.mount()?;
    let record = node.registry.require(&mount)?;
    Ok(Json(record.dependency_details()).into_response())
}

async fn set_options(
    node: &Node,
    role: &RoleSnapshot,
    query: Option<String>,
    body: &[u8],
    configuration: bool,
    replace: bool,
) -> Result<Response> {
    let mount = Params::parse(query)?.mount()?;
    let values = option_values(body)?;
    let op = if configuration {
        WriteOp::SetConfiguration {
            mount,
            values,
            replace,
        }
    } else {
        WriteOp::SetDependencies {
            mount,
            values,
            replace,
        }
    };
    execute(node, role, op, StatusCode::OK).await
}

async fn patch_configuration(
    State(node): State<AppState>,
    Extension(role): Extension<RoleSnapshot>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response> {
    set_options(&node, &role, query, &body, true, false).await
}

async fn put_configuration(
    State(node): State<AppState>,
    Extension(role): Extension<RoleSnapshot>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response> {
    set_options(&node, &role, query, &body, true, true).await
}

async fn patch_dependencies(
    State(node): State<AppState>,
    Extension(role): Extension<RoleSnapshot>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response> {
    set_options(&node, &role, query, &body, false, false).await
}

async fn put_dependencies(
    State(node): State<AppState>,
    Extension(role): Extension<RoleSnapshot>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response> {
    set_options(&node, &role, query, &body, false, true).await
}

// Not leader-gated: the mode belongs to this node
async fn set_development(node: &Node, query: Option<String>, enabled: bool) -> Result<Response> {
    let op = WriteOp::SetDevelopmentMode {
        mount: Params::parse(query)?.mount()?,
        enabled,
    };
    execute(node, &node.role.resolve(), op, StatusCode::OK).await
}

async fn enable_development(State(node): State<AppState>, RawQuery(query): RawQuery) -> Result<Response> {
    set_development(&node, query, true).await
}

async fn disable_development(State(node): State<AppState>, RawQuery(query): RawQuery) -> Result<Response> {
    set_development(&node, query, false).await
}

async fn list_scripts(State(node): State<AppState>, RawQuery(query): RawQuery) -> Result<Response> {
    let mount = Params::parse(query)?.mount()?;
    let record = node.registry.require(&mount)?;
    Ok(Json(node.runtime.list_scripts(&record)).into_response())
}

async fn run_script(
    State(node): State<AppState>,
    Path(name): Path<String>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response> {
    let mount = Params::parse(query)?.mount()?;
    let record = node.registry.require(&mount)?;
    let args: Value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body)?
    };
    let result = node.runtime.run_script(&record, &name, args).await?;
    Ok(Json(result).into_response())
}

async fn run_tests(State(node): State<AppState>, RawQuery(query): RawQuery) -> Result<Response> {
    let params = Params::parse(query)?;
    let mount = params.mount()?;
    let reporter = Reporter::parse(params.get("reporter"))?;
    let record = node.registry.require(&mount)?;
    let report = node.runtime.run_tests(&record, params.get("grep")).await?;
    let lines = render_report(&report, reporter);

    let body = if reporter == Reporter::Stream {
        let stream = async_stream::stream! {
            for line in lines {
                yield Ok::<_, Infallible>(Bytes::from(format!("{}\n", line)));
            }
        };
        Body::from_stream(stream)
    } else {
        Body::from(lines.join("\n"))
    };
    Ok((
        [(header::CONTENT_TYPE, reporter.content_type())],
        body,
    )
        .into_response())
}

fn attachment(filename: &str) -> String {
    format!("attachment; filename=\"{}\"", filename)
}

async fn download_bundle(State(node): State<AppState>, RawQuery(query): RawQuery) -> Result<Response> {
    let mount = Params::parse(query)?.mount()?;
    let record = node.registry.require(&mount)?;
    let bytes = node.registry.bundles().load(&record)?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                attachment(&crate::common::bundle_filename(&mount)),
            ),
        ],
        bytes,
    )
        .into_response())
}

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn fetch_bundle(
    State(node): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Response> {
    let mount = Params::parse(query)?.mount()?;
    let record = node.registry.require(&mount)?;
    let fetched = node.registry.bundles().fetch(
        &record,
        header_str(&headers, header::IF_NONE_MATCH),
        header_str(&headers, header::IF_MATCH),
    )?;
    let response = match fetched {
        BundleFetch::Unchanged { etag } => {
            (StatusCode::NOT_MODIFIED, [(header::ETAG, etag)]).into_response()
        }
        BundleFetch::Bundle {
            bytes,
            etag,
            filename,
        } => (
            [
                (header::ETAG, etag),
                (header::CONTENT_TYPE, "application/zip".to_string()),
                (header::CONTENT_DISPOSITION, attachment(&filename)),
            ],
            bytes,
        )
            .into_response(),
    };
    Ok(response)
}

async fn readme(State(node): State<AppState>, RawQuery(query): RawQuery) -> Result<Response> {
    let mount = Params::parse(query)?.mount()?;
    let record = node.registry.require(&mount)?;
    Ok(match record.manifest.readme {
        Some(text) => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            text,
        )
            .into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

// ============================================================================
// Internal channel
// ============================================================================

/// Batch local install: `{mount: [source node ids]}`
async fn local_install(State(node): State<AppState>, body: Bytes) -> Result<Response> {
    let batch: BTreeMap<String, Vec<NodeId>> = serde_json::from_slice(&body)?;
    let outcomes = node.installer.install_batch(&batch).await;
    Ok(Json(outcomes).into_response())
}

/// Rebuild the routing table after out-of-band changes
async fn local_reload(State(node): State<AppState>, RawQuery(query): RawQuery) -> Result<Response> {
    Params::parse(query)?.mount()?;
    crate::services::RouterCache::rebuild(node.routes.as_ref());
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn local_uninstall(State(node): State<AppState>, RawQuery(query): RawQuery) -> Result<Response> {
    let mount = Params::parse(query)?.mount()?;
    node.installer.remove_locally(&mount).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn local_status(State(node): State<AppState>) -> impl IntoResponse {
    let role = node.role.resolve();
    let ready = match node.readiness.probe(&role, &node.peers).await {
        Ok(ready) => ready,
        Err(e) => {
            tracing::debug!("Readiness probe could not reach the leader: {}", e);
            false
        }
    };
    Json(json!({ "ready": ready }))
}

async fn local_checksums(State(node): State<AppState>, RawQuery(query): RawQuery) -> Result<Response> {
    let mounts = Params::parse(query)?.all("mount");
    Ok(Json(node.registry.checksums_of(&mounts)).into_response())
}

/// Start a heal sweep and answer before it finishes
async fn local_heal(State(node): State<AppState>) -> impl IntoResponse {
    let heal = node.heal.clone();
    tokio::spawn(async move {
        match heal.heal().await {
            Ok(report) => tracing::info!(
                "Heal finished: {} followers checked, {} mounts repaired, {} removed",
                report.followers_checked,
                report.repaired_count(),
                report.removed_count()
            ),
            Err(e) => tracing::warn!("Heal failed: {}", e),
        }
    });
    (StatusCode::ACCEPTED, Json(json!({ "status": "accepted" })))
}

// ============================================================================
// Operator endpoints
// ============================================================================

async fn health(State(node): State<AppState>) -> impl IntoResponse {
    let role = node.role.resolve();
    Json(json!({
        "status": "healthy",
        "node_id": role.node_id,
        "role": role.role().to_string(),
        "is_leader": role.is_leader(),
        "ready": node.readiness.is_ready(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn admin_status(State(node): State<AppState>) -> impl IntoResponse {
    let role = node.role.resolve();
    Json(json!({
        "node_id": role.node_id,
        "role": role.role().to_string(),
        "is_leader": role.is_leader(),
        "leader": role.leader,
        "term": role.term,
        "ready": node.readiness.is_ready(),
        "services": node.registry.len(),
        "routes": node.routes.routes(),
        "routes_generation": node.routes.generation(),
        "peers": node.membership.others(),
        "pending_replication": node.replicator.pending().len(),
        "uptime_secs": node.metrics.uptime_seconds(),
    }))
}

#[derive(Debug, Deserialize)]
struct LeaderChange {
    leader: NodeId,
    /// Defaults to the next term
    term: Option<u64>,
}

/// Announce a leader to this node
async fn admin_set_leader(State(node): State<AppState>, body: Bytes) -> Result<Response> {
    let change: LeaderChange = serde_json::from_slice(&body)?;
    if !node.membership.contains(&change.leader) {
        return Err(Error::InvalidConfig(format!("unknown node {}", change.leader)));
    }
    let term = change.term.unwrap_or_else(|| node.role.term() + 1);
    if !node.role.follow(term, change.leader.clone()) {
        return Err(Error::InvalidConfig(format!(
            "term {} is older than current term {}",
            term,
            node.role.term()
        )));
    }
    let role = node.role.resolve();
    if role.is_leader() && node.readiness.latch() {
        tracing::info!("Node {} ready as leader (term {})", role.node_id, role.term);
    }
    Ok(Json(json!({
        "leader": role.leader,
        "term": role.term,
        "is_leader": role.is_leader(),
    }))
    .into_response())
}

async fn metrics(State(node): State<AppState>) -> impl IntoResponse {
    let body = node
        .metrics
        .to_prometheus(node.node_id(), node.role.is_leader());
    (
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        body,
    )
}
