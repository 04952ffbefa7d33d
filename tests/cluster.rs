//! Multi-node behavior: relay to the leader, replication, heal, readiness

mod common;

use axum::http::{header, HeaderName, Method, StatusCode};
use common::*;
use minisvc::cluster::{PeerRequest, RoleResolver, FORWARDED_HEADER};
use minisvc::common::{quote_etag, InternalServiceConfig};
use minisvc::services::bundle::materialize;
use minisvc::services::{InstallOptions, UninstallOptions, WriteOutcome};
use minisvc::Error;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn install_request(mount: &str, version: &str, bundle: &[u8]) -> PeerRequest {
    PeerRequest::post(format!("/services?{}", mount_query(mount)))
        .json(&upload(version, bundle).to_body())
        .unwrap()
}

#[tokio::test]
async fn test_follower_forwards_library_writes() {
    let cluster = TestCluster::start(2);
    let follower = cluster.node(2);
    let role = follower.role.resolve();
    assert!(!role.is_leader());

    let outcome = follower
        .gateway
        .install(&role, "/app", upload("1.0.0", b"v1"), InstallOptions::default())
        .await
        .unwrap();
    let WriteOutcome::Service(response) = outcome else {
        panic!("expected a service");
    };

    // Executed on the leader only; the follower catches up through replication
    let leader = cluster.leader();
    assert_eq!(leader.registry.checksum_of("/app"), Some(response.service.checksum.clone()));
    assert!(!follower.registry.contains("/app"));
    assert_eq!(follower.metrics.writes_forwarded.get(), 1);
    assert_eq!(follower.metrics.writes_total.get(), 0);

    let report = leader.replicator.flush().await;
    assert_eq!(report.upserts, 1);
    assert!(report.failures.is_empty());
    assert_eq!(follower.registry.checksum_of("/app"), Some(response.service.checksum));
    assert_eq!(&follower.registry.load_bundle("/app").unwrap()[..], b"v1");

    // Leader errors come back typed
    let err = follower
        .gateway
        .install(&role, "/app", upload("1.0.0", b"v1"), InstallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MountConflict(ref m) if m == "/app"));

    follower
        .gateway
        .uninstall(&role, "/app", UninstallOptions::default())
        .await
        .unwrap();
    leader.replicator.flush().await;
    assert!(!follower.registry.contains("/app"));
}

#[tokio::test]
async fn test_http_writes_are_relayed_verbatim() {
    let cluster = TestCluster::start(2);

    let response = cluster
        .send("node-2", install_request("/web", "1.0.0", b"web"))
        .await;
    assert_eq!(response.status, StatusCode::CREATED);
    let body: Value = response.json().unwrap();
    assert_eq!(body["mount"], "/web");
    assert_eq!(
        body["checksum"].as_str(),
        cluster.leader().registry.checksum_of("/web").as_deref()
    );

    let response = cluster
        .send(
            "node-2",
            PeerRequest::new(
                Method::PATCH,
                format!("/services/configuration?{}", mount_query("/web")),
            )
            .json(&json!({"a": 3}))
            .unwrap(),
        )
        .await;
    assert_eq!(response.status, StatusCode::OK);
    let body: Value = response.json().unwrap();
    assert_eq!(body["values"]["a"], 3);

    // A leader-side error is relayed with its status
    let response = cluster
        .send("node-2", install_request("/web", "1.0.0", b"web"))
        .await;
    assert_eq!(response.status, StatusCode::CONFLICT);
    assert_eq!(cluster.node(2).metrics.writes_forwarded.get(), 3);

    // Reads stay local
    let response = cluster
        .send(
            "node-2",
            PeerRequest::get(format!("/services/service?{}", mount_query("/web"))),
        )
        .await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_relayed_request_is_not_relayed_again() {
    let cluster = TestCluster::start(3);
    let request = install_request("/app", "1.0.0", b"v1")
        .header(HeaderName::from_static(FORWARDED_HEADER), "node-3")
        .unwrap();
    let response = cluster.send("node-2", request).await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(matches!(response.into_error(), Error::LeaderUnavailable(_)));
    assert!(!cluster.leader().registry.contains("/app"));
}

#[tokio::test]
async fn test_follower_toggles_its_own_development_mode() {
    let cluster = TestCluster::start(2);
    let response = cluster
        .send("node-2", install_request("/app", "1.0.0", b"v1"))
        .await;
    assert_eq!(response.status, StatusCode::CREATED);
    let leader = cluster.leader();
    leader.replicator.flush().await;
    let follower = cluster.node(2);
    let forwarded = follower.metrics.writes_forwarded.get();

    let response = cluster
        .send(
            "node-2",
            PeerRequest::post(format!("/services/development?{}", mount_query("/app"))),
        )
        .await;
    assert_eq!(response.status, StatusCode::OK);
    let body: Value = response.json().unwrap();
    assert_eq!(body["development"], true);

    assert!(follower.registry.require("/app").unwrap().mode.is_development());
    assert!(!leader.registry.require("/app").unwrap().mode.is_development());
    assert_eq!(follower.metrics.writes_forwarded.get(), forwarded);
    assert!(follower.replicator.pending().is_empty());
    assert!(leader.replicator.pending().is_empty());

    // Works without any leader too
    cluster.transport.disconnect(LEADER);
    let role = follower.role.resolve();
    let outcome = follower
        .gateway
        .set_development_mode(&role, "/app", false)
        .await
        .unwrap();
    let WriteOutcome::Service(response) = outcome else {
        panic!("expected a service");
    };
    assert!(!response.service.development);
    assert!(!follower.registry.require("/app").unwrap().mode.is_development());
}

#[tokio::test]
async fn test_no_leader() {
    let cluster = TestCluster::build(2, None, Duration::from_secs(1), Arc::new(minisvc::services::NoopRuntime));
    let node = cluster.node(1);
    let role = node.role.resolve();
    assert!(role.leader.is_none());

    let err = node
        .gateway
        .install(&role, "/app", upload("1.0.0", b"v1"), InstallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LeaderUnavailable(_)));

    let response = cluster
        .send("node-1", install_request("/app", "1.0.0", b"v1"))
        .await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);

    // Reads still work without a leader
    let response = cluster.send("node-1", PeerRequest::get("/services")).await;
    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn test_unreachable_leader() {
    let cluster = TestCluster::start(2);
    cluster.transport.disconnect(LEADER);

    let follower = cluster.node(2);
    let role = follower.role.resolve();
    let err = follower
        .gateway
        .install(&role, "/app", upload("1.0.0", b"v1"), InstallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LeaderUnavailable(_)));
    assert!(err.is_retryable());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timeout_does_not_cancel_leader_write() {
    let runtime = Arc::new(SlowRuntime::delayed(Duration::from_millis(300)));
    let cluster = TestCluster::build(2, Some(LEADER), Duration::from_millis(50), runtime);
    let follower = cluster.node(2);
    let role = follower.role.resolve();

    let err = follower
        .gateway
        .install(&role, "/app", upload("1.0.0", b"v1"), InstallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PeerTimeout(ref n) if n == LEADER));

    // The leader finishes what it started
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(cluster.leader().registry.contains("/app"));
}

#[tokio::test]
async fn test_heal_repairs_only_stale_followers() {
    let cluster = TestCluster::start(3);
    let leader = cluster.leader();
    let role = leader.role.resolve();
    for (mount, bundle) in [("/a", &b"a"[..]), ("/b", &b"b"[..])] {
        leader
            .gateway
            .install(&role, mount, upload("1.0.0", bundle), InstallOptions::default())
            .await
            .unwrap();
    }
    leader.replicator.flush().await;

    // node-2: /b drifted, plus a mount the leader never had
    let node2 = cluster.node(2);
    let mut drifted = node2.registry.require("/b").unwrap();
    drifted.checksum = "drifted".into();
    node2.registry.write(drifted, Some(b"garbage")).unwrap();
    let mut extra = node2.registry.require("/a").unwrap();
    extra.mount = "/extra".into();
    node2.registry.write(extra, Some(b"a")).unwrap();
    // node-3: /a missing
    cluster.node(3).registry.remove("/a").unwrap();

    let report = leader.heal.heal().await.unwrap();
    assert_eq!(report.followers_checked, 2);
    assert!(report.failures.is_empty());
    assert_eq!(report.repaired["node-2"], vec!["/b".to_string()]);
    assert_eq!(report.repaired["node-3"], vec!["/a".to_string()]);

    for n in 2..=3 {
        let node = cluster.node(n);
        assert_eq!(node.registry.checksum_of("/a"), leader.registry.checksum_of("/a"));
        assert_eq!(node.registry.checksum_of("/b"), leader.registry.checksum_of("/b"));
    }
    assert_eq!(&node2.registry.load_bundle("/b").unwrap()[..], b"b");
    assert_eq!(report.removed["node-2"], vec!["/extra".to_string()]);
    assert!(!report.removed.contains_key("node-3"));
    assert!(!node2.registry.contains("/extra"));
    assert!(node2.registry.checksum_of("/extra").is_none());

    // Nothing left to repair
    let report = leader.heal.heal().await.unwrap();
    assert_eq!(report.repaired_count(), 0);
    assert_eq!(report.removed_count(), 0);

    // Only the leader heals
    let err = cluster.node(2).heal.heal().await.unwrap_err();
    assert!(matches!(err, Error::LeaderUnavailable(_)));
}

#[tokio::test]
async fn test_heal_removes_uninstall_missed_by_follower() {
    let cluster = TestCluster::start(2);
    let leader = cluster.leader();
    let role = leader.role.resolve();
    leader
        .gateway
        .install(&role, "/app", upload("1.0.0", b"v1"), InstallOptions::default())
        .await
        .unwrap();
    leader.replicator.flush().await;
    let follower = cluster.node(2);
    assert!(follower.registry.contains("/app"));

    // The removal push is lost while the follower is away
    cluster.transport.disconnect("node-2");
    leader
        .gateway
        .uninstall(&role, "/app", UninstallOptions::default())
        .await
        .unwrap();
    let flushed = leader.replicator.flush().await;
    assert!(flushed.failures.contains_key("node-2"));
    cluster.transport.register("node-2", follower.router());
    assert!(follower.registry.contains("/app"));

    let report = leader.heal.heal().await.unwrap();
    assert!(report.failures.is_empty());
    assert_eq!(report.removed["node-2"], vec!["/app".to_string()]);
    assert!(!follower.registry.contains("/app"));
    assert!(follower.registry.checksum_of("/app").is_none());
}

#[tokio::test]
async fn test_heal_reports_unreachable_follower() {
    let cluster = TestCluster::start(3);
    let leader = cluster.leader();
    let role = leader.role.resolve();
    leader
        .gateway
        .install(&role, "/a", upload("1.0.0", b"a"), InstallOptions::default())
        .await
        .unwrap();
    cluster.transport.disconnect("node-3");

    let report = leader.heal.heal().await.unwrap();
    assert_eq!(report.repaired["node-2"], vec!["/a".to_string()]);
    assert!(report.failures.contains_key("node-3"));
}

#[tokio::test]
async fn test_initial_sync_mirrors_leader() {
    let cluster = TestCluster::start(2);
    let leader = cluster.leader();
    let role = leader.role.resolve();
    leader
        .gateway
        .install(&role, "/a", upload("1.0.0", b"a"), InstallOptions::default())
        .await
        .unwrap();

    // A leftover the leader does not know about
    let follower = cluster.node(2);
    let mut leftover = leader.registry.require("/a").unwrap();
    leftover.mount = "/gone".into();
    follower.registry.write(leftover, Some(b"a")).unwrap();
    assert!(!follower.readiness.is_ready());

    follower.initial_sync().await.unwrap();
    assert!(follower.readiness.is_ready());
    assert_eq!(follower.registry.mounts(), vec!["/a".to_string()]);
    assert_eq!(follower.routes.resolve("/a/api"), Some("/a".to_string()));

    // Syncing again changes nothing
    let report = follower.installer.sync_from(LEADER).await.unwrap();
    assert!(report.removed.is_empty());
    assert_eq!(
        report.applied["/a"],
        minisvc::services::InstallOutcome::Unchanged {
            checksum: leader.registry.checksum_of("/a").unwrap()
        }
    );
}

#[tokio::test]
async fn test_internal_services_seeded_on_leader() {
    let cluster = TestCluster::configured(2, |config| {
        config.internal_services.push(InternalServiceConfig {
            mount: "/_system/health".into(),
            name: "health".into(),
            version: "1.0.0".into(),
        });
    });
    let leader = cluster.leader();
    let follower = cluster.node(2);
    let record = leader.registry.require("/_system/health").unwrap();
    assert_eq!(record.manifest.name, "health");
    assert!(record.bundle_ref.is_none());
    assert_eq!(leader.routes.resolve("/_system/health/ping"), Some("/_system/health".to_string()));
    assert!(!follower.registry.contains("/_system/health"));

    // The follower pulls the bundle the leader materializes on demand
    follower.initial_sync().await.unwrap();
    let expected = materialize(&record.manifest).unwrap();
    assert_eq!(&follower.registry.load_bundle("/_system/health").unwrap()[..], &expected[..]);
    assert_eq!(follower.registry.checksum_of("/_system/health"), Some(record.checksum));

    let report = leader.heal.heal().await.unwrap();
    assert_eq!(report.repaired_count(), 0);
}

#[tokio::test]
async fn test_readiness_latches_once() {
    let cluster = TestCluster::start(2);
    assert!(cluster.leader().readiness.is_ready());
    assert!(!cluster.node(2).readiness.is_ready());

    let response = cluster.send("node-2", PeerRequest::get("/_local/status")).await;
    let body: Value = response.json().unwrap();
    assert_eq!(body["ready"], true);

    // Once ready, the leader is not asked again
    cluster.transport.disconnect(LEADER);
    let response = cluster.send("node-2", PeerRequest::get("/_local/status")).await;
    let body: Value = response.json().unwrap();
    assert_eq!(body["ready"], true);
}

#[tokio::test]
async fn test_readiness_without_reachable_leader() {
    let cluster = TestCluster::start(2);
    cluster.transport.disconnect(LEADER);
    let response = cluster.send("node-2", PeerRequest::get("/_local/status")).await;
    assert_eq!(response.status, StatusCode::OK);
    let body: Value = response.json().unwrap();
    assert_eq!(body["ready"], false);
}

#[tokio::test]
async fn test_conditional_bundle_fetch() {
    let cluster = TestCluster::start(1);
    let leader = cluster.leader();
    let role = leader.role.resolve();
    leader
        .gateway
        .install(&role, "/app", upload("1.0.0", b"zipbytes"), InstallOptions::default())
        .await
        .unwrap();
    let checksum = leader.registry.checksum_of("/app").unwrap();
    let path = format!("/services/bundle?{}", mount_query("/app"));

    let response = cluster.send(LEADER, PeerRequest::get(path.clone())).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(&response.body[..], b"zipbytes");
    assert_eq!(response.headers[header::ETAG], quote_etag(&checksum).as_str());

    let response = cluster
        .send(
            LEADER,
            PeerRequest::get(path.clone())
                .header(header::IF_NONE_MATCH, &quote_etag(&checksum))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status, StatusCode::NOT_MODIFIED);
    assert!(response.body.is_empty());

    let response = cluster
        .send(
            LEADER,
            PeerRequest::get(path)
                .header(header::IF_MATCH, &quote_etag("older"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert!(matches!(response.into_error(), Error::StaleReference(_)));
}

#[tokio::test]
async fn test_leader_handover() {
    let cluster = TestCluster::start(2);
    let response = cluster
        .send(
            "node-2",
            PeerRequest::new(Method::PUT, "/_admin/leader")
                .json(&json!({"leader": "node-2"}))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status, StatusCode::OK);
    let body: Value = response.json().unwrap();
    assert_eq!(body["is_leader"], true);
    assert_eq!(body["term"], 2);

    // node-2 now executes writes itself
    let response = cluster
        .send("node-2", install_request("/app", "1.0.0", b"v1"))
        .await;
    assert_eq!(response.status, StatusCode::CREATED);
    assert!(cluster.node(2).registry.contains("/app"));
    assert!(!cluster.leader().registry.contains("/app"));

    // Older terms are refused
    let response = cluster
        .send(
            "node-2",
            PeerRequest::new(Method::PUT, "/_admin/leader")
                .json(&json!({"leader": "node-1", "term": 1}))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_apply_falls_through_unreachable_sources() {
    let cluster = TestCluster::start(3);
    let leader = cluster.leader();
    let role = leader.role.resolve();
    leader
        .gateway
        .install(&role, "/a", upload("1.0.0", b"a"), InstallOptions::default())
        .await
        .unwrap();
    cluster.transport.disconnect("node-3");

    let follower = cluster.node(2);
    let generation = follower.routes.generation();
    let outcome = follower
        .installer
        .apply_locally("/a", &["node-3".to_string(), LEADER.to_string()])
        .await
        .unwrap();
    assert_eq!(
        outcome,
        minisvc::services::InstallOutcome::Installed {
            checksum: leader.registry.checksum_of("/a").unwrap()
        }
    );
    assert!(follower.routes.generation() > generation);
    assert_eq!(follower.metrics.peer_failures.get(), 1);

    // Applying the same content again is a no-op
    let again = follower
        .installer
        .apply_locally("/a", &[LEADER.to_string()])
        .await
        .unwrap();
    assert!(matches!(again, minisvc::services::InstallOutcome::Unchanged { .. }));

    // A source without the mount removes the local copy
    let err = follower
        .installer
        .apply_locally("/a", &["node-3".to_string()])
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    leader
        .gateway
        .uninstall(&role, "/a", UninstallOptions::default())
        .await
        .unwrap();
    let removed = follower
        .installer
        .apply_locally("/a", &[LEADER.to_string()])
        .await
        .unwrap();
    assert_eq!(removed, minisvc::services::InstallOutcome::Removed);
    assert!(!follower.registry.contains("/a"));
}
