// Integration tests: HTTP endpoints over the metrics store

mod common;

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::http::header::{ACCESS_CONTROL_ALLOW_ORIGIN, ORIGIN};
use axum_test::TestServer;
use common::{FakeFleet, builder, instance, report, sample, ts, worker};
use fleetwatch::models::{FleetTotals, Snapshot, UserTotals, WindowStats, WorkerSnapshot};
use fleetwatch::routes;
use fleetwatch::store::MetricsStore;

fn test_server() -> (TestServer, Arc<MetricsStore>) {
    let store = Arc::new(MetricsStore::default());
    let server = TestServer::new(routes::app(store.clone()));
    (server, store)
}

async fn publish_one(store: &Arc<MetricsStore>) {
    let fleet = Arc::new(FakeFleet::new(report(
        25,
        vec![worker("w1", 10_000, vec![instance("0.2.3", "NVIDIA GeForce RTX 4090")])],
    )));
    builder(fleet, None, false, store.clone())
        .build_at(ts("2025-03-01T10:00:00Z"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_version_endpoint() {
    let (server, _) = test_server();
    let response = server.get("/version").await;
    response.assert_status_ok();
    let json: serde_json::Value = response.json();
    assert_eq!(
        json.get("name").and_then(|v| v.as_str()),
        Some("fleetwatch")
    );
    assert!(json.get("version").and_then(|v| v.as_str()).is_some());
}

#[tokio::test]
async fn test_snapshot_endpoints_not_ready_before_first_tick() {
    let (server, _) = test_server();
    for path in ["/api/metrics", "/api/general", "/api/user", "/api/workers"] {
        let response = server.get(path).await;
        response.assert_status_not_found();
        response.assert_text(routes::NOT_READY);
    }
}

#[tokio::test]
async fn test_metrics_endpoint_returns_latest_snapshot() {
    let (server, store) = test_server();
    publish_one(&store).await;

    let response = server.get("/api/metrics").await;
    response.assert_status_ok();
    let snapshot: Snapshot = response.json();
    assert_eq!(snapshot.taken_at, ts("2025-03-01T10:00:00Z"));
    assert_eq!(snapshot.general.running_instances, 25);
    assert_eq!(snapshot.workers.len(), 1);

    let raw: serde_json::Value = server.get("/api/metrics").await.json();
    assert!(raw["general"].get("runningInstances").is_some());
    assert!(raw["user"].get("totalDailyCost").is_some());
}

#[tokio::test]
async fn test_sliced_endpoints() {
    let (server, store) = test_server();
    publish_one(&store).await;

    let general: FleetTotals = server.get("/api/general").await.json();
    assert_eq!(general.cli_version, "0.2.3");
    assert_eq!(general.rpm, 1200);

    let user: UserTotals = server.get("/api/user").await.json();
    assert_eq!(user.actual_instances, 1);
    assert_eq!(user.tokens_last_24h, 10_000);

    let workers: Vec<WorkerSnapshot> = server.get("/api/workers").await.json();
    assert_eq!(workers[0].name, "worker-w1");
    assert_eq!(workers[0].instances[0].gpu_model, "RTX 4090");
}

#[tokio::test]
async fn test_hourly_endpoint_reports_zeros_for_empty_window() {
    let (server, _) = test_server();
    let response = server.get("/api/hourly").await;
    response.assert_status_ok();
    let stats: WindowStats = response.json();
    assert!(stats.is_empty());
    assert_eq!(stats.rpm.max, 0);
}

#[tokio::test]
async fn test_hourly_endpoint_summarizes_window() {
    let (server, store) = test_server();
    let t = ts("2025-03-01T10:00:00Z");
    for (i, rpm) in [5, 10, 3].into_iter().enumerate() {
        store
            .window()
            .append(sample(t + chrono::Duration::minutes(i as i64), rpm));
    }
    let stats: WindowStats = server.get("/api/hourly").await.json();
    assert_eq!(stats.rpm.min, 3);
    assert_eq!(stats.rpm.max, 10);
    assert_eq!(stats.rpm.current, 3);
    assert_eq!(stats.rpm.avg, 6.0);
    assert_eq!(stats.start_time, t);
}

#[tokio::test]
async fn test_cors_allows_any_origin() {
    let (server, _) = test_server();
    let response = server
        .get("/version")
        .add_header(ORIGIN, HeaderValue::from_static("http://dashboard.local"))
        .await;
    response.assert_status_ok();
    assert_eq!(
        response
            .headers()
            .get(ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
}
