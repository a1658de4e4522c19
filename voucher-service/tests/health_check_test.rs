//! HTTP side-listener and gRPC health tests.

mod common;

use common::{as_caller, spawn_app, spawn_app_with, test_config, ORG};
use std::io::Write;
use tonic::transport::Channel;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;
use voucher_service::grpc::proto::GetGroupRequest;
use voucher_service::models::Principal;

#[tokio::test]
async fn test_health_and_ready() {
    let app = spawn_app().await;
    let client = reqwest::Client::new();

    let response = client
        .get(app.http_url("/health"))
        .header("x-request-id", "req-123")
        .send()
        .await
        .expect("Failed to call /health");
    assert!(response.status().is_success());
    assert_eq!(
        response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok()),
        Some("req-123")
    );
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["service"], "voucher-service");

    let response = client.get(app.http_url("/ready")).send().await.unwrap();
    assert!(response.status().is_success());
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let mut app = spawn_app().await;
    let alice = app.alice.clone();
    app.client
        .get_group(as_caller(
            &alice,
            GetGroupRequest {
                group_id: ORG.to_string(),
            },
        ))
        .await
        .unwrap();

    let body = reqwest::get(app.http_url("/metrics"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("voucher_grpc_requests_total"));
    assert!(body.contains("voucher_authz_decisions_total"));
}

#[tokio::test]
async fn test_grpc_health_reports_serving() {
    let app = spawn_app().await;

    let channel = Channel::from_shared(format!("http://127.0.0.1:{}", app.grpc_port))
        .unwrap()
        .connect()
        .await
        .unwrap();
    let mut client = HealthClient::new(channel);
    let response = client
        .check(HealthCheckRequest {
            service: "micros.voucher.v1.VoucherService".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.status, ServingStatus::Serving as i32);
}

#[tokio::test]
async fn test_seed_file_is_applied_on_build() {
    let mut seed = tempfile::NamedTempFile::new().unwrap();
    write!(
        seed,
        r#"{{"organizations": [{{"org_id": "org-seeded", "description": "Seeded",
             "admins": [{{"username": "root-admin"}}]}}],
            "support": [{{"username": "ops"}}]}}"#
    )
    .unwrap();

    let mut config = test_config();
    config.seed_path = Some(seed.path().to_path_buf());
    let app = spawn_app_with(config).await;

    // Seeded org exists: provisioning it again returns the same root.
    let root = app
        .provisioner
        .provision_org("org-seeded", "ignored")
        .await
        .unwrap();
    assert_eq!(root.description, "Seeded");

    // The seeded admin can read its organization root over gRPC.
    let admin = Principal::user("root-admin", "org-seeded");
    let mut client = app.client.clone();
    let group = client
        .get_group(as_caller(
            &admin,
            GetGroupRequest {
                group_id: "org-seeded".to_string(),
            },
        ))
        .await
        .expect("seeded admin cannot read its org")
        .into_inner();
    assert_eq!(group.group_id, "org-seeded");
}
