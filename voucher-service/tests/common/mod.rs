//! Common test utilities for voucher-service integration tests.
#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use prost_types::Timestamp;
use service_core::config::Config as CommonConfig;
use std::path::PathBuf;
use std::sync::Once;
use tonic::transport::Channel;
use tonic::Request;
use voucher_service::config::{SigningConfig, StorageBackend, StorageConfig, VoucherConfig};
use voucher_service::grpc::proto::{voucher_service_client::VoucherServiceClient, User};
use voucher_service::models::{Principal, SerialRecord};
use voucher_service::services::{Provisioner, VoucherSigner};
use voucher_service::startup::Application;

static INIT: Once = Once::new();

pub const ORG: &str = "org-acme";
pub const VENDOR_IEN: &str = "32473";

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,voucher_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

pub fn fixture(name: &str) -> Vec<u8> {
    std::fs::read(fixture_path(name)).expect("Failed to read fixture")
}

pub fn domain_cert() -> Vec<u8> {
    fixture("domain_cert_a.der")
}

pub fn other_domain_cert() -> Vec<u8> {
    fixture("domain_cert_b.der")
}

pub fn device_key() -> Vec<u8> {
    fixture("device_pubkey.der")
}

pub fn masa_signer() -> VoucherSigner {
    VoucherSigner::from_files(
        &fixture_path("masa_key.pem"),
        &fixture_path("masa_cert.pem"),
    )
    .expect("Failed to load MASA signer")
}

pub fn test_config() -> VoucherConfig {
    VoucherConfig {
        common: CommonConfig::ephemeral(),
        service_name: "voucher-service-test".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        storage: StorageConfig {
            backend: StorageBackend::Memory,
            database: None,
        },
        signing: SigningConfig {
            key_path: fixture_path("masa_key.pem"),
            cert_path: fixture_path("masa_cert.pem"),
        },
        seed_path: None,
    }
}

pub struct TestApp {
    pub http_port: u16,
    pub grpc_port: u16,
    pub client: VoucherServiceClient<Channel>,
    pub provisioner: Provisioner,
    pub alice: Principal,
}

impl TestApp {
    pub fn http_url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.http_port, path)
    }

    /// Register `username` in org-acme without any role.
    pub async fn register(&self, username: &str) -> Principal {
        let principal = Principal::user(username, ORG);
        self.provisioner
            .register_account(&principal)
            .await
            .expect("Failed to register account");
        principal
    }

    pub async fn register_serial(&self, serial_number: &str, public_key: Option<Vec<u8>>) {
        self.provisioner
            .register_serial(SerialRecord {
                serial_number: serial_number.to_string(),
                org_id: ORG.to_string(),
                public_key_der: public_key,
                mac_addr: Some("02:00:00:00:00:01".to_string()),
                vendor_ien: VENDOR_IEN.to_string(),
            })
            .await
            .expect("Failed to register serial");
    }
}

/// Spawn the application on ephemeral ports with org-acme provisioned and
/// alice as its root ADMIN.
pub async fn spawn_app() -> TestApp {
    spawn_app_with(test_config()).await
}

pub async fn spawn_app_with(config: VoucherConfig) -> TestApp {
    init_tracing();

    let app = Application::build(config)
        .await
        .expect("Failed to build application");

    let http_port = app.http_port();
    let grpc_port = app.grpc_port();
    let provisioner = app.provisioner();
    let grpc_addr = format!("http://127.0.0.1:{}", grpc_port);

    // Start the application in the background
    tokio::spawn(async move {
        app.run_until_stopped().await.ok();
    });

    // Wait for server to be ready with retry
    let client = {
        let mut attempts = 0;
        loop {
            match VoucherServiceClient::connect(grpc_addr.clone()).await {
                Ok(client) => break client,
                Err(_) if attempts < 20 => {
                    attempts += 1;
                    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
                }
                Err(e) => panic!("Failed to connect gRPC client after 20 attempts: {}", e),
            }
        }
    };

    provisioner
        .provision_org(ORG, "Acme Corp")
        .await
        .expect("Failed to provision org");
    let alice = Principal::user("alice", ORG);
    provisioner
        .bootstrap_admin(&alice)
        .await
        .expect("Failed to bootstrap admin");

    TestApp {
        http_port,
        grpc_port,
        client,
        provisioner,
        alice,
    }
}

/// Wrap `message` in a request carrying `caller`'s identity metadata.
pub fn as_caller<T>(caller: &Principal, message: T) -> Request<T> {
    let mut request = Request::new(message);
    let metadata = request.metadata_mut();
    metadata.insert("x-username", caller.username.parse().unwrap());
    metadata.insert("x-account-type", caller.account_type.as_str().parse().unwrap());
    metadata.insert("x-org-id", caller.org_id.parse().unwrap());
    request
}

pub fn proto_user(principal: &Principal) -> Option<User> {
    Some(User {
        username: principal.username.clone(),
        account_type: principal.account_type.to_proto(),
        org_id: principal.org_id.clone(),
    })
}

pub fn timestamp(dt: DateTime<Utc>) -> Option<Timestamp> {
    Some(Timestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos() as i32,
    })
}

pub fn in_days(days: i64) -> Option<Timestamp> {
    timestamp(Utc::now() + Duration::days(days))
}
