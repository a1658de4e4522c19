//! Domain certificate integration tests.

mod common;

use chrono::{Duration, Utc};
use common::{as_caller, domain_cert, in_days, other_domain_cert, spawn_app, timestamp, ORG};
use tonic::Code;
use voucher_service::grpc::proto::{
    CreateDomainCertRequest, DeleteDomainCertRequest, GetDomainCertRequest, GetGroupRequest,
};

#[tokio::test]
async fn test_domain_cert_lifecycle() {
    let mut app = spawn_app().await;
    let alice = app.alice.clone();
    let expiry = Utc::now() + Duration::days(90);

    let cert_id = app
        .client
        .create_domain_cert(as_caller(
            &alice,
            CreateDomainCertRequest {
                group_id: ORG.to_string(),
                certificate_der: domain_cert(),
                revocation_checks: true,
                expiry_time: timestamp(expiry),
            },
        ))
        .await
        .expect("CreateDomainCert failed")
        .into_inner()
        .cert_id;

    let cert = app
        .client
        .get_domain_cert(as_caller(
            &alice,
            GetDomainCertRequest {
                cert_id: cert_id.clone(),
            },
        ))
        .await
        .expect("GetDomainCert failed")
        .into_inner();
    assert_eq!(cert.group_id, ORG);
    assert_eq!(cert.certificate_der, domain_cert());
    assert!(cert.revocation_checks);
    assert_eq!(cert.expiry_time, timestamp(expiry));

    let group = app
        .client
        .get_group(as_caller(
            &alice,
            GetGroupRequest {
                group_id: ORG.to_string(),
            },
        ))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(group.cert_ids, vec![cert_id.clone()]);

    app.client
        .delete_domain_cert(as_caller(
            &alice,
            DeleteDomainCertRequest {
                cert_id: cert_id.clone(),
            },
        ))
        .await
        .expect("DeleteDomainCert failed");

    let status = app
        .client
        .get_domain_cert(as_caller(&alice, GetDomainCertRequest { cert_id }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
}

#[tokio::test]
async fn test_expiry_must_be_in_the_future() {
    let mut app = spawn_app().await;
    let alice = app.alice.clone();

    for expiry_time in [timestamp(Utc::now()), in_days(-1), None] {
        let status = app
            .client
            .create_domain_cert(as_caller(
                &alice,
                CreateDomainCertRequest {
                    group_id: ORG.to_string(),
                    certificate_der: domain_cert(),
                    revocation_checks: false,
                    expiry_time,
                },
            ))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }
}

#[tokio::test]
async fn test_duplicate_and_malformed_certificates() {
    let mut app = spawn_app().await;
    let alice = app.alice.clone();
    let request = |der: Vec<u8>| CreateDomainCertRequest {
        group_id: ORG.to_string(),
        certificate_der: der,
        revocation_checks: false,
        expiry_time: in_days(30),
    };

    app.client
        .create_domain_cert(as_caller(&alice, request(domain_cert())))
        .await
        .unwrap();
    let status = app
        .client
        .create_domain_cert(as_caller(&alice, request(domain_cert())))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::AlreadyExists);

    app.client
        .create_domain_cert(as_caller(&alice, request(other_domain_cert())))
        .await
        .expect("a different certificate is accepted");

    let status = app
        .client
        .create_domain_cert(as_caller(&alice, request(b"garbage".to_vec())))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_cert_access_is_group_scoped() {
    let mut app = spawn_app().await;
    let alice = app.alice.clone();
    let bob = app.register("bob").await;

    let cert_id = app
        .client
        .create_domain_cert(as_caller(
            &alice,
            CreateDomainCertRequest {
                group_id: ORG.to_string(),
                certificate_der: domain_cert(),
                revocation_checks: false,
                expiry_time: in_days(30),
            },
        ))
        .await
        .unwrap()
        .into_inner()
        .cert_id;

    let status = app
        .client
        .get_domain_cert(as_caller(
            &bob,
            GetDomainCertRequest {
                cert_id: cert_id.clone(),
            },
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::PermissionDenied);

    let status = app
        .client
        .delete_domain_cert(as_caller(&bob, DeleteDomainCertRequest { cert_id }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::PermissionDenied);

    let status = app
        .client
        .create_domain_cert(as_caller(
            &bob,
            CreateDomainCertRequest {
                group_id: ORG.to_string(),
                certificate_der: other_domain_cert(),
                revocation_checks: false,
                expiry_time: in_days(30),
            },
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::PermissionDenied);
}
