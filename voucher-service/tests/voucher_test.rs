//! Ownership voucher integration tests.

mod common;

use chrono::{Duration, Utc};
use cms::content_info::ContentInfo;
use cms::signed_data::SignedData;
use der::{Decode, Encode};
use common::{
    as_caller, device_key, domain_cert, in_days, masa_signer, spawn_app, timestamp, TestApp, ORG,
    VENDOR_IEN,
};
use tonic::Code;
use voucher_service::grpc::proto::{CreateDomainCertRequest, GetOwnershipVoucherRequest};
use voucher_service::services::voucher::ID_CT_ANIMA_JSON_VOUCHER;

async fn cert_in_root(app: &mut TestApp) -> String {
    let alice = app.alice.clone();
    app.client
        .create_domain_cert(as_caller(
            &alice,
            CreateDomainCertRequest {
                group_id: ORG.to_string(),
                certificate_der: domain_cert(),
                revocation_checks: true,
                expiry_time: in_days(365),
            },
        ))
        .await
        .expect("CreateDomainCert failed")
        .into_inner()
        .cert_id
}

#[tokio::test]
async fn test_voucher_decodes_to_requested_binding() {
    let mut app = spawn_app().await;
    let alice = app.alice.clone();
    app.register_serial("SN123", Some(device_key())).await;
    let cert_id = cert_in_root(&mut app).await;
    let lifetime = Utc::now() + Duration::days(7);

    let response = app
        .client
        .get_ownership_voucher(as_caller(
            &alice,
            GetOwnershipVoucherRequest {
                serial_number: "SN123".to_string(),
                cert_id,
                lifetime: timestamp(lifetime),
                ien: VENDOR_IEN.to_string(),
            },
        ))
        .await
        .expect("GetOwnershipVoucher failed")
        .into_inner();
    assert_eq!(response.public_key_der, device_key());

    // CMS envelope carries the JSON voucher content type.
    let content_info = ContentInfo::from_der(&response.voucher).unwrap();
    let signed_data = SignedData::from_der(&content_info.content.to_der().unwrap()).unwrap();
    assert_eq!(
        signed_data.encap_content_info.econtent_type,
        ID_CT_ANIMA_JSON_VOUCHER
    );

    let voucher = masa_signer().verify(&response.voucher).unwrap();
    assert_eq!(voucher.serial_number, "SN123");
    assert_eq!(voucher.device_public_key, device_key());
    assert_eq!(voucher.pinned_domain_cert, domain_cert());
    assert!(voucher.domain_cert_revocation_checks);
    assert_eq!(voucher.expires_on, lifetime);
    assert_eq!(voucher.assertion, "verified");
}

#[tokio::test]
async fn test_ien_mismatch_is_invalid_argument() {
    let mut app = spawn_app().await;
    let alice = app.alice.clone();
    app.register_serial("SN123", Some(device_key())).await;
    let cert_id = cert_in_root(&mut app).await;

    let status = app
        .client
        .get_ownership_voucher(as_caller(
            &alice,
            GetOwnershipVoucherRequest {
                serial_number: "SN123".to_string(),
                cert_id,
                lifetime: in_days(1),
                ien: "1".to_string(),
            },
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_voucher_preconditions() {
    let mut app = spawn_app().await;
    let alice = app.alice.clone();
    let bob = app.register("bob").await;
    app.register_serial("SN123", Some(device_key())).await;
    app.register_serial("SN-NOKEY", None).await;
    let cert_id = cert_in_root(&mut app).await;

    let request = |serial: &str, lifetime| GetOwnershipVoucherRequest {
        serial_number: serial.to_string(),
        cert_id: cert_id.clone(),
        lifetime,
        ien: VENDOR_IEN.to_string(),
    };

    let cases = [
        (&alice, request("SN-UNKNOWN", in_days(1)), Code::NotFound),
        (&alice, request("SN-NOKEY", in_days(1)), Code::NotFound),
        (&alice, request("SN123", None), Code::InvalidArgument),
        (&alice, request("SN123", in_days(-1)), Code::InvalidArgument),
        (&bob, request("SN123", in_days(1)), Code::PermissionDenied),
    ];

    for (caller, message, code) in cases {
        let status = app
            .client
            .get_ownership_voucher(as_caller(caller, message))
            .await
            .unwrap_err();
        assert_eq!(status.code(), code, "{}", status.message());
    }
}
