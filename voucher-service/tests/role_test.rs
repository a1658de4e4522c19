//! Role grant integration tests.

mod common;

use common::{as_caller, proto_user, spawn_app, ORG};
use tonic::Code;
use voucher_service::grpc::proto::{
    AddUserRoleRequest, CreateGroupRequest, GetGroupRequest, GetUserRoleRequest,
    RemoveUserRoleRequest, Role as ProtoRole,
};

#[tokio::test]
async fn test_grant_and_revoke_role() {
    let mut app = spawn_app().await;
    let alice = app.alice.clone();
    let bob = app.register("bob").await;

    app.client
        .add_user_role(as_caller(
            &alice,
            AddUserRoleRequest {
                user: proto_user(&bob),
                group_id: ORG.to_string(),
                role: ProtoRole::Assigner as i32,
            },
        ))
        .await
        .expect("AddUserRole failed");

    let roles = app
        .client
        .get_user_role(as_caller(
            &alice,
            GetUserRoleRequest {
                user: proto_user(&bob),
            },
        ))
        .await
        .unwrap()
        .into_inner()
        .group_roles;
    assert_eq!(roles.get(ORG), Some(&(ProtoRole::Assigner as i32)));

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
    assert_eq!(group.user_roles.len(), 2);

    app.client
        .remove_user_role(as_caller(
            &alice,
            RemoveUserRoleRequest {
                user: proto_user(&bob),
                group_id: ORG.to_string(),
                role: ProtoRole::Assigner as i32,
            },
        ))
        .await
        .expect("RemoveUserRole failed");

    let roles = app
        .client
        .get_user_role(as_caller(
            &alice,
            GetUserRoleRequest {
                user: proto_user(&bob),
            },
        ))
        .await
        .unwrap()
        .into_inner()
        .group_roles;
    assert!(roles.is_empty());
}

#[tokio::test]
async fn test_identical_grant_twice_is_already_exists() {
    let mut app = spawn_app().await;
    let alice = app.alice.clone();
    let bob = app.register("bob").await;

    let request = || AddUserRoleRequest {
        user: proto_user(&bob),
        group_id: ORG.to_string(),
        role: ProtoRole::Requestor as i32,
    };

    app.client
        .add_user_role(as_caller(&alice, request()))
        .await
        .unwrap();
    let status = app
        .client
        .add_user_role(as_caller(&alice, request()))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::AlreadyExists);

    // A different role on the same group must be removed first.
    let status = app
        .client
        .add_user_role(as_caller(
            &alice,
            AddUserRoleRequest {
                role: ProtoRole::Admin as i32,
                ..request()
            },
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::AlreadyExists);

    let roles = app
        .client
        .get_user_role(as_caller(
            &alice,
            GetUserRoleRequest {
                user: proto_user(&bob),
            },
        ))
        .await
        .unwrap()
        .into_inner()
        .group_roles;
    assert_eq!(roles.len(), 1);
    assert_eq!(roles.get(ORG), Some(&(ProtoRole::Requestor as i32)));
}

#[tokio::test]
async fn test_role_errors() {
    let mut app = spawn_app().await;
    let alice = app.alice.clone();
    let bob = app.register("bob").await;
    let ghost = voucher_service::models::Principal::user("ghost", ORG);

    // Unregistered user
    let status = app
        .client
        .add_user_role(as_caller(
            &alice,
            AddUserRoleRequest {
                user: proto_user(&ghost),
                group_id: ORG.to_string(),
                role: ProtoRole::Requestor as i32,
            },
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);

    // Unknown group
    let status = app
        .client
        .add_user_role(as_caller(
            &alice,
            AddUserRoleRequest {
                user: proto_user(&bob),
                group_id: "no-such-group".to_string(),
                role: ProtoRole::Requestor as i32,
            },
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);

    // Unspecified role
    let status = app
        .client
        .add_user_role(as_caller(
            &alice,
            AddUserRoleRequest {
                user: proto_user(&bob),
                group_id: ORG.to_string(),
                role: ProtoRole::Unspecified as i32,
            },
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    // SUPPORT is never assignable
    let status = app
        .client
        .add_user_role(as_caller(
            &alice,
            AddUserRoleRequest {
                user: proto_user(&bob),
                group_id: ORG.to_string(),
                role: ProtoRole::Support as i32,
            },
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::PermissionDenied);

    // Nothing to remove
    let status = app
        .client
        .remove_user_role(as_caller(
            &alice,
            RemoveUserRoleRequest {
                user: proto_user(&bob),
                group_id: ORG.to_string(),
                role: ProtoRole::Requestor as i32,
            },
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);

    // Unregistered user lookup
    let status = app
        .client
        .get_user_role(as_caller(
            &alice,
            GetUserRoleRequest {
                user: proto_user(&ghost),
            },
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn test_assigner_is_limited_by_privilege_order() {
    let mut app = spawn_app().await;
    let alice = app.alice.clone();
    let bob = app.register("bob").await;
    let carol = app.register("carol").await;

    let g1 = app
        .client
        .create_group(as_caller(
            &alice,
            CreateGroupRequest {
                parent_group_id: ORG.to_string(),
                description: "g1".to_string(),
            },
        ))
        .await
        .unwrap()
        .into_inner()
        .group_id;
    app.client
        .add_user_role(as_caller(
            &alice,
            AddUserRoleRequest {
                user: proto_user(&bob),
                group_id: g1.clone(),
                role: ProtoRole::Assigner as i32,
            },
        ))
        .await
        .unwrap();

    let status = app
        .client
        .add_user_role(as_caller(
            &bob,
            AddUserRoleRequest {
                user: proto_user(&carol),
                group_id: g1.clone(),
                role: ProtoRole::Admin as i32,
            },
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::PermissionDenied);

    // bob's role on g1 does not reach the root.
    let status = app
        .client
        .add_user_role(as_caller(
            &bob,
            AddUserRoleRequest {
                user: proto_user(&carol),
                group_id: ORG.to_string(),
                role: ProtoRole::Requestor as i32,
            },
        ))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::PermissionDenied);

    app.client
        .add_user_role(as_caller(
            &bob,
            AddUserRoleRequest {
                user: proto_user(&carol),
                group_id: g1.clone(),
                role: ProtoRole::Assigner as i32,
            },
        ))
        .await
        .expect("ASSIGNER may grant ASSIGNER");

    // bob sees carol's role on g1, not alice's on the root.
    let roles = app
        .client
        .get_user_role(as_caller(
            &bob,
            GetUserRoleRequest {
                user: proto_user(&alice),
            },
        ))
        .await
        .unwrap()
        .into_inner()
        .group_roles;
    assert!(roles.is_empty());
    let roles = app
        .client
        .get_user_role(as_caller(
            &bob,
            GetUserRoleRequest {
                user: proto_user(&carol),
            },
        ))
        .await
        .unwrap()
        .into_inner()
        .group_roles;
    assert_eq!(roles.get(&g1), Some(&(ProtoRole::Assigner as i32)));
}
