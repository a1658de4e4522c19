//! Caller identity from request metadata.
//!
//! Authentication happens upstream; this service trusts the identity headers
//! it is handed and only checks that they are complete.

use service_core::error::AppError;
use tonic::metadata::MetadataMap;

use crate::grpc::proto;
use crate::models::{AccountType, Principal};

pub const USERNAME_KEY: &str = "x-username";
pub const ACCOUNT_TYPE_KEY: &str = "x-account-type";
pub const ORG_ID_KEY: &str = "x-org-id";

fn header<'a>(metadata: &'a MetadataMap, key: &str) -> Result<&'a str, AppError> {
    metadata
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Unauthenticated(anyhow::anyhow!("missing {} metadata", key)))
}

/// Resolve the calling principal.
pub fn caller_from_metadata(metadata: &MetadataMap) -> Result<Principal, AppError> {
    let username = header(metadata, USERNAME_KEY)?;
    let account_type: AccountType = header(metadata, ACCOUNT_TYPE_KEY)?
        .parse()
        .map_err(|e: String| AppError::Unauthenticated(anyhow::anyhow!(e)))?;
    let org_id = header(metadata, ORG_ID_KEY)?;
    Ok(Principal::new(username, account_type, org_id))
}

/// Resolve the principal named in a request body.
pub fn principal_from_proto(user: Option<proto::User>) -> Result<Principal, AppError> {
    let user =
        user.ok_or_else(|| AppError::InvalidArgument(anyhow::anyhow!("user is required")))?;
    if user.username.is_empty() || user.org_id.is_empty() {
        return Err(AppError::InvalidArgument(anyhow::anyhow!(
            "user.username and user.org_id are required"
        )));
    }
    let account_type = AccountType::from_proto(user.account_type).ok_or_else(|| {
        AppError::InvalidArgument(anyhow::anyhow!("user.account_type is required"))
    })?;
    Ok(Principal::new(user.username, account_type, user.org_id))
}

pub fn principal_to_proto(principal: &Principal) -> proto::User {
    proto::User {
        username: principal.username.clone(),
        account_type: principal.account_type.to_proto(),
        org_id: principal.org_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(pairs: &[(&'static str, &'static str)]) -> MetadataMap {
        let mut map = MetadataMap::new();
        for (k, v) in pairs {
            map.insert(*k, v.parse().unwrap());
        }
        map
    }

    #[test]
    fn complete_identity_resolves() {
        let map = metadata(&[
            (USERNAME_KEY, "alice"),
            (ACCOUNT_TYPE_KEY, "service"),
            (ORG_ID_KEY, "org-acme"),
        ]);
        let caller = caller_from_metadata(&map).unwrap();
        assert_eq!(
            caller,
            Principal::new("alice", AccountType::Service, "org-acme")
        );
    }

    #[test]
    fn missing_or_bad_identity_is_unauthenticated() {
        let cases = [
            metadata(&[(USERNAME_KEY, "alice"), (ACCOUNT_TYPE_KEY, "user")]),
            metadata(&[
                (USERNAME_KEY, " "),
                (ACCOUNT_TYPE_KEY, "user"),
                (ORG_ID_KEY, "org-acme"),
            ]),
            metadata(&[
                (USERNAME_KEY, "alice"),
                (ACCOUNT_TYPE_KEY, "robot"),
                (ORG_ID_KEY, "org-acme"),
            ]),
        ];
        for map in cases {
            let err = caller_from_metadata(&map).unwrap_err();
            assert!(matches!(err, AppError::Unauthenticated(_)));
        }
    }

    #[test]
    fn body_principal_needs_account_type() {
        let user = proto::User {
            username: "bob".into(),
            account_type: 0,
            org_id: "org-acme".into(),
        };
        assert!(principal_from_proto(Some(user)).is_err());
        assert!(principal_from_proto(None).is_err());

        let bob = Principal::user("bob", "org-acme");
        assert_eq!(
            principal_from_proto(Some(principal_to_proto(&bob))).unwrap(),
            bob
        );
    }
}
