//! Hierarchical authorization.
//!
//! A principal's effective role on a group is the highest role granted to
//! it on that group or any ancestor. SUPPORT principals hold SUPPORT
//! everywhere.

use std::collections::HashSet;
use tracing::{debug, warn};

use super::error::{CustodyError, StoreError};
use super::metrics::AUTHZ_DECISIONS_TOTAL;
use super::store::CustodyTx;
use crate::models::{Access, Principal, Role};

/// Highest role held by `principal` on `group_id`, or `None`.
///
/// Returns `None` for an unknown group. Fails if the parent chain loops.
pub async fn effective_role(
    tx: &mut dyn CustodyTx,
    principal: &Principal,
    group_id: &str,
) -> Result<Option<Role>, StoreError> {
    if tx
        .is_support(&principal.username, principal.account_type)
        .await?
    {
        return Ok(Some(Role::Support));
    }

    let mut best: Option<Role> = None;
    let mut visited = HashSet::new();
    let mut cursor = Some(group_id.to_string());

    while let Some(current) = cursor {
        if !visited.insert(current.clone()) {
            return Err(StoreError::CorruptTree(format!(
                "cycle through group {}",
                current
            )));
        }
        let Some(group) = tx.group(&current).await? else {
            break;
        };
        if let Some(role) = tx.grant(principal, &current).await? {
            best = best.max(Some(role));
        }
        cursor = group.parent_group_id;
    }

    Ok(best)
}

/// Require `access` on `group_id`; returns the caller's effective role.
pub async fn authorize(
    tx: &mut dyn CustodyTx,
    principal: &Principal,
    group_id: &str,
    access: Access,
) -> Result<Role, CustodyError> {
    let required = access.required_role();
    match effective_role(tx, principal, group_id).await? {
        Some(role) if role >= required => {
            AUTHZ_DECISIONS_TOTAL
                .with_label_values(&[access.as_str(), "allow"])
                .inc();
            debug!(principal = %principal, group_id, role = %role, "Access granted");
            Ok(role)
        }
        held => {
            AUTHZ_DECISIONS_TOTAL
                .with_label_values(&[access.as_str(), "deny"])
                .inc();
            warn!(
                principal = %principal,
                group_id,
                required = %required,
                held = ?held,
                "Access denied"
            );
            Err(CustodyError::permission_denied(format!(
                "requires {} on group {}",
                required, group_id
            )))
        }
    }
}

/// Whether a holder of `caller` may grant or revoke `target`.
///
/// SUPPORT is never assignable.
pub fn can_assign(caller: Role, target: Role) -> bool {
    match (caller, target) {
        (_, Role::Support) => false,
        (Role::Support | Role::Admin, _) => true,
        (Role::Assigner, Role::Assigner | Role::Requestor) => true,
        _ => false,
    }
}
