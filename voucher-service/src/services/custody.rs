//! Custody operations: the group tree, role grants, serial numbers, domain
//! certificates and voucher issuance.
//!
//! Each operation runs its lookups, authorization and writes in a single
//! store transaction. A failed operation drops the transaction uncommitted.

use chrono::{DateTime, Utc};
use der::Decode;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use x509_cert::Certificate;

use super::authorization::{authorize, can_assign, effective_role};
use super::error::{CustodyError, StoreError};
use super::metrics::VOUCHERS_ISSUED_TOTAL;
use super::store::{CustodyStore, CustodyTx};
use super::voucher::{OwnershipVoucher, VoucherSigner};
use crate::models::{Access, DomainCertificate, Group, Principal, Role, RoleGrant, SerialRecord};

pub const MAX_DESCRIPTION_CHARS: usize = 256;

/// A group with its directly attached resources.
#[derive(Debug, Clone)]
pub struct GroupDetails {
    pub group: Group,
    pub cert_ids: Vec<String>,
    pub serial_numbers: Vec<String>,
    /// Direct grants only; inherited roles are not listed.
    pub grants: Vec<RoleGrant>,
    pub child_group_ids: Vec<String>,
}

/// A serial and the groups holding it that the caller may see.
#[derive(Debug, Clone)]
pub struct SerialDetails {
    pub record: SerialRecord,
    pub group_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct IssuedVoucher {
    /// DER-encoded CMS ContentInfo.
    pub voucher: Vec<u8>,
    pub public_key_der: Vec<u8>,
}

#[derive(Clone)]
pub struct CustodyService {
    store: Arc<dyn CustodyStore>,
    signer: Arc<VoucherSigner>,
}

/// Whether `principal` holds at least the role `access` needs on `group_id`.
async fn has_access(
    tx: &mut dyn CustodyTx,
    principal: &Principal,
    group_id: &str,
    access: Access,
) -> Result<bool, StoreError> {
    Ok(effective_role(tx, principal, group_id)
        .await?
        .is_some_and(|role| role >= access.required_role()))
}

impl CustodyService {
    pub fn new(store: Arc<dyn CustodyStore>, signer: Arc<VoucherSigner>) -> Self {
        Self { store, signer }
    }

    // Groups

    #[instrument(skip(self, caller, description), fields(caller = %caller))]
    pub async fn create_group(
        &self,
        caller: &Principal,
        parent_group_id: &str,
        description: &str,
    ) -> Result<String, CustodyError> {
        if description.chars().count() > MAX_DESCRIPTION_CHARS {
            return Err(CustodyError::invalid_argument(format!(
                "description exceeds {} characters",
                MAX_DESCRIPTION_CHARS
            )));
        }

        let mut tx = self.store.begin().await?;
        let parent = tx.group(parent_group_id).await?.ok_or_else(|| {
            CustodyError::not_found(format!("parent group {} not found", parent_group_id))
        })?;
        authorize(tx.as_mut(), caller, &parent.group_id, Access::Structure).await?;

        let group = Group::child_of(&parent, description);
        tx.insert_group(&group).await?;
        tx.commit().await?;

        info!(group_id = %group.group_id, org_id = %group.org_id, "Group created");
        Ok(group.group_id)
    }

    #[instrument(skip(self, caller), fields(caller = %caller))]
    pub async fn delete_group(&self, caller: &Principal, group_id: &str) -> Result<(), CustodyError> {
        let mut tx = self.store.begin().await?;
        let group = tx
            .group(group_id)
            .await?
            .ok_or_else(|| CustodyError::not_found(format!("group {} not found", group_id)))?;
        let Some(parent_id) = group.parent_group_id.as_deref() else {
            return Err(CustodyError::failed_precondition(format!(
                "group {} is an organization root",
                group_id
            )));
        };
        authorize(tx.as_mut(), caller, parent_id, Access::Structure).await?;

        let not_empty = !tx.child_group_ids(group_id).await?.is_empty()
            || !tx.group_serials(group_id).await?.is_empty()
            || !tx.group_certificate_ids(group_id).await?.is_empty();
        if not_empty {
            return Err(CustodyError::failed_precondition(format!(
                "group {} is not empty",
                group_id
            )));
        }

        tx.delete_group(group_id).await?;
        tx.commit().await?;

        info!(group_id, "Group deleted");
        Ok(())
    }

    #[instrument(skip(self, caller), fields(caller = %caller))]
    pub async fn get_group(
        &self,
        caller: &Principal,
        group_id: &str,
    ) -> Result<GroupDetails, CustodyError> {
        let mut tx = self.store.begin().await?;
        let group = tx
            .group(group_id)
            .await?
            .ok_or_else(|| CustodyError::not_found(format!("group {} not found", group_id)))?;
        authorize(tx.as_mut(), caller, group_id, Access::Read).await?;

        Ok(GroupDetails {
            cert_ids: tx.group_certificate_ids(group_id).await?,
            serial_numbers: tx.group_serials(group_id).await?,
            grants: tx.grants_on_group(group_id).await?,
            child_group_ids: tx.child_group_ids(group_id).await?,
            group,
        })
    }

    // Roles

    #[instrument(skip(self, caller, user), fields(caller = %caller, user = %user))]
    pub async fn add_user_role(
        &self,
        caller: &Principal,
        user: &Principal,
        group_id: &str,
        role: Option<Role>,
    ) -> Result<(), CustodyError> {
        let role = role.ok_or_else(|| CustodyError::invalid_argument("role is required"))?;

        let mut tx = self.store.begin().await?;
        let group = tx.group(group_id).await?.ok_or_else(|| {
            CustodyError::failed_precondition(format!("group {} does not exist", group_id))
        })?;
        if !tx.account_exists(user).await? {
            return Err(CustodyError::failed_precondition(format!(
                "account {} does not exist",
                user
            )));
        }
        if user.org_id != group.org_id {
            return Err(CustodyError::failed_precondition(format!(
                "account {} belongs to another organization than group {}",
                user, group_id
            )));
        }

        let caller_role = authorize(tx.as_mut(), caller, group_id, Access::Write).await?;
        if !can_assign(caller_role, role) {
            warn!(caller_role = %caller_role, role = %role, "Role assignment denied");
            return Err(CustodyError::permission_denied(format!(
                "{} may not assign {}",
                caller_role, role
            )));
        }

        match tx.grant(user, group_id).await? {
            Some(existing) if existing == role => {
                return Err(CustodyError::already_exists(format!(
                    "{} already holds {} on group {}",
                    user, role, group_id
                )));
            }
            Some(existing) => {
                return Err(CustodyError::already_exists(format!(
                    "{} holds {} on group {}; remove it first",
                    user, existing, group_id
                )));
            }
            None => {}
        }

        tx.insert_grant(&RoleGrant {
            principal: user.clone(),
            group_id: group_id.to_string(),
            role,
        })
        .await?;
        tx.commit().await?;

        info!(group_id, role = %role, "Role granted");
        Ok(())
    }

    #[instrument(skip(self, caller, user), fields(caller = %caller, user = %user))]
    pub async fn remove_user_role(
        &self,
        caller: &Principal,
        user: &Principal,
        group_id: &str,
        role: Option<Role>,
    ) -> Result<(), CustodyError> {
        let role = role.ok_or_else(|| CustodyError::invalid_argument("role is required"))?;

        let mut tx = self.store.begin().await?;
        if tx.group(group_id).await?.is_none() {
            return Err(CustodyError::not_found(format!(
                "group {} not found",
                group_id
            )));
        }
        let caller_role = authorize(tx.as_mut(), caller, group_id, Access::Write).await?;

        let stored = tx.grant(user, group_id).await?;
        if stored != Some(role) {
            return Err(CustodyError::not_found(format!(
                "{} does not hold {} on group {}",
                user, role, group_id
            )));
        }
        if !can_assign(caller_role, role) {
            warn!(caller_role = %caller_role, role = %role, "Role revocation denied");
            return Err(CustodyError::permission_denied(format!(
                "{} may not revoke {}",
                caller_role, role
            )));
        }

        tx.delete_grant(user, group_id).await?;
        tx.commit().await?;

        info!(group_id, role = %role, "Role revoked");
        Ok(())
    }

    /// Direct grants of `user` on groups the caller can read.
    #[instrument(skip(self, caller, user), fields(caller = %caller, user = %user))]
    pub async fn get_user_role(
        &self,
        caller: &Principal,
        user: &Principal,
    ) -> Result<BTreeMap<String, Role>, CustodyError> {
        let mut tx = self.store.begin().await?;
        if !tx.account_exists(user).await? {
            return Err(CustodyError::failed_precondition(format!(
                "account {} does not exist",
                user
            )));
        }

        let mut roles = BTreeMap::new();
        for grant in tx.grants_for_principal(user).await? {
            if has_access(tx.as_mut(), caller, &grant.group_id, Access::Read).await? {
                roles.insert(grant.group_id, grant.role);
            }
        }
        Ok(roles)
    }

    // Serial numbers

    #[instrument(skip(self, caller), fields(caller = %caller))]
    pub async fn add_serial(
        &self,
        caller: &Principal,
        serial_number: &str,
        group_id: &str,
    ) -> Result<(), CustodyError> {
        let mut tx = self.store.begin().await?;
        let group = tx
            .group(group_id)
            .await?
            .ok_or_else(|| CustodyError::not_found(format!("group {} not found", group_id)))?;
        let record = tx.serial(serial_number).await?.ok_or_else(|| {
            CustodyError::not_found(format!("serial {} not found", serial_number))
        })?;
        if record.org_id != group.org_id {
            return Err(CustodyError::failed_precondition(format!(
                "serial {} belongs to another organization",
                serial_number
            )));
        }
        authorize(tx.as_mut(), caller, group_id, Access::Write).await?;

        let mut holders = tx.serial_group_ids(serial_number).await?;
        if holders.iter().any(|g| g == group_id) {
            return Err(CustodyError::already_exists(format!(
                "serial {} is already in group {}",
                serial_number, group_id
            )));
        }
        if holders.is_empty() {
            holders.push(record.org_id.clone());
        }

        let mut may_move = false;
        for holder in &holders {
            if has_access(tx.as_mut(), caller, holder, Access::Write).await? {
                may_move = true;
                break;
            }
        }
        if !may_move {
            warn!(serial_number, "Caller holds no ASSIGNER role over the serial's groups");
            return Err(CustodyError::permission_denied(format!(
                "requires ASSIGNER on a group holding serial {}",
                serial_number
            )));
        }

        tx.add_serial_membership(serial_number, group_id).await?;
        tx.commit().await?;

        info!(serial_number, group_id, "Serial added to group");
        Ok(())
    }

    #[instrument(skip(self, caller), fields(caller = %caller))]
    pub async fn remove_serial(
        &self,
        caller: &Principal,
        serial_number: &str,
        group_id: &str,
    ) -> Result<(), CustodyError> {
        let mut tx = self.store.begin().await?;
        if tx.group(group_id).await?.is_none() {
            return Err(CustodyError::not_found(format!(
                "group {} not found",
                group_id
            )));
        }
        authorize(tx.as_mut(), caller, group_id, Access::Write).await?;

        let holders = tx.serial_group_ids(serial_number).await?;
        if !holders.iter().any(|g| g == group_id) {
            return Err(CustodyError::not_found(format!(
                "serial {} is not in group {}",
                serial_number, group_id
            )));
        }

        tx.remove_serial_membership(serial_number, group_id).await?;
        tx.commit().await?;

        info!(serial_number, group_id, "Serial removed from group");
        Ok(())
    }

    #[instrument(skip(self, caller), fields(caller = %caller))]
    pub async fn get_serial(
        &self,
        caller: &Principal,
        serial_number: &str,
    ) -> Result<SerialDetails, CustodyError> {
        let mut tx = self.store.begin().await?;
        let record = tx.serial(serial_number).await?.ok_or_else(|| {
            CustodyError::not_found(format!("serial {} not found", serial_number))
        })?;

        let holders = tx.serial_group_ids(serial_number).await?;
        let denied = || {
            CustodyError::permission_denied(format!(
                "requires REQUESTOR on a group holding serial {}",
                serial_number
            ))
        };

        if holders.is_empty() {
            if !has_access(tx.as_mut(), caller, &record.org_id, Access::Read).await? {
                return Err(denied());
            }
            return Ok(SerialDetails {
                record,
                group_ids: Vec::new(),
            });
        }

        let mut visible = Vec::new();
        for group_id in holders {
            if has_access(tx.as_mut(), caller, &group_id, Access::Read).await? {
                visible.push(group_id);
            }
        }
        if visible.is_empty() {
            return Err(denied());
        }
        visible.sort();

        Ok(SerialDetails {
            record,
            group_ids: visible,
        })
    }

    // Domain certificates

    #[instrument(skip(self, caller, certificate_der), fields(caller = %caller))]
    pub async fn create_domain_cert(
        &self,
        caller: &Principal,
        group_id: &str,
        certificate_der: Vec<u8>,
        revocation_checks: bool,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<String, CustodyError> {
        let expiry =
            expiry.ok_or_else(|| CustodyError::invalid_argument("expiry_time is required"))?;
        if expiry <= Utc::now() {
            return Err(CustodyError::invalid_argument(
                "expiry_time must be in the future",
            ));
        }
        Certificate::from_der(&certificate_der).map_err(|e| {
            CustodyError::invalid_argument(format!("certificate is not valid X.509 DER: {}", e))
        })?;

        let mut tx = self.store.begin().await?;
        if tx.group(group_id).await?.is_none() {
            return Err(CustodyError::not_found(format!(
                "group {} not found",
                group_id
            )));
        }
        authorize(tx.as_mut(), caller, group_id, Access::Write).await?;

        if let Some(existing) = tx.certificate_id_by_der(group_id, &certificate_der).await? {
            return Err(CustodyError::already_exists(format!(
                "certificate already registered in group {} as {}",
                group_id, existing
            )));
        }

        let cert = DomainCertificate {
            cert_id: uuid::Uuid::new_v4().to_string(),
            group_id: group_id.to_string(),
            certificate_der,
            revocation_checks,
            expiry_utc: expiry,
            created_utc: Utc::now(),
        };
        tx.insert_certificate(&cert).await?;
        tx.commit().await?;

        info!(cert_id = %cert.cert_id, group_id, "Domain certificate created");
        Ok(cert.cert_id)
    }

    #[instrument(skip(self, caller), fields(caller = %caller))]
    pub async fn delete_domain_cert(
        &self,
        caller: &Principal,
        cert_id: &str,
    ) -> Result<(), CustodyError> {
        let mut tx = self.store.begin().await?;
        let cert = tx.certificate(cert_id).await?.ok_or_else(|| {
            CustodyError::not_found(format!("certificate {} not found", cert_id))
        })?;
        authorize(tx.as_mut(), caller, &cert.group_id, Access::Write).await?;

        tx.delete_certificate(cert_id).await?;
        tx.commit().await?;

        info!(cert_id, group_id = %cert.group_id, "Domain certificate deleted");
        Ok(())
    }

    #[instrument(skip(self, caller), fields(caller = %caller))]
    pub async fn get_domain_cert(
        &self,
        caller: &Principal,
        cert_id: &str,
    ) -> Result<DomainCertificate, CustodyError> {
        let mut tx = self.store.begin().await?;
        let cert = tx.certificate(cert_id).await?.ok_or_else(|| {
            CustodyError::not_found(format!("certificate {} not found", cert_id))
        })?;
        authorize(tx.as_mut(), caller, &cert.group_id, Access::Read).await?;
        Ok(cert)
    }

    // Vouchers

    /// Issue a signed ownership voucher pinning `cert_id` for `serial_number`.
    #[instrument(skip(self, caller), fields(caller = %caller))]
    pub async fn get_ownership_voucher(
        &self,
        caller: &Principal,
        serial_number: &str,
        cert_id: &str,
        lifetime: Option<DateTime<Utc>>,
        ien: &str,
    ) -> Result<IssuedVoucher, CustodyError> {
        let lifetime =
            lifetime.ok_or_else(|| CustodyError::invalid_argument("lifetime is required"))?;

        let voucher = {
            let mut tx = self.store.begin().await?;
            let record = tx.serial(serial_number).await?.ok_or_else(|| {
                CustodyError::not_found(format!("serial {} not found", serial_number))
            })?;
            let cert = tx.certificate(cert_id).await?.ok_or_else(|| {
                CustodyError::not_found(format!("certificate {} not found", cert_id))
            })?;
            authorize(tx.as_mut(), caller, &cert.group_id, Access::Read).await?;

            let holders = tx.serial_group_ids(serial_number).await?;
            if !holders.iter().any(|g| g == &cert.group_id) {
                return Err(CustodyError::failed_precondition(format!(
                    "serial {} is not in group {}",
                    serial_number, cert.group_id
                )));
            }

            let public_key_der = record.public_key_der.ok_or_else(|| {
                CustodyError::not_found(format!(
                    "no public key registered for serial {}",
                    serial_number
                ))
            })?;
            if record.vendor_ien != ien {
                return Err(CustodyError::invalid_argument(format!(
                    "IEN {} does not match the vendor of serial {}",
                    ien, serial_number
                )));
            }
            if lifetime <= Utc::now() {
                return Err(CustodyError::invalid_argument(
                    "lifetime must be in the future",
                ));
            }

            OwnershipVoucher::new(
                serial_number,
                cert.certificate_der,
                cert.revocation_checks,
                public_key_der,
                lifetime,
            )
        };

        let public_key_der = voucher.device_public_key.clone();
        let signer = Arc::clone(&self.signer);
        let signed = tokio::task::spawn_blocking(move || signer.sign(&voucher))
            .await
            .map_err(|e| CustodyError::Signing(e.to_string()))
            .and_then(|r| r.map_err(|e| CustodyError::Signing(e.to_string())));

        match signed {
            Ok(bytes) => {
                VOUCHERS_ISSUED_TOTAL.with_label_values(&["ok"]).inc();
                info!(serial_number, cert_id, expires_on = %lifetime, "Ownership voucher issued");
                Ok(IssuedVoucher {
                    voucher: bytes,
                    public_key_der,
                })
            }
            Err(e) => {
                VOUCHERS_ISSUED_TOTAL.with_label_values(&["error"]).inc();
                Err(e)
            }
        }
    }
}
