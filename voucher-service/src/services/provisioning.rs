//! Out-of-band provisioning: organizations, accounts, serial numbers and
//! SUPPORT principals.
//!
//! These entry points stand in for the identity system and the device
//! manufacturing line. They are not part of the public RPC surface.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;
use service_core::error::AppError;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::error::CustodyError;
use super::store::CustodyStore;
use crate::models::{AccountType, Group, Principal, Role, RoleGrant, SerialRecord};

#[derive(Clone)]
pub struct Provisioner {
    store: Arc<dyn CustodyStore>,
}

impl Provisioner {
    pub fn new(store: Arc<dyn CustodyStore>) -> Self {
        Self { store }
    }

    /// Create the root group of `org_id`. Returns the existing root if the
    /// organization is already provisioned.
    pub async fn provision_org(
        &self,
        org_id: &str,
        description: &str,
    ) -> Result<Group, CustodyError> {
        if org_id.is_empty() {
            return Err(CustodyError::invalid_argument("org_id is required"));
        }

        let mut tx = self.store.begin().await?;
        if let Some(existing) = tx.group(org_id).await? {
            if existing.is_root() {
                debug!(org_id, "Organization already provisioned");
                return Ok(existing);
            }
            return Err(CustodyError::already_exists(format!(
                "group {} exists and is not an organization root",
                org_id
            )));
        }

        let root = Group::root(org_id, description);
        tx.insert_group(&root).await?;
        tx.commit().await?;

        info!(org_id, "Organization provisioned");
        Ok(root)
    }

    pub async fn register_account(&self, principal: &Principal) -> Result<(), CustodyError> {
        let mut tx = self.store.begin().await?;
        tx.insert_account(principal).await?;
        tx.commit().await?;
        debug!(principal = %principal, "Account registered");
        Ok(())
    }

    /// Register a device serial; it starts out in its organization root.
    pub async fn register_serial(&self, record: SerialRecord) -> Result<(), CustodyError> {
        let mut tx = self.store.begin().await?;
        match tx.group(&record.org_id).await? {
            Some(root) if root.is_root() => {}
            _ => {
                return Err(CustodyError::failed_precondition(format!(
                    "organization {} is not provisioned",
                    record.org_id
                )))
            }
        }
        if tx.serial(&record.serial_number).await?.is_some() {
            return Err(CustodyError::already_exists(format!(
                "serial {} already registered",
                record.serial_number
            )));
        }

        tx.insert_serial(&record).await?;
        tx.add_serial_membership(&record.serial_number, &record.org_id)
            .await?;
        tx.commit().await?;

        info!(serial_number = %record.serial_number, org_id = %record.org_id, "Serial registered");
        Ok(())
    }

    pub async fn grant_support(
        &self,
        username: &str,
        account_type: AccountType,
    ) -> Result<(), CustodyError> {
        let mut tx = self.store.begin().await?;
        tx.insert_support(username, account_type).await?;
        tx.commit().await?;
        info!(username, account_type = %account_type, "SUPPORT granted");
        Ok(())
    }

    /// Register `principal` and make it ADMIN of its organization root.
    ///
    /// An account that is already registered keeps whatever grants it has,
    /// so re-applying a seed never restores a role revoked since.
    pub async fn bootstrap_admin(&self, principal: &Principal) -> Result<(), CustodyError> {
        let mut tx = self.store.begin().await?;
        match tx.group(&principal.org_id).await? {
            Some(root) if root.is_root() => {}
            _ => {
                return Err(CustodyError::failed_precondition(format!(
                    "organization {} is not provisioned",
                    principal.org_id
                )))
            }
        }

        if tx.account_exists(principal).await? {
            debug!(principal = %principal, "Admin already registered, grants left as-is");
            return Ok(());
        }

        tx.insert_account(principal).await?;
        tx.insert_grant(&RoleGrant {
            principal: principal.clone(),
            group_id: principal.org_id.clone(),
            role: Role::Admin,
        })
        .await?;
        tx.commit().await?;

        info!(principal = %principal, "Organization admin bootstrapped");
        Ok(())
    }
}

/// Startup seed document.
///
/// ```json
/// {
///   "organizations": [{
///     "org_id": "org-acme",
///     "description": "Acme",
///     "admins": [{"username": "alice"}],
///     "accounts": [{"username": "bot", "account_type": "service"}],
///     "serials": [{"serial_number": "SN1", "vendor_ien": "32473",
///                  "public_key_der_b64": "MFkw..."}]
///   }],
///   "support": [{"username": "ops"}]
/// }
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub organizations: Vec<SeedOrganization>,
    #[serde(default)]
    pub support: Vec<SeedAccount>,
}

#[derive(Debug, Deserialize)]
pub struct SeedOrganization {
    pub org_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub admins: Vec<SeedAccount>,
    #[serde(default)]
    pub accounts: Vec<SeedAccount>,
    #[serde(default)]
    pub serials: Vec<SeedSerial>,
}

#[derive(Debug, Deserialize)]
pub struct SeedAccount {
    pub username: String,
    #[serde(default = "default_account_type")]
    pub account_type: AccountType,
}

fn default_account_type() -> AccountType {
    AccountType::User
}

#[derive(Debug, Deserialize)]
pub struct SeedSerial {
    pub serial_number: String,
    pub vendor_ien: String,
    pub public_key_der_b64: Option<String>,
    pub mac_addr: Option<String>,
}

impl SeedFile {
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!(
                "Failed to read seed file {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!(
                "Invalid seed file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Apply through `provisioner`. Entries already present are skipped, so
    /// the same seed can be applied on every start.
    pub async fn apply(&self, provisioner: &Provisioner) -> Result<(), CustodyError> {
        for org in &self.organizations {
            provisioner
                .provision_org(&org.org_id, &org.description)
                .await?;

            for admin in &org.admins {
                let principal = Principal::new(&admin.username, admin.account_type, &org.org_id);
                provisioner.bootstrap_admin(&principal).await?;
            }
            for account in &org.accounts {
                let principal =
                    Principal::new(&account.username, account.account_type, &org.org_id);
                provisioner.register_account(&principal).await?;
            }
            for serial in &org.serials {
                let public_key_der = serial
                    .public_key_der_b64
                    .as_deref()
                    .map(|b64| STANDARD.decode(b64))
                    .transpose()
                    .map_err(|e| {
                        CustodyError::invalid_argument(format!(
                            "serial {}: invalid public_key_der_b64: {}",
                            serial.serial_number, e
                        ))
                    })?;
                let record = SerialRecord {
                    serial_number: serial.serial_number.clone(),
                    org_id: org.org_id.clone(),
                    public_key_der,
                    mac_addr: serial.mac_addr.clone(),
                    vendor_ien: serial.vendor_ien.clone(),
                };
                match provisioner.register_serial(record).await {
                    Ok(()) | Err(CustodyError::AlreadyExists(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        for support in &self.support {
            provisioner
                .grant_support(&support.username, support.account_type)
                .await?;
        }

        info!(
            organizations = self.organizations.len(),
            support = self.support.len(),
            "Seed applied"
        );
        Ok(())
    }
}
