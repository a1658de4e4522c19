//! Transactional storage for groups, grants, serials and certificates.
//!
//! Every custody operation runs against one [`CustodyTx`]. Writes become
//! visible to other transactions only after [`CustodyTx::commit`]; dropping a
//! transaction discards them.

mod database;
mod memory;

pub use database::PgStore;
pub use memory::MemoryStore;

use async_trait::async_trait;

use super::error::StoreError;
use crate::models::{AccountType, DomainCertificate, Group, Principal, Role, RoleGrant, SerialRecord};

#[async_trait]
pub trait CustodyStore: Send + Sync {
    /// Start a serializable transaction.
    async fn begin<'a>(&'a self) -> Result<Box<dyn CustodyTx + 'a>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CustodyTx: Send {
    // Accounts
    async fn account_exists(&mut self, principal: &Principal) -> Result<bool, StoreError>;
    async fn insert_account(&mut self, principal: &Principal) -> Result<(), StoreError>;
    async fn is_support(
        &mut self,
        username: &str,
        account_type: AccountType,
    ) -> Result<bool, StoreError>;
    async fn insert_support(
        &mut self,
        username: &str,
        account_type: AccountType,
    ) -> Result<(), StoreError>;

    // Groups
    async fn group(&mut self, group_id: &str) -> Result<Option<Group>, StoreError>;
    async fn child_group_ids(&mut self, group_id: &str) -> Result<Vec<String>, StoreError>;
    async fn insert_group(&mut self, group: &Group) -> Result<(), StoreError>;
    /// Delete a group together with the grants attached to it.
    async fn delete_group(&mut self, group_id: &str) -> Result<(), StoreError>;

    // Grants
    async fn grant(
        &mut self,
        principal: &Principal,
        group_id: &str,
    ) -> Result<Option<Role>, StoreError>;
    async fn grants_on_group(&mut self, group_id: &str) -> Result<Vec<RoleGrant>, StoreError>;
    async fn grants_for_principal(
        &mut self,
        principal: &Principal,
    ) -> Result<Vec<RoleGrant>, StoreError>;
    async fn insert_grant(&mut self, grant: &RoleGrant) -> Result<(), StoreError>;
    async fn delete_grant(&mut self, principal: &Principal, group_id: &str)
        -> Result<(), StoreError>;

    // Serials
    async fn serial(&mut self, serial_number: &str) -> Result<Option<SerialRecord>, StoreError>;
    async fn insert_serial(&mut self, record: &SerialRecord) -> Result<(), StoreError>;
    async fn serial_group_ids(&mut self, serial_number: &str) -> Result<Vec<String>, StoreError>;
    async fn group_serials(&mut self, group_id: &str) -> Result<Vec<String>, StoreError>;
    async fn add_serial_membership(
        &mut self,
        serial_number: &str,
        group_id: &str,
    ) -> Result<(), StoreError>;
    async fn remove_serial_membership(
        &mut self,
        serial_number: &str,
        group_id: &str,
    ) -> Result<(), StoreError>;

    // Certificates
    async fn certificate(&mut self, cert_id: &str)
        -> Result<Option<DomainCertificate>, StoreError>;
    async fn certificate_id_by_der(
        &mut self,
        group_id: &str,
        certificate_der: &[u8],
    ) -> Result<Option<String>, StoreError>;
    async fn group_certificate_ids(&mut self, group_id: &str) -> Result<Vec<String>, StoreError>;
    async fn insert_certificate(&mut self, cert: &DomainCertificate) -> Result<(), StoreError>;
    async fn delete_certificate(&mut self, cert_id: &str) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
