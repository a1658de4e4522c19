//! In-process store. One mutex guards the whole dataset, so transactions
//! are fully serialized. Writes apply in place and are reverted from an undo
//! log if the transaction is dropped without commit.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::{Mutex, MutexGuard};

use super::{CustodyStore, CustodyTx};
use crate::models::{AccountType, DomainCertificate, Group, Principal, Role, RoleGrant, SerialRecord};
use crate::services::error::StoreError;

type GrantKey = (Principal, String);
type MembershipKey = (String, String);

#[derive(Debug, Default)]
struct MemoryState {
    accounts: HashSet<Principal>,
    support: HashSet<(String, AccountType)>,
    groups: HashMap<String, Group>,
    grants: HashMap<GrantKey, Role>,
    serials: HashMap<String, SerialRecord>,
    /// (serial_number, group_id)
    memberships: BTreeSet<MembershipKey>,
    certificates: HashMap<String, DomainCertificate>,
}

enum Undo {
    RemoveAccount(Principal),
    RemoveSupport((String, AccountType)),
    RemoveGroup(String),
    RestoreGroup(Group),
    RemoveGrant(GrantKey),
    RestoreGrant(GrantKey, Role),
    RemoveSerial(String),
    RemoveMembership(MembershipKey),
    RestoreMembership(MembershipKey),
    RemoveCertificate(String),
    RestoreCertificate(DomainCertificate),
}

impl MemoryState {
    fn revert(&mut self, undo: Undo) {
        match undo {
            Undo::RemoveAccount(p) => {
                self.accounts.remove(&p);
            }
            Undo::RemoveSupport(key) => {
                self.support.remove(&key);
            }
            Undo::RemoveGroup(id) => {
                self.groups.remove(&id);
            }
            Undo::RestoreGroup(group) => {
                self.groups.insert(group.group_id.clone(), group);
            }
            Undo::RemoveGrant(key) => {
                self.grants.remove(&key);
            }
            Undo::RestoreGrant(key, role) => {
                self.grants.insert(key, role);
            }
            Undo::RemoveSerial(sn) => {
                self.serials.remove(&sn);
            }
            Undo::RemoveMembership(key) => {
                self.memberships.remove(&key);
            }
            Undo::RestoreMembership(key) => {
                self.memberships.insert(key);
            }
            Undo::RemoveCertificate(id) => {
                self.certificates.remove(&id);
            }
            Undo::RestoreCertificate(cert) => {
                self.certificates.insert(cert.cert_id.clone(), cert);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CustodyStore for MemoryStore {
    async fn begin<'a>(&'a self) -> Result<Box<dyn CustodyTx + 'a>, StoreError> {
        Ok(Box::new(MemoryTx {
            state: self.state.lock().await,
            undo: Vec::new(),
            committed: false,
        }))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

struct MemoryTx<'a> {
    state: MutexGuard<'a, MemoryState>,
    undo: Vec<Undo>,
    committed: bool,
}

impl Drop for MemoryTx<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        while let Some(undo) = self.undo.pop() {
            self.state.revert(undo);
        }
    }
}

#[async_trait]
impl CustodyTx for MemoryTx<'_> {
    async fn account_exists(&mut self, principal: &Principal) -> Result<bool, StoreError> {
        Ok(self.state.accounts.contains(principal))
    }

    async fn insert_account(&mut self, principal: &Principal) -> Result<(), StoreError> {
        if self.state.accounts.insert(principal.clone()) {
            self.undo.push(Undo::RemoveAccount(principal.clone()));
        }
        Ok(())
    }

    async fn is_support(
        &mut self,
        username: &str,
        account_type: AccountType,
    ) -> Result<bool, StoreError> {
        Ok(self
            .state
            .support
            .contains(&(username.to_string(), account_type)))
    }

    async fn insert_support(
        &mut self,
        username: &str,
        account_type: AccountType,
    ) -> Result<(), StoreError> {
        let key = (username.to_string(), account_type);
        if self.state.support.insert(key.clone()) {
            self.undo.push(Undo::RemoveSupport(key));
        }
        Ok(())
    }

    async fn group(&mut self, group_id: &str) -> Result<Option<Group>, StoreError> {
        Ok(self.state.groups.get(group_id).cloned())
    }

    async fn child_group_ids(&mut self, group_id: &str) -> Result<Vec<String>, StoreError> {
        let mut children: Vec<String> = self
            .state
            .groups
            .values()
            .filter(|g| g.parent_group_id.as_deref() == Some(group_id))
            .map(|g| g.group_id.clone())
            .collect();
        children.sort();
        Ok(children)
    }

    async fn insert_group(&mut self, group: &Group) -> Result<(), StoreError> {
        if self.state.groups.contains_key(&group.group_id) {
            return Err(StoreError::Conflict(format!(
                "group {} already exists",
                group.group_id
            )));
        }
        self.state
            .groups
            .insert(group.group_id.clone(), group.clone());
        self.undo.push(Undo::RemoveGroup(group.group_id.clone()));
        Ok(())
    }

    async fn delete_group(&mut self, group_id: &str) -> Result<(), StoreError> {
        let attached: Vec<GrantKey> = self
            .state
            .grants
            .keys()
            .filter(|(_, gid)| gid == group_id)
            .cloned()
            .collect();
        for key in attached {
            if let Some(role) = self.state.grants.remove(&key) {
                self.undo.push(Undo::RestoreGrant(key, role));
            }
        }
        if let Some(group) = self.state.groups.remove(group_id) {
            self.undo.push(Undo::RestoreGroup(group));
        }
        Ok(())
    }

    async fn grant(
        &mut self,
        principal: &Principal,
        group_id: &str,
    ) -> Result<Option<Role>, StoreError> {
        Ok(self
            .state
            .grants
            .get(&(principal.clone(), group_id.to_string()))
            .copied())
    }

    async fn grants_on_group(&mut self, group_id: &str) -> Result<Vec<RoleGrant>, StoreError> {
        let mut grants: Vec<RoleGrant> = self
            .state
            .grants
            .iter()
            .filter(|((_, gid), _)| gid == group_id)
            .map(|((principal, gid), role)| RoleGrant {
                principal: principal.clone(),
                group_id: gid.clone(),
                role: *role,
            })
            .collect();
        grants.sort_by(|a, b| a.principal.cmp(&b.principal));
        Ok(grants)
    }

    async fn grants_for_principal(
        &mut self,
        principal: &Principal,
    ) -> Result<Vec<RoleGrant>, StoreError> {
        let mut grants: Vec<RoleGrant> = self
            .state
            .grants
            .iter()
            .filter(|((p, _), _)| p == principal)
            .map(|((p, gid), role)| RoleGrant {
                principal: p.clone(),
                group_id: gid.clone(),
                role: *role,
            })
            .collect();
        grants.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        Ok(grants)
    }

    async fn insert_grant(&mut self, grant: &RoleGrant) -> Result<(), StoreError> {
        let key = (grant.principal.clone(), grant.group_id.clone());
        match self.state.grants.insert(key.clone(), grant.role) {
            Some(previous) => self.undo.push(Undo::RestoreGrant(key, previous)),
            None => self.undo.push(Undo::RemoveGrant(key)),
        }
        Ok(())
    }

    async fn delete_grant(
        &mut self,
        principal: &Principal,
        group_id: &str,
    ) -> Result<(), StoreError> {
        let key = (principal.clone(), group_id.to_string());
        if let Some(role) = self.state.grants.remove(&key) {
            self.undo.push(Undo::RestoreGrant(key, role));
        }
        Ok(())
    }

    async fn serial(&mut self, serial_number: &str) -> Result<Option<SerialRecord>, StoreError> {
        Ok(self.state.serials.get(serial_number).cloned())
    }

    async fn insert_serial(&mut self, record: &SerialRecord) -> Result<(), StoreError> {
        if self.state.serials.contains_key(&record.serial_number) {
            return Err(StoreError::Conflict(format!(
                "serial {} already exists",
                record.serial_number
            )));
        }
        self.state
            .serials
            .insert(record.serial_number.clone(), record.clone());
        self.undo
            .push(Undo::RemoveSerial(record.serial_number.clone()));
        Ok(())
    }

    async fn serial_group_ids(&mut self, serial_number: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .state
            .memberships
            .iter()
            .filter(|(sn, _)| sn == serial_number)
            .map(|(_, gid)| gid.clone())
            .collect())
    }

    async fn group_serials(&mut self, group_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .state
            .memberships
            .iter()
            .filter(|(_, gid)| gid == group_id)
            .map(|(sn, _)| sn.clone())
            .collect())
    }

    async fn add_serial_membership(
        &mut self,
        serial_number: &str,
        group_id: &str,
    ) -> Result<(), StoreError> {
        let key = (serial_number.to_string(), group_id.to_string());
        if self.state.memberships.insert(key.clone()) {
            self.undo.push(Undo::RemoveMembership(key));
        }
        Ok(())
    }

    async fn remove_serial_membership(
        &mut self,
        serial_number: &str,
        group_id: &str,
    ) -> Result<(), StoreError> {
        let key = (serial_number.to_string(), group_id.to_string());
        if self.state.memberships.remove(&key) {
            self.undo.push(Undo::RestoreMembership(key));
        }
        Ok(())
    }

    async fn certificate(
        &mut self,
        cert_id: &str,
    ) -> Result<Option<DomainCertificate>, StoreError> {
        Ok(self.state.certificates.get(cert_id).cloned())
    }

    async fn certificate_id_by_der(
        &mut self,
        group_id: &str,
        certificate_der: &[u8],
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .state
            .certificates
            .values()
            .find(|c| c.group_id == group_id && c.certificate_der == certificate_der)
            .map(|c| c.cert_id.clone()))
    }

    async fn group_certificate_ids(&mut self, group_id: &str) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self
            .state
            .certificates
            .values()
            .filter(|c| c.group_id == group_id)
            .map(|c| c.cert_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn insert_certificate(&mut self, cert: &DomainCertificate) -> Result<(), StoreError> {
        self.state
            .certificates
            .insert(cert.cert_id.clone(), cert.clone());
        self.undo.push(Undo::RemoveCertificate(cert.cert_id.clone()));
        Ok(())
    }

    async fn delete_certificate(&mut self, cert_id: &str) -> Result<(), StoreError> {
        if let Some(cert) = self.state.certificates.remove(cert_id) {
            self.undo.push(Undo::RestoreCertificate(cert));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut tx = self;
        tx.committed = true;
        tx.undo.clear();
        Ok(())
    }
}
