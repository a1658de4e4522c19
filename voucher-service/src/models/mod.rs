//! Domain models for voucher-service.

pub mod certificate;
pub mod group;
pub mod principal;
pub mod role;
pub mod serial;

pub use certificate::DomainCertificate;
pub use group::Group;
pub use principal::{AccountType, Principal};
pub use role::{Access, Role, RoleGrant};
pub use serial::SerialRecord;
