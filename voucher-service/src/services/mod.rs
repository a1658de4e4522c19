//! Services module for voucher-service.

pub mod authorization;
pub mod custody;
pub mod error;
pub mod metrics;
pub mod provisioning;
pub mod store;
pub mod voucher;

pub use custody::{CustodyService, GroupDetails, IssuedVoucher, SerialDetails};
pub use error::{CustodyError, StoreError};
pub use metrics::{get_metrics, init_metrics};
pub use provisioning::{Provisioner, SeedFile};
pub use store::{CustodyStore, CustodyTx, MemoryStore, PgStore};
pub use voucher::{OwnershipVoucher, VoucherSigner};
