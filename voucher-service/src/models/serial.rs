//! Device serial number records.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A device provisioned for an organization.
///
/// Group membership is tracked separately; removing a serial from every
/// group never deletes this record.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct SerialRecord {
    pub serial_number: String,
    pub org_id: String,
    /// DER SubjectPublicKeyInfo of the device key.
    pub public_key_der: Option<Vec<u8>>,
    pub mac_addr: Option<String>,
    /// IANA enterprise number of the manufacturer.
    pub vendor_ien: String,
}
