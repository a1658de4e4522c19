//! Domain certificates pinned into ownership vouchers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct DomainCertificate {
    pub cert_id: String,
    /// Owning group. A certificate belongs to exactly one group.
    pub group_id: String,
    pub certificate_der: Vec<u8>,
    pub revocation_checks: bool,
    pub expiry_utc: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
}
