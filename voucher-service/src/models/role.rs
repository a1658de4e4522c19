//! Roles, access levels and role grants.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::Principal;

/// Privilege level held by a principal on a group.
///
/// Ordering follows [`Role::rank`]: `Support > Admin > Assigner > Requestor`.
/// It is independent of declaration order and of the wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Requestor,
    Assigner,
    Admin,
    Support,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Support, Role::Admin, Role::Assigner, Role::Requestor];

    /// Privilege rank; higher is more privileged.
    pub fn rank(self) -> u8 {
        match self {
            Self::Support => 4,
            Self::Admin => 3,
            Self::Assigner => 2,
            Self::Requestor => 1,
        }
    }

    /// Convert from proto enum value. `ROLE_UNSPECIFIED` yields `None`.
    pub fn from_proto(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Support),
            2 => Some(Self::Admin),
            3 => Some(Self::Assigner),
            4 => Some(Self::Requestor),
            _ => None,
        }
    }

    /// Convert to proto enum value.
    pub fn to_proto(self) -> i32 {
        match self {
            Self::Support => 1,
            Self::Admin => 2,
            Self::Assigner => 3,
            Self::Requestor => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Support => "support",
            Self::Admin => "admin",
            Self::Assigner => "assigner",
            Self::Requestor => "requestor",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "support" => Ok(Self::Support),
            "admin" => Ok(Self::Admin),
            "assigner" => Ok(Self::Assigner),
            "requestor" => Ok(Self::Requestor),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

impl PartialOrd for Role {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Role {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str().to_uppercase())
    }
}

/// Kind of access an operation needs on its target group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Inspect groups, serials, certificates; request vouchers.
    Read,
    /// Move serials, manage certificates, grant roles.
    Write,
    /// Create and delete groups.
    Structure,
}

impl Access {
    pub fn required_role(self) -> Role {
        match self {
            Self::Read => Role::Requestor,
            Self::Write => Role::Assigner,
            Self::Structure => Role::Admin,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Structure => "structure",
        }
    }
}

/// A direct grant of `role` to `principal` on `group_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleGrant {
    pub principal: Principal,
    pub group_id: String,
    pub role: Role,
}
