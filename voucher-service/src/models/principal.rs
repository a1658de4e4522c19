//! Principals: the users and service accounts that hold roles.

use serde::{Deserialize, Serialize};

/// Account kind of a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    User,
    Service,
}

impl AccountType {
    /// Convert from proto enum value.
    pub fn from_proto(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::User),
            2 => Some(Self::Service),
            _ => None,
        }
    }

    /// Convert to proto enum value.
    pub fn to_proto(self) -> i32 {
        match self {
            Self::User => 1,
            Self::Service => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Service => "service",
        }
    }
}

impl std::str::FromStr for AccountType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "service" => Ok(Self::Service),
            other => Err(format!("unknown account type '{}'", other)),
        }
    }
}

impl std::fmt::Display for AccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A user or service account, scoped to one organization.
///
/// Two principals are the same only if all three fields match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Principal {
    pub username: String,
    pub account_type: AccountType,
    pub org_id: String,
}

impl Principal {
    pub fn new(
        username: impl Into<String>,
        account_type: AccountType,
        org_id: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            account_type,
            org_id: org_id.into(),
        }
    }

    pub fn user(username: impl Into<String>, org_id: impl Into<String>) -> Self {
        Self::new(username, AccountType::User, org_id)
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}@{}", self.account_type, self.username, self.org_id)
    }
}
