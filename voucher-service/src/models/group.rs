//! Group model: one node of an organization's custody tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A node in the group tree.
///
/// An organization root has no parent and its `group_id` equals its
/// `org_id`. Children, serial membership and certificates are looked up by
/// `group_id`; the group itself holds no collections.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Group {
    pub group_id: String,
    pub parent_group_id: Option<String>,
    pub org_id: String,
    pub description: String,
    pub created_utc: DateTime<Utc>,
}

impl Group {
    /// Organization root group.
    pub fn root(org_id: impl Into<String>, description: impl Into<String>) -> Self {
        let org_id = org_id.into();
        Self {
            group_id: org_id.clone(),
            parent_group_id: None,
            org_id,
            description: description.into(),
            created_utc: Utc::now(),
        }
    }

    /// New leaf under `parent`, inheriting its organization.
    pub fn child_of(parent: &Group, description: impl Into<String>) -> Self {
        Self {
            group_id: uuid::Uuid::new_v4().to_string(),
            parent_group_id: Some(parent.group_id.clone()),
            org_id: parent.org_id.clone(),
            description: description.into(),
            created_utc: Utc::now(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_group_id.is_none()
    }
}
