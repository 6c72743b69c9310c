//! Administrative user records.
//!
//! Credential handling and token issuance live in the external auth layer;
//! the store only keeps the account facts the service needs for role checks
//! and audit attribution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Reviewer,
    Auditor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: Uuid,
    pub username: String,
    pub email: String,
    pub full_name: Option<String>,
    pub roles: Vec<UserRole>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(
        username: impl Into<String>,
        email: impl Into<String>,
        roles: Vec<UserRole>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            username: username.into(),
            email: email.into(),
            full_name: None,
            roles,
            active: true,
            created_at: now,
            updated_at: now,
            last_login: None,
        }
    }

    pub fn has_role(&self, role: UserRole) -> bool {
        self.roles.contains(&role)
    }
}
