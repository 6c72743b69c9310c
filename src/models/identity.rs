//! Identity: the durable handle issued to a unique applicant.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    Active,
    Suspended,
    /// Absorbed into another identity; kept for provenance only.
    Merged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub identity_id: Uuid,
    pub status: IdentityStatus,
    /// Free-form metadata: suspension reason, merge provenance, override notes.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Applications bound to this identity, in binding order.
    /// The first entry is the anchor application.
    pub application_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Identity {
    pub fn new(identity_id: Uuid, anchor_application: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            identity_id,
            status: IdentityStatus::Active,
            metadata: HashMap::new(),
            application_ids: vec![anchor_application],
            created_at: now,
            updated_at: now,
        }
    }

    /// The first application bound to this identity.
    pub fn anchor(&self) -> Option<Uuid> {
        self.application_ids.first().copied()
    }

    pub fn contains(&self, application_id: Uuid) -> bool {
        self.application_ids.contains(&application_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchor_is_first_bound_application() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut identity = Identity::new(Uuid::new_v4(), a, Utc::now());
        identity.application_ids.push(b);
        assert_eq!(identity.anchor(), Some(a));
        assert!(identity.contains(b));
    }
}
