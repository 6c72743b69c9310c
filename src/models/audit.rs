//! Immutable audit events.
//!
//! `NewAuditEvent` deliberately carries no timestamp or id field: both are
//! assigned by the journal at append time, so a caller-supplied timestamp is
//! unrepresentable rather than merely rejected.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    Submitted,
    FaceDetected,
    EmbeddingGenerated,
    DuplicateDetected,
    IdentityIssued,
    ApplicationLinked,
    ApplicationRejected,
    ProcessingFailed,
    OverrideDecision,
    Merge,
    Suspend,
    DataAccess,
    AdminLogin,
    UserCreated,
    UserUpdated,
    UserDeactivated,
}

impl std::fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Submitted => "submitted",
            Self::FaceDetected => "face_detected",
            Self::EmbeddingGenerated => "embedding_generated",
            Self::DuplicateDetected => "duplicate_detected",
            Self::IdentityIssued => "identity_issued",
            Self::ApplicationLinked => "application_linked",
            Self::ApplicationRejected => "application_rejected",
            Self::ProcessingFailed => "processing_failed",
            Self::OverrideDecision => "override_decision",
            Self::Merge => "merge",
            Self::Suspend => "suspend",
            Self::DataAccess => "data_access",
            Self::AdminLogin => "admin_login",
            Self::UserCreated => "user_created",
            Self::UserUpdated => "user_updated",
            Self::UserDeactivated => "user_deactivated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    System,
    Admin,
    Reviewer,
    Api,
}

impl std::fmt::Display for ActorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::System => "system",
            Self::Admin => "admin",
            Self::Reviewer => "reviewer",
            Self::Api => "api",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Application,
    Identity,
    User,
    System,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Application => "application",
            Self::Identity => "identity",
            Self::User => "user",
            Self::System => "system",
        };
        f.write_str(s)
    }
}

/// A stored audit event. Insert-only: no update or delete exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub event_kind: AuditEventKind,
    pub timestamp: DateTime<Utc>,
    pub actor_id: String,
    pub actor_kind: ActorKind,
    pub resource_id: String,
    pub resource_kind: ResourceKind,
    /// Human-readable description of what happened.
    pub action: String,
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Event payload accepted by the journal.
#[derive(Debug, Clone)]
pub struct NewAuditEvent {
    pub event_kind: AuditEventKind,
    pub actor_id: String,
    pub actor_kind: ActorKind,
    pub resource_id: String,
    pub resource_kind: ResourceKind,
    pub action: String,
    pub details: HashMap<String, serde_json::Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
}

impl NewAuditEvent {
    /// System-actor event, the common case inside the pipeline.
    pub fn system(
        event_kind: AuditEventKind,
        resource_id: impl Into<String>,
        resource_kind: ResourceKind,
        action: impl Into<String>,
    ) -> Self {
        Self {
            event_kind,
            actor_id: "system".to_string(),
            actor_kind: ActorKind::System,
            resource_id: resource_id.into(),
            resource_kind,
            action: action.into(),
            details: HashMap::new(),
            ip_address: None,
            user_agent: None,
            success: true,
            error_message: None,
        }
    }

    pub fn actor(mut self, actor_id: impl Into<String>, actor_kind: ActorKind) -> Self {
        self.actor_id = actor_id.into();
        self.actor_kind = actor_kind;
        self
    }

    pub fn detail(mut self, key: &str, value: serde_json::Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(error.into());
        self
    }
}
