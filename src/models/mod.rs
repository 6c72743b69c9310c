//! Domain records persisted in the application store.

pub mod application;
pub mod audit;
pub mod embedding;
pub mod identity;
pub mod user;

pub use application::{
    ApplicantData, Application, ApplicationResult, ApplicationStatus, MatchResult, PhotoRef,
    ProcessingStage, ProcessingState,
};
pub use audit::{ActorKind, AuditEvent, AuditEventKind, NewAuditEvent, ResourceKind};
pub use embedding::{EmbeddingRecord, FaceBox};
pub use identity::{Identity, IdentityStatus};
pub use user::{User, UserRole};
