//! Durable record store behind a capability trait.
//!
//! Five collections: applications, identities, embeddings, audit events and
//! users. The trait shapes mirror the hot queries (status listings newest
//! first, identity membership, audit trails by resource or actor). Updates
//! to a single document are atomic; multi-document sequences are the
//! caller's responsibility and must roll forward on retry.
//!
//! Audit events are insert-only at the trait level: there is no operation
//! that modifies or deletes one.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Application, ApplicationStatus, AuditEvent, AuditEventKind, EmbeddingRecord, Identity,
    IdentityStatus, User,
};

pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record already exists: {0}")]
    AlreadyExists(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// One page of results plus the unpaged total.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

/// Filter for audit queries; all clauses are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub resource_id: Option<String>,
    pub actor_id: Option<String>,
    pub event_kind: Option<AuditEventKind>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

pub type ApplicationMutator = Box<dyn FnOnce(&mut Application) + Send>;
pub type IdentityMutator = Box<dyn FnOnce(&mut Identity) + Send>;
pub type UserMutator = Box<dyn FnOnce(&mut User) + Send>;

#[async_trait]
pub trait Store: Send + Sync {
    // -- applications --------------------------------------------------

    async fn insert_application(&self, application: Application) -> Result<(), StoreError>;
    async fn get_application(&self, id: Uuid) -> Result<Option<Application>, StoreError>;
    /// Atomic read-modify-write of one application document. Returns the
    /// updated document.
    async fn modify_application(
        &self,
        id: Uuid,
        mutate: ApplicationMutator,
    ) -> Result<Application, StoreError>;
    /// Newest first, optionally filtered by status. `page` is 1-based.
    async fn list_applications(
        &self,
        status: Option<ApplicationStatus>,
        page: usize,
        size: usize,
    ) -> Result<Page<Application>, StoreError>;
    async fn applications_by_identity(
        &self,
        identity_id: Uuid,
    ) -> Result<Vec<Application>, StoreError>;
    async fn count_applications(
        &self,
        status: Option<ApplicationStatus>,
        is_duplicate: Option<bool>,
    ) -> Result<u64, StoreError>;

    // -- identities ----------------------------------------------------

    async fn insert_identity(&self, identity: Identity) -> Result<(), StoreError>;
    async fn get_identity(&self, id: Uuid) -> Result<Option<Identity>, StoreError>;
    async fn modify_identity(
        &self,
        id: Uuid,
        mutate: IdentityMutator,
    ) -> Result<Identity, StoreError>;
    async fn list_identities(
        &self,
        status: Option<IdentityStatus>,
        page: usize,
        size: usize,
    ) -> Result<Page<Identity>, StoreError>;

    // -- embeddings ----------------------------------------------------

    /// Fails with `AlreadyExists` when the application already has an
    /// embedding: the mapping is strictly 1:1.
    async fn insert_embedding(&self, record: EmbeddingRecord) -> Result<(), StoreError>;
    async fn get_embedding(
        &self,
        application_id: Uuid,
    ) -> Result<Option<EmbeddingRecord>, StoreError>;
    async fn embeddings_by_identity(
        &self,
        identity_id: Uuid,
    ) -> Result<Vec<EmbeddingRecord>, StoreError>;
    /// Re-point an embedding at another identity (override rebind, merge).
    /// The vector itself is immutable.
    async fn rebind_embedding(
        &self,
        application_id: Uuid,
        identity_id: Uuid,
    ) -> Result<(), StoreError>;
    async fn count_embeddings(&self) -> Result<u64, StoreError>;

    // -- audit events (insert-only) -----------------------------------

    async fn append_audit(&self, event: AuditEvent) -> Result<(), StoreError>;
    /// Newest first. `page` is 1-based.
    async fn query_audit(
        &self,
        filter: AuditQuery,
        page: usize,
        size: usize,
    ) -> Result<Page<AuditEvent>, StoreError>;

    // -- users ---------------------------------------------------------

    async fn insert_user(&self, user: User) -> Result<(), StoreError>;
    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;
    async fn modify_user(&self, id: Uuid, mutate: UserMutator) -> Result<User, StoreError>;
    async fn list_users(&self, page: usize, size: usize) -> Result<Page<User>, StoreError>;
}

pub(crate) fn paginate<T: Clone>(items: &[T], page: usize, size: usize) -> Page<T> {
    let total = items.len() as u64;
    let page = page.max(1);
    let start = (page - 1).saturating_mul(size);
    let items = items
        .iter()
        .skip(start)
        .take(size)
        .cloned()
        .collect();
    Page { items, total }
}
