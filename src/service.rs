//! Ingress facade: the service-layer surface the HTTP glue calls into.
//!
//! Transport, request parsing and authentication live outside this crate;
//! what's here is the validated business surface (submit, status, listings,
//! review workflow, user administration, audit access and the thin face
//! utilities) plus process-local rate limiting as defense in depth.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::audit::AuditJournal;
use crate::cache::EmbeddingCache;
use crate::clock::Clock;
use crate::config::Settings;
use crate::error::{ErrorCode, ErrorEnvelope};
use crate::identity::{IdentityError, IdentityManager, OverrideDecision};
use crate::index::VectorIndex;
use crate::models::{
    ActorKind, ApplicantData, Application, ApplicationStatus, AuditEvent, AuditEventKind,
    Identity, IdentityStatus, NewAuditEvent, PhotoRef, ResourceKind, User, UserRole,
};
use crate::notifier::PushHub;
use crate::queue::{QueueError, Submission, WorkQueue};
use crate::resilience::DeadLetterSink;
use crate::review::{ReviewCase, ReviewError, ReviewService};
use crate::store::{AuditQuery, Page, Store, StoreError};

/// Largest accepted photograph.
const MAX_PHOTO_BYTES: usize = 10 * 1024 * 1024;
/// Minimum declared resolution on either edge.
const MIN_RESOLUTION: u32 = 300;
/// Largest batch for submit/status/override calls.
const MAX_BATCH: usize = 100;
const SUPPORTED_FORMATS: &[&str] = &["jpg", "jpeg", "png"];

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{message}")]
    Validation { code: ErrorCode, message: String },
    #[error("submission queue is full")]
    QueueFull,
    #[error("rate limit exceeded, retry in {retry_after}s")]
    RateLimited { retry_after: u64 },
    #[error("record not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ReviewError> for ServiceError {
    fn from(e: ReviewError) -> Self {
        match e {
            ReviewError::NotFound(id) => Self::NotFound(id.to_string()),
            ReviewError::NothingToReview(id) => Self::Validation {
                code: ErrorCode::E400,
                message: format!("application {id} has no matches to review"),
            },
            ReviewError::Store(e) => Self::Store(e),
        }
    }
}

impl ServiceError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Validation { code, .. } => *code,
            Self::QueueFull => ErrorCode::E105,
            Self::RateLimited { .. } => ErrorCode::E504,
            Self::NotFound(_) => ErrorCode::E202,
            Self::Identity(IdentityError::InvalidJustification { .. }) => ErrorCode::E400,
            Self::Identity(IdentityError::ApplicationNotFound(_))
            | Self::Identity(IdentityError::IdentityNotFound(_)) => ErrorCode::E202,
            Self::Identity(_) => ErrorCode::E103,
            Self::Analyzer(e) => e.error_code(),
            Self::Store(e) if e.is_transient() => ErrorCode::E200,
            Self::Store(_) => ErrorCode::E500,
        }
    }

    /// Uniform envelope for the edge.
    pub fn envelope(&self, now: DateTime<Utc>) -> ErrorEnvelope {
        let mut envelope =
            ErrorEnvelope::new(self.error_code(), now).with_message(self.to_string());
        if let Self::RateLimited { retry_after } = self {
            envelope = envelope.with_retry_after(*retry_after);
        }
        envelope
    }
}

/// Simple token bucket, process-local by design.
struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<(f64, Instant)>,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            state: Mutex::new((capacity, Instant::now())),
        }
    }

    fn try_acquire(&self) -> Result<(), u64> {
        let mut state = self.state.lock().expect("bucket lock poisoned");
        let (ref mut tokens, ref mut refilled_at) = *state;
        let elapsed = refilled_at.elapsed().as_secs_f64();
        *tokens = (*tokens + elapsed * self.refill_per_sec).min(self.capacity);
        *refilled_at = Instant::now();
        if *tokens >= 1.0 {
            *tokens -= 1.0;
            Ok(())
        } else {
            Err(((1.0 - *tokens) / self.refill_per_sec).ceil() as u64)
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewApplicant {
    pub name: String,
    pub date_of_birth: NaiveDate,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub demographics: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct PhotoUpload {
    pub bytes: Vec<u8>,
    pub format: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionReceipt {
    pub application_id: Uuid,
    pub status: ApplicationStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchSubmitResult {
    Accepted(SubmissionReceipt),
    Rejected(ErrorEnvelope),
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub application_id: Uuid,
    pub status: ApplicationStatus,
    pub is_duplicate: bool,
    pub identity_id: Option<Uuid>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StatusView {
    fn from_application(app: &Application) -> Self {
        Self {
            application_id: app.application_id,
            status: app.processing.status,
            is_duplicate: app.result.is_duplicate,
            identity_id: app.result.identity_id,
            error_code: app.processing.error_code,
            error_message: app.processing.error_message.clone(),
            created_at: app.created_at,
            updated_at: app.updated_at,
            started_at: app.processing.started_at,
            completed_at: app.processing.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentityView {
    pub identity: Identity,
    pub applications: Vec<StatusView>,
}

#[derive(Debug, Serialize)]
pub struct SystemStats {
    pub queue: crate::queue::QueueStats,
    pub cache: crate::cache::CacheStats,
    pub index: crate::index::IndexStats,
    pub dead_letter: crate::resilience::DeadLetterStats,
    pub push: crate::notifier::PushStats,
    pub total_applications: u64,
    pub duplicates_detected: u64,
}

pub struct EnrollmentService {
    settings: Arc<Settings>,
    store: Arc<dyn Store>,
    queue: Arc<WorkQueue>,
    cache: Arc<EmbeddingCache>,
    index: Arc<VectorIndex>,
    journal: Arc<AuditJournal>,
    identities: Arc<IdentityManager>,
    analyzer: Arc<dyn FaceAnalyzer>,
    hub: Arc<PushHub>,
    dead_letter: Arc<DeadLetterSink>,
    review: ReviewService,
    clock: Arc<dyn Clock>,
    submit_bucket: TokenBucket,
    batch_bucket: TokenBucket,
}

#[allow(clippy::too_many_arguments)]
impl EnrollmentService {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn Store>,
        queue: Arc<WorkQueue>,
        cache: Arc<EmbeddingCache>,
        index: Arc<VectorIndex>,
        journal: Arc<AuditJournal>,
        identities: Arc<IdentityManager>,
        analyzer: Arc<dyn FaceAnalyzer>,
        hub: Arc<PushHub>,
        dead_letter: Arc<DeadLetterSink>,
        review: ReviewService,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            store,
            queue,
            cache,
            index,
            journal,
            identities,
            analyzer,
            hub,
            dead_letter,
            review,
            clock,
            submit_bucket: TokenBucket::new(50.0, 25.0),
            batch_bucket: TokenBucket::new(5.0, 1.0),
        }
    }

    // -- submission ------------------------------------------------------

    fn validate_photo(&self, photo: &PhotoUpload) -> Result<(), ServiceError> {
        let format = photo.format.to_ascii_lowercase();
        if !SUPPORTED_FORMATS.contains(&format.as_str()) {
            return Err(ServiceError::Validation {
                code: ErrorCode::E005,
                message: format!("unsupported format: {}", photo.format),
            });
        }
        if photo.bytes.is_empty() {
            return Err(ServiceError::Validation {
                code: ErrorCode::E401,
                message: "photograph bytes are required".to_string(),
            });
        }
        if photo.bytes.len() > MAX_PHOTO_BYTES {
            return Err(ServiceError::Validation {
                code: ErrorCode::E006,
                message: format!("photograph is {} bytes", photo.bytes.len()),
            });
        }
        if let (Some(w), Some(h)) = (photo.width, photo.height) {
            if w < MIN_RESOLUTION || h < MIN_RESOLUTION {
                return Err(ServiceError::Validation {
                    code: ErrorCode::E007,
                    message: format!("declared resolution {w}x{h} below {MIN_RESOLUTION}px"),
                });
            }
        }
        Ok(())
    }

    fn validate_applicant(applicant: &NewApplicant) -> Result<(), ServiceError> {
        if applicant.name.trim().is_empty() {
            return Err(ServiceError::Validation {
                code: ErrorCode::E401,
                message: "applicant name is required".to_string(),
            });
        }
        Ok(())
    }

    pub async fn submit(
        &self,
        applicant: NewApplicant,
        photo: PhotoUpload,
        webhook_url: Option<String>,
    ) -> Result<SubmissionReceipt, ServiceError> {
        self.submit_bucket
            .try_acquire()
            .map_err(|retry_after| ServiceError::RateLimited { retry_after })?;
        Self::validate_applicant(&applicant)?;
        self.validate_photo(&photo)?;

        let now = self.clock.now();
        let application_id = Uuid::new_v4();
        let application = Application::new(
            application_id,
            ApplicantData {
                name: applicant.name.trim().to_string(),
                date_of_birth: applicant.date_of_birth,
                email: applicant.email,
                phone: applicant.phone,
                address: applicant.address,
                demographics: applicant.demographics,
            },
            PhotoRef {
                format: photo.format.to_ascii_lowercase(),
                width: photo.width,
                height: photo.height,
                byte_size: photo.bytes.len() as u64,
                ..PhotoRef::default()
            },
            now,
        );
        self.store.insert_application(application).await?;

        let submission = Submission {
            application_id,
            photo_bytes: photo.bytes,
            format: photo.format.to_ascii_lowercase(),
            enqueued_at: now,
            retry_count: 0,
            webhook_url,
        };
        match self.queue.enqueue(submission) {
            Ok(()) => {}
            Err(QueueError::Full(_)) => return Err(ServiceError::QueueFull),
            Err(e) => {
                return Err(ServiceError::Validation {
                    code: ErrorCode::E500,
                    message: e.to_string(),
                })
            }
        }

        if let Err(e) = self
            .journal
            .append(
                NewAuditEvent::system(
                    AuditEventKind::Submitted,
                    application_id.to_string(),
                    ResourceKind::Application,
                    "application submitted",
                )
                .actor("api", ActorKind::Api),
            )
            .await
        {
            tracing::error!(error = %e, "audit append failed for submission");
        }

        Ok(SubmissionReceipt {
            application_id,
            status: ApplicationStatus::Pending,
            created_at: now,
        })
    }

    pub async fn submit_batch(
        &self,
        items: Vec<(NewApplicant, PhotoUpload)>,
        webhook_url: Option<String>,
    ) -> Result<Vec<BatchSubmitResult>, ServiceError> {
        self.batch_bucket
            .try_acquire()
            .map_err(|retry_after| ServiceError::RateLimited { retry_after })?;
        if items.len() > MAX_BATCH {
            return Err(ServiceError::Validation {
                code: ErrorCode::E400,
                message: format!("batch size {} exceeds {MAX_BATCH}", items.len()),
            });
        }

        let mut results = Vec::with_capacity(items.len());
        for (applicant, photo) in items {
            // The per-submit bucket does not gate batch members.
            let outcome = async {
                Self::validate_applicant(&applicant)?;
                self.validate_photo(&photo)?;
                self.submit_unthrottled(applicant, photo, webhook_url.clone())
                    .await
            }
            .await;
            results.push(match outcome {
                Ok(receipt) => BatchSubmitResult::Accepted(receipt),
                Err(e) => BatchSubmitResult::Rejected(e.envelope(self.clock.now())),
            });
        }
        Ok(results)
    }

    async fn submit_unthrottled(
        &self,
        applicant: NewApplicant,
        photo: PhotoUpload,
        webhook_url: Option<String>,
    ) -> Result<SubmissionReceipt, ServiceError> {
        // Same path as `submit` minus the bucket; validation already ran.
        let now = self.clock.now();
        let application_id = Uuid::new_v4();
        let application = Application::new(
            application_id,
            ApplicantData {
                name: applicant.name.trim().to_string(),
                date_of_birth: applicant.date_of_birth,
                email: applicant.email,
                phone: applicant.phone,
                address: applicant.address,
                demographics: applicant.demographics,
            },
            PhotoRef {
                format: photo.format.to_ascii_lowercase(),
                width: photo.width,
                height: photo.height,
                byte_size: photo.bytes.len() as u64,
                ..PhotoRef::default()
            },
            now,
        );
        self.store.insert_application(application).await?;
        match self.queue.enqueue(Submission {
            application_id,
            photo_bytes: photo.bytes,
            format: photo.format.to_ascii_lowercase(),
            enqueued_at: now,
            retry_count: 0,
            webhook_url,
        }) {
            Ok(()) => Ok(SubmissionReceipt {
                application_id,
                status: ApplicationStatus::Pending,
                created_at: now,
            }),
            Err(QueueError::Full(_)) => Err(ServiceError::QueueFull),
            Err(e) => Err(ServiceError::Validation {
                code: ErrorCode::E500,
                message: e.to_string(),
            }),
        }
    }

    // -- status & listings ----------------------------------------------

    pub async fn status(&self, application_id: Uuid) -> Result<StatusView, ServiceError> {
        let app = self
            .store
            .get_application(application_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(application_id.to_string()))?;
        Ok(StatusView::from_application(&app))
    }

    pub async fn status_batch(
        &self,
        application_ids: &[Uuid],
    ) -> Result<Vec<Option<StatusView>>, ServiceError> {
        if application_ids.len() > MAX_BATCH {
            return Err(ServiceError::Validation {
                code: ErrorCode::E400,
                message: format!("batch size {} exceeds {MAX_BATCH}", application_ids.len()),
            });
        }
        let lookups = application_ids
            .iter()
            .map(|id| self.store.get_application(*id));
        let mut out = Vec::with_capacity(application_ids.len());
        for found in futures::future::join_all(lookups).await {
            out.push(found?.as_ref().map(StatusView::from_application));
        }
        Ok(out)
    }

    pub async fn list_applications(
        &self,
        status: Option<ApplicationStatus>,
        page: usize,
        size: usize,
    ) -> Result<Page<Application>, ServiceError> {
        Ok(self.store.list_applications(status, page, size).await?)
    }

    pub async fn get_application(&self, application_id: Uuid) -> Result<Application, ServiceError> {
        self.store
            .get_application(application_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(application_id.to_string()))
    }

    pub async fn list_identities(
        &self,
        status: Option<IdentityStatus>,
        page: usize,
        size: usize,
    ) -> Result<Page<Identity>, ServiceError> {
        Ok(self.store.list_identities(status, page, size).await?)
    }

    pub async fn get_identity(&self, identity_id: Uuid) -> Result<IdentityView, ServiceError> {
        let identity = self
            .store
            .get_identity(identity_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(identity_id.to_string()))?;
        let applications = self
            .store
            .applications_by_identity(identity_id)
            .await?
            .iter()
            .map(StatusView::from_application)
            .collect();
        Ok(IdentityView {
            identity,
            applications,
        })
    }

    // -- review workflow -------------------------------------------------

    pub async fn list_pending_review(
        &self,
        page: usize,
        size: usize,
    ) -> Result<Page<Application>, ServiceError> {
        Ok(self.review.list_pending(page, size).await?)
    }

    pub async fn get_review_case(&self, application_id: Uuid) -> Result<ReviewCase, ServiceError> {
        Ok(self.review.build_case(application_id).await?)
    }

    pub async fn override_application(
        &self,
        application_id: Uuid,
        decision: OverrideDecision,
        justification: &str,
        reviewer_id: &str,
    ) -> Result<StatusView, ServiceError> {
        let updated = self
            .identities
            .apply_override(application_id, decision, justification, reviewer_id)
            .await?;
        Ok(StatusView::from_application(&updated))
    }

    pub async fn bulk_override(
        &self,
        application_ids: &[Uuid],
        decision: OverrideDecision,
        justification: &str,
        reviewer_id: &str,
    ) -> Result<Vec<Result<StatusView, ErrorEnvelope>>, ServiceError> {
        if application_ids.len() > MAX_BATCH {
            return Err(ServiceError::Validation {
                code: ErrorCode::E400,
                message: format!("batch size {} exceeds {MAX_BATCH}", application_ids.len()),
            });
        }
        let mut out = Vec::with_capacity(application_ids.len());
        for id in application_ids {
            out.push(
                self.override_application(*id, decision, justification, reviewer_id)
                    .await
                    .map_err(|e| e.envelope(self.clock.now())),
            );
        }
        Ok(out)
    }

    // -- user administration ---------------------------------------------

    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        roles: Vec<UserRole>,
        actor: &User,
    ) -> Result<User, ServiceError> {
        if username.trim().is_empty() {
            return Err(ServiceError::Validation {
                code: ErrorCode::E401,
                message: "username is required".to_string(),
            });
        }
        let user = User::new(username.trim(), email, roles, self.clock.now());
        self.store.insert_user(user.clone()).await?;
        self.audit_admin(
            AuditEventKind::UserCreated,
            &user.user_id.to_string(),
            ResourceKind::User,
            format!("user {} created", user.username),
            actor,
        )
        .await;
        Ok(user)
    }

    /// Role changes; an admin cannot change their own roles.
    pub async fn update_user_roles(
        &self,
        user_id: Uuid,
        roles: Vec<UserRole>,
        actor: &User,
    ) -> Result<User, ServiceError> {
        if user_id == actor.user_id {
            return Err(ServiceError::Validation {
                code: ErrorCode::E303,
                message: "cannot change your own roles".to_string(),
            });
        }
        let updated = self
            .store
            .modify_user(user_id, Box::new(move |user| user.roles = roles))
            .await
            .map_err(|e| match e {
                StoreError::NotFound(id) => ServiceError::NotFound(id),
                other => ServiceError::Store(other),
            })?;
        self.audit_admin(
            AuditEventKind::UserUpdated,
            &user_id.to_string(),
            ResourceKind::User,
            format!("roles updated for {}", updated.username),
            actor,
        )
        .await;
        Ok(updated)
    }

    /// Deactivation; an admin cannot deactivate their own account.
    pub async fn deactivate_user(&self, user_id: Uuid, actor: &User) -> Result<User, ServiceError> {
        if user_id == actor.user_id {
            return Err(ServiceError::Validation {
                code: ErrorCode::E303,
                message: "cannot deactivate your own account".to_string(),
            });
        }
        let updated = self
            .store
            .modify_user(user_id, Box::new(|user| user.active = false))
            .await
            .map_err(|e| match e {
                StoreError::NotFound(id) => ServiceError::NotFound(id),
                other => ServiceError::Store(other),
            })?;
        self.audit_admin(
            AuditEventKind::UserDeactivated,
            &user_id.to_string(),
            ResourceKind::User,
            format!("user {} deactivated", updated.username),
            actor,
        )
        .await;
        Ok(updated)
    }

    pub async fn list_users(&self, page: usize, size: usize) -> Result<Page<User>, ServiceError> {
        Ok(self.store.list_users(page, size).await?)
    }

    async fn audit_admin(
        &self,
        kind: AuditEventKind,
        resource_id: &str,
        resource_kind: ResourceKind,
        action: String,
        actor: &User,
    ) {
        let event = NewAuditEvent::system(kind, resource_id, resource_kind, action)
            .actor(actor.username.clone(), ActorKind::Admin);
        if let Err(e) = self.journal.append(event).await {
            tracing::error!(error = %e, "admin audit append failed");
        }
    }

    // -- audit access ----------------------------------------------------

    pub async fn audit_query(
        &self,
        filter: AuditQuery,
        page: usize,
        size: usize,
    ) -> Result<Page<AuditEvent>, ServiceError> {
        Ok(self.journal.query(filter, page, size).await?)
    }

    pub async fn audit_export_csv(&self, filter: AuditQuery) -> Result<String, ServiceError> {
        Ok(self.journal.export_csv(filter).await?)
    }

    // -- face utilities --------------------------------------------------

    pub async fn detect_face(
        &self,
        image: &[u8],
        format: &str,
    ) -> Result<crate::analyzer::DetectedFace, ServiceError> {
        Ok(self.analyzer.detect(image, format).await?)
    }

    pub async fn embed_face(&self, image: &[u8], format: &str) -> Result<Vec<f32>, ServiceError> {
        let face = self.analyzer.detect(image, format).await?;
        Ok(self.analyzer.embed(&face).await?)
    }

    /// Cosine similarity between two embeddings, clamped to [0, 1].
    pub fn compare_vectors(&self, a: &[f32], b: &[f32]) -> Result<f32, ServiceError> {
        if a.len() != b.len() || a.is_empty() {
            return Err(ServiceError::Validation {
                code: ErrorCode::E400,
                message: format!("vector dimensions disagree: {} vs {}", a.len(), b.len()),
            });
        }
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a < f32::EPSILON || norm_b < f32::EPSILON {
            return Err(ServiceError::Validation {
                code: ErrorCode::E400,
                message: "zero-norm vector".to_string(),
            });
        }
        Ok((dot / (norm_a * norm_b)).clamp(0.0, 1.0))
    }

    pub async fn compare_images(
        &self,
        image_a: (&[u8], &str),
        image_b: (&[u8], &str),
    ) -> Result<f32, ServiceError> {
        let a = self.embed_face(image_a.0, image_a.1).await?;
        let b = self.embed_face(image_b.0, image_b.1).await?;
        self.compare_vectors(&a, &b)
    }

    // -- operator stats --------------------------------------------------

    pub async fn stats(&self) -> Result<SystemStats, ServiceError> {
        Ok(SystemStats {
            queue: self.queue.stats(),
            cache: self.cache.stats(),
            index: self.index.stats(),
            dead_letter: self.dead_letter.stats(),
            push: self.hub.stats(),
            total_applications: self.store.count_applications(None, None).await?,
            duplicates_detected: self.store.count_applications(None, Some(true)).await?,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}
