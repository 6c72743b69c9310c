//! Identity assignment, linking, reviewer overrides and merges.
//!
//! Translates a de-duplication verdict into durable state. All writes here
//! are idempotent keyed on the application id: the ASSIGN sequence
//! (identity, embedding record, vector insert, application result) checks
//! which substeps already exist and rolls forward, so a crash mid-sequence
//! is repaired by simply re-running it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::audit::AuditJournal;
use crate::clock::Clock;
use crate::dedup::DedupOutcome;
use crate::index::{IndexError, VectorIndex};
use crate::models::{
    ActorKind, Application, ApplicationStatus, AuditEventKind, FaceBox, Identity, IdentityStatus,
    MatchResult, NewAuditEvent, ResourceKind,
};
use crate::store::{Store, StoreError};

/// Minimum non-whitespace characters in an override justification.
const MIN_JUSTIFICATION_LEN: usize = 10;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("justification must be at least {min} non-whitespace characters")]
    InvalidJustification { min: usize },
    #[error("application {0} not found")]
    ApplicationNotFound(Uuid),
    #[error("identity {0} not found")]
    IdentityNotFound(Uuid),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

impl IdentityError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Index(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideDecision {
    ApproveDuplicate,
    RejectDuplicate,
    FlagForReview,
}

impl std::fmt::Display for OverrideDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ApproveDuplicate => "approve_duplicate",
            Self::RejectDuplicate => "reject_duplicate",
            Self::FlagForReview => "flag_for_review",
        };
        f.write_str(s)
    }
}

/// Everything the ASSIGN stage needs to persist one embedding.
#[derive(Debug, Clone)]
pub struct EmbeddingInput {
    pub vector: Vec<f32>,
    pub quality_score: f32,
    pub face_box: FaceBox,
    pub model_version: String,
}

pub struct IdentityManager {
    store: Arc<dyn Store>,
    index: Arc<VectorIndex>,
    journal: Arc<AuditJournal>,
    clock: Arc<dyn Clock>,
}

impl IdentityManager {
    pub fn new(
        store: Arc<dyn Store>,
        index: Arc<VectorIndex>,
        journal: Arc<AuditJournal>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            index,
            journal,
            clock,
        }
    }

    /// Mint a fresh identity id, regenerating on collision with a stored
    /// identity. Collisions are vanishingly rare; the loop is still
    /// mandatory.
    async fn mint_identity_id(&self) -> Result<Uuid, IdentityError> {
        loop {
            let candidate = Uuid::new_v4();
            if self.store.get_identity(candidate).await?.is_none() {
                return Ok(candidate);
            }
            tracing::warn!(identity_id = %candidate, "identity id collision, regenerating");
        }
    }

    /// Unique path: issue a fresh identity anchored at this application,
    /// persist the embedding, index the vector, mark the application
    /// `Verified`.
    pub async fn assign_unique(
        &self,
        application_id: Uuid,
        embedding: &EmbeddingInput,
    ) -> Result<Identity, IdentityError> {
        let application = self
            .store
            .get_application(application_id)
            .await?
            .ok_or(IdentityError::ApplicationNotFound(application_id))?;

        // Roll forward: reuse an identity recorded by a previous attempt.
        let identity = match application.result.identity_id {
            Some(existing) => match self.store.get_identity(existing).await? {
                Some(identity) => identity,
                None => {
                    let identity = Identity::new(existing, application_id, self.clock.now());
                    self.store.insert_identity(identity.clone()).await?;
                    identity
                }
            },
            None => {
                let identity = Identity::new(
                    self.mint_identity_id().await?,
                    application_id,
                    self.clock.now(),
                );
                self.store.insert_identity(identity.clone()).await?;
                identity
            }
        };

        self.persist_embedding(application_id, identity.identity_id, embedding)
            .await?;

        let identity_id = identity.identity_id;
        self.store
            .modify_application(
                application_id,
                Box::new(move |app| {
                    app.result.identity_id = Some(identity_id);
                    app.result.is_duplicate = false;
                    app.result.matches.clear();
                    app.processing.status = ApplicationStatus::Verified;
                    app.processing.duplicate_check_done = true;
                }),
            )
            .await?;

        self.journal
            .append(
                NewAuditEvent::system(
                    AuditEventKind::IdentityIssued,
                    application_id.to_string(),
                    ResourceKind::Application,
                    "new identity issued to unique applicant",
                )
                .detail(
                    "identity_id",
                    serde_json::json!(identity.identity_id.to_string()),
                ),
            )
            .await?;

        tracing::info!(
            application_id = %application_id,
            identity_id = %identity.identity_id,
            "identity issued"
        );
        Ok(identity)
    }

    /// Duplicate path: link this application to the matched application's
    /// identity. The embedding and vector are stored even when the verdict
    /// is flagged for review, so later submissions can match against it.
    /// Returns the linked identity and the final status.
    pub async fn link_duplicate(
        &self,
        application_id: Uuid,
        verdict: &DedupOutcome,
        embedding: &EmbeddingInput,
    ) -> Result<(Identity, ApplicationStatus), IdentityError> {
        self.store
            .get_application(application_id)
            .await?
            .ok_or(IdentityError::ApplicationNotFound(application_id))?;
        let best = verdict
            .best_match()
            .ok_or_else(|| IdentityError::InvalidState("duplicate verdict without matches".into()))?;

        let identity = self
            .identity_for_application(best.matched_application_id)
            .await?;

        // Idempotent membership append.
        let member = application_id;
        self.store
            .modify_identity(
                identity.identity_id,
                Box::new(move |identity| {
                    if !identity.application_ids.contains(&member) {
                        identity.application_ids.push(member);
                    }
                }),
            )
            .await?;

        self.persist_embedding(application_id, identity.identity_id, embedding)
            .await?;

        let matches = self.resolve_match_identities(&verdict.matches).await?;
        let status = if verdict.requires_manual_review {
            ApplicationStatus::PendingReview
        } else {
            ApplicationStatus::Duplicate
        };

        let identity_id = identity.identity_id;
        let review_reason = verdict.review_reason.clone();
        let requires_review = verdict.requires_manual_review;
        self.store
            .modify_application(
                application_id,
                Box::new(move |app| {
                    app.result.identity_id = Some(identity_id);
                    app.result.is_duplicate = true;
                    app.result.matches = matches;
                    app.result.requires_manual_review = requires_review;
                    app.result.review_reason = review_reason;
                    app.processing.status = status;
                    app.processing.duplicate_check_done = true;
                }),
            )
            .await?;

        self.journal
            .append(
                NewAuditEvent::system(
                    AuditEventKind::ApplicationLinked,
                    application_id.to_string(),
                    ResourceKind::Application,
                    "application linked to existing identity",
                )
                .detail("identity_id", serde_json::json!(identity_id.to_string()))
                .detail(
                    "matched_application_id",
                    serde_json::json!(best.matched_application_id.to_string()),
                )
                .detail("status", serde_json::json!(status)),
            )
            .await?;

        tracing::info!(
            application_id = %application_id,
            identity_id = %identity_id,
            status = %status,
            "application linked"
        );
        Ok((identity, status))
    }

    /// Resolve the identity for a matched application, creating one
    /// defensively when the matched application has none (an invariant
    /// breach that must not cascade).
    async fn identity_for_application(
        &self,
        matched_application_id: Uuid,
    ) -> Result<Identity, IdentityError> {
        let matched = self
            .store
            .get_application(matched_application_id)
            .await?
            .ok_or(IdentityError::ApplicationNotFound(matched_application_id))?;

        match matched.result.identity_id {
            Some(id) => match self.store.get_identity(id).await? {
                Some(identity) => Ok(identity),
                None => {
                    tracing::error!(
                        application_id = %matched_application_id,
                        identity_id = %id,
                        "identity record missing for matched application, recreating"
                    );
                    let identity = Identity::new(id, matched_application_id, self.clock.now());
                    self.store.insert_identity(identity.clone()).await?;
                    Ok(identity)
                }
            },
            None => {
                tracing::error!(
                    application_id = %matched_application_id,
                    "matched application has no identity, creating one defensively"
                );
                let identity = Identity::new(
                    self.mint_identity_id().await?,
                    matched_application_id,
                    self.clock.now(),
                );
                self.store.insert_identity(identity.clone()).await?;
                let identity_id = identity.identity_id;
                self.store
                    .modify_application(
                        matched_application_id,
                        Box::new(move |app| {
                            app.result.identity_id = Some(identity_id);
                        }),
                    )
                    .await?;
                Ok(identity)
            }
        }
    }

    /// Fill `matched_identity_id` on each match from the store.
    pub async fn resolve_match_identities(
        &self,
        matches: &[MatchResult],
    ) -> Result<Vec<MatchResult>, IdentityError> {
        let mut resolved = Vec::with_capacity(matches.len());
        for m in matches {
            let identity_id = self
                .store
                .get_application(m.matched_application_id)
                .await?
                .and_then(|app| app.result.identity_id);
            resolved.push(MatchResult {
                matched_application_id: m.matched_application_id,
                confidence_score: m.confidence_score,
                matched_identity_id: identity_id,
            });
        }
        Ok(resolved)
    }

    /// Embedding + vector substeps, both idempotent on the application id.
    async fn persist_embedding(
        &self,
        application_id: Uuid,
        identity_id: Uuid,
        embedding: &EmbeddingInput,
    ) -> Result<(), IdentityError> {
        if self.store.get_embedding(application_id).await?.is_none() {
            self.store
                .insert_embedding(crate::models::EmbeddingRecord {
                    application_id,
                    identity_id,
                    vector: embedding.vector.clone(),
                    model_version: embedding.model_version.clone(),
                    quality_score: embedding.quality_score,
                    face_box: embedding.face_box,
                    created_at: self.clock.now(),
                })
                .await?;
        }
        if !self.index.contains(application_id) {
            self.index.add(application_id, &embedding.vector)?;
        }
        Ok(())
    }

    /// Reviewer override. Justification must carry at least ten
    /// non-whitespace characters.
    pub async fn apply_override(
        &self,
        application_id: Uuid,
        decision: OverrideDecision,
        justification: &str,
        reviewer_id: &str,
    ) -> Result<Application, IdentityError> {
        if justification.chars().filter(|c| !c.is_whitespace()).count() < MIN_JUSTIFICATION_LEN {
            return Err(IdentityError::InvalidJustification {
                min: MIN_JUSTIFICATION_LEN,
            });
        }

        let application = self
            .store
            .get_application(application_id)
            .await?
            .ok_or(IdentityError::ApplicationNotFound(application_id))?;
        let before = application.processing.status;

        let updated = match decision {
            OverrideDecision::ApproveDuplicate => {
                if application.result.identity_id.is_none() {
                    return Err(IdentityError::InvalidState(
                        "cannot approve duplicate without a matched identity".into(),
                    ));
                }
                self.review_update(application_id, justification, reviewer_id, move |app| {
                    app.processing.status = ApplicationStatus::Duplicate;
                    app.result.is_duplicate = true;
                    app.result.requires_manual_review = false;
                })
                .await?
            }
            OverrideDecision::RejectDuplicate => {
                self.reject_duplicate(&application, justification, reviewer_id)
                    .await?
            }
            OverrideDecision::FlagForReview => {
                self.review_update(application_id, justification, reviewer_id, |app| {
                    app.result.requires_manual_review = true;
                })
                .await?
            }
        };

        self.journal
            .append(
                NewAuditEvent::system(
                    AuditEventKind::OverrideDecision,
                    application_id.to_string(),
                    ResourceKind::Application,
                    format!("reviewer override: {decision}"),
                )
                .actor(reviewer_id, ActorKind::Reviewer)
                .detail("decision", serde_json::json!(decision))
                .detail("justification", serde_json::json!(justification))
                .detail("before_status", serde_json::json!(before))
                .detail("after_status", serde_json::json!(updated.processing.status)),
            )
            .await?;

        Ok(updated)
    }

    async fn review_update(
        &self,
        application_id: Uuid,
        justification: &str,
        reviewer_id: &str,
        mutate: impl FnOnce(&mut Application) + Send + 'static,
    ) -> Result<Application, IdentityError> {
        let reviewed_at = self.clock.now();
        let notes = justification.to_string();
        let reviewer = reviewer_id.to_string();
        Ok(self
            .store
            .modify_application(
                application_id,
                Box::new(move |app| {
                    mutate(app);
                    app.result.reviewed_by = Some(reviewer);
                    app.result.review_notes = Some(notes);
                    app.result.reviewed_at = Some(reviewed_at);
                }),
            )
            .await?)
    }

    /// Reviewer decided the applicants are different people: verify this
    /// application under a fresh identity and detach it from the matched
    /// one.
    async fn reject_duplicate(
        &self,
        application: &Application,
        justification: &str,
        reviewer_id: &str,
    ) -> Result<Application, IdentityError> {
        let application_id = application.application_id;
        let previous_identity = application.result.identity_id;

        let mut fresh = Identity::new(
            self.mint_identity_id().await?,
            application_id,
            self.clock.now(),
        );
        fresh.metadata.insert(
            "override_reason".to_string(),
            serde_json::json!(justification),
        );
        fresh
            .metadata
            .insert("overridden_by".to_string(), serde_json::json!(reviewer_id));
        self.store.insert_identity(fresh.clone()).await?;

        if let Some(previous) = previous_identity {
            self.store
                .modify_identity(
                    previous,
                    Box::new(move |identity| {
                        identity.application_ids.retain(|id| *id != application_id);
                    }),
                )
                .await?;
        }
        if self.store.get_embedding(application_id).await?.is_some() {
            self.store
                .rebind_embedding(application_id, fresh.identity_id)
                .await?;
        }

        let fresh_id = fresh.identity_id;
        let updated = self
            .review_update(application_id, justification, reviewer_id, move |app| {
                app.processing.status = ApplicationStatus::Verified;
                app.result.identity_id = Some(fresh_id);
                app.result.is_duplicate = false;
                app.result.requires_manual_review = false;
            })
            .await?;

        self.journal
            .append(
                NewAuditEvent::system(
                    AuditEventKind::IdentityIssued,
                    application_id.to_string(),
                    ResourceKind::Application,
                    "fresh identity issued on override",
                )
                .actor(reviewer_id, ActorKind::Reviewer)
                .detail("identity_id", serde_json::json!(fresh_id.to_string()))
                .detail(
                    "previous_identity_id",
                    serde_json::json!(previous_identity.map(|id| id.to_string())),
                ),
            )
            .await?;

        Ok(updated)
    }

    /// Move every application from `source` onto `target`, mark the source
    /// merged and record provenance on both sides. Vector index entries are
    /// deliberately left alone; identity lookups always go through the
    /// application record.
    pub async fn merge(
        &self,
        source_id: Uuid,
        target_id: Uuid,
        reason: &str,
        actor_id: &str,
    ) -> Result<Identity, IdentityError> {
        if source_id == target_id {
            return Err(IdentityError::InvalidState(
                "cannot merge an identity into itself".into(),
            ));
        }
        let source = self
            .store
            .get_identity(source_id)
            .await?
            .ok_or(IdentityError::IdentityNotFound(source_id))?;
        let target = self
            .store
            .get_identity(target_id)
            .await?
            .ok_or(IdentityError::IdentityNotFound(target_id))?;
        if source.status == IdentityStatus::Merged {
            return Err(IdentityError::InvalidState(format!(
                "identity {source_id} is already merged"
            )));
        }
        if target.status == IdentityStatus::Merged {
            return Err(IdentityError::InvalidState(format!(
                "identity {target_id} is merged; choose its live successor"
            )));
        }

        let moved = source.application_ids.clone();
        for application_id in &moved {
            let app_id = *application_id;
            self.store
                .modify_application(
                    app_id,
                    Box::new(move |app| {
                        app.result.identity_id = Some(target_id);
                    }),
                )
                .await?;
            if self.store.get_embedding(app_id).await?.is_some() {
                self.store.rebind_embedding(app_id, target_id).await?;
            }
        }

        let now = self.clock.now();
        let moved_for_target = moved.clone();
        let updated_target = self
            .store
            .modify_identity(
                target_id,
                Box::new(move |identity| {
                    for id in &moved_for_target {
                        if !identity.application_ids.contains(id) {
                            identity.application_ids.push(*id);
                        }
                    }
                    merge_provenance(identity, "merged_from", source_id, now);
                }),
            )
            .await?;

        let reason_owned = reason.to_string();
        self.store
            .modify_identity(
                source_id,
                Box::new(move |identity| {
                    identity.status = IdentityStatus::Merged;
                    identity.application_ids.clear();
                    identity
                        .metadata
                        .insert("merged_into".to_string(), serde_json::json!(target_id.to_string()));
                    identity
                        .metadata
                        .insert("merge_reason".to_string(), serde_json::json!(reason_owned));
                }),
            )
            .await?;

        self.journal
            .append(
                NewAuditEvent::system(
                    AuditEventKind::Merge,
                    source_id.to_string(),
                    ResourceKind::Identity,
                    "identity merged",
                )
                .actor(actor_id, ActorKind::Admin)
                .detail("target_identity_id", serde_json::json!(target_id.to_string()))
                .detail("moved_applications", serde_json::json!(moved.len()))
                .detail("reason", serde_json::json!(reason)),
            )
            .await?;

        tracing::info!(
            source = %source_id,
            target = %target_id,
            moved = moved.len(),
            "identities merged"
        );
        Ok(updated_target)
    }

    /// Suspend an identity with a reason recorded in its metadata.
    pub async fn suspend(
        &self,
        identity_id: Uuid,
        reason: &str,
        actor_id: &str,
    ) -> Result<Identity, IdentityError> {
        let reason_owned = reason.to_string();
        let updated = self
            .store
            .modify_identity(
                identity_id,
                Box::new(move |identity| {
                    identity.status = IdentityStatus::Suspended;
                    identity
                        .metadata
                        .insert("suspension_reason".to_string(), serde_json::json!(reason_owned));
                }),
            )
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => IdentityError::IdentityNotFound(identity_id),
                other => IdentityError::Store(other),
            })?;

        self.journal
            .append(
                NewAuditEvent::system(
                    AuditEventKind::Suspend,
                    identity_id.to_string(),
                    ResourceKind::Identity,
                    "identity suspended",
                )
                .actor(actor_id, ActorKind::Admin)
                .detail("reason", serde_json::json!(reason)),
            )
            .await?;
        Ok(updated)
    }
}

fn merge_provenance(identity: &mut Identity, key: &str, other: Uuid, at: DateTime<Utc>) {
    let entry = serde_json::json!({
        "identity_id": other.to_string(),
        "at": at.to_rfc3339(),
    });
    match identity.metadata.get_mut(key) {
        Some(serde_json::Value::Array(list)) => list.push(entry),
        _ => {
            identity
                .metadata
                .insert(key.to_string(), serde_json::Value::Array(vec![entry]));
        }
    }
}
