//! Application record: one submission through its whole lifecycle.
//!
//! Created on submit with status `Pending`, mutated only by the owning
//! processor until a terminal status, afterwards only by reviewer override.
//! Applications are never deleted, only superseded.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCode;

/// Finite status set an application moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Pending,
    Processing,
    /// Unique applicant, identity issued.
    Verified,
    /// Linked to an existing identity.
    Duplicate,
    /// Borderline or ambiguous match, awaiting a human decision.
    PendingReview,
    /// Quality or format failure attributable to the applicant.
    Rejected,
    /// System failure after exhausting retries.
    Failed,
}

impl ApplicationStatus {
    /// Terminal statuses are left alone by the processor. `PendingReview`
    /// is terminal for the pipeline but may still change under override.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Verified | Self::Duplicate | Self::PendingReview | Self::Rejected | Self::Failed
        )
    }

    /// Valid forward transitions. Override-permitted moves out of
    /// `PendingReview`/`Duplicate` are validated by the identity manager,
    /// not here.
    pub fn can_transition_to(&self, next: ApplicationStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Processing | Self::Failed),
            Self::Processing => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Verified => "verified",
            Self::Duplicate => "duplicate",
            Self::PendingReview => "pending_review",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Pipeline stage currently (or last) driving the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Ingest,
    Analyze,
    Dedup,
    Assign,
    Done,
}

impl std::fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ingest => "ingest",
            Self::Analyze => "analyze",
            Self::Dedup => "dedup",
            Self::Assign => "assign",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

/// Applicant demographics as submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicantData {
    pub name: String,
    pub date_of_birth: NaiveDate,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    /// Free-form demographic attributes (examination board, centre, ...).
    #[serde(default)]
    pub demographics: HashMap<String, String>,
}

/// Metadata for the stored photograph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhotoRef {
    /// Blob path once the INGEST stage has persisted the bytes.
    pub storage_path: Option<String>,
    /// Declared format (jpg, jpeg, png).
    pub format: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub byte_size: u64,
    /// SHA-256 of the stored bytes, recorded at ingest.
    pub sha256: Option<String>,
    pub ingested_at: Option<DateTime<Utc>>,
}

/// Mutable processing bookkeeping owned by the processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingState {
    pub stage: ProcessingStage,
    pub status: ApplicationStatus,
    pub quality_score: Option<f32>,
    pub face_detected: bool,
    pub embedding_generated: bool,
    pub duplicate_check_done: bool,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Default for ProcessingState {
    fn default() -> Self {
        Self {
            stage: ProcessingStage::Ingest,
            status: ApplicationStatus::Pending,
            quality_score: None,
            face_detected: false,
            embedding_generated: false,
            duplicate_check_done: false,
            error_code: None,
            error_message: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// One candidate surfaced by the de-duplication search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched_application_id: Uuid,
    pub confidence_score: f32,
    /// Resolved lazily by the identity manager.
    pub matched_identity_id: Option<Uuid>,
}

/// Outcome of processing, including any reviewer override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationResult {
    pub identity_id: Option<Uuid>,
    pub is_duplicate: bool,
    /// Ordered by descending confidence.
    #[serde(default)]
    pub matches: Vec<MatchResult>,
    pub requires_manual_review: bool,
    pub review_reason: Option<String>,
    pub reviewed_by: Option<String>,
    pub review_notes: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

/// One submission, from intake to final decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub application_id: Uuid,
    pub applicant: ApplicantData,
    pub photo: PhotoRef,
    pub processing: ProcessingState,
    pub result: ApplicationResult,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Application {
    pub fn new(
        application_id: Uuid,
        applicant: ApplicantData,
        photo: PhotoRef,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            application_id,
            applicant,
            photo,
            processing: ProcessingState::default(),
            result: ApplicationResult::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> ApplicationStatus {
        self.processing.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!ApplicationStatus::Pending.is_terminal());
        assert!(!ApplicationStatus::Processing.is_terminal());
        assert!(ApplicationStatus::Verified.is_terminal());
        assert!(ApplicationStatus::PendingReview.is_terminal());
        assert!(ApplicationStatus::Failed.is_terminal());
    }

    #[test]
    fn monotonic_transitions() {
        use ApplicationStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Verified));
        assert!(Processing.can_transition_to(Rejected));
        assert!(!Verified.can_transition_to(Processing));
        assert!(!Rejected.can_transition_to(Pending));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ApplicationStatus::PendingReview).unwrap();
        assert_eq!(json, "\"pending_review\"");
    }
}
