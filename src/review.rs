//! Review-case payloads for the human decision queue.
//!
//! Everything a review client renders (band label, color hint, borderline
//! flag, per-field match flags) is derived here from the raw scores, so
//! every client agrees on the same bands.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::dedup::{ConfidenceBand, DedupConfig};
use crate::models::{Application, ApplicationStatus};
use crate::store::{Page, Store, StoreError};

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("application {0} not found")]
    NotFound(Uuid),
    #[error("application {0} has no recorded matches to review")]
    NothingToReview(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplicationSummary {
    pub application_id: Uuid,
    pub name: String,
    pub date_of_birth: NaiveDate,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: ApplicationStatus,
    pub quality_score: Option<f32>,
    pub photo_path: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

impl ApplicationSummary {
    fn from_application(app: &Application) -> Self {
        Self {
            application_id: app.application_id,
            name: app.applicant.name.clone(),
            date_of_birth: app.applicant.date_of_birth,
            email: app.applicant.email.clone(),
            phone: app.applicant.phone.clone(),
            status: app.processing.status,
            quality_score: app.processing.quality_score,
            photo_path: app.photo.storage_path.clone(),
            submitted_at: app.created_at,
        }
    }
}

/// Visual indicators derived from the best-match score.
#[derive(Debug, Clone, Serialize)]
pub struct SimilarityIndicators {
    pub confidence_score: f32,
    pub band: ConfidenceBand,
    /// green / yellow / red hint for the console.
    pub color: &'static str,
    pub is_borderline: bool,
}

impl SimilarityIndicators {
    pub fn derive(score: f32, cfg: &DedupConfig) -> Self {
        let (band, color) = if score >= cfg.high_confidence_threshold {
            (ConfidenceBand::High, "green")
        } else if score >= cfg.verification_threshold {
            (ConfidenceBand::Medium, "yellow")
        } else {
            (ConfidenceBand::Low, "red")
        };
        Self {
            confidence_score: score,
            band,
            color,
            is_borderline: (score - cfg.verification_threshold).abs() <= cfg.borderline_margin,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldMatch {
    pub current: Option<String>,
    pub matched: Option<String>,
    pub matches: bool,
}

fn field_match(current: Option<String>, matched: Option<String>) -> FieldMatch {
    let matches = match (&current, &matched) {
        (Some(a), Some(b)) => a.trim().eq_ignore_ascii_case(b.trim()),
        _ => false,
    };
    FieldMatch {
        current,
        matched,
        matches,
    }
}

/// Field-by-field demographic comparison between the application under
/// review and its best match.
#[derive(Debug, Clone, Serialize)]
pub struct FieldComparison {
    pub name: FieldMatch,
    pub email: FieldMatch,
    pub phone: FieldMatch,
    pub date_of_birth: FieldMatch,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewCase {
    pub application: ApplicationSummary,
    pub matched_application: Option<ApplicationSummary>,
    pub similarity: Option<SimilarityIndicators>,
    pub field_comparison: Option<FieldComparison>,
    pub review_reason: Option<String>,
    pub review_priority: &'static str,
}

pub struct ReviewService {
    store: Arc<dyn Store>,
    cfg: DedupConfig,
}

impl ReviewService {
    pub fn new(store: Arc<dyn Store>, cfg: DedupConfig) -> Self {
        Self { store, cfg }
    }

    /// Applications waiting on a reviewer, newest first.
    pub async fn list_pending(&self, page: usize, size: usize) -> Result<Page<Application>, ReviewError> {
        Ok(self
            .store
            .list_applications(Some(ApplicationStatus::PendingReview), page, size)
            .await?)
    }

    /// Full comparison view for one application.
    pub async fn build_case(&self, application_id: Uuid) -> Result<ReviewCase, ReviewError> {
        let application = self
            .store
            .get_application(application_id)
            .await?
            .ok_or(ReviewError::NotFound(application_id))?;

        let best = application.result.matches.first().cloned();
        let matched_application = match &best {
            Some(m) => self.store.get_application(m.matched_application_id).await?,
            None => None,
        };

        let similarity = best
            .as_ref()
            .map(|m| SimilarityIndicators::derive(m.confidence_score, &self.cfg));
        let field_comparison = matched_application.as_ref().map(|matched| FieldComparison {
            name: field_match(
                Some(application.applicant.name.clone()),
                Some(matched.applicant.name.clone()),
            ),
            email: field_match(
                application.applicant.email.clone(),
                matched.applicant.email.clone(),
            ),
            phone: field_match(
                application.applicant.phone.clone(),
                matched.applicant.phone.clone(),
            ),
            date_of_birth: field_match(
                Some(application.applicant.date_of_birth.to_string()),
                Some(matched.applicant.date_of_birth.to_string()),
            ),
        });

        let review_priority = match &similarity {
            Some(s) if s.is_borderline => "high",
            _ => "normal",
        };

        Ok(ReviewCase {
            application: ApplicationSummary::from_application(&application),
            matched_application: matched_application
                .as_ref()
                .map(ApplicationSummary::from_application),
            similarity,
            field_comparison,
            review_reason: application.result.review_reason.clone(),
            review_priority,
        })
    }
}
