//! Duplicate detection over the vector index.
//!
//! Threshold and banding are applied here, not in the index: the search
//! runs unfiltered for `top_k` candidates, everything at or above the
//! verification threshold counts as a duplicate match, and the best score
//! decides the confidence band. Borderline scores (within the margin of
//! the threshold) and ambiguous results (two or more high-band candidates)
//! are flagged for manual review instead of an automatic link.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::audit::AuditJournal;
use crate::index::{IndexError, VectorIndex};
use crate::models::{AuditEventKind, MatchResult, NewAuditEvent, ResourceKind};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum DedupError {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("audit append failed: {0}")]
    Audit(#[from] StoreError),
}

impl DedupError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Index(e) => e.is_transient(),
            Self::Audit(e) => e.is_transient(),
        }
    }
}

/// Confidence bucket for the best match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    High,
    Medium,
    Low,
    Unique,
}

impl std::fmt::Display for ConfidenceBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Unique => "unique",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Verification threshold (tau): matches at or above count as duplicates.
    pub verification_threshold: f32,
    /// High band floor.
    pub high_confidence_threshold: f32,
    /// Best scores within this margin of tau require manual review.
    pub borderline_margin: f32,
    /// ANN candidates fetched per query.
    pub top_k: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            verification_threshold: 0.85,
            high_confidence_threshold: 0.95,
            borderline_margin: 0.02,
            top_k: 10,
        }
    }
}

/// Verdict for one query vector.
#[derive(Debug, Clone, Serialize)]
pub struct DedupOutcome {
    pub is_duplicate: bool,
    pub band: ConfidenceBand,
    /// Matches at or above the threshold, descending score. Identity ids
    /// are resolved later by the identity manager.
    pub matches: Vec<MatchResult>,
    pub requires_manual_review: bool,
    pub review_reason: Option<String>,
}

impl DedupOutcome {
    fn unique() -> Self {
        Self {
            is_duplicate: false,
            band: ConfidenceBand::Unique,
            matches: Vec::new(),
            requires_manual_review: false,
            review_reason: None,
        }
    }

    pub fn best_match(&self) -> Option<&MatchResult> {
        self.matches.first()
    }
}

pub struct Deduplicator {
    index: Arc<VectorIndex>,
    journal: Arc<AuditJournal>,
    cfg: DedupConfig,
}

impl Deduplicator {
    pub fn new(index: Arc<VectorIndex>, journal: Arc<AuditJournal>, cfg: DedupConfig) -> Self {
        tracing::info!(
            threshold = cfg.verification_threshold,
            top_k = cfg.top_k,
            "deduplicator initialized"
        );
        Self {
            index,
            journal,
            cfg,
        }
    }

    fn classify(&self, score: f32) -> ConfidenceBand {
        if score >= self.cfg.high_confidence_threshold {
            ConfidenceBand::High
        } else if score >= self.cfg.verification_threshold {
            ConfidenceBand::Medium
        } else {
            ConfidenceBand::Low
        }
    }

    fn is_borderline(&self, score: f32) -> bool {
        (score - self.cfg.verification_threshold).abs() <= self.cfg.borderline_margin
    }

    /// Run the duplicate check for one query vector. `application_id` links
    /// the audit event to the submission being processed; ad-hoc queries
    /// (face utilities) pass `None` and are not journaled.
    pub async fn detect_duplicates(
        &self,
        vector: &[f32],
        application_id: Option<Uuid>,
    ) -> Result<DedupOutcome, DedupError> {
        // Unfiltered search; the threshold is our business rule, not the
        // index's.
        let hits = self.index.search(vector, self.cfg.top_k, None)?;
        let candidates: Vec<_> = hits
            .into_iter()
            .filter(|h| h.similarity >= self.cfg.verification_threshold)
            .collect();

        let outcome = if candidates.is_empty() {
            tracing::info!(application_id = ?application_id, "no duplicates found");
            DedupOutcome::unique()
        } else {
            let best = candidates[0].similarity;
            let band = self.classify(best);

            let mut requires_manual_review = false;
            let mut review_reason = None;
            if self.is_borderline(best) {
                requires_manual_review = true;
                review_reason = Some(format!(
                    "borderline match: similarity {best:.3} is within {:.3} of threshold {:.3}",
                    self.cfg.borderline_margin, self.cfg.verification_threshold
                ));
                tracing::warn!(application_id = ?application_id, best, "borderline match");
            }
            let high_count = candidates
                .iter()
                .filter(|c| c.similarity >= self.cfg.high_confidence_threshold)
                .count();
            if high_count > 1 {
                requires_manual_review = true;
                review_reason = Some(format!(
                    "ambiguous: {high_count} high-confidence matches require verification"
                ));
                tracing::warn!(application_id = ?application_id, high_count, "ambiguous matches");
            }

            DedupOutcome {
                is_duplicate: true,
                band,
                matches: candidates
                    .iter()
                    .map(|c| MatchResult {
                        matched_application_id: c.application_id,
                        confidence_score: c.similarity,
                        matched_identity_id: None,
                    })
                    .collect(),
                requires_manual_review,
                review_reason,
            }
        };

        if let Some(application_id) = application_id {
            let mut event = NewAuditEvent::system(
                AuditEventKind::DuplicateDetected,
                application_id.to_string(),
                ResourceKind::Application,
                "duplicate check completed",
            )
            .detail("is_duplicate", serde_json::json!(outcome.is_duplicate))
            .detail("band", serde_json::json!(outcome.band))
            .detail(
                "requires_manual_review",
                serde_json::json!(outcome.requires_manual_review),
            )
            .detail("candidates", serde_json::json!(outcome.matches.len()));
            if let Some(best) = outcome.best_match() {
                event = event
                    .detail("best_score", serde_json::json!(best.confidence_score))
                    .detail(
                        "matched_application_id",
                        serde_json::json!(best.matched_application_id.to_string()),
                    );
            }
            self.journal.append(event).await?;
        }

        Ok(outcome)
    }
}
