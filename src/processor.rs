//! Pipeline driver: INGEST → ANALYZE → DEDUP → ASSIGN → DONE.
//!
//! Workers loop over the queue; each submission is driven through the stage
//! machine with per-stage wall-clock budgets, push-event progress, typed
//! failure mapping and audit coverage. Rejections are normal outcomes, not
//! errors: only system failures propagate into the retry/requeue path.
//!
//! Every write in ASSIGN is idempotent keyed on the application id, so a
//! crash mid-sequence is repaired by the next attempt rolling forward.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::audit::AuditJournal;
use crate::blob::PhotoBlobs;
use crate::cache::EmbeddingCache;
use crate::clock::Clock;
use crate::config::Settings;
use crate::dedup::{DedupError, DedupOutcome, Deduplicator};
use crate::error::ErrorCode;
use crate::identity::{EmbeddingInput, IdentityManager};
use crate::models::{
    ApplicationStatus, AuditEventKind, FaceBox, NewAuditEvent, ProcessingStage, ResourceKind,
};
use crate::notifier::{PushHub, WebhookSink};
use crate::queue::{QueueError, Submission, WorkQueue};
use crate::resilience::{CallError, DeadLetterSink, Resilience};
use crate::store::{Store, StoreError};

/// Outcome of one processing pass over a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// Terminal success: `Verified`, `Duplicate` or `PendingReview`.
    Completed(ApplicationStatus),
    /// Terminal rejection attributable to the applicant.
    Rejected(ErrorCode),
    /// Transient failure; the submission went back on the queue.
    Requeued(ErrorCode),
    /// Terminal failure (permanent, or retries exhausted).
    Failed(ErrorCode),
}

/// Stage exit taken when the happy path breaks.
#[derive(Debug)]
enum StageFailure {
    /// Applicant-attributable: terminal `Rejected`, never retried.
    Reject { code: ErrorCode, message: String },
    /// System-attributable.
    Fail {
        code: ErrorCode,
        message: String,
        retryable: bool,
    },
}

#[derive(Debug, Error)]
enum AnalyzeCallError {
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),
    #[error("analyze stage timed out")]
    Timeout,
}

impl AnalyzeCallError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Analyzer(e) => e.is_transient(),
            Self::Timeout => true,
        }
    }

    fn error_code(&self) -> ErrorCode {
        match self {
            Self::Analyzer(e) => e.error_code(),
            Self::Timeout => ErrorCode::E104,
        }
    }
}

#[derive(Debug, Error)]
enum DedupCallError {
    #[error(transparent)]
    Dedup(#[from] DedupError),
    #[error("dedup stage timed out")]
    Timeout,
}

impl DedupCallError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Dedup(e) => e.is_transient(),
            Self::Timeout => true,
        }
    }

    fn error_code(&self) -> ErrorCode {
        match self {
            Self::Dedup(_) => ErrorCode::E102,
            Self::Timeout => ErrorCode::E104,
        }
    }
}

/// What ANALYZE hands to the downstream stages.
struct AnalysisOutput {
    vector: Vec<f32>,
    quality_score: f32,
    face_box: FaceBox,
    from_cache: bool,
}

/// Final state produced by ASSIGN.
struct FinalResult {
    status: ApplicationStatus,
    identity_id: Option<Uuid>,
    is_duplicate: bool,
    matched_application_id: Option<Uuid>,
    best_score: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Queue-level requeue bound for retryable failures.
    pub max_retries: u32,
    pub ingest_budget: Duration,
    pub analyze_budget: Duration,
    pub dedup_budget: Duration,
    pub assign_budget: Duration,
    /// Worker back-off when the queue is empty.
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    pub cache_ttl: Duration,
}

impl ProcessorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_retries: settings.retry_max_attempts,
            ingest_budget: Duration::from_secs(5),
            analyze_budget: settings.processing_timeout,
            dedup_budget: Duration::from_secs(5),
            assign_budget: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            shutdown_grace: settings.shutdown_grace,
            cache_ttl: settings.cache_ttl,
        }
    }
}

pub struct Processor {
    store: Arc<dyn Store>,
    queue: Arc<WorkQueue>,
    cache: Arc<EmbeddingCache>,
    blobs: Arc<PhotoBlobs>,
    analyzer: Arc<dyn FaceAnalyzer>,
    dedup: Arc<Deduplicator>,
    identities: Arc<IdentityManager>,
    journal: Arc<AuditJournal>,
    hub: Arc<PushHub>,
    webhooks: Arc<WebhookSink>,
    analyzer_resilience: Resilience,
    index_resilience: Resilience,
    dead_letter: Arc<DeadLetterSink>,
    clock: Arc<dyn Clock>,
    cfg: ProcessorConfig,
}

#[allow(clippy::too_many_arguments)]
impl Processor {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<WorkQueue>,
        cache: Arc<EmbeddingCache>,
        blobs: Arc<PhotoBlobs>,
        analyzer: Arc<dyn FaceAnalyzer>,
        dedup: Arc<Deduplicator>,
        identities: Arc<IdentityManager>,
        journal: Arc<AuditJournal>,
        hub: Arc<PushHub>,
        webhooks: Arc<WebhookSink>,
        analyzer_resilience: Resilience,
        index_resilience: Resilience,
        dead_letter: Arc<DeadLetterSink>,
        clock: Arc<dyn Clock>,
        cfg: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            queue,
            cache,
            blobs,
            analyzer,
            dedup,
            identities,
            journal,
            hub,
            webhooks,
            analyzer_resilience,
            index_resilience,
            dead_letter,
            clock,
            cfg,
        }
    }

    /// Run `workers` cooperative workers until the shutdown signal flips.
    /// In-flight submissions get the configured grace period to finish;
    /// whatever remains is re-enqueued for the next startup.
    pub async fn run(self: Arc<Self>, workers: usize, mut shutdown: watch::Receiver<bool>) {
        let mut pool = tokio::task::JoinSet::new();
        for worker_id in 0..workers.max(1) {
            let processor = Arc::clone(&self);
            let shutdown = shutdown.clone();
            pool.spawn(async move { processor.worker_loop(worker_id, shutdown).await });
        }

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        tracing::info!("processor shutting down, waiting for in-flight work");

        let deadline = tokio::time::Instant::now() + self.cfg.shutdown_grace;
        loop {
            match tokio::time::timeout_at(deadline, pool.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!("shutdown grace elapsed, aborting workers");
                    pool.abort_all();
                    break;
                }
            }
        }

        let requeued = self.queue.drain_in_flight();
        tracing::info!(requeued, "processor stopped");
    }

    async fn worker_loop(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker_id, "processor worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.queue.dequeue() {
                Some(submission) => {
                    let _ = self.process_submission(&submission).await;
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        tracing::info!(worker_id, "processor worker stopped");
    }

    /// Drive one submission through the whole stage machine.
    pub async fn process_submission(&self, submission: &Submission) -> ProcessingOutcome {
        let application_id = submission.application_id;
        tracing::info!(
            application_id = %application_id,
            retry = submission.retry_count,
            "processing submission"
        );

        match self.run_stages(submission).await {
            Ok(final_result) => {
                let _ = self.queue.mark_complete(application_id, true);
                ProcessingOutcome::Completed(final_result.status)
            }
            Err(StageFailure::Reject { code, message }) => {
                self.terminal_reject(submission, code, &message).await;
                let _ = self.queue.mark_complete(application_id, true);
                ProcessingOutcome::Rejected(code)
            }
            Err(StageFailure::Fail {
                code,
                message,
                retryable,
            }) => self.handle_failure(submission, code, &message, retryable).await,
        }
    }

    async fn run_stages(&self, submission: &Submission) -> Result<FinalResult, StageFailure> {
        self.stage_ingest(submission).await?;
        let analysis = self.stage_analyze(submission).await?;
        let verdict = self.stage_dedup(submission, &analysis).await?;
        let final_result = self.stage_assign(submission, &analysis, &verdict).await?;
        self.stage_done(submission, &final_result).await;
        Ok(final_result)
    }

    // -- INGEST ---------------------------------------------------------

    async fn stage_ingest(&self, submission: &Submission) -> Result<(), StageFailure> {
        let application_id = submission.application_id;
        let started_at = self.clock.now();
        self.modify_app(application_id, move |app| {
            app.processing.stage = ProcessingStage::Ingest;
            app.processing.status = ApplicationStatus::Processing;
            app.processing.started_at = Some(started_at);
        })
        .await?;

        self.hub.send_processing_update(
            application_id,
            ProcessingStage::Ingest,
            "in_progress",
            10,
            "saving photograph",
            None,
        );
        if let Some(url) = &submission.webhook_url {
            let _ = self
                .webhooks
                .notify_application_status(
                    url,
                    application_id,
                    "processing",
                    serde_json::json!({ "stage": "ingest" }),
                )
                .await;
        }

        let stored = tokio::time::timeout(
            self.cfg.ingest_budget,
            self.blobs
                .save(application_id, &submission.photo_bytes, &submission.format),
        )
        .await
        .map_err(|_| StageFailure::Fail {
            code: ErrorCode::E104,
            message: "photograph ingest timed out".to_string(),
            retryable: false,
        })?
        .map_err(|e| StageFailure::Fail {
            // Blob I/O failure needs operator attention; do not retry.
            code: ErrorCode::E100,
            message: format!("photograph ingest failed: {e}"),
            retryable: false,
        })?;

        let ingested_at = self.clock.now();
        self.modify_app(application_id, move |app| {
            app.photo.storage_path = Some(stored.path.to_string_lossy().into_owned());
            app.photo.sha256 = Some(stored.sha256);
            app.photo.byte_size = stored.byte_size;
            app.photo.ingested_at = Some(ingested_at);
        })
        .await?;

        self.hub.send_processing_update(
            application_id,
            ProcessingStage::Ingest,
            "completed",
            20,
            "photograph saved",
            None,
        );
        Ok(())
    }

    // -- ANALYZE --------------------------------------------------------

    async fn stage_analyze(&self, submission: &Submission) -> Result<AnalysisOutput, StageFailure> {
        let application_id = submission.application_id;
        self.modify_app(application_id, |app| {
            app.processing.stage = ProcessingStage::Analyze;
        })
        .await?;
        self.hub.send_processing_update(
            application_id,
            ProcessingStage::Analyze,
            "in_progress",
            30,
            "detecting face",
            None,
        );

        if let Some(vector) = self.cache.get(application_id).await {
            tracing::info!(application_id = %application_id, "embedding served from cache");
            self.modify_app(application_id, |app| {
                app.processing.face_detected = true;
                app.processing.embedding_generated = true;
                app.processing.quality_score = Some(1.0);
            })
            .await?;
            self.hub.send_processing_update(
                application_id,
                ProcessingStage::Analyze,
                "completed",
                50,
                "embedding reused from cache",
                None,
            );
            return Ok(AnalysisOutput {
                vector,
                quality_score: 1.0,
                face_box: FaceBox::default(),
                from_cache: true,
            });
        }

        let analyzer = Arc::clone(&self.analyzer);
        let bytes = submission.photo_bytes.clone();
        let format = submission.format.clone();
        let budget = self.cfg.analyze_budget;
        let result = self
            .analyzer_resilience
            .call(
                "face-analyzer",
                move || {
                    let analyzer = Arc::clone(&analyzer);
                    let bytes = bytes.clone();
                    let format = format.clone();
                    async move {
                        tokio::time::timeout(budget, async {
                            let face = analyzer.detect(&bytes, &format).await?;
                            let quality = analyzer.assess(&bytes, &face).await?;
                            let vector = analyzer.embed(&face).await?;
                            Ok::<_, AnalyzerError>((face, quality, vector))
                        })
                        .await
                        .map_err(|_| AnalyzeCallError::Timeout)?
                        .map_err(AnalyzeCallError::from)
                    }
                },
                AnalyzeCallError::is_transient,
            )
            .await;

        let (face, quality, vector) = match result {
            Ok(output) => output,
            Err(CallError::Rejected(e)) => {
                // Applicant-attributable photo problem.
                return Err(StageFailure::Reject {
                    code: e.error_code(),
                    message: e.to_string(),
                });
            }
            Err(CallError::Open { retry_after, .. }) => {
                return Err(StageFailure::Fail {
                    code: ErrorCode::E503,
                    message: format!(
                        "face analyzer unavailable, breaker open for {}s",
                        retry_after.as_secs()
                    ),
                    retryable: true,
                });
            }
            Err(CallError::Exhausted { attempts, source }) => {
                return Err(StageFailure::Fail {
                    code: source.error_code(),
                    message: format!("analyzer failed after {attempts} attempts: {source}"),
                    retryable: true,
                });
            }
        };

        let face_box = face.bounding_box;
        let overall = quality.overall;
        self.modify_app(application_id, move |app| {
            app.processing.face_detected = true;
            app.processing.embedding_generated = true;
            app.processing.quality_score = Some(overall);
        })
        .await?;

        self.journal_event(
            NewAuditEvent::system(
                AuditEventKind::FaceDetected,
                application_id.to_string(),
                ResourceKind::Application,
                "face detected and quality assessed",
            )
            .detail("quality", serde_json::json!(overall)),
        )
        .await;
        self.journal_event(NewAuditEvent::system(
            AuditEventKind::EmbeddingGenerated,
            application_id.to_string(),
            ResourceKind::Application,
            "embedding generated",
        ))
        .await;

        self.cache
            .set_with_ttl(application_id, vector.clone(), self.cfg.cache_ttl)
            .await;

        self.hub.send_processing_update(
            application_id,
            ProcessingStage::Analyze,
            "completed",
            50,
            "face detected and embedding generated",
            Some(serde_json::json!({ "quality_score": overall })),
        );

        Ok(AnalysisOutput {
            vector,
            quality_score: overall,
            face_box,
            from_cache: false,
        })
    }

    // -- DEDUP ----------------------------------------------------------

    async fn stage_dedup(
        &self,
        submission: &Submission,
        analysis: &AnalysisOutput,
    ) -> Result<DedupOutcome, StageFailure> {
        let application_id = submission.application_id;
        self.modify_app(application_id, |app| {
            app.processing.stage = ProcessingStage::Dedup;
        })
        .await?;
        self.hub.send_processing_update(
            application_id,
            ProcessingStage::Dedup,
            "in_progress",
            60,
            "checking for duplicate applications",
            None,
        );

        let dedup = Arc::clone(&self.dedup);
        let vector = analysis.vector.clone();
        let budget = self.cfg.dedup_budget;
        let result = self
            .index_resilience
            .call(
                "vector-index",
                move || {
                    let dedup = Arc::clone(&dedup);
                    let vector = vector.clone();
                    async move {
                        tokio::time::timeout(
                            budget,
                            dedup.detect_duplicates(&vector, Some(application_id)),
                        )
                        .await
                        .map_err(|_| DedupCallError::Timeout)?
                        .map_err(DedupCallError::from)
                    }
                },
                DedupCallError::is_transient,
            )
            .await;

        let verdict = match result {
            Ok(verdict) => verdict,
            Err(CallError::Open { retry_after, .. }) => {
                return Err(StageFailure::Fail {
                    code: ErrorCode::E503,
                    message: format!(
                        "vector index unavailable, breaker open for {}s",
                        retry_after.as_secs()
                    ),
                    retryable: true,
                });
            }
            Err(CallError::Exhausted { attempts, source }) => {
                return Err(StageFailure::Fail {
                    code: source.error_code(),
                    message: format!("duplicate check failed after {attempts} attempts: {source}"),
                    retryable: true,
                });
            }
            Err(CallError::Rejected(source)) => {
                // Permanent: an invariant broke (bad dimension, corrupt
                // record). Not worth retrying.
                return Err(StageFailure::Fail {
                    code: source.error_code(),
                    message: source.to_string(),
                    retryable: false,
                });
            }
        };

        self.hub.send_processing_update(
            application_id,
            ProcessingStage::Dedup,
            "completed",
            70,
            "duplicate check completed",
            Some(serde_json::json!({
                "is_duplicate": verdict.is_duplicate,
                "band": verdict.band,
                "cached_embedding": analysis.from_cache,
            })),
        );
        Ok(verdict)
    }

    // -- ASSIGN ---------------------------------------------------------

    async fn stage_assign(
        &self,
        submission: &Submission,
        analysis: &AnalysisOutput,
        verdict: &DedupOutcome,
    ) -> Result<FinalResult, StageFailure> {
        let application_id = submission.application_id;
        self.modify_app(application_id, |app| {
            app.processing.stage = ProcessingStage::Assign;
        })
        .await?;
        self.hub.send_processing_update(
            application_id,
            ProcessingStage::Assign,
            "in_progress",
            80,
            "assigning identity",
            None,
        );

        let embedding = EmbeddingInput {
            vector: analysis.vector.clone(),
            quality_score: analysis.quality_score,
            face_box: analysis.face_box,
            model_version: self.analyzer.model_version(),
        };

        let assignment = tokio::time::timeout(self.cfg.assign_budget, async {
            if verdict.is_duplicate {
                self.identities
                    .link_duplicate(application_id, verdict, &embedding)
                    .await
            } else {
                self.identities
                    .assign_unique(application_id, &embedding)
                    .await
                    .map(|identity| (identity, ApplicationStatus::Verified))
            }
        })
        .await
        .map_err(|_| StageFailure::Fail {
            code: ErrorCode::E104,
            message: "identity assignment timed out".to_string(),
            retryable: true,
        })?;

        let (identity, status) = assignment.map_err(|e| StageFailure::Fail {
            code: ErrorCode::E103,
            message: e.to_string(),
            retryable: e.is_transient(),
        })?;

        let completed_at = self.clock.now();
        self.modify_app(application_id, move |app| {
            app.processing.stage = ProcessingStage::Done;
            app.processing.completed_at = Some(completed_at);
        })
        .await?;

        Ok(FinalResult {
            status,
            identity_id: Some(identity.identity_id),
            is_duplicate: verdict.is_duplicate,
            matched_application_id: verdict.best_match().map(|m| m.matched_application_id),
            best_score: verdict.best_match().map(|m| m.confidence_score),
        })
    }

    // -- DONE -----------------------------------------------------------

    async fn stage_done(&self, submission: &Submission, final_result: &FinalResult) {
        let application_id = submission.application_id;
        let result_json = serde_json::json!({
            "status": final_result.status,
            "identity_id": final_result.identity_id.map(|id| id.to_string()),
            "is_duplicate": final_result.is_duplicate,
        });
        self.hub.send_processing_update(
            application_id,
            ProcessingStage::Done,
            "completed",
            100,
            "processing completed",
            None,
        );
        self.hub.send_complete(application_id, result_json);

        if let Some(url) = &submission.webhook_url {
            let status_label = match final_result.status {
                ApplicationStatus::Verified => "approved",
                ApplicationStatus::Duplicate => "duplicate",
                ApplicationStatus::PendingReview => "pending_review",
                other => {
                    tracing::warn!(status = %other, "unexpected final status for webhook");
                    return;
                }
            };
            let _ = self
                .webhooks
                .notify_application_status(
                    url,
                    application_id,
                    status_label,
                    serde_json::json!({}),
                )
                .await;

            match (final_result.is_duplicate, final_result.identity_id) {
                (false, Some(identity_id)) => {
                    let _ = self
                        .webhooks
                        .notify_identity_created(url, application_id, identity_id)
                        .await;
                }
                (true, _) => {
                    if let (Some(matched), Some(score)) =
                        (final_result.matched_application_id, final_result.best_score)
                    {
                        let _ = self
                            .webhooks
                            .notify_duplicate_detected(url, application_id, matched, score)
                            .await;
                    }
                }
                _ => {}
            }
        }

        tracing::info!(
            application_id = %application_id,
            status = %final_result.status,
            "submission processed"
        );
    }

    // -- failure handling ------------------------------------------------

    async fn terminal_reject(&self, submission: &Submission, code: ErrorCode, message: &str) {
        let application_id = submission.application_id;
        let completed_at = self.clock.now();
        let msg = message.to_string();
        let _ = self
            .modify_app(application_id, move |app| {
                app.processing.status = ApplicationStatus::Rejected;
                app.processing.error_code = Some(code);
                app.processing.error_message = Some(msg);
                app.processing.completed_at = Some(completed_at);
            })
            .await;

        self.journal_event(
            NewAuditEvent::system(
                AuditEventKind::ApplicationRejected,
                application_id.to_string(),
                ResourceKind::Application,
                "application rejected",
            )
            .detail("error_code", serde_json::json!(code))
            .failed(message),
        )
        .await;

        self.hub.send_error(application_id, code, message);
        if let Some(url) = &submission.webhook_url {
            let _ = self
                .webhooks
                .notify_application_status(
                    url,
                    application_id,
                    "rejected",
                    serde_json::json!({
                        "error_code": code,
                        "error_message": message,
                    }),
                )
                .await;
        }
        tracing::info!(
            application_id = %application_id,
            code = %code,
            "submission rejected"
        );
    }

    async fn handle_failure(
        &self,
        submission: &Submission,
        code: ErrorCode,
        message: &str,
        retryable: bool,
    ) -> ProcessingOutcome {
        let application_id = submission.application_id;

        if retryable {
            match self.queue.requeue(application_id, self.cfg.max_retries) {
                Ok(retry) => {
                    tracing::warn!(
                        application_id = %application_id,
                        code = %code,
                        retry,
                        "transient failure, submission requeued"
                    );
                    let msg = message.to_string();
                    let _ = self
                        .modify_app(application_id, move |app| {
                            app.processing.error_code = Some(code);
                            app.processing.error_message = Some(msg);
                        })
                        .await;
                    return ProcessingOutcome::Requeued(code);
                }
                Err(QueueError::RetriesExhausted(_)) => {
                    self.terminal_fail(submission, ErrorCode::E999, message).await;
                    self.dead_letter.record(
                        code.as_str(),
                        message,
                        serde_json::json!({
                            "application_id": application_id.to_string(),
                            "retries": submission.retry_count,
                        }),
                        self.clock.now(),
                    );
                    return ProcessingOutcome::Failed(ErrorCode::E999);
                }
                Err(e) => {
                    tracing::error!(
                        application_id = %application_id,
                        error = %e,
                        "requeue failed, marking terminal"
                    );
                }
            }
        }

        self.terminal_fail(submission, code, message).await;
        let _ = self.queue.mark_complete(application_id, false);
        ProcessingOutcome::Failed(code)
    }

    async fn terminal_fail(&self, submission: &Submission, code: ErrorCode, message: &str) {
        let application_id = submission.application_id;
        let completed_at = self.clock.now();
        let msg = message.to_string();
        let _ = self
            .modify_app(application_id, move |app| {
                app.processing.status = ApplicationStatus::Failed;
                app.processing.error_code = Some(code);
                app.processing.error_message = Some(msg);
                app.processing.completed_at = Some(completed_at);
            })
            .await;

        self.journal_event(
            NewAuditEvent::system(
                AuditEventKind::ProcessingFailed,
                application_id.to_string(),
                ResourceKind::Application,
                "processing failed",
            )
            .detail("error_code", serde_json::json!(code))
            .failed(message),
        )
        .await;

        self.hub.send_error(application_id, code, message);
        if let Some(url) = &submission.webhook_url {
            let _ = self
                .webhooks
                .notify_application_status(
                    url,
                    application_id,
                    "failed",
                    serde_json::json!({ "error_code": code }),
                )
                .await;
        }
        tracing::error!(
            application_id = %application_id,
            code = %code,
            message,
            "submission failed terminally"
        );
    }

    // -- helpers ---------------------------------------------------------

    async fn modify_app(
        &self,
        application_id: Uuid,
        mutate: impl FnOnce(&mut crate::models::Application) + Send + 'static,
    ) -> Result<(), StageFailure> {
        self.store
            .modify_application(application_id, Box::new(mutate))
            .await
            .map(|_| ())
            .map_err(|e| match e {
                StoreError::NotFound(_) => StageFailure::Fail {
                    code: ErrorCode::E202,
                    message: format!("application {application_id} missing"),
                    retryable: false,
                },
                other => StageFailure::Fail {
                    code: ErrorCode::E200,
                    message: other.to_string(),
                    retryable: other.is_transient(),
                },
            })
    }

    /// Audit failures must never break processing; log and continue.
    async fn journal_event(&self, event: NewAuditEvent) {
        if let Err(e) = self.journal.append(event).await {
            tracing::error!(error = %e, "audit append failed");
        }
    }
}
