//! End-to-end pipeline scenarios: submission through identity assignment,
//! review overrides, rejection, and breaker behavior under analyzer
//! outages.

mod helpers;

use std::time::Duration;

use helpers::{
    applicant, assert_invariants, cosine, fetch_status, photo, pinned_photo, unit_with_cosine,
    Harness,
};

use faceguard::dedup::ConfidenceBand;
use faceguard::error::ErrorCode;
use faceguard::identity::OverrideDecision;
use faceguard::models::{ApplicationStatus, AuditEventKind};
use faceguard::processor::ProcessingOutcome;
use faceguard::resilience::CircuitState;
use faceguard::store::{AuditQuery, Store};

#[tokio::test]
async fn unique_duplicate_borderline_and_override_flow() {
    let h = Harness::new();
    let service = &h.ctx.service;

    // -- Fresh unique -------------------------------------------------
    let first = service
        .submit(applicant("Asha Verma"), photo(b"photo-alpha"), None)
        .await
        .unwrap();
    assert_eq!(first.status, ApplicationStatus::Pending);
    assert!(matches!(
        h.drive_one().await,
        ProcessingOutcome::Completed(ApplicationStatus::Verified)
    ));

    let first_view = service.status(first.application_id).await.unwrap();
    assert_eq!(first_view.status, ApplicationStatus::Verified);
    assert!(!first_view.is_duplicate);
    let identity_u1 = first_view.identity_id.expect("identity issued");
    assert_eq!(h.ctx.index.size(), 1);

    let issued = h
        .ctx
        .journal
        .query(
            AuditQuery {
                resource_id: Some(first.application_id.to_string()),
                event_kind: Some(AuditEventKind::IdentityIssued),
                ..AuditQuery::default()
            },
            1,
            10,
        )
        .await
        .unwrap();
    assert_eq!(issued.total, 1);

    // -- Exact duplicate (same photo bytes) ---------------------------
    let second = service
        .submit(applicant("A. Verma"), photo(b"photo-alpha"), None)
        .await
        .unwrap();
    assert!(matches!(
        h.drive_one().await,
        ProcessingOutcome::Completed(ApplicationStatus::Duplicate)
    ));

    let second_app = service.get_application(second.application_id).await.unwrap();
    assert_eq!(second_app.processing.status, ApplicationStatus::Duplicate);
    assert!(second_app.result.is_duplicate);
    assert_eq!(second_app.result.identity_id, Some(identity_u1));
    assert!(second_app.result.matches[0].confidence_score >= 0.99);
    assert_eq!(
        second_app.result.matches[0].matched_application_id,
        first.application_id
    );
    assert_eq!(h.ctx.index.size(), 2);

    let detected = h
        .ctx
        .journal
        .query(
            AuditQuery {
                resource_id: Some(second.application_id.to_string()),
                event_kind: Some(AuditEventKind::DuplicateDetected),
                ..AuditQuery::default()
            },
            1,
            10,
        )
        .await
        .unwrap();
    assert_eq!(detected.total, 1);
    assert_eq!(
        detected.items[0].details["matched_application_id"],
        serde_json::json!(first.application_id.to_string())
    );

    // The identity now lists both applications, anchored on the first.
    let identity_view = service.get_identity(identity_u1).await.unwrap();
    assert_eq!(identity_view.identity.anchor(), Some(first.application_id));
    assert_eq!(identity_view.applications.len(), 2);

    // -- Borderline third application ---------------------------------
    let anchor_vector = h.ctx.index.reconstruct(first.application_id).unwrap();
    let borderline_vector = unit_with_cosine(&anchor_vector, 0.86, 17);
    assert!((cosine(&anchor_vector, &borderline_vector) - 0.86).abs() < 1e-3);

    let third = service
        .submit(
            applicant("Asha V"),
            pinned_photo(&borderline_vector),
            None,
        )
        .await
        .unwrap();
    assert!(matches!(
        h.drive_one().await,
        ProcessingOutcome::Completed(ApplicationStatus::PendingReview)
    ));

    let third_app = service.get_application(third.application_id).await.unwrap();
    assert_eq!(third_app.processing.status, ApplicationStatus::PendingReview);
    assert!(third_app.result.requires_manual_review);
    assert!(third_app
        .result
        .review_reason
        .as_deref()
        .unwrap()
        .contains("borderline"));
    // Linked to the existing identity while it waits; no new identity yet.
    assert_eq!(third_app.result.identity_id, Some(identity_u1));
    let identities = service.list_identities(None, 1, 50).await.unwrap();
    assert_eq!(identities.total, 1);
    // Its vector is already searchable for later submissions.
    assert_eq!(h.ctx.index.size(), 3);

    // The review queue exposes the case with derived indicators.
    let pending = service.list_pending_review(1, 10).await.unwrap();
    assert_eq!(pending.total, 1);
    let case = service.get_review_case(third.application_id).await.unwrap();
    let similarity = case.similarity.unwrap();
    assert_eq!(similarity.band, ConfidenceBand::Medium);
    assert_eq!(similarity.color, "yellow");
    assert!(similarity.is_borderline);
    assert_eq!(case.review_priority, "high");
    assert!(case.field_comparison.unwrap().date_of_birth.matches);

    // -- Override: reviewer rejects the duplicate ---------------------
    let overridden = service
        .override_application(
            third.application_id,
            OverrideDecision::RejectDuplicate,
            "different persons - side-by-side facial geometry differs",
            "R1",
        )
        .await
        .unwrap();
    assert_eq!(overridden.status, ApplicationStatus::Verified);
    let identity_u2 = overridden.identity_id.unwrap();
    assert_ne!(identity_u2, identity_u1);

    // The matched identity no longer lists the third application.
    let identity_view = service.get_identity(identity_u1).await.unwrap();
    assert!(!identity_view
        .identity
        .application_ids
        .contains(&third.application_id));

    let trail = h
        .ctx
        .journal
        .query(
            AuditQuery {
                resource_id: Some(third.application_id.to_string()),
                ..AuditQuery::default()
            },
            1,
            50,
        )
        .await
        .unwrap();
    let kinds: Vec<AuditEventKind> = trail.items.iter().map(|e| e.event_kind).collect();
    assert!(kinds.contains(&AuditEventKind::OverrideDecision));
    assert!(kinds.contains(&AuditEventKind::IdentityIssued));

    assert_invariants(&h.ctx).await;
}

#[tokio::test]
async fn rejection_leaves_no_traces() {
    let h = Harness::new();
    let service = &h.ctx.service;

    let receipt = service
        .submit(applicant("No Face"), photo(b"NOFACE-frame"), None)
        .await
        .unwrap();
    assert!(matches!(
        h.drive_one().await,
        ProcessingOutcome::Rejected(ErrorCode::E001)
    ));

    let app = service.get_application(receipt.application_id).await.unwrap();
    assert_eq!(app.processing.status, ApplicationStatus::Rejected);
    assert_eq!(app.processing.error_code, Some(ErrorCode::E001));
    assert!(!app.processing.face_detected);

    // No embedding, no vector, no identity.
    assert_eq!(h.ctx.store.count_embeddings().await.unwrap(), 0);
    assert_eq!(h.ctx.index.size(), 0);
    assert_eq!(service.list_identities(None, 1, 10).await.unwrap().total, 0);

    let rejected = h
        .ctx
        .journal
        .query(
            AuditQuery {
                resource_id: Some(receipt.application_id.to_string()),
                event_kind: Some(AuditEventKind::ApplicationRejected),
                ..AuditQuery::default()
            },
            1,
            10,
        )
        .await
        .unwrap();
    assert_eq!(rejected.total, 1);
    assert!(!rejected.items[0].success);
}

#[tokio::test]
async fn quality_failures_map_to_their_codes() {
    let h = Harness::new();
    let service = &h.ctx.service;

    for (bytes, code) in [
        (&b"MULTI-frame"[..], ErrorCode::E002),
        (&b"BLUR-frame"[..], ErrorCode::E003),
        (&b"SMALL-frame"[..], ErrorCode::E004),
    ] {
        let receipt = service
            .submit(applicant("Quality Case"), photo(bytes), None)
            .await
            .unwrap();
        assert!(matches!(h.drive_one().await, ProcessingOutcome::Rejected(c) if c == code));
        assert_eq!(
            fetch_status(&h.ctx, receipt.application_id).await,
            ApplicationStatus::Rejected
        );
    }
}

#[tokio::test]
async fn breaker_opens_probes_and_recloses() {
    let h = Harness::with_settings(|s| {
        s.cb_failure_threshold = 3;
        s.cb_open_timeout = Duration::from_millis(300);
        s.cb_success_threshold = 2;
        s.retry_max_attempts = 1;
    });
    let service = &h.ctx.service;

    // Two submissions whose embeddings always fail: each pass is a single
    // analyzer attempt, each exhausts its one queue retry.
    let s1 = service
        .submit(applicant("Fail One"), photo(b"EMBEDFAIL-1"), None)
        .await
        .unwrap();
    assert!(matches!(
        h.drive_one().await,
        ProcessingOutcome::Requeued(ErrorCode::E101)
    ));
    assert!(matches!(
        h.drive_one().await,
        ProcessingOutcome::Failed(ErrorCode::E999)
    ));
    assert_eq!(
        fetch_status(&h.ctx, s1.application_id).await,
        ApplicationStatus::Failed
    );

    let s2 = service
        .submit(applicant("Fail Two"), photo(b"EMBEDFAIL-2"), None)
        .await
        .unwrap();
    // Third counted failure: the breaker opens.
    assert!(matches!(
        h.drive_one().await,
        ProcessingOutcome::Requeued(ErrorCode::E101)
    ));
    assert_eq!(
        h.ctx.analyzer_breaker.snapshot().state,
        CircuitState::Open
    );
    let embeds_when_open = h.analyzer.embeds();

    // While open, processing fails fast without reaching the analyzer.
    assert!(matches!(
        h.drive_one().await,
        ProcessingOutcome::Failed(ErrorCode::E999)
    ));
    assert_eq!(
        fetch_status(&h.ctx, s2.application_id).await,
        ApplicationStatus::Failed
    );
    assert_eq!(h.analyzer.embeds(), embeds_when_open);

    let s3 = service
        .submit(applicant("Probe Person"), photo(b"probe-photo"), None)
        .await
        .unwrap();
    assert!(matches!(
        h.drive_one().await,
        ProcessingOutcome::Requeued(ErrorCode::E503)
    ));
    assert_eq!(h.analyzer.embeds(), embeds_when_open);

    // After the open timeout one probe is admitted and succeeds.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(matches!(
        h.drive_one().await,
        ProcessingOutcome::Completed(ApplicationStatus::Verified)
    ));
    assert_eq!(
        fetch_status(&h.ctx, s3.application_id).await,
        ApplicationStatus::Verified
    );
    assert_eq!(
        h.ctx.analyzer_breaker.snapshot().state,
        CircuitState::HalfOpen
    );

    // A second success closes the breaker; normal processing resumes.
    let s4 = service
        .submit(applicant("Back To Normal"), photo(b"another-photo"), None)
        .await
        .unwrap();
    assert!(matches!(
        h.drive_one().await,
        ProcessingOutcome::Completed(ApplicationStatus::Verified)
    ));
    assert_eq!(
        fetch_status(&h.ctx, s4.application_id).await,
        ApplicationStatus::Verified
    );
    assert_eq!(
        h.ctx.analyzer_breaker.snapshot().state,
        CircuitState::Closed
    );

    // The exhausted submissions were dead-lettered.
    assert!(h.ctx.dead_letter.stats().total >= 2);
    assert_invariants(&h.ctx).await;
}

#[tokio::test]
async fn worker_pool_processes_and_shuts_down_cleanly() {
    let h = Harness::new();
    let service = &h.ctx.service;

    let mut ids = Vec::new();
    for i in 0..5 {
        let bytes = format!("pool-photo-{i}");
        let receipt = service
            .submit(applicant(&format!("Applicant {i}")), photo(bytes.as_bytes()), None)
            .await
            .unwrap();
        ids.push(receipt.application_id);
    }

    let pool = h.ctx.start();

    // Wait for all five to reach a terminal state.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let mut done = 0;
        for id in &ids {
            if fetch_status(&h.ctx, *id).await.is_terminal() {
                done += 1;
            }
        }
        if done == ids.len() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "workers did not finish in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    h.ctx.shutdown();
    pool.await.unwrap();

    // One verified, four duplicates is impossible here (distinct photos):
    // every application must be verified with its own identity.
    for id in &ids {
        assert_eq!(fetch_status(&h.ctx, *id).await, ApplicationStatus::Verified);
    }
    assert_eq!(h.ctx.index.size(), 5);
    assert_eq!(
        service.list_identities(None, 1, 50).await.unwrap().total,
        5
    );
    assert_invariants(&h.ctx).await;
}

#[tokio::test]
async fn push_channel_receives_progress_sequence() {
    let h = Harness::new();
    let service = &h.ctx.service;

    let receipt = service
        .submit(applicant("Watched One"), photo(b"watched-photo"), None)
        .await
        .unwrap();

    let mut rx = h.ctx.hub.connect("console-1", Some("reviewer".into()), None);
    assert!(h.ctx.hub.subscribe("console-1", receipt.application_id));

    assert!(matches!(
        h.drive_one().await,
        ProcessingOutcome::Completed(ApplicationStatus::Verified)
    ));

    // connection_established, subscription_confirmed, then strictly
    // increasing progress ending in processing_complete.
    use faceguard::notifier::PushMessage;
    let mut progress = Vec::new();
    let mut saw_complete = false;
    while let Ok(msg) = rx.try_recv() {
        match msg {
            PushMessage::ProcessingUpdate { progress: p, .. } => progress.push(p),
            PushMessage::ProcessingComplete { .. } => saw_complete = true,
            _ => {}
        }
    }
    assert_eq!(progress, vec![10, 20, 30, 50, 60, 70, 80, 100]);
    assert!(saw_complete);
}

#[tokio::test]
async fn batch_submit_honours_limits_and_queue_capacity() {
    let h = Harness::with_settings(|s| s.max_queue_size = 2);
    let service = &h.ctx.service;

    use faceguard::service::BatchSubmitResult;
    let batch = vec![
        (applicant("One"), photo(b"b1")),
        (applicant("Two"), photo(b"b2")),
        (applicant("Three"), photo(b"b3")),
    ];
    let results = service.submit_batch(batch, None).await.unwrap();
    let accepted = results
        .iter()
        .filter(|r| matches!(r, BatchSubmitResult::Accepted(_)))
        .count();
    assert_eq!(accepted, 2);
    match &results[2] {
        BatchSubmitResult::Rejected(envelope) => {
            assert_eq!(envelope.error_code, ErrorCode::E105);
            assert!(envelope.retry_after.is_some());
        }
        other => panic!("expected queue-full rejection, got {other:?}"),
    }
}
