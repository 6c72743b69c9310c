//! Shared fixtures for the integration suite.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use uuid::Uuid;

use faceguard::analyzer::{
    AnalyzerError, DetectedFace, FaceAnalyzer, QualityScores, StubAnalyzer,
};
use faceguard::models::ApplicationStatus;
use faceguard::processor::ProcessingOutcome;
use faceguard::service::{NewApplicant, PhotoUpload};
use faceguard::store::Store;
use faceguard::{AppContext, Settings, EMBEDDING_DIM};

/// Stub analyzer wrapper that counts invocations, for asserting that an
/// open breaker short-circuits without reaching the model.
pub struct CountingAnalyzer {
    inner: StubAnalyzer,
    pub detect_calls: AtomicUsize,
    pub embed_calls: AtomicUsize,
}

impl CountingAnalyzer {
    pub fn new() -> Self {
        Self {
            inner: StubAnalyzer::with_defaults(),
            detect_calls: AtomicUsize::new(0),
            embed_calls: AtomicUsize::new(0),
        }
    }

    pub fn embeds(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FaceAnalyzer for CountingAnalyzer {
    async fn detect(&self, image: &[u8], format: &str) -> Result<DetectedFace, AnalyzerError> {
        self.detect_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.detect(image, format).await
    }

    async fn assess(
        &self,
        image: &[u8],
        face: &DetectedFace,
    ) -> Result<QualityScores, AnalyzerError> {
        self.inner.assess(image, face).await
    }

    async fn embed(&self, face: &DetectedFace) -> Result<Vec<f32>, AnalyzerError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.embed(face).await
    }

    fn model_version(&self) -> String {
        self.inner.model_version()
    }
}

pub struct Harness {
    pub ctx: AppContext,
    pub analyzer: Arc<CountingAnalyzer>,
    _blob_dir: TempDir,
    _index_dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(tweak: impl FnOnce(&mut Settings)) -> Self {
        init_tracing();
        let blob_dir = TempDir::new().expect("blob dir");
        let index_dir = TempDir::new().expect("index dir");
        let mut settings = Settings {
            blob_dir: blob_dir.path().to_path_buf(),
            index_dir: index_dir.path().to_path_buf(),
            retry_initial_delay: Duration::from_millis(5),
            retry_max_delay: Duration::from_millis(20),
            ..Settings::default()
        };
        tweak(&mut settings);

        let analyzer = Arc::new(CountingAnalyzer::new());
        let ctx = AppContext::initialize(settings, analyzer.clone()).expect("context");
        Self {
            ctx,
            analyzer,
            _blob_dir: blob_dir,
            _index_dir: index_dir,
        }
    }

    /// Dequeue and fully process one submission.
    pub async fn drive_one(&self) -> ProcessingOutcome {
        let submission = self.ctx.queue.dequeue().expect("queue should have work");
        self.ctx.processor.process_submission(&submission).await
    }
}

/// `RUST_LOG=faceguard=debug cargo test` shows pipeline traces.
fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn applicant(name: &str) -> NewApplicant {
    NewApplicant {
        name: name.to_string(),
        date_of_birth: NaiveDate::from_ymd_opt(1990, 1, 1).unwrap(),
        email: Some(format!("{}@example.org", name.to_ascii_lowercase().replace(' ', "."))),
        phone: Some("+1-555-0100".to_string()),
        address: None,
        demographics: HashMap::new(),
    }
}

pub fn photo(bytes: &[u8]) -> PhotoUpload {
    PhotoUpload {
        bytes: bytes.to_vec(),
        format: "jpg".to_string(),
        width: Some(640),
        height: Some(480),
    }
}

/// Photo whose embedding is pinned to exactly `vector`.
pub fn pinned_photo(vector: &[f32]) -> PhotoUpload {
    let bytes = [b"VEC:".to_vec(), serde_json::to_vec(vector).unwrap()].concat();
    PhotoUpload {
        bytes,
        format: "jpg".to_string(),
        width: Some(640),
        height: Some(480),
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let na = dot(a, a).sqrt();
    let nb = dot(b, b).sqrt();
    dot(a, b) / (na * nb)
}

/// Unit vector with the requested cosine against `base` (itself unit-norm).
pub fn unit_with_cosine(base: &[f32], target: f32, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ortho: Vec<f32> = (0..base.len()).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    let along = dot(&ortho, base);
    for (o, b) in ortho.iter_mut().zip(base) {
        *o -= along * b;
    }
    let norm = dot(&ortho, &ortho).sqrt();
    ortho.iter_mut().for_each(|o| *o /= norm);

    let residual = (1.0 - target * target).sqrt();
    base.iter()
        .zip(&ortho)
        .map(|(b, o)| target * b + residual * o)
        .collect()
}

/// The quantified invariants of the data model, checked against live state.
pub async fn assert_invariants(ctx: &AppContext) {
    let apps = ctx
        .store
        .list_applications(None, 1, 10_000)
        .await
        .unwrap()
        .items;

    for app in &apps {
        let status = app.processing.status;

        // Identity cardinality: one identity per verified/duplicate
        // application, membership recorded on the identity.
        if matches!(
            status,
            ApplicationStatus::Verified | ApplicationStatus::Duplicate
        ) {
            let identity_id = app
                .result
                .identity_id
                .unwrap_or_else(|| panic!("{} lacks an identity", app.application_id));
            let identity = ctx
                .store
                .get_identity(identity_id)
                .await
                .unwrap()
                .unwrap_or_else(|| panic!("identity {identity_id} missing"));
            assert!(
                identity.contains(app.application_id),
                "identity {identity_id} does not list {}",
                app.application_id
            );
            assert!(identity.anchor().is_some());
        }

        // Embedding bijection + vector/store consistency.
        if matches!(
            status,
            ApplicationStatus::Verified
                | ApplicationStatus::Duplicate
                | ApplicationStatus::PendingReview
        ) {
            let record = ctx
                .store
                .get_embedding(app.application_id)
                .await
                .unwrap()
                .unwrap_or_else(|| panic!("{} lacks an embedding record", app.application_id));
            assert_eq!(record.vector.len(), EMBEDDING_DIM);
            let norm = record.l2_norm();
            assert!((0.99..=1.01).contains(&norm), "norm {norm} out of range");

            assert!(ctx.index.contains(app.application_id));
            let indexed = ctx.index.reconstruct(app.application_id).unwrap();
            assert!(
                cosine(&indexed, &record.vector) >= 0.999,
                "index and store disagree for {}",
                app.application_id
            );
        }
    }
}

pub async fn fetch_status(ctx: &AppContext, id: Uuid) -> ApplicationStatus {
    ctx.store
        .get_application(id)
        .await
        .unwrap()
        .unwrap()
        .processing
        .status
}
