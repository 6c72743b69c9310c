//! Composition root.
//!
//! Every capability handle is constructed exactly once here and passed down
//! explicitly; no component reaches for globals. Shutdown propagates
//! through a watch channel and disposes workers before the queue drains
//! in-flight work back for the next startup.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;

use crate::analyzer::FaceAnalyzer;
use crate::audit::AuditJournal;
use crate::blob::PhotoBlobs;
use crate::cache::EmbeddingCache;
use crate::clock::{Clock, SystemClock};
use crate::config::Settings;
use crate::dedup::{DedupConfig, Deduplicator};
use crate::identity::IdentityManager;
use crate::index::{IndexConfig, VectorIndex};
use crate::notifier::{PushHub, WebhookConfig, WebhookSink};
use crate::processor::{Processor, ProcessorConfig};
use crate::queue::WorkQueue;
use crate::resilience::{BreakerConfig, CircuitBreaker, DeadLetterSink, Resilience, RetryPolicy};
use crate::review::ReviewService;
use crate::service::EnrollmentService;
use crate::store::{MemoryStore, Store};

/// Dead-letter capacity; plenty for operator inspection windows.
const DEAD_LETTER_CAPACITY: usize = 1000;

pub struct AppContext {
    pub settings: Arc<Settings>,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<dyn Store>,
    pub index: Arc<VectorIndex>,
    pub cache: Arc<EmbeddingCache>,
    pub queue: Arc<WorkQueue>,
    pub blobs: Arc<PhotoBlobs>,
    pub journal: Arc<AuditJournal>,
    pub dedup: Arc<Deduplicator>,
    pub identities: Arc<IdentityManager>,
    pub hub: Arc<PushHub>,
    pub webhooks: Arc<WebhookSink>,
    pub dead_letter: Arc<DeadLetterSink>,
    pub analyzer_breaker: Arc<CircuitBreaker>,
    pub index_breaker: Arc<CircuitBreaker>,
    pub processor: Arc<Processor>,
    pub service: Arc<EnrollmentService>,
    shutdown_tx: watch::Sender<bool>,
}

impl AppContext {
    /// Build the full pipeline against the in-memory store engine and the
    /// persistent vector index under `settings.index_dir`.
    pub fn initialize(
        settings: Settings,
        analyzer: Arc<dyn FaceAnalyzer>,
    ) -> anyhow::Result<Self> {
        settings.validate().context("invalid settings")?;
        let settings = Arc::new(settings);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let store: Arc<dyn Store> = Arc::new(MemoryStore::new(clock.clone()));
        let index = Arc::new(VectorIndex::open(
            IndexConfig {
                dim: settings.embedding_dim,
                nlist: settings.ann_nlist,
                nprobe: settings.ann_nprobe,
                ..IndexConfig::default()
            },
            settings.index_dir.clone(),
        ));
        let cache = Arc::new(EmbeddingCache::new(settings.cache_ttl, clock.clone()));
        let queue = Arc::new(WorkQueue::new(settings.max_queue_size));
        let blobs = Arc::new(PhotoBlobs::new(settings.blob_dir.clone()));
        let journal = Arc::new(AuditJournal::new(store.clone(), clock.clone()));
        let hub = Arc::new(PushHub::new(clock.clone()));
        let webhooks = Arc::new(WebhookSink::new(WebhookConfig::default(), clock.clone()));
        let dead_letter = Arc::new(DeadLetterSink::new(DEAD_LETTER_CAPACITY));

        let breaker_cfg = BreakerConfig {
            failure_threshold: settings.cb_failure_threshold,
            open_timeout: settings.cb_open_timeout,
            success_threshold: settings.cb_success_threshold,
        };
        let retry = RetryPolicy {
            max_attempts: settings.retry_max_attempts,
            initial_delay: settings.retry_initial_delay,
            max_delay: settings.retry_max_delay,
            base: settings.retry_base,
            jitter: true,
        };
        let analyzer_breaker = Arc::new(CircuitBreaker::new("face-analyzer", breaker_cfg.clone()));
        let index_breaker = Arc::new(CircuitBreaker::new("vector-index", breaker_cfg));
        let analyzer_resilience = Resilience::new(
            analyzer_breaker.clone(),
            retry.clone(),
            dead_letter.clone(),
            clock.clone(),
        );
        let index_resilience = Resilience::new(
            index_breaker.clone(),
            retry,
            dead_letter.clone(),
            clock.clone(),
        );

        let dedup_cfg = DedupConfig {
            verification_threshold: settings.verification_threshold,
            ..DedupConfig::default()
        };
        let dedup = Arc::new(Deduplicator::new(
            index.clone(),
            journal.clone(),
            dedup_cfg.clone(),
        ));
        let identities = Arc::new(IdentityManager::new(
            store.clone(),
            index.clone(),
            journal.clone(),
            clock.clone(),
        ));

        let processor = Arc::new(Processor::new(
            store.clone(),
            queue.clone(),
            cache.clone(),
            blobs.clone(),
            analyzer.clone(),
            dedup.clone(),
            identities.clone(),
            journal.clone(),
            hub.clone(),
            webhooks.clone(),
            analyzer_resilience,
            index_resilience,
            dead_letter.clone(),
            clock.clone(),
            ProcessorConfig::from_settings(&settings),
        ));

        let service = Arc::new(EnrollmentService::new(
            settings.clone(),
            store.clone(),
            queue.clone(),
            cache.clone(),
            index.clone(),
            journal.clone(),
            identities.clone(),
            analyzer,
            hub.clone(),
            dead_letter.clone(),
            ReviewService::new(store.clone(), dedup_cfg),
            clock.clone(),
        ));

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            settings,
            clock,
            store,
            index,
            cache,
            queue,
            blobs,
            journal,
            dedup,
            identities,
            hub,
            webhooks,
            dead_letter,
            analyzer_breaker,
            index_breaker,
            processor,
            service,
            shutdown_tx,
        })
    }

    /// Spawn the worker pool. Returns the handle that resolves once the
    /// pool has fully stopped after [`Self::shutdown`].
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let processor = self.processor.clone();
        let workers = self.settings.worker_count;
        let rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move { processor.run(workers, rx).await })
    }

    /// Signal cooperative shutdown to the worker pool.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
