//! TTL cache of application id → embedding vector.
//!
//! Two backings behind one type: a process-local map, and an optional
//! shared key-value store consulted first so workers on other processes see
//! each other's embeddings. Shared-store trouble is never allowed to stall
//! the pipeline: every remote call is bounded by a timeout and guarded by a
//! circuit breaker, and any failure is simply treated as a miss.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::clock::Clock;
use crate::resilience::CircuitBreaker;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("shared store unavailable: {0}")]
    Unavailable(String),
    #[error("shared store payload corrupt: {0}")]
    Corrupt(String),
}

/// Remote key-value backing (Redis-shaped, but implementation-free).
#[async_trait]
pub trait SharedKv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), KvError>;
    async fn delete(&self, key: &str) -> Result<(), KvError>;
    async fn clear(&self) -> Result<(), KvError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub ttl_seconds: u64,
    pub shared_backing: bool,
}

struct Entry {
    vector: Vec<f32>,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
}

struct SharedBacking {
    kv: Arc<dyn SharedKv>,
    breaker: Arc<CircuitBreaker>,
    call_timeout: Duration,
}

pub struct EmbeddingCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    local: Mutex<HashMap<Uuid, Entry>>,
    shared: Option<SharedBacking>,
    counters: Mutex<Counters>,
}

impl EmbeddingCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            local: Mutex::new(HashMap::new()),
            shared: None,
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Attach a shared backing. `call_timeout` bounds every remote call;
    /// a timeout is treated as a miss and counted by the breaker.
    pub fn with_shared(
        mut self,
        kv: Arc<dyn SharedKv>,
        breaker: Arc<CircuitBreaker>,
        call_timeout: Duration,
    ) -> Self {
        self.shared = Some(SharedBacking {
            kv,
            breaker,
            call_timeout,
        });
        self
    }

    fn key(application_id: Uuid) -> String {
        format!("embedding:{application_id}")
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        self.clock.now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero())
    }

    pub async fn get(&self, application_id: Uuid) -> Option<Vec<f32>> {
        if let Some(vector) = self.shared_get(application_id).await {
            self.counters.lock().expect("cache lock poisoned").hits += 1;
            tracing::debug!(application_id = %application_id, "embedding cache hit (shared)");
            return Some(vector);
        }

        let now = self.clock.now();
        let mut local = self.local.lock().expect("cache lock poisoned");
        match local.get(&application_id) {
            Some(entry) if entry.expires_at > now => {
                let vector = entry.vector.clone();
                drop(local);
                self.counters.lock().expect("cache lock poisoned").hits += 1;
                tracing::debug!(application_id = %application_id, "embedding cache hit (local)");
                Some(vector)
            }
            Some(_) => {
                local.remove(&application_id);
                drop(local);
                let mut counters = self.counters.lock().expect("cache lock poisoned");
                counters.evictions += 1;
                counters.misses += 1;
                None
            }
            None => {
                drop(local);
                self.counters.lock().expect("cache lock poisoned").misses += 1;
                None
            }
        }
    }

    pub async fn set(&self, application_id: Uuid, vector: Vec<f32>) {
        self.set_with_ttl(application_id, vector, self.ttl).await;
    }

    pub async fn set_with_ttl(&self, application_id: Uuid, vector: Vec<f32>, ttl: Duration) {
        self.local
            .lock()
            .expect("cache lock poisoned")
            .insert(
                application_id,
                Entry {
                    vector: vector.clone(),
                    expires_at: self.expiry(ttl),
                },
            );
        self.shared_set(application_id, &vector, ttl).await;
    }

    pub async fn delete(&self, application_id: Uuid) -> bool {
        let removed = self
            .local
            .lock()
            .expect("cache lock poisoned")
            .remove(&application_id)
            .is_some();
        if let Some(shared) = &self.shared {
            let key = Self::key(application_id);
            let kv = Arc::clone(&shared.kv);
            let timeout = shared.call_timeout;
            let result = shared
                .breaker
                .call(|| async move {
                    tokio::time::timeout(timeout, kv.delete(&key))
                        .await
                        .map_err(|_| KvError::Unavailable("timeout".into()))?
                })
                .await;
            if let Err(e) = result {
                tracing::warn!(error = %e, "shared cache delete failed");
            }
        }
        removed
    }

    pub async fn clear(&self) -> usize {
        let count = {
            let mut local = self.local.lock().expect("cache lock poisoned");
            let count = local.len();
            local.clear();
            count
        };
        if let Some(shared) = &self.shared {
            let kv = Arc::clone(&shared.kv);
            let timeout = shared.call_timeout;
            let result = shared
                .breaker
                .call(|| async move {
                    tokio::time::timeout(timeout, kv.clear())
                        .await
                        .map_err(|_| KvError::Unavailable("timeout".into()))?
                })
                .await;
            if let Err(e) = result {
                tracing::warn!(error = %e, "shared cache clear failed");
            }
        }
        count
    }

    /// Reclaim expired local entries eagerly. Optional: `get` already
    /// evicts lazily.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut local = self.local.lock().expect("cache lock poisoned");
        let before = local.len();
        local.retain(|_, entry| entry.expires_at > now);
        let swept = before - local.len();
        if swept > 0 {
            self.counters.lock().expect("cache lock poisoned").evictions += swept as u64;
        }
        swept
    }

    pub fn stats(&self) -> CacheStats {
        let counters = self.counters.lock().expect("cache lock poisoned");
        CacheStats {
            hits: counters.hits,
            misses: counters.misses,
            evictions: counters.evictions,
            size: self.local.lock().expect("cache lock poisoned").len(),
            ttl_seconds: self.ttl.as_secs(),
            shared_backing: self.shared.is_some(),
        }
    }

    async fn shared_get(&self, application_id: Uuid) -> Option<Vec<f32>> {
        let shared = self.shared.as_ref()?;
        let key = Self::key(application_id);
        let kv = Arc::clone(&shared.kv);
        let timeout = shared.call_timeout;
        let result = shared
            .breaker
            .call(|| async move {
                tokio::time::timeout(timeout, kv.get(&key))
                    .await
                    .map_err(|_| KvError::Unavailable("timeout".into()))?
            })
            .await;
        match result {
            Ok(Some(bytes)) => match bincode::deserialize::<Vec<f32>>(&bytes) {
                Ok(vector) => Some(vector),
                Err(e) => {
                    tracing::warn!(error = %e, "shared cache payload corrupt, treating as miss");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "shared cache get failed, treating as miss");
                None
            }
        }
    }

    async fn shared_set(&self, application_id: Uuid, vector: &[f32], ttl: Duration) {
        let Some(shared) = self.shared.as_ref() else {
            return;
        };
        let bytes = match bincode::serialize(&vector.to_vec()) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "embedding serialization failed, skipping shared set");
                return;
            }
        };
        let key = Self::key(application_id);
        let kv = Arc::clone(&shared.kv);
        let timeout = shared.call_timeout;
        let result = shared
            .breaker
            .call(|| async move {
                tokio::time::timeout(timeout, kv.set(&key, bytes, ttl))
                    .await
                    .map_err(|_| KvError::Unavailable("timeout".into()))?
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "shared cache set failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn cache_with_manual_clock() -> (EmbeddingCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = EmbeddingCache::new(Duration::from_secs(3600), clock.clone());
        (cache, clock)
    }

    #[tokio::test]
    async fn hit_then_expiry_then_miss() {
        let (cache, clock) = cache_with_manual_clock();
        let id = Uuid::new_v4();
        cache.set(id, vec![0.25; 4]).await;

        assert_eq!(cache.get(id).await.unwrap(), vec![0.25; 4]);

        clock.advance(Duration::from_secs(3601));
        assert!(cache.get(id).await.is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.size, 0);
    }

    #[tokio::test]
    async fn per_entry_ttl_overrides_default() {
        let (cache, clock) = cache_with_manual_clock();
        let short = Uuid::new_v4();
        let long = Uuid::new_v4();
        cache
            .set_with_ttl(short, vec![1.0], Duration::from_secs(10))
            .await;
        cache.set(long, vec![2.0]).await;

        clock.advance(Duration::from_secs(11));
        assert!(cache.get(short).await.is_none());
        assert!(cache.get(long).await.is_some());
    }

    #[tokio::test]
    async fn sweep_reclaims_expired_entries() {
        let (cache, clock) = cache_with_manual_clock();
        for _ in 0..3 {
            cache.set(Uuid::new_v4(), vec![0.0]).await;
        }
        clock.advance(Duration::from_secs(3601));
        assert_eq!(cache.sweep(), 3);
        assert_eq!(cache.stats().size, 0);
        assert_eq!(cache.stats().evictions, 3);
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let (cache, _clock) = cache_with_manual_clock();
        let id = Uuid::new_v4();
        cache.set(id, vec![1.0]).await;
        assert!(cache.delete(id).await);
        assert!(!cache.delete(id).await);

        cache.set(Uuid::new_v4(), vec![1.0]).await;
        cache.set(Uuid::new_v4(), vec![2.0]).await;
        assert_eq!(cache.clear().await, 2);
    }

    struct FlakyKv;

    #[async_trait]
    impl SharedKv for FlakyKv {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, KvError> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), KvError> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        async fn delete(&self, _key: &str) -> Result<(), KvError> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        async fn clear(&self) -> Result<(), KvError> {
            Err(KvError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn shared_failures_fall_back_to_local() {
        use crate::resilience::BreakerConfig;
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let breaker = Arc::new(CircuitBreaker::new("cache-kv", BreakerConfig::default()));
        let cache = EmbeddingCache::new(Duration::from_secs(3600), clock).with_shared(
            Arc::new(FlakyKv),
            breaker.clone(),
            Duration::from_millis(50),
        );

        let id = Uuid::new_v4();
        cache.set(id, vec![0.5; 4]).await;
        // Shared get fails; the local copy still answers.
        assert_eq!(cache.get(id).await.unwrap(), vec![0.5; 4]);
        // The breaker saw the remote failures.
        assert!(breaker.snapshot().failures > 0);
    }
}
