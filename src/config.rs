//! Runtime configuration loaded from environment variables.
//!
//! Every tunable documented for operators is read here once at startup and
//! carried as a typed `Settings` value. Components receive the settings (or
//! the slice of them they need) at construction time; nothing reads the
//! environment after boot.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Embedding dimensionality the whole pipeline is built around.
pub const EMBEDDING_DIM: usize = 512;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
    #[error("embedding_dim must be {expected}, got {got}")]
    UnsupportedDimension { expected: usize, got: usize },
}

/// Typed runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Location of the application store (opaque to this crate).
    pub store_uri: String,
    pub store_db_name: String,

    /// Photograph blob directory.
    pub blob_dir: PathBuf,
    /// Vector index + id-mapping directory.
    pub index_dir: PathBuf,

    /// De-duplication verification threshold (tau).
    pub verification_threshold: f32,
    /// Must equal [`EMBEDDING_DIM`].
    pub embedding_dim: usize,

    /// IVF cluster count.
    pub ann_nlist: usize,
    /// IVF clusters probed per search.
    pub ann_nprobe: usize,

    /// Work queue capacity.
    pub max_queue_size: usize,
    /// Per-stage wall-clock budget for the ANALYZE stage.
    pub processing_timeout: Duration,
    /// Default embedding cache TTL.
    pub cache_ttl: Duration,

    /// Minimum detected face edge in pixels.
    pub min_face_size: u32,
    /// Laplacian-variance blur floor.
    pub blur_threshold: f32,
    /// Overall quality floor.
    pub quality_score_threshold: f32,

    /// Circuit breaker tuning.
    pub cb_failure_threshold: u32,
    pub cb_open_timeout: Duration,
    pub cb_success_threshold: u32,

    /// Retry tuning.
    pub retry_max_attempts: u32,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_base: f64,

    /// Processor worker pool size.
    pub worker_count: usize,
    /// Grace period allowed to in-flight submissions on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_uri: "memory://local".to_string(),
            store_db_name: "faceguard".to_string(),
            blob_dir: PathBuf::from("./storage/photographs"),
            index_dir: PathBuf::from("./storage/vectors"),
            verification_threshold: 0.85,
            embedding_dim: EMBEDDING_DIM,
            ann_nlist: 100,
            ann_nprobe: 10,
            max_queue_size: 10_000,
            processing_timeout: Duration::from_secs(10),
            cache_ttl: Duration::from_secs(3600),
            min_face_size: 80,
            blur_threshold: 100.0,
            quality_score_threshold: 0.7,
            cb_failure_threshold: 5,
            cb_open_timeout: Duration::from_secs(60),
            cb_success_threshold: 2,
            retry_max_attempts: 3,
            retry_initial_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            retry_base: 2.0,
            worker_count: 4,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    ///
    /// A `.env` file next to the process is honoured when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Missing .env is not an error.
        let _ = dotenvy::dotenv();

        let d = Self::default();
        let settings = Self {
            store_uri: env_string("STORE_URI", d.store_uri),
            store_db_name: env_string("STORE_DB_NAME", d.store_db_name),
            blob_dir: PathBuf::from(env_string(
                "BLOB_DIR",
                d.blob_dir.to_string_lossy().into_owned(),
            )),
            index_dir: PathBuf::from(env_string(
                "INDEX_DIR",
                d.index_dir.to_string_lossy().into_owned(),
            )),
            verification_threshold: env_parse("VERIFICATION_THRESHOLD", d.verification_threshold)?,
            embedding_dim: env_parse("EMBEDDING_DIM", d.embedding_dim)?,
            ann_nlist: env_parse("ANN_NLIST", d.ann_nlist)?,
            ann_nprobe: env_parse("ANN_NPROBE", d.ann_nprobe)?,
            max_queue_size: env_parse("MAX_QUEUE_SIZE", d.max_queue_size)?,
            processing_timeout: env_secs("PROCESSING_TIMEOUT", d.processing_timeout)?,
            cache_ttl: env_secs("CACHE_TTL", d.cache_ttl)?,
            min_face_size: env_parse("MIN_FACE_SIZE", d.min_face_size)?,
            blur_threshold: env_parse("BLUR_THRESHOLD", d.blur_threshold)?,
            quality_score_threshold: env_parse(
                "QUALITY_SCORE_THRESHOLD",
                d.quality_score_threshold,
            )?,
            cb_failure_threshold: env_parse("CB_FAILURE_THRESHOLD", d.cb_failure_threshold)?,
            cb_open_timeout: env_secs("CB_OPEN_TIMEOUT", d.cb_open_timeout)?,
            cb_success_threshold: env_parse("CB_SUCCESS_THRESHOLD", d.cb_success_threshold)?,
            retry_max_attempts: env_parse("RETRY_MAX_ATTEMPTS", d.retry_max_attempts)?,
            retry_initial_delay: env_secs_f("RETRY_INITIAL_DELAY", d.retry_initial_delay)?,
            retry_max_delay: env_secs_f("RETRY_MAX_DELAY", d.retry_max_delay)?,
            retry_base: env_parse("RETRY_BASE", d.retry_base)?,
            worker_count: env_parse("WORKER_COUNT", d.worker_count)?,
            shutdown_grace: env_secs("SHUTDOWN_GRACE", d.shutdown_grace)?,
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding_dim != EMBEDDING_DIM {
            return Err(ConfigError::UnsupportedDimension {
                expected: EMBEDDING_DIM,
                got: self.embedding_dim,
            });
        }
        if !(0.0..=1.0).contains(&self.verification_threshold) {
            return Err(ConfigError::InvalidValue {
                name: "VERIFICATION_THRESHOLD",
                value: self.verification_threshold.to_string(),
            });
        }
        if self.ann_nprobe == 0 || self.ann_nlist == 0 || self.ann_nprobe > self.ann_nlist {
            return Err(ConfigError::InvalidValue {
                name: "ANN_NPROBE",
                value: format!("{}/{}", self.ann_nprobe, self.ann_nlist),
            });
        }
        if self.retry_base < 1.0 {
            return Err(ConfigError::InvalidValue {
                name: "RETRY_BASE",
                value: self.retry_base.to_string(),
            });
        }
        Ok(())
    }
}

fn env_string(name: &str, default: String) -> String {
    std::env::var(name).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            name,
            value: raw.clone(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_secs(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(env_parse(
        name,
        default.as_secs(),
    )?))
}

fn env_secs_f(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let secs: f64 = env_parse(name, default.as_secs_f64())?;
    if secs < 0.0 {
        return Err(ConfigError::InvalidValue {
            name,
            value: secs.to_string(),
        });
    }
    Ok(Duration::from_secs_f64(secs))
}
