//! Uniform contract over the external face detection/embedding stack.
//!
//! Any CNN stack sits behind [`FaceAnalyzer`]; the pipeline only sees typed
//! failure kinds and the three capabilities it needs: find the face, score
//! the photo, produce a unit embedding. The quality formula lives here so
//! every implementation scores identically.

pub mod stub;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::error::ErrorCode;
use crate::models::FaceBox;

pub use stub::StubAnalyzer;

/// Blur variances are normalized against this ceiling.
pub const BLUR_NORM_CEILING: f32 = 500.0;

#[derive(Debug, Clone, Error)]
pub enum AnalyzerError {
    #[error("no face detected")]
    NoFace,
    #[error("{count} faces detected, expected exactly one")]
    MultipleFaces { count: usize },
    #[error("detected face {width}x{height} below minimum {min}px")]
    FaceTooSmall { width: u32, height: u32, min: u32 },
    #[error("unsupported image format: {format}")]
    BadFormat { format: String },
    #[error("overall quality {overall:.3} below threshold {threshold:.3}")]
    LowQuality { overall: f32, threshold: f32 },
    #[error("embedding generation failed: {0}")]
    EmbeddingFailed(String),
}

impl AnalyzerError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::NoFace => ErrorCode::E001,
            Self::MultipleFaces { .. } => ErrorCode::E002,
            Self::LowQuality { .. } => ErrorCode::E003,
            Self::FaceTooSmall { .. } => ErrorCode::E004,
            Self::BadFormat { .. } => ErrorCode::E005,
            Self::EmbeddingFailed(_) => ErrorCode::E101,
        }
    }

    /// Only embedding blips are worth retrying; everything else is a
    /// property of the submitted photo.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::EmbeddingFailed(_))
    }
}

/// A face located in the source image, plus the tensor handed to `embed`.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bounding_box: FaceBox,
    pub confidence: f32,
    /// Model-specific crop representation, opaque to the pipeline.
    pub tensor: Vec<f32>,
}

/// Component scores in [0, 1] (blur is the raw variance before
/// normalization).
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QualityScores {
    pub blur: f32,
    pub lighting: f32,
    pub size: f32,
    pub overall: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct QualityThresholds {
    /// Overall floor; below it the photo is rejected.
    pub quality_floor: f32,
    /// Laplacian-variance floor; below it the photo is rejected regardless
    /// of the other components.
    pub blur_floor: f32,
}

impl QualityScores {
    /// Weighted overall: `0.5 * blur_norm + 0.3 * lighting + 0.2 * size`.
    pub fn compute(blur_variance: f32, lighting: f32, size: f32) -> Self {
        let blur_norm = (blur_variance / BLUR_NORM_CEILING).min(1.0);
        Self {
            blur: blur_variance,
            lighting,
            size,
            overall: 0.5 * blur_norm + 0.3 * lighting + 0.2 * size,
        }
    }

    /// Apply the floors. Called by analyzer implementations at the end of
    /// `assess`.
    pub fn gate(self, thresholds: QualityThresholds) -> Result<Self, AnalyzerError> {
        let blur_norm = (self.blur / BLUR_NORM_CEILING).min(1.0);
        let blur_floor_norm = (thresholds.blur_floor / BLUR_NORM_CEILING).min(1.0);
        if blur_norm < blur_floor_norm {
            return Err(AnalyzerError::LowQuality {
                overall: self.overall,
                threshold: thresholds.quality_floor,
            });
        }
        if self.overall < thresholds.quality_floor {
            return Err(AnalyzerError::LowQuality {
                overall: self.overall,
                threshold: thresholds.quality_floor,
            });
        }
        Ok(self)
    }
}

#[async_trait]
pub trait FaceAnalyzer: Send + Sync {
    /// Locate exactly one face in the image.
    async fn detect(&self, image: &[u8], format: &str) -> Result<DetectedFace, AnalyzerError>;

    /// Score the photo's usability for recognition.
    async fn assess(&self, image: &[u8], face: &DetectedFace)
        -> Result<QualityScores, AnalyzerError>;

    /// Produce an L2-normalized embedding for a detected face.
    async fn embed(&self, face: &DetectedFace) -> Result<Vec<f32>, AnalyzerError>;

    /// Batch embedding; equivalent to N single calls.
    async fn embed_batch(&self, faces: &[DetectedFace]) -> Result<Vec<Vec<f32>>, AnalyzerError> {
        let mut out = Vec::with_capacity(faces.len());
        for face in faces {
            out.push(self.embed(face).await?);
        }
        Ok(out)
    }

    /// Version tag recorded on stored embeddings.
    fn model_version(&self) -> String;
}
