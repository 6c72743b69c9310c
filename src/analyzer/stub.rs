//! Deterministic analyzer for tests, demos and the face utility endpoints.
//!
//! Photo bytes map to embeddings through a SHA-256 seed, so identical bytes
//! always produce identical vectors. Magic byte prefixes inject the typed
//! failure kinds, and a `VEC:` prefix carrying a JSON float array pins the
//! embedding exactly, which lets a test steer similarity precisely.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::models::FaceBox;

use super::{
    AnalyzerError, DetectedFace, FaceAnalyzer, QualityScores, QualityThresholds,
};

const SUPPORTED_FORMATS: &[&str] = &["jpg", "jpeg", "png"];

pub struct StubAnalyzer {
    dim: usize,
    min_face_size: u32,
    thresholds: QualityThresholds,
}

impl StubAnalyzer {
    pub fn new(dim: usize, min_face_size: u32, quality_floor: f32, blur_floor: f32) -> Self {
        Self {
            dim,
            min_face_size,
            thresholds: QualityThresholds {
                quality_floor,
                blur_floor,
            },
        }
    }

    /// Defaults matching the pipeline's standard thresholds.
    pub fn with_defaults() -> Self {
        Self::new(crate::config::EMBEDDING_DIM, 80, 0.7, 100.0)
    }

    fn seeded_vector(&self, image: &[u8]) -> Vec<f32> {
        let digest = Sha256::digest(image);
        let seed = u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
        let mut rng = StdRng::seed_from_u64(seed);
        let mut v: Vec<f32> = (0..self.dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        normalize(&mut v);
        v
    }

    fn pinned_vector(&self, payload: &[u8]) -> Result<Vec<f32>, AnalyzerError> {
        let mut v: Vec<f32> = serde_json::from_slice(payload)
            .map_err(|e| AnalyzerError::EmbeddingFailed(format!("pinned vector: {e}")))?;
        if v.len() != self.dim {
            return Err(AnalyzerError::EmbeddingFailed(format!(
                "pinned vector has {} dims, expected {}",
                v.len(),
                self.dim
            )));
        }
        normalize(&mut v);
        Ok(v)
    }
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

fn has_prefix<'a>(image: &'a [u8], prefix: &str) -> Option<&'a [u8]> {
    image.strip_prefix(prefix.as_bytes())
}

#[async_trait]
impl FaceAnalyzer for StubAnalyzer {
    async fn detect(&self, image: &[u8], format: &str) -> Result<DetectedFace, AnalyzerError> {
        let format = format.to_ascii_lowercase();
        if !SUPPORTED_FORMATS.contains(&format.as_str()) {
            return Err(AnalyzerError::BadFormat { format });
        }
        if has_prefix(image, "NOFACE").is_some() {
            return Err(AnalyzerError::NoFace);
        }
        if has_prefix(image, "MULTI").is_some() {
            return Err(AnalyzerError::MultipleFaces { count: 2 });
        }
        if has_prefix(image, "SMALL").is_some() {
            return Err(AnalyzerError::FaceTooSmall {
                width: self.min_face_size / 2,
                height: self.min_face_size / 2,
                min: self.min_face_size,
            });
        }

        let tensor = if has_prefix(image, "EMBEDFAIL").is_some() {
            Vec::new()
        } else if let Some(payload) = has_prefix(image, "VEC:") {
            self.pinned_vector(payload)?
        } else {
            self.seeded_vector(image)
        };

        Ok(DetectedFace {
            bounding_box: FaceBox {
                x: 100,
                y: 100,
                width: 160,
                height: 160,
            },
            confidence: 0.98,
            tensor,
        })
    }

    async fn assess(
        &self,
        image: &[u8],
        _face: &DetectedFace,
    ) -> Result<QualityScores, AnalyzerError> {
        let (blur, lighting, size) = if has_prefix(image, "BLUR").is_some() {
            (10.0, 0.9, 0.85)
        } else if has_prefix(image, "LOWQ").is_some() {
            (150.0, 0.1, 0.2)
        } else {
            (300.0, 0.9, 0.85)
        };
        QualityScores::compute(blur, lighting, size).gate(self.thresholds)
    }

    async fn embed(&self, face: &DetectedFace) -> Result<Vec<f32>, AnalyzerError> {
        if face.tensor.is_empty() {
            return Err(AnalyzerError::EmbeddingFailed(
                "model returned no output".to_string(),
            ));
        }
        let mut v = face.tensor.clone();
        normalize(&mut v);
        Ok(v)
    }

    fn model_version(&self) -> String {
        "stub-v1".to_string()
    }
}
