//! Embedding record: the stored face vector for a processed application.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Face bounding box in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// 1:1 with applications that completed embedding generation.
/// Every embedding references a live identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub application_id: Uuid,
    pub identity_id: Uuid,
    /// 512 floats, unit L2 norm.
    pub vector: Vec<f32>,
    pub model_version: String,
    pub quality_score: f32,
    pub face_box: FaceBox,
    pub created_at: DateTime<Utc>,
}

impl EmbeddingRecord {
    /// L2 norm of the stored vector. The invariant checked in tests is
    /// `norm in [0.99, 1.01]`.
    pub fn l2_norm(&self) -> f32 {
        self.vector.iter().map(|v| v * v).sum::<f32>().sqrt()
    }
}
