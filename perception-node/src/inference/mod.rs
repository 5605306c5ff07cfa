pub mod http_client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::camera::Frame;
use crate::error::Result;
use gatewatch_common::{BBox, Detection};

pub use http_client::HttpInferenceClient;

/// Person/face detector. Returned detections carry frame coordinates; the
/// caller stamps camera, timestamp and sequence.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>>;
}

/// Face detector + embedding model run on an image crop.
#[async_trait]
pub trait FaceEmbedder: Send + Sync {
    async fn embed(&self, frame: &Frame) -> Result<Vec<FaceEmbedding>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEmbedding {
    /// In the coordinates of the image passed to `embed`.
    pub bbox: BBox,
    #[serde(default)]
    pub score: f32,
    #[serde(default)]
    pub landmarks: Option<Vec<[f32; 2]>>,
    pub embedding: Vec<f32>,
}

impl FaceEmbedding {
    /// Highest-scoring face with a non-empty embedding.
    pub fn best(faces: &[FaceEmbedding]) -> Option<&FaceEmbedding> {
        faces
            .iter()
            .filter(|f| !f.embedding.is_empty())
            .fold(None, |best: Option<&FaceEmbedding>, f| match best {
                Some(b) if b.score >= f.score => Some(b),
                _ => Some(f),
            })
    }
}
