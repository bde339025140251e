//! Collaborator traits for the pretrained detection and embedding models.
//!
//! Implementations live outside this crate (see `veriface-models`). Every
//! implementation must behave as a pure function of its input image: no
//! session-specific mutable state, safe to share across sessions behind an
//! `Arc`.

use crate::types::{BoxDetection, Embedding};
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("model unavailable: {0}")]
    Unavailable(String),
    #[error("inference failed: {0}")]
    Failed(String),
}

/// Generic object detector (the card model). Returns boxes above the given
/// confidence threshold, sorted by descending confidence.
pub trait ObjectDetector: Send + Sync {
    fn detect(
        &self,
        image: &RgbImage,
        confidence_threshold: f32,
    ) -> Result<Vec<BoxDetection>, InferenceError>;
}

/// Face detector. Same contract as [`ObjectDetector`]; split so the two
/// models cannot be wired to the wrong pipeline stage.
pub trait FaceDetector: Send + Sync {
    fn detect(
        &self,
        image: &RgbImage,
        confidence_threshold: f32,
    ) -> Result<Vec<BoxDetection>, InferenceError>;
}

/// Face embedding extractor. Returns `None` when the collaborator cannot
/// find a usable face in the crop.
pub trait EmbeddingExtractor: Send + Sync {
    fn embed(&self, face_crop: &RgbImage) -> Result<Option<Embedding>, InferenceError>;
}

/// The set of process-wide model handles a session operates against.
/// Cheap to clone; all fields are shared read-only references.
#[derive(Clone)]
pub struct Collaborators {
    pub cards: Arc<dyn ObjectDetector>,
    pub faces: Arc<dyn FaceDetector>,
    pub embedder: Arc<dyn EmbeddingExtractor>,
}
