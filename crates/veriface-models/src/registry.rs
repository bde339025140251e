//! Process-wide model registry.
//!
//! Constructed once at startup and shared by read-only reference into every
//! session. Model weights load exactly once; each invocation is a pure
//! function of its input frame, so cross-session sharing is safe.

use crate::detector::{DetectorError, YoloDetector};
use crate::embedder::{EmbedderError, FaceEmbedder};
use std::sync::Arc;
use thiserror::Error;
use veriface_core::Collaborators;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Embedder(#[from] EmbedderError),
}

pub struct ModelRegistry {
    cards: Arc<YoloDetector>,
    faces: Arc<YoloDetector>,
    embedder: Arc<FaceEmbedder>,
}

impl ModelRegistry {
    /// Load all three models. Fails when any model file is missing; the
    /// caller decides whether that is fatal or degrades to an unavailable
    /// service.
    pub fn load(
        card_model: &str,
        face_model: &str,
        embedding_model: &str,
    ) -> Result<Self, RegistryError> {
        let cards = Arc::new(YoloDetector::load(card_model, "card")?);
        let faces = Arc::new(YoloDetector::load(face_model, "face")?);
        let embedder = Arc::new(FaceEmbedder::load(embedding_model, faces.clone())?);
        Ok(Self {
            cards,
            faces,
            embedder,
        })
    }

    /// Collaborator handles for a new session. Cheap: clones three `Arc`s.
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            cards: self.cards.clone(),
            faces: self.faces.clone(),
            embedder: self.embedder.clone(),
        }
    }
}
