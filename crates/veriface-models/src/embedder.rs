//! ArcFace-style face embedding extraction via ONNX Runtime.
//!
//! Mirrors the hosted face-analysis stack: a face is first located inside
//! the crop (detectors disagree on tight crops, which is why callers retry
//! with padding), then the tight face region is resized to 112×112 and
//! embedded.

use crate::detector::YoloDetector;
use image::{imageops, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::cmp::Ordering;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use veriface_core::geometry;
use veriface_core::types::Embedding;
use veriface_core::{EmbeddingExtractor, InferenceError};

// --- Named constants (different normalization from the detectors!) ---
const EMBED_INPUT_SIZE: u32 = 112;
const EMBED_MEAN: f32 = 127.5;
const EMBED_STD: f32 = 127.5;
const EMBED_DIM: usize = 512;
const CROP_FACE_CONFIDENCE: f32 = 0.3;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0} — place the exported ONNX model in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Embedding extractor combining face localization with ArcFace inference.
pub struct FaceEmbedder {
    faces: Arc<YoloDetector>,
    session: Mutex<Session>,
}

impl FaceEmbedder {
    /// Load the embedding ONNX model, reusing the given face detector for
    /// in-crop localization.
    pub fn load(model_path: &str, faces: Arc<YoloDetector>) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name().to_string()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self {
            faces,
            session: Mutex::new(session),
        })
    }

    /// Preprocess a tight face region into a NCHW tensor with symmetric
    /// (x − 127.5) / 127.5 normalization.
    fn preprocess(face: &RgbImage) -> Array4<f32> {
        let resized = imageops::resize(
            face,
            EMBED_INPUT_SIZE,
            EMBED_INPUT_SIZE,
            imageops::FilterType::Triangle,
        );
        let size = EMBED_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in resized.enumerate_pixels() {
            tensor[[0, 0, y as usize, x as usize]] = (pixel[0] as f32 - EMBED_MEAN) / EMBED_STD;
            tensor[[0, 1, y as usize, x as usize]] = (pixel[1] as f32 - EMBED_MEAN) / EMBED_STD;
            tensor[[0, 2, y as usize, x as usize]] = (pixel[2] as f32 - EMBED_MEAN) / EMBED_STD;
        }
        tensor
    }

    fn run(&self, face: &RgbImage) -> Result<Vec<f32>, EmbedderError> {
        let input = Self::preprocess(face);
        let mut session = self
            .session
            .lock()
            .map_err(|_| EmbedderError::InferenceFailed("session mutex poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != EMBED_DIM {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {EMBED_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }
        Ok(raw.to_vec())
    }
}

impl EmbeddingExtractor for FaceEmbedder {
    fn embed(&self, face_crop: &RgbImage) -> Result<Option<Embedding>, InferenceError> {
        let detections = self
            .faces
            .detect_boxes(face_crop, CROP_FACE_CONFIDENCE)
            .map_err(|e| InferenceError::Failed(e.to_string()))?;
        let best = detections.into_iter().max_by(|a, b| {
            (a.confidence, a.area_ratio)
                .partial_cmp(&(b.confidence, b.area_ratio))
                .unwrap_or(Ordering::Equal)
        });
        let Some(face) = best else {
            return Ok(None);
        };

        let Some(tight) = geometry::crop_rect(
            face_crop,
            face.x1 as i64,
            face.y1 as i64,
            face.x2 as i64,
            face.y2 as i64,
        ) else {
            return Ok(None);
        };

        let raw = self
            .run(&tight)
            .map_err(|e| InferenceError::Failed(e.to_string()))?;
        Ok(Some(Embedding::from_raw(raw)))
    }
}
