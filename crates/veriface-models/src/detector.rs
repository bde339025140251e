//! YOLO-style single-class detector via ONNX Runtime.
//!
//! Decodes the `[1, 5, N]` export layout (cx, cy, w, h, confidence per
//! column) with letterbox de-mapping and NMS post-processing.

use image::{imageops, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use veriface_core::types::BoxDetection;
use veriface_core::{FaceDetector, InferenceError, ObjectDetector};

// --- Named constants (no magic numbers) ---
const YOLO_INPUT_SIZE: usize = 640;
const YOLO_NMS_THRESHOLD: f32 = 0.45;
const YOLO_PAD_VALUE: f32 = 114.0 / 255.0;
const YOLO_ATTRIBUTES: usize = 5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — place the exported ONNX model in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Single-class YOLO detector. One instance per model; shared across
/// sessions behind an `Arc`, with the ONNX session serialized internally.
pub struct YoloDetector {
    session: Mutex<Session>,
    label: &'static str,
}

impl YoloDetector {
    /// Load a YOLO ONNX export from the given path.
    pub fn load(model_path: &str, label: &'static str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            label,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name().to_string()).collect::<Vec<_>>(),
            "loaded detection model"
        );

        Ok(Self {
            session: Mutex::new(session),
            label,
        })
    }

    /// Detect objects above `threshold`, sorted by descending confidence.
    pub fn detect_boxes(
        &self,
        image: &RgbImage,
        threshold: f32,
    ) -> Result<Vec<BoxDetection>, DetectorError> {
        let (input, letterbox) = preprocess(image);

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectorError::InferenceFailed("session mutex poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, predictions) = outputs[0].try_extract_tensor::<f32>().map_err(|e| {
            DetectorError::InferenceFailed(format!("{} predictions: {e}", self.label))
        })?;

        let detections = decode_predictions(
            predictions,
            image.width(),
            image.height(),
            &letterbox,
            threshold,
        );

        let mut result = nms(detections, YOLO_NMS_THRESHOLD);
        result.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(result)
    }
}

impl ObjectDetector for YoloDetector {
    fn detect(
        &self,
        image: &RgbImage,
        confidence_threshold: f32,
    ) -> Result<Vec<BoxDetection>, InferenceError> {
        self.detect_boxes(image, confidence_threshold)
            .map_err(|e| InferenceError::Failed(e.to_string()))
    }
}

impl FaceDetector for YoloDetector {
    fn detect(
        &self,
        image: &RgbImage,
        confidence_threshold: f32,
    ) -> Result<Vec<BoxDetection>, InferenceError> {
        self.detect_boxes(image, confidence_threshold)
            .map_err(|e| InferenceError::Failed(e.to_string()))
    }
}

/// Preprocess an RGB frame into a NCHW float tensor with letterbox padding
/// and /255 normalization.
fn preprocess(image: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = image.dimensions();
    let size = YOLO_INPUT_SIZE;

    let scale_w = size as f32 / width as f32;
    let scale_h = size as f32 / height as f32;
    let scale = scale_w.min(scale_h);

    let new_w = ((width as f32 * scale).round() as u32).max(1);
    let new_h = ((height as f32 * scale).round() as u32).max(1);
    let pad_x = (size as f32 - new_w as f32) / 2.0;
    let pad_y = (size as f32 - new_h as f32) / 2.0;

    let resized = imageops::resize(image, new_w, new_h, imageops::FilterType::Triangle);

    let pad_x_start = pad_x.floor() as usize;
    let pad_y_start = pad_y.floor() as usize;

    let mut tensor = Array4::<f32>::from_elem((1, 3, size, size), YOLO_PAD_VALUE);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = x as usize + pad_x_start;
        let ty = y as usize + pad_y_start;
        if tx >= size || ty >= size {
            continue;
        }
        tensor[[0, 0, ty, tx]] = pixel[0] as f32 / 255.0;
        tensor[[0, 1, ty, tx]] = pixel[1] as f32 / 255.0;
        tensor[[0, 2, ty, tx]] = pixel[2] as f32 / 255.0;
    }

    (tensor, LetterboxInfo { scale, pad_x, pad_y })
}

/// Decode a `[1, 5, N]` prediction tensor laid out attribute-major.
fn decode_predictions(
    data: &[f32],
    frame_width: u32,
    frame_height: u32,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<BoxDetection> {
    let num = data.len() / YOLO_ATTRIBUTES;
    let frame_area = (frame_width * frame_height) as f32;
    let mut detections = Vec::new();

    for i in 0..num {
        let confidence = data[4 * num + i];
        if confidence <= threshold {
            continue;
        }

        let cx = data[i];
        let cy = data[num + i];
        let w = data[2 * num + i];
        let h = data[3 * num + i];

        // letterbox space → original frame space
        let x1 = ((cx - w / 2.0 - letterbox.pad_x) / letterbox.scale).clamp(0.0, frame_width as f32);
        let y1 =
            ((cy - h / 2.0 - letterbox.pad_y) / letterbox.scale).clamp(0.0, frame_height as f32);
        let x2 = ((cx + w / 2.0 - letterbox.pad_x) / letterbox.scale).clamp(0.0, frame_width as f32);
        let y2 =
            ((cy + h / 2.0 - letterbox.pad_y) / letterbox.scale).clamp(0.0, frame_height as f32);

        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        detections.push(BoxDetection {
            x1,
            y1,
            x2,
            y2,
            confidence,
            area_ratio: ((x2 - x1) * (y2 - y1)) / frame_area.max(1.0),
        });
    }

    detections
}

/// Non-Maximum Suppression: remove overlapping detections.
fn nms(mut detections: Vec<BoxDetection>, iou_threshold: f32) -> Vec<BoxDetection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());

        for j in (i + 1)..detections.len() {
            if suppressed[j] {
                continue;
            }
            if iou(&detections[i], &detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Intersection-over-Union between two boxes.
fn iou(a: &BoxDetection, b: &BoxDetection) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - inter;

    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
