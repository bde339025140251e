//! Rotation-invariant reference-face extraction from a captured card.
//!
//! Cards can be presented in any orientation, so the printed face is searched
//! across eight rotations of the card crop. Each angle's best detection is
//! scored on where the face sits relative to the card content and how upright
//! it is; a gated cascade then picks the winning angle.

use crate::geometry;
use crate::infer::{EmbeddingExtractor, FaceDetector, InferenceError};
use crate::types::{BoxDetection, Embedding};
use image::RgbImage;
use std::cmp::Ordering;
use thiserror::Error;

pub const ROTATION_STEP_DEG: u32 = 45;

const CONTENT_THRESHOLD: u8 = 10;
const FACE_DETECT_CONFIDENCE: f32 = 0.3;
const FACE_MIN_AREA_RATIO: f32 = 0.005;
const FACE_MAX_AREA_RATIO: f32 = 0.25;
const SCORE_GATE: f32 = 0.9;
const TOP_SCORE_MIN: f32 = 0.35;
const UPRIGHT_ASPECT_MIN: f32 = 1.05;
const FACE_PAD_RATIO: f32 = 0.15;
const MIN_FACE_CROP_PX: u32 = 60;
const EMBED_MIN_SIDE: u32 = 256;
const EMBED_PAD_RATIOS: [f32; 3] = [0.0, 0.25, 0.5];

/// Expected face-center anchors in content-relative coordinates. A portrait
/// card carries its photo in the upper third; a landscape card carries it on
/// the left half.
const ANCHORS_PORTRAIT: &[(f32, f32)] = &[(0.33, 0.33)];
const ANCHORS_LANDSCAPE: &[(f32, f32)] = &[(0.22, 0.5), (0.30, 0.5)];

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("empty card image")]
    EmptyImage,
    #[error("no usable face in any rotation ({0})")]
    NoFace(String),
    #[error("face crop too small ({width}x{height})")]
    CropTooSmall { width: u32, height: u32 },
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// The best face found at one rotation angle, with its selection criteria.
#[derive(Debug, Clone)]
pub struct RotationCandidate {
    pub angle: u32,
    pub face: BoxDetection,
    pub anchor_score: f32,
    pub top_score: f32,
    pub angle_bonus: f32,
    pub aspect: f32,
    pub upright: bool,
}

impl RotationCandidate {
    pub fn key(&self) -> SelectionKey {
        SelectionKey {
            anchor_score: self.anchor_score,
            confidence: self.face.confidence,
            area_ratio: self.face.area_ratio,
            top_score: self.top_score,
            angle_bonus: self.angle_bonus,
        }
    }
}

/// Final tie-break criteria in fixed priority order. The derived
/// lexicographic comparison over the field order IS the selection rule.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct SelectionKey {
    pub anchor_score: f32,
    pub confidence: f32,
    pub area_ratio: f32,
    pub top_score: f32,
    pub angle_bonus: f32,
}

/// An upright reference face recovered from the card.
pub struct ExtractedFace {
    pub crop: RgbImage,
    /// Face box in the coordinates of the rotated card image.
    pub bbox: BoxDetection,
    /// Rotation applied to the card before the face was found.
    pub angle: u32,
    pub rotated_width: u32,
    pub rotated_height: u32,
}

/// Search all rotations of the card for the printed face and crop it.
pub fn extract_card_face(
    card: &RgbImage,
    faces: &dyn FaceDetector,
) -> Result<ExtractedFace, ExtractError> {
    if card.width() == 0 || card.height() == 0 {
        return Err(ExtractError::EmptyImage);
    }

    let mut candidates: Vec<RotationCandidate> = Vec::new();
    let mut rotations: Vec<RgbImage> = Vec::new();
    let mut no_content = 0usize;
    let mut no_face = 0usize;

    for angle in (0u32..360).step_by(ROTATION_STEP_DEG as usize) {
        let rotated = geometry::rotate_expanded(card, angle);
        let Some((cx1, cy1, cx2, cy2)) = geometry::content_bbox(&rotated, CONTENT_THRESHOLD)
        else {
            no_content += 1;
            continue;
        };
        let content_w = (cx2 - cx1).max(1) as f32;
        let content_h = (cy2 - cy1).max(1) as f32;
        let anchors = if content_w >= content_h {
            ANCHORS_LANDSCAPE
        } else {
            ANCHORS_PORTRAIT
        };

        let detections = faces.detect(&rotated, FACE_DETECT_CONFIDENCE)?;
        let best = detections
            .into_iter()
            .filter(|f| {
                f.area_ratio >= FACE_MIN_AREA_RATIO && f.area_ratio <= FACE_MAX_AREA_RATIO
            })
            .max_by(|a, b| {
                (a.confidence, a.area_ratio)
                    .partial_cmp(&(b.confidence, b.area_ratio))
                    .unwrap_or(Ordering::Equal)
            });
        let Some(face) = best else {
            no_face += 1;
            continue;
        };

        let aspect = face.height().max(1.0) / face.width().max(1.0);
        let (center_x, center_y) = face.center();
        let cx = (center_x - cx1 as f32) / content_w;
        let cy = (center_y - cy1 as f32) / content_h;
        let anchor_score = anchors
            .iter()
            .map(|&(ax, ay)| 1.0 - ((cx - ax).powi(2) + (cy - ay).powi(2)).sqrt())
            .fold(f32::MIN, f32::max);
        let top_score = 1.0 - cy;
        let angle_off = angle % 90;
        let angle_off = angle_off.min(90 - angle_off) as f32;
        let angle_bonus = 1.0 - angle_off / 45.0;

        candidates.push(RotationCandidate {
            angle,
            face,
            anchor_score,
            top_score,
            angle_bonus,
            aspect,
            upright: aspect >= UPRIGHT_ASPECT_MIN,
        });
        rotations.push(rotated);
    }

    let Some(winner) = select_candidate(&candidates) else {
        let mut parts = Vec::new();
        if no_content > 0 {
            parts.push(format!("no content: {no_content}"));
        }
        if no_face > 0 {
            parts.push(format!("no face: {no_face}"));
        }
        return Err(ExtractError::NoFace(parts.join(", ")));
    };

    let candidate = &candidates[winner];
    let rotated = &rotations[winner];
    tracing::debug!(
        angle = candidate.angle,
        confidence = candidate.face.confidence,
        anchor_score = candidate.anchor_score,
        top_score = candidate.top_score,
        upright = candidate.upright,
        "rotation search selected"
    );

    let crop = geometry::crop_face(rotated, &candidate.face, FACE_PAD_RATIO)
        .ok_or(ExtractError::CropTooSmall {
            width: 0,
            height: 0,
        })?;
    let (crop_w, crop_h) = crop.dimensions();
    if crop_w < MIN_FACE_CROP_PX || crop_h < MIN_FACE_CROP_PX {
        return Err(ExtractError::CropTooSmall {
            width: crop_w,
            height: crop_h,
        });
    }

    Ok(ExtractedFace {
        crop,
        bbox: candidate.face.clone(),
        angle: candidate.angle,
        rotated_width: rotated.width(),
        rotated_height: rotated.height(),
    })
}

/// The selection cascade over per-angle candidates. Returns the index of the
/// winner.
///
/// 1. keep candidates within 90% of the maximum confidence;
/// 2. prefer those with `top_score >= 0.35`, falling back when none qualify;
/// 3. prefer upright candidates, with the same fallback;
/// 4. take the lexicographic max of [`SelectionKey`].
pub fn select_candidate(candidates: &[RotationCandidate]) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }

    let max_confidence = candidates
        .iter()
        .map(|c| c.face.confidence)
        .fold(f32::MIN, f32::max);
    let gate = max_confidence * SCORE_GATE;
    let gated: Vec<usize> = (0..candidates.len())
        .filter(|&i| candidates[i].face.confidence >= gate)
        .collect();

    let pool = prefer(gated, |i| candidates[i].top_score >= TOP_SCORE_MIN);
    let pool = prefer(pool, |i| candidates[i].upright);

    pool.into_iter().max_by(|&a, &b| {
        candidates[a]
            .key()
            .partial_cmp(&candidates[b].key())
            .unwrap_or(Ordering::Equal)
    })
}

/// Narrow the pool to members matching the predicate, keeping the original
/// pool when none do.
fn prefer(pool: Vec<usize>, pred: impl Fn(usize) -> bool) -> Vec<usize> {
    let kept: Vec<usize> = pool.iter().copied().filter(|&i| pred(i)).collect();
    if kept.is_empty() {
        pool
    } else {
        kept
    }
}

/// Obtain an embedding for a face crop, working around detectors that balk
/// at tight crops: upscale small crops, then retry behind growing black
/// borders.
pub fn embed_face(
    crop: &RgbImage,
    embedder: &dyn EmbeddingExtractor,
) -> Result<Option<Embedding>, InferenceError> {
    let resized = geometry::upscale_min_side(crop, EMBED_MIN_SIDE);
    for ratio in EMBED_PAD_RATIOS {
        let padded = geometry::pad_border(&resized, ratio);
        if let Some(embedding) = embedder.embed(&padded)? {
            return Ok(Some(embedding));
        }
    }
    Ok(None)
}
