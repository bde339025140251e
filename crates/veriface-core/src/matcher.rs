//! Live face tracking and matching against the card's reference embedding.
//!
//! Runs only while the card is locked. Confirmation is gated on two
//! independent signals: the face must have been held still long enough, and
//! its embedding must be similar enough to the reference extracted from the
//! card.

use crate::config::SessionConfig;
use crate::geometry;
use crate::infer::{EmbeddingExtractor, FaceDetector, InferenceError};
use crate::rotation;
use crate::types::Embedding;
use crate::window::HitWindow;
use image::RgbImage;
use std::cmp::Ordering;
use std::time::Instant;

const LIVE_FACE_PAD_RATIO: f32 = 0.15;

/// Reference-embedding slot. Extraction is attempted at most once per
/// session; a failed attempt becomes retryable again when the face sub-state
/// resets.
#[derive(Debug)]
enum ReferenceSlot {
    NotAttempted,
    Ready(Embedding),
    Failed,
}

#[derive(Debug)]
enum FacePhase {
    /// No live face since the last (re)start.
    Idle,
    /// Face first sighted; matching deferred while the user positions.
    Grace { since: Instant },
    /// Post-grace stillness tracking.
    Tracking(TrackState),
    /// Terminal: payload frozen.
    Matched { similarity: f32 },
}

#[derive(Debug)]
struct TrackState {
    window: HitWindow,
    last_center: (f32, f32),
    still_since: Instant,
}

/// Per-frame matcher output, consumed by the session's response builder.
#[derive(Debug, Clone, Default)]
pub struct FaceFrame {
    pub face_detected: bool,
    pub matched: bool,
    pub similarity: Option<f32>,
    pub best_similarity: Option<f32>,
}

pub struct LiveFaceMatcher {
    config: SessionConfig,
    phase: FacePhase,
    reference: ReferenceSlot,
    best_similarity: Option<f32>,
}

impl LiveFaceMatcher {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            phase: FacePhase::Idle,
            reference: ReferenceSlot::NotAttempted,
            best_similarity: None,
        }
    }

    pub fn is_matched(&self) -> bool {
        matches!(self.phase, FacePhase::Matched { .. })
    }

    /// Process one live frame. `card_face` is the face crop recovered from
    /// the locked card, absent when extraction failed at lock time.
    pub fn process(
        &mut self,
        frame: &RgbImage,
        now: Instant,
        card_face: Option<&RgbImage>,
        faces: &dyn FaceDetector,
        embedder: &dyn EmbeddingExtractor,
    ) -> Result<FaceFrame, InferenceError> {
        // terminal: replay the cached payload, no recomputation
        if let FacePhase::Matched { similarity } = self.phase {
            return Ok(FaceFrame {
                face_detected: true,
                matched: true,
                similarity: Some(similarity),
                best_similarity: self.best_similarity,
            });
        }

        let detections = faces.detect(frame, self.config.face_confidence)?;
        let best = detections.into_iter().max_by(|a, b| {
            (a.confidence, a.area_ratio)
                .partial_cmp(&(b.confidence, b.area_ratio))
                .unwrap_or(Ordering::Equal)
        });

        let Some(face) = best else {
            // a dropped face fully restarts face-validation progress
            self.clear_face_state();
            return Ok(FaceFrame {
                face_detected: false,
                best_similarity: self.best_similarity,
                ..FaceFrame::default()
            });
        };

        match &self.phase {
            FacePhase::Idle => {
                self.phase = FacePhase::Grace { since: now };
                return Ok(self.undecided_frame());
            }
            FacePhase::Grace { since } => {
                if now.duration_since(*since) < self.config.grace {
                    return Ok(self.undecided_frame());
                }
                // grace over: this frame already counts for tracking
                self.phase = FacePhase::Tracking(TrackState {
                    window: HitWindow::new(self.config.stillness_window),
                    last_center: face.center(),
                    still_since: now,
                });
            }
            FacePhase::Tracking(_) | FacePhase::Matched { .. } => {}
        }

        let FacePhase::Tracking(track) = &mut self.phase else {
            return Ok(self.undecided_frame());
        };

        let center = face.center();
        if geometry::distance(center, track.last_center) > self.config.stillness_px {
            track.still_since = now;
        }
        track.last_center = center;
        track
            .window
            .push(now.duration_since(track.still_since) >= self.config.stillness);
        let stable = track.window.is_stable(self.config.stillness_min_hits);

        self.ensure_reference(card_face, embedder)?;

        let similarity = if let ReferenceSlot::Ready(reference) = &self.reference {
            let crop = geometry::crop_face(frame, &face, LIVE_FACE_PAD_RATIO).or_else(|| {
                geometry::crop_rect(
                    frame,
                    face.x1 as i64,
                    face.y1 as i64,
                    face.x2 as i64,
                    face.y2 as i64,
                )
            });
            match crop {
                Some(crop) => rotation::embed_face(&crop, embedder)?
                    .map(|embedding| embedding.similarity(reference)),
                None => None,
            }
        } else {
            None
        };

        if let Some(sim) = similarity {
            self.best_similarity = Some(self.best_similarity.map_or(sim, |b| b.max(sim)));
        }

        if stable && similarity.map_or(false, |s| s >= self.config.match_threshold) {
            let sim = similarity.unwrap_or_default();
            self.phase = FacePhase::Matched { similarity: sim };
            tracing::info!(similarity = sim, "live face matched");
            return Ok(FaceFrame {
                face_detected: true,
                matched: true,
                similarity,
                best_similarity: self.best_similarity,
            });
        }

        Ok(FaceFrame {
            face_detected: true,
            matched: false,
            similarity,
            best_similarity: self.best_similarity,
        })
    }

    fn undecided_frame(&self) -> FaceFrame {
        FaceFrame {
            face_detected: true,
            best_similarity: self.best_similarity,
            ..FaceFrame::default()
        }
    }

    /// Lazily extract the reference embedding from the card face crop, at
    /// most once until the slot is cleared again.
    fn ensure_reference(
        &mut self,
        card_face: Option<&RgbImage>,
        embedder: &dyn EmbeddingExtractor,
    ) -> Result<(), InferenceError> {
        if !matches!(self.reference, ReferenceSlot::NotAttempted) {
            return Ok(());
        }
        let Some(crop) = card_face else {
            return Ok(());
        };
        match rotation::embed_face(crop, embedder)? {
            Some(embedding) => {
                tracing::debug!("reference embedding ready");
                self.reference = ReferenceSlot::Ready(embedding);
            }
            None => {
                tracing::warn!("reference embedding extraction failed");
                self.reference = ReferenceSlot::Failed;
            }
        }
        Ok(())
    }

    /// "No face" observation: restart all face-validation progress. A ready
    /// reference embedding is kept (it is never replaced once set); a failed
    /// attempt becomes eligible again.
    fn clear_face_state(&mut self) {
        self.phase = FacePhase::Idle;
        if matches!(self.reference, ReferenceSlot::Failed) {
            self.reference = ReferenceSlot::NotAttempted;
        }
    }

    /// Explicit retry: clear face sub-state and allow the reference to be
    /// recomputed. The caller keeps its card lock.
    pub fn retry(&mut self) {
        self.phase = FacePhase::Idle;
        self.reference = ReferenceSlot::NotAttempted;
    }

    /// Full session reset.
    pub fn reset(&mut self) {
        self.phase = FacePhase::Idle;
        self.reference = ReferenceSlot::NotAttempted;
        self.best_similarity = None;
    }
}
