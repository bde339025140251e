//! Streaming card detection and the lock state machine.
//!
//! Detection happens every frame; the machine smooths the per-frame hits
//! through a small window and requires continuous stability for the lock
//! delay before the card is accepted as final.

use crate::config::SessionConfig;
use crate::infer::{InferenceError, ObjectDetector};
use crate::types::BoxDetection;
use crate::window::HitWindow;
use image::RgbImage;
use std::time::Instant;

/// Result of detecting a card in one resized frame.
#[derive(Debug, Clone)]
pub struct CardObservation {
    /// Largest valid box, when any box passed the aspect/area filters.
    pub best_valid: Option<BoxDetection>,
    /// Highest-confidence box regardless of validity, kept so the client can
    /// render feedback even when nothing qualifies.
    pub display: Option<BoxDetection>,
    /// A box passed the aspect filter but fell below the minimum area.
    pub too_small: bool,
    pub frame_width: u32,
    pub frame_height: u32,
}

impl CardObservation {
    pub fn has_valid(&self) -> bool {
        self.best_valid.is_some()
    }

    /// Box surfaced to the client: the valid one when present, otherwise the
    /// best overall for display purposes.
    pub fn surface(&self) -> Option<&BoxDetection> {
        self.best_valid.as_ref().or(self.display.as_ref())
    }
}

/// Run the card detector on a resized frame and classify its boxes.
pub fn observe(
    detector: &dyn ObjectDetector,
    frame: &RgbImage,
    config: &SessionConfig,
) -> Result<CardObservation, InferenceError> {
    let (frame_width, frame_height) = frame.dimensions();
    let boxes = detector.detect(frame, config.card_confidence)?;

    let mut best_valid: Option<BoxDetection> = None;
    let mut display: Option<BoxDetection> = None;
    let mut too_small = false;

    for bbox in boxes {
        if bbox.width() <= 0.0 || bbox.height() <= 0.0 {
            continue;
        }
        if display.as_ref().map_or(true, |d| bbox.confidence > d.confidence) {
            display = Some(bbox.clone());
        }
        let aspect = bbox.aspect();
        if !(config.card_aspect_min..=config.card_aspect_max).contains(&aspect) {
            continue;
        }
        if bbox.area_ratio < config.card_min_area_ratio {
            too_small = true;
            continue;
        }
        if best_valid.as_ref().map_or(true, |v| bbox.area() > v.area()) {
            best_valid = Some(bbox);
        }
    }

    Ok(CardObservation {
        best_valid,
        display,
        too_small,
        frame_width,
        frame_height,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    Searching,
    Locking,
    Locked,
}

#[derive(Debug)]
enum Phase {
    Searching,
    Locking { since: Instant },
    Locked,
}

/// Hysteresis for the SEARCHING → LOCKING → LOCKED transition. The machine
/// only tracks timing and stability; the caller owns the locked payload.
pub struct CardLockMachine {
    window: HitWindow,
    phase: Phase,
    config: SessionConfig,
}

impl CardLockMachine {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            window: HitWindow::new(config.hit_window),
            phase: Phase::Searching,
            config,
        }
    }

    pub fn state(&self) -> CardState {
        match self.phase {
            Phase::Searching => CardState::Searching,
            Phase::Locking { .. } => CardState::Locking,
            Phase::Locked => CardState::Locked,
        }
    }

    /// Feed one frame's detection outcome. Returns true on the single frame
    /// where the machine transitions into LOCKED. Once locked the machine
    /// ignores further observations until reset.
    pub fn step(&mut self, has_valid: bool, now: Instant) -> bool {
        if matches!(self.phase, Phase::Locked) {
            return false;
        }

        self.window.push(has_valid);
        let stable = self.window.is_stable(self.config.min_hits);

        match self.phase {
            Phase::Searching => {
                if stable && has_valid {
                    self.phase = Phase::Locking { since: now };
                }
                false
            }
            Phase::Locking { since } => {
                if stable && has_valid {
                    if now.duration_since(since) >= self.config.lock_delay {
                        self.phase = Phase::Locked;
                        return true;
                    }
                    false
                } else {
                    // a single unstable frame demotes and restarts the timer
                    self.phase = Phase::Searching;
                    false
                }
            }
            Phase::Locked => false,
        }
    }

    /// Force SEARCHING and clear all smoothing state.
    pub fn reset(&mut self) {
        self.phase = Phase::Searching;
        self.window.clear();
    }

    pub fn window_hits(&self) -> usize {
        self.window.hits()
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }
}
