//! Per-connection verification session.
//!
//! Composes the card lock machine and the live face matcher, routes control
//! messages, and builds the per-frame wire payload. Frames for one session
//! are processed strictly sequentially; sessions never share state.

use crate::card::{self, CardLockMachine, CardObservation, CardState};
use crate::config::SessionConfig;
use crate::encode;
use crate::geometry;
use crate::infer::{Collaborators, InferenceError};
use crate::matcher::{FaceFrame, LiveFaceMatcher};
use crate::rotation::{self, ExtractError};
use crate::types::BoxDetection;
use image::RgbImage;
use serde::Serialize;
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("payload encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Text control messages accepted between frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Forget everything and return to SEARCHING.
    Reset,
    /// Clear face-validation progress, keeping the card lock.
    RetryFace,
}

impl ControlMessage {
    /// Case-insensitive, whitespace-trimmed parse. Unknown text is `None`.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "reset" => Some(Self::Reset),
            "retry_face" => Some(Self::RetryFace),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Searching,
    Locking,
    Locked,
    /// Models are not loaded; control messages are still accepted.
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

/// One JSON response per processed frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameResponse {
    pub state: SessionState,
    pub bbox: Option<[f32; 4]>,
    pub confidence: f32,
    pub area_ratio: f32,
    pub frame: FrameSize,
    pub too_small: bool,
    pub face_detected: bool,
    pub matched: bool,
    pub validation_done: bool,
    pub validation_failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crop: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_crop: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_bbox: Option<[f32; 4]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_similarity: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_similarity: Option<f32>,
}

impl FrameResponse {
    fn empty(state: SessionState, width: u32, height: u32) -> Self {
        Self {
            state,
            bbox: None,
            confidence: 0.0,
            area_ratio: 0.0,
            frame: FrameSize { width, height },
            too_small: false,
            face_detected: false,
            matched: false,
            validation_done: false,
            validation_failed: false,
            crop: None,
            face_crop: None,
            face_bbox: None,
            face_similarity: None,
            best_similarity: None,
        }
    }

    /// Payload reported while the model registry is unavailable.
    pub fn unavailable(width: u32, height: u32) -> Self {
        Self::empty(SessionState::Unavailable, width, height)
    }
}

/// Terminal card payload, built once on lock and replayed verbatim.
struct LockedCard {
    bbox: BoxDetection,
    too_small: bool,
    card_uri: String,
    face_crop: Option<RgbImage>,
    face_uri: Option<String>,
    face_bbox: Option<[f32; 4]>,
}

pub struct VerificationSession {
    id: Uuid,
    config: SessionConfig,
    collab: Collaborators,
    machine: CardLockMachine,
    locked: Option<LockedCard>,
    /// Validation clock: starts at lock, restarts on an explicit retry.
    validation_since: Option<Instant>,
    matcher: LiveFaceMatcher,
}

impl VerificationSession {
    pub fn new(config: SessionConfig, collab: Collaborators) -> Self {
        let id = Uuid::new_v4();
        tracing::debug!(session = %id, "session created");
        Self {
            id,
            machine: CardLockMachine::new(config.clone()),
            matcher: LiveFaceMatcher::new(config.clone()),
            locked: None,
            validation_since: None,
            config,
            collab,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Process one decoded frame. Exactly one response per call.
    pub fn process_frame(
        &mut self,
        image: &RgbImage,
        now: Instant,
    ) -> Result<FrameResponse, SessionError> {
        let frame = geometry::resize_long_edge(image, self.config.frame_long_edge);
        let (width, height) = frame.dimensions();

        if self.machine.state() == CardState::Locked {
            if let Some(locked) = &self.locked {
                let face = self.matcher.process(
                    &frame,
                    now,
                    locked.face_crop.as_ref(),
                    self.collab.faces.as_ref(),
                    self.collab.embedder.as_ref(),
                )?;
                return Ok(Self::locked_response(
                    locked,
                    &face,
                    width,
                    height,
                    validation_failed(&face, self.validation_since, now, &self.config),
                ));
            }
            // lock without payload cannot happen in normal flow; recover by
            // searching again
            self.machine.reset();
        }

        let observation = card::observe(self.collab.cards.as_ref(), &frame, &self.config)?;
        let just_locked = self.machine.step(observation.has_valid(), now);

        if just_locked {
            match self.build_locked_payload(&frame, &observation) {
                Ok(Some(locked)) => {
                    tracing::info!(
                        session = %self.id,
                        confidence = locked.bbox.confidence,
                        area_ratio = locked.bbox.area_ratio,
                        face_found = locked.face_uri.is_some(),
                        "card locked"
                    );
                    self.validation_since = Some(now);
                    let response = Self::locked_response(
                        &locked,
                        &FaceFrame::default(),
                        width,
                        height,
                        false,
                    );
                    self.locked = Some(locked);
                    return Ok(response);
                }
                Ok(None) => {
                    // degenerate crop; fall through and keep searching
                    self.machine.reset();
                }
                Err(err) => {
                    self.machine.reset();
                    return Err(err);
                }
            }
        }

        let state = match self.machine.state() {
            CardState::Searching => SessionState::Searching,
            CardState::Locking => SessionState::Locking,
            CardState::Locked => SessionState::Locked,
        };
        let surface = observation.surface();
        Ok(FrameResponse {
            bbox: surface.map(BoxDetection::as_array),
            confidence: surface.map_or(0.0, |b| b.confidence),
            area_ratio: surface.map_or(0.0, |b| b.area_ratio),
            too_small: observation.too_small,
            ..FrameResponse::empty(state, width, height)
        })
    }

    /// Handle a control message between frames. Takes effect atomically
    /// before the next frame.
    pub fn handle_control(&mut self, message: ControlMessage, now: Instant) {
        match message {
            ControlMessage::Reset => {
                tracing::info!(session = %self.id, "session reset");
                self.machine.reset();
                self.matcher.reset();
                self.locked = None;
                self.validation_since = None;
            }
            ControlMessage::RetryFace => {
                tracing::info!(session = %self.id, "face validation retry");
                self.matcher.retry();
                if self.validation_since.is_some() {
                    self.validation_since = Some(now);
                }
            }
        }
    }

    /// Build the terminal payload for the frame that completed the lock.
    /// Returns `Ok(None)` when the winning box degenerates to an empty crop.
    fn build_locked_payload(
        &self,
        frame: &RgbImage,
        observation: &CardObservation,
    ) -> Result<Option<LockedCard>, SessionError> {
        let Some(bbox) = observation.best_valid.clone() else {
            return Ok(None);
        };
        let Some(card_crop) = geometry::crop_with_padding(frame, &bbox, self.config.card_pad_ratio)
        else {
            return Ok(None);
        };
        let card_uri = encode::jpeg_data_uri(&card_crop, self.config.jpeg_quality)?;

        let (face_crop, face_uri, face_bbox) =
            match rotation::extract_card_face(&card_crop, self.collab.faces.as_ref()) {
                Ok(extracted) => {
                    let uri = encode::jpeg_data_uri(&extracted.crop, self.config.jpeg_quality)?;
                    let normalized = extracted
                        .bbox
                        .normalized(extracted.rotated_width, extracted.rotated_height);
                    (Some(extracted.crop), Some(uri), Some(normalized))
                }
                Err(ExtractError::Inference(err)) => return Err(err.into()),
                Err(err) => {
                    // non-fatal: the card stays locked, matching can never
                    // succeed, and the client learns via validation_failed
                    tracing::warn!(session = %self.id, error = %err, "card face extraction failed");
                    (None, None, None)
                }
            };

        Ok(Some(LockedCard {
            too_small: bbox.area_ratio < self.config.card_min_area_ratio,
            bbox,
            card_uri,
            face_crop,
            face_uri,
            face_bbox,
        }))
    }

    fn locked_response(
        locked: &LockedCard,
        face: &FaceFrame,
        width: u32,
        height: u32,
        validation_failed: bool,
    ) -> FrameResponse {
        FrameResponse {
            state: SessionState::Locked,
            bbox: Some(locked.bbox.as_array()),
            confidence: locked.bbox.confidence,
            area_ratio: locked.bbox.area_ratio,
            frame: FrameSize { width, height },
            too_small: locked.too_small,
            face_detected: face.face_detected,
            matched: face.matched,
            validation_done: face.matched || validation_failed,
            validation_failed,
            crop: Some(locked.card_uri.clone()),
            face_crop: locked.face_uri.clone(),
            face_bbox: locked.face_bbox,
            face_similarity: face.similarity,
            best_similarity: face.best_similarity,
        }
    }
}

fn validation_failed(
    face: &FaceFrame,
    validation_since: Option<Instant>,
    now: Instant,
    config: &SessionConfig,
) -> bool {
    !face.matched
        && validation_since
            .map_or(false, |since| now.duration_since(since) >= config.validation_timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infer::{EmbeddingExtractor, FaceDetector, ObjectDetector};
    use crate::types::Embedding;
    use image::Rgb;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const FRAME_W: u32 = 1280;
    const FRAME_H: u32 = 720;

    fn live_frame() -> RgbImage {
        RgbImage::from_pixel(FRAME_W, FRAME_H, Rgb([90, 90, 90]))
    }

    fn valid_card_box() -> BoxDetection {
        // 640x400 box in a 1280x720 frame: aspect 1.6, area ratio ~0.278
        BoxDetection {
            x1: 100.0,
            y1: 100.0,
            x2: 740.0,
            y2: 500.0,
            confidence: 0.92,
            area_ratio: 0.278,
        }
    }

    /// Card detector replaying a scripted validity sequence.
    struct ScriptedCards {
        script: Mutex<Vec<bool>>,
        calls: Mutex<usize>,
    }

    impl ScriptedCards {
        fn valid_for(frames: usize) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(vec![true; frames]),
                calls: Mutex::new(0),
            })
        }

        fn with_script(script: Vec<bool>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    impl ObjectDetector for ScriptedCards {
        fn detect(
            &self,
            _image: &RgbImage,
            _confidence_threshold: f32,
        ) -> Result<Vec<BoxDetection>, InferenceError> {
            *self.calls.lock().unwrap() += 1;
            let mut script = self.script.lock().unwrap();
            let valid = if script.is_empty() {
                true
            } else {
                script.remove(0)
            };
            if valid {
                Ok(vec![valid_card_box()])
            } else {
                Ok(vec![])
            }
        }
    }

    /// Face detector distinguishing card crops from live frames by size:
    /// card crops (and their rotations) get a fixed printed face; live
    /// frames get `live` per-frame behavior.
    struct StubFaces {
        live_face: bool,
    }

    impl FaceDetector for StubFaces {
        fn detect(
            &self,
            image: &RgbImage,
            _confidence_threshold: f32,
        ) -> Result<Vec<BoxDetection>, InferenceError> {
            if image.width() == FRAME_W {
                if self.live_face {
                    Ok(vec![BoxDetection {
                        x1: 550.0,
                        y1: 300.0,
                        x2: 650.0,
                        y2: 420.0,
                        confidence: 0.85,
                        area_ratio: 0.013,
                    }])
                } else {
                    Ok(vec![])
                }
            } else {
                // printed face on the card crop, portrait, well inside bounds
                Ok(vec![BoxDetection {
                    x1: 100.0,
                    y1: 100.0,
                    x2: 180.0,
                    y2: 220.0,
                    confidence: 0.9,
                    area_ratio: 0.03,
                }])
            }
        }
    }

    struct ConstantEmbedder;

    impl EmbeddingExtractor for ConstantEmbedder {
        fn embed(&self, _face_crop: &RgbImage) -> Result<Option<Embedding>, InferenceError> {
            Ok(Some(Embedding::from_raw(vec![1.0, 0.0])))
        }
    }

    fn collaborators(cards: Arc<ScriptedCards>, live_face: bool) -> Collaborators {
        Collaborators {
            cards,
            faces: Arc::new(StubFaces { live_face }),
            embedder: Arc::new(ConstantEmbedder),
        }
    }

    fn session(cards: Arc<ScriptedCards>, live_face: bool) -> VerificationSession {
        VerificationSession::new(SessionConfig::default(), collaborators(cards, live_face))
    }

    fn at(t0: Instant, secs: f32) -> Instant {
        t0 + Duration::from_millis((secs * 1000.0) as u64)
    }

    #[test]
    fn continuous_card_locks_once_with_payload() {
        let cards = ScriptedCards::valid_for(20);
        let mut s = session(cards.clone(), true);
        let frame = live_frame();
        let t0 = Instant::now();

        let mut states = Vec::new();
        for i in 0..8 {
            let r = s.process_frame(&frame, at(t0, i as f32 * 0.1)).unwrap();
            states.push(r.state);
            if i < 7 {
                assert!(r.crop.is_none(), "frame {i}");
            } else {
                // the locking frame carries the full payload
                assert!(r.crop.is_some());
                assert!(r.face_crop.is_some());
                assert!(r.face_bbox.is_some());
                assert!(!r.too_small);
                assert_eq!(r.bbox, Some(valid_card_box().as_array()));
            }
        }
        assert_eq!(states[0], SessionState::Searching);
        // the second valid frame reaches window stability
        assert_eq!(states[1], SessionState::Locking);
        assert_eq!(states[6], SessionState::Locking);
        assert_eq!(states[7], SessionState::Locked);

        // after lock the card detector is never consulted again
        let calls = cards.calls();
        let replay = s.process_frame(&frame, at(t0, 0.9)).unwrap();
        assert_eq!(replay.state, SessionState::Locked);
        assert_eq!(cards.calls(), calls);
    }

    #[test]
    fn locked_payload_is_replayed_byte_identically() {
        let cards = ScriptedCards::valid_for(20);
        let mut s = session(cards, true);
        let frame = live_frame();
        let t0 = Instant::now();

        for i in 0..8 {
            s.process_frame(&frame, at(t0, i as f32 * 0.1)).unwrap();
        }
        // drive the live matcher to MATCHED: grace 3s + stillness 3s at 1s
        // frame spacing, starting from the first post-lock frame
        let mut last = None;
        for i in 1..=8 {
            last = Some(s.process_frame(&frame, at(t0, 0.7 + i as f32)).unwrap());
        }
        let matched = last.unwrap();
        assert!(matched.matched, "matcher should have confirmed");
        assert!(matched.validation_done);

        let a = serde_json::to_string(&matched).unwrap();
        let next = s.process_frame(&frame, at(t0, 10.5)).unwrap();
        let b = serde_json::to_string(&next).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unstable_run_demotes_before_relock() {
        // 2 valid, 3 invalid, then valid again
        let script = vec![true, true, false, false, false, true, true, true];
        let cards = ScriptedCards::with_script(script);
        let mut s = session(cards, true);
        let frame = live_frame();
        let t0 = Instant::now();

        let mut states = Vec::new();
        for i in 0..8 {
            let r = s.process_frame(&frame, at(t0, i as f32 * 0.1)).unwrap();
            states.push(r.state);
        }
        use SessionState::{Locking, Searching};
        assert_eq!(
            states,
            vec![
                Searching, Locking, // two valid frames arm the lock
                Searching, Searching, Searching, // demoted during the invalid run
                Searching, // a lone fresh hit is not stable yet
                Locking, Locking, // two fresh hits re-arm
            ]
        );
    }

    #[test]
    fn reset_mid_locking_returns_to_searching_with_empty_buffers() {
        let cards = ScriptedCards::valid_for(20);
        let mut s = session(cards, true);
        let frame = live_frame();
        let t0 = Instant::now();

        s.process_frame(&frame, at(t0, 0.0)).unwrap();
        let r = s.process_frame(&frame, at(t0, 0.1)).unwrap();
        assert_eq!(r.state, SessionState::Locking);

        s.handle_control(ControlMessage::Reset, at(t0, 0.15));

        // one hit in a cleared window is not stable
        let r = s.process_frame(&frame, at(t0, 0.2)).unwrap();
        assert_eq!(r.state, SessionState::Searching);
        let r = s.process_frame(&frame, at(t0, 0.3)).unwrap();
        assert_eq!(r.state, SessionState::Locking);
    }

    #[test]
    fn reset_after_lock_discards_payload() {
        let cards = ScriptedCards::valid_for(30);
        let mut s = session(cards, true);
        let frame = live_frame();
        let t0 = Instant::now();

        for i in 0..8 {
            s.process_frame(&frame, at(t0, i as f32 * 0.1)).unwrap();
        }
        s.handle_control(ControlMessage::Reset, at(t0, 1.0));
        let r = s.process_frame(&frame, at(t0, 1.1)).unwrap();
        assert_eq!(r.state, SessionState::Searching);
        assert!(r.crop.is_none());
        assert!(!r.matched);
    }

    #[test]
    fn missing_live_face_times_out_as_validation_failed() {
        let cards = ScriptedCards::valid_for(20);
        let mut s = session(cards, false); // card face extracts, live face never appears
        let frame = live_frame();
        let t0 = Instant::now();

        for i in 0..8 {
            s.process_frame(&frame, at(t0, i as f32 * 0.1)).unwrap();
        }
        let before = s.process_frame(&frame, at(t0, 10.0)).unwrap();
        assert!(!before.validation_failed);
        assert!(!before.face_detected);

        // validation clock started at the 0.7s lock; default timeout 20s
        let after = s.process_frame(&frame, at(t0, 21.0)).unwrap();
        assert!(after.validation_failed);
        assert!(after.validation_done);
        assert!(!after.matched);
        assert_eq!(after.state, SessionState::Locked);
    }

    #[test]
    fn retry_face_restarts_validation_keeping_the_lock() {
        let cards = ScriptedCards::valid_for(20);
        let mut s = session(cards, false);
        let frame = live_frame();
        let t0 = Instant::now();

        for i in 0..8 {
            s.process_frame(&frame, at(t0, i as f32 * 0.1)).unwrap();
        }
        let failed = s.process_frame(&frame, at(t0, 21.0)).unwrap();
        assert!(failed.validation_failed);

        s.handle_control(ControlMessage::RetryFace, at(t0, 21.5));
        let retried = s.process_frame(&frame, at(t0, 22.0)).unwrap();
        assert_eq!(retried.state, SessionState::Locked);
        assert!(retried.crop.is_some());
        assert!(!retried.validation_failed);
    }

    #[test]
    fn control_messages_parse_loosely() {
        assert_eq!(ControlMessage::parse("reset"), Some(ControlMessage::Reset));
        assert_eq!(ControlMessage::parse(" RESET \n"), Some(ControlMessage::Reset));
        assert_eq!(
            ControlMessage::parse("Retry_Face"),
            Some(ControlMessage::RetryFace)
        );
        assert_eq!(ControlMessage::parse("pause"), None);
        assert_eq!(ControlMessage::parse(""), None);
    }

    #[test]
    fn searching_response_serializes_expected_shape() {
        let cards = ScriptedCards::with_script(vec![false]);
        let mut s = session(cards, true);
        let r = s
            .process_frame(&live_frame(), Instant::now())
            .unwrap();
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["state"], "searching");
        assert_eq!(json["frame"]["width"], 1280);
        assert_eq!(json["frame"]["height"], 720);
        assert_eq!(json["matched"], false);
        // optional payloads are omitted entirely, not null
        assert!(json.get("crop").is_none());
        assert!(json.get("face_similarity").is_none());
    }

    #[test]
    fn unavailable_response_reports_state() {
        let r = FrameResponse::unavailable(640, 480);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["state"], "unavailable");
        assert_eq!(json["frame"]["width"], 640);
    }

    #[test]
    fn oversized_frames_are_capped_before_detection() {
        let cards = ScriptedCards::valid_for(5);
        let mut s = session(cards, true);
        let big = RgbImage::from_pixel(2560, 1440, Rgb([90, 90, 90]));
        let r = s.process_frame(&big, Instant::now()).unwrap();
        assert_eq!(r.frame, FrameSize { width: 1280, height: 720 });
    }
}
