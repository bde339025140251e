use std::time::Duration;

/// Tunables for one verification session. Constructed once per connection;
/// the daemon overrides defaults from its environment configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Longest-edge cap applied to every frame before detection.
    pub frame_long_edge: u32,
    /// Confidence threshold for the card detector.
    pub card_confidence: f32,
    /// Accepted card box aspect envelope (width / height).
    pub card_aspect_min: f32,
    pub card_aspect_max: f32,
    /// Minimum card box area as a fraction of frame area.
    pub card_min_area_ratio: f32,
    /// Capacity of the card-detection hit window.
    pub hit_window: usize,
    /// Hits required within the window for the detection to count as stable.
    pub min_hits: usize,
    /// Continuous-stability duration required before the card locks.
    pub lock_delay: Duration,
    /// Symmetric padding applied when cropping the locked card, as a
    /// fraction of box dimensions.
    pub card_pad_ratio: f32,
    /// Confidence threshold for live-frame face detection.
    pub face_confidence: f32,
    /// Window after first seeing a live face during which matching is
    /// deferred so the user can position themselves.
    pub grace: Duration,
    /// Maximum face-center movement between frames still counted as "still".
    pub stillness_px: f32,
    /// How long the face must be held still.
    pub stillness: Duration,
    /// Capacity of the stillness hit window.
    pub stillness_window: usize,
    /// Hits required in the stillness window.
    pub stillness_min_hits: usize,
    /// Cosine similarity required for a match.
    pub match_threshold: f32,
    /// How long after lock an unmatched session reports validation failure.
    pub validation_timeout: Duration,
    /// JPEG quality for crop payloads.
    pub jpeg_quality: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_long_edge: 1280,
            card_confidence: 0.8,
            card_aspect_min: 1.25,
            card_aspect_max: 2.1,
            card_min_area_ratio: 0.13,
            hit_window: 4,
            min_hits: 2,
            lock_delay: Duration::from_millis(600),
            card_pad_ratio: 0.05,
            face_confidence: 0.5,
            grace: Duration::from_secs(3),
            stillness_px: 12.0,
            stillness: Duration::from_secs(3),
            stillness_window: 6,
            stillness_min_hits: 1,
            match_threshold: 0.35,
            validation_timeout: Duration::from_secs(20),
            jpeg_quality: 88,
        }
    }
}
