use std::path::PathBuf;
use std::time::Duration;
use veriface_core::SessionConfig;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Listen address for the HTTP/WebSocket server.
    pub bind_addr: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Per-session tunables.
    pub session: SessionConfig,
}

impl Config {
    /// Load configuration from `VERIFACE_*` environment variables with
    /// defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("VERIFACE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("models"));

        let defaults = SessionConfig::default();
        let session = SessionConfig {
            card_confidence: env_f32("VERIFACE_CARD_CONFIDENCE", defaults.card_confidence),
            card_min_area_ratio: env_f32(
                "VERIFACE_CARD_MIN_AREA_RATIO",
                defaults.card_min_area_ratio,
            ),
            lock_delay: env_duration("VERIFACE_LOCK_DELAY_SECS", defaults.lock_delay),
            face_confidence: env_f32("VERIFACE_FACE_CONFIDENCE", defaults.face_confidence),
            grace: env_duration("VERIFACE_GRACE_SECS", defaults.grace),
            stillness_px: env_f32("VERIFACE_STILLNESS_PIXELS", defaults.stillness_px),
            stillness: env_duration("VERIFACE_STILLNESS_SECS", defaults.stillness),
            match_threshold: env_f32("VERIFACE_MATCH_THRESHOLD", defaults.match_threshold),
            validation_timeout: env_duration(
                "VERIFACE_VALIDATION_TIMEOUT_SECS",
                defaults.validation_timeout,
            ),
            ..defaults
        };

        Self {
            bind_addr: std::env::var("VERIFACE_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8787".to_string()),
            model_dir,
            session,
        }
    }

    /// Path to the card detection model.
    pub fn card_model_path(&self) -> String {
        self.model_dir
            .join("card.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the face detection model.
    pub fn face_model_path(&self) -> String {
        self.model_dir
            .join("face.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the face embedding model.
    pub fn embedding_model_path(&self) -> String {
        self.model_dir
            .join("arcface.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_duration(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f32>().ok())
        .filter(|secs| *secs >= 0.0)
        .map(Duration::from_secs_f32)
        .unwrap_or(default)
}
