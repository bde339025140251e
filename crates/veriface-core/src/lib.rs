//! veriface-core — Identity-document capture and face-match verification.
//!
//! Owns the per-session verification state machine: card lock hysteresis,
//! rotation-invariant reference-face extraction from the captured card, and
//! the live stillness/similarity matcher. Detection and embedding models are
//! consumed through the collaborator traits in [`infer`]; this crate never
//! touches model weights itself.

pub mod card;
pub mod config;
pub mod encode;
pub mod geometry;
pub mod infer;
pub mod matcher;
pub mod quality;
pub mod rotation;
pub mod session;
pub mod types;
pub mod window;

pub use config::SessionConfig;
pub use infer::{Collaborators, EmbeddingExtractor, FaceDetector, InferenceError, ObjectDetector};
pub use session::{ControlMessage, FrameResponse, VerificationSession};
pub use types::{BoxDetection, Embedding};
