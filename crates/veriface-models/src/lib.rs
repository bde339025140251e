//! veriface-models — ONNX collaborator implementations.
//!
//! YOLO-style single-class detectors for cards and faces, and an
//! ArcFace-style embedding extractor, all running via ONNX Runtime for CPU
//! inference. Implements the collaborator traits from `veriface-core`.

pub mod detector;
pub mod embedder;
pub mod registry;

pub use detector::{DetectorError, YoloDetector};
pub use embedder::{EmbedderError, FaceEmbedder};
pub use registry::{ModelRegistry, RegistryError};
