//! facegate-core — Face verification pipeline primitives.
//!
//! Detection (SCRFD), anti-spoof classification (MiniFASNet) and embedding
//! extraction (ArcFace) run via ONNX Runtime behind the [`FaceDetect`] and
//! [`FaceEmbed`] capability traits; the decision logic (detection gate,
//! nearest-reference matcher) is pure and model-agnostic.

pub mod detect;
pub mod embed;
pub mod gate;
pub mod liveness;
pub mod matcher;
pub mod preprocess;
pub mod types;

pub use detect::{DetectError, FaceDetect, ScrfdDetector};
pub use embed::{ArcFaceEmbedder, EmbedError, FaceEmbed};
pub use gate::{GateOutcome, MIN_DETECTION_CONFIDENCE};
pub use liveness::{LivenessError, SpoofGuardedDetector, SpoofNet};
pub use matcher::{MatchDecision, SIMILARITY_THRESHOLD_PERCENT};
pub use types::{BoundingBox, DetectedFace, Embedding, Metric, ReferenceEmbedding};
