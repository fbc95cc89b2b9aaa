//! Detection gate: admission policy applied to raw detector output.
//!
//! The detector itself never enforces an acceptance threshold — it returns
//! every scored candidate so this gate can apply one policy uniformly for
//! both registration and verification.

use crate::types::DetectedFace;

/// Minimum detection confidence for a candidate to pass the gate.
///
/// Fixed, not configurable: it suppresses false positives on empty or
/// low-quality frames, and both workflows depend on the same boundary.
pub const MIN_DETECTION_CONFIDENCE: f32 = 0.95;

/// Outcome of running the gate over a detector's candidate list.
#[derive(Debug, Clone)]
pub enum GateOutcome {
    /// A face passed every check and may proceed down the pipeline.
    Admitted(DetectedFace),
    /// No candidate, or the leading candidate was below the confidence bar.
    NoFace,
    /// The leading candidate failed the liveness judgment.
    Spoof,
}

impl GateOutcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self, GateOutcome::Admitted(_))
    }
}

/// Apply the admission policy to `candidates`.
///
/// Only the first candidate is considered: frames are assumed to hold a
/// single subject (access-control kiosk pattern), and detectors order their
/// output by priority. Remaining candidates are discarded.
///
/// With `require_liveness`, a negative judgment yields [`GateOutcome::Spoof`];
/// an absent judgment fails closed to `Spoof` as well, since an admitted face
/// without an anti-spoof verdict would bypass the protection entirely.
pub fn admit(candidates: &[DetectedFace], require_liveness: bool) -> GateOutcome {
    let Some(candidate) = candidates.first() else {
        return GateOutcome::NoFace;
    };

    if candidate.confidence < MIN_DETECTION_CONFIDENCE {
        return GateOutcome::NoFace;
    }

    if require_liveness && candidate.live != Some(true) {
        return GateOutcome::Spoof;
    }

    GateOutcome::Admitted(candidate.clone())
}
