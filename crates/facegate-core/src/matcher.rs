//! Nearest-reference matching and the verify/reject decision.

use crate::types::{Embedding, ReferenceEmbedding};

/// Similarity percentage at or above which a match counts as verified.
pub const SIMILARITY_THRESHOLD_PERCENT: f64 = 50.0;

/// Final decision for a query embedding against the gallery references.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchDecision {
    Verified {
        identity: String,
        similarity_percent: f64,
    },
    Unverified {
        similarity_percent: f64,
    },
}

impl MatchDecision {
    /// The similarity percentage, carried on both accept and reject for
    /// observability.
    pub fn similarity_percent(&self) -> f64 {
        match self {
            MatchDecision::Verified { similarity_percent, .. }
            | MatchDecision::Unverified { similarity_percent } => *similarity_percent,
        }
    }
}

/// Convert a cosine distance into a similarity percentage.
///
/// `(1 − distance) × 100`. Valid only for a metric bounded in [0, 2]; do not
/// reuse with a different distance function.
pub fn similarity_percent(distance: f32) -> f64 {
    (1.0 - f64::from(distance)) * 100.0
}

/// Two-decimal display form used in every response payload, e.g. `"87.31%"`.
pub fn format_similarity(percent: f64) -> String {
    format!("{percent:.2}%")
}

/// Scan every reference and decide against the single globally nearest one.
///
/// Returns `None` when `references` is empty (identities exist but own no
/// usable images). Iteration follows the slice order — the cache orders
/// entries by identity name, then file name — and the comparison is strict,
/// so the earliest reference at the minimum distance wins ties.
pub fn find_match(query: &Embedding, references: &[ReferenceEmbedding]) -> Option<MatchDecision> {
    let mut nearest: Option<(&ReferenceEmbedding, f32)> = None;

    for reference in references {
        let distance = query.cosine_distance(&reference.embedding);
        match nearest {
            Some((_, best)) if distance >= best => {}
            _ => nearest = Some((reference, distance)),
        }
    }

    let (reference, distance) = nearest?;
    let percent = similarity_percent(distance);

    tracing::debug!(
        identity = %reference.identity,
        source = %reference.source.display(),
        distance,
        similarity = percent,
        "nearest reference selected"
    );

    if percent >= SIMILARITY_THRESHOLD_PERCENT {
        Some(MatchDecision::Verified {
            identity: reference.identity.clone(),
            similarity_percent: percent,
        })
    } else {
        Some(MatchDecision::Unverified { similarity_percent: percent })
    }
}
