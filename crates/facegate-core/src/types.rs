use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, in pixel coordinates of the
/// preprocessed image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// A single face candidate returned by a detector.
///
/// `confidence` is in [0, 1]. `live` is the detector's anti-spoof judgment
/// when one was requested; `None` means no judgment was made.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub live: Option<bool>,
}

/// Distance metric a set of embeddings was built for.
///
/// Only cosine distance is supported; the similarity-percentage formula in
/// the matcher assumes a metric bounded in [0, 2].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Cosine,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
        }
    }
}

/// Face embedding vector (512-dimensional for ArcFace, L2-normalized).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Cosine distance between two embeddings: `1 − cosine similarity`,
    /// bounded in [0, 2]. Zero-norm vectors compare at distance 1.
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        let similarity = if denom > 0.0 { dot / denom } else { 0.0 };
        1.0 - similarity
    }
}

/// One precomputed gallery reference: the embedding of a stored face image
/// together with the identity that owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceEmbedding {
    /// Identity name (the gallery sub-directory).
    pub identity: String,
    /// Path of the gallery image this embedding was computed from.
    pub source: PathBuf,
    pub embedding: Embedding,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding { values: values.to_vec() }
    }

    #[test]
    fn test_cosine_distance_identical() {
        let a = emb(&[1.0, 0.0, 0.0]);
        assert!(a.cosine_distance(&a).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_orthogonal() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[0.0, 1.0]);
        assert!((a.cosine_distance(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_opposite() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[-1.0, 0.0]);
        assert!((a.cosine_distance(&b) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_zero_vector() {
        let a = emb(&[0.0, 0.0]);
        let b = emb(&[1.0, 0.0]);
        assert_eq!(a.cosine_distance(&b), 1.0);
    }

    #[test]
    fn test_cosine_distance_scale_invariant() {
        let a = emb(&[1.0, 2.0, 3.0]);
        let b = emb(&[2.0, 4.0, 6.0]);
        assert!(a.cosine_distance(&b).abs() < 1e-6);
    }

    #[test]
    fn test_metric_as_str() {
        assert_eq!(Metric::Cosine.as_str(), "cosine");
    }
}
