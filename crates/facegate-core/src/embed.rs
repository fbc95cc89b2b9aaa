//! ArcFace face embedder via ONNX Runtime.
//!
//! Produces 512-dimensional L2-normalized embeddings from face crops, using
//! the w600k_r50 ArcFace model.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

use crate::types::Embedding;

const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric normalization, unlike SCRFD
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_ID: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("model file not found: {0} — download w600k_r50.onnx from insightface")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Capability contract for the embedding model.
///
/// `model_id` tags every cache artifact; two embedders with different ids
/// never share precomputed representations.
pub trait FaceEmbed {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, EmbedError>;
    fn model_id(&self) -> &str;
}

/// ArcFace-based embedder over RGB face crops.
pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbedError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded ArcFace model");

        Ok(Self { session })
    }

    /// Resize a face crop to the model input and normalize into NCHW layout.
    fn preprocess(face: &RgbImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE as u32;
        let resized = if face.dimensions() == (size, size) {
            face.clone()
        } else {
            imageops::resize(face, size, size, FilterType::Triangle)
        };

        let mut tensor =
            Array4::<f32>::zeros((1, 3, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }

        tensor
    }
}

/// Scale a raw model output to unit length. A zero vector is returned as-is.
fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}

impl FaceEmbed for ArcFaceEmbedder {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, EmbedError> {
        let input = Self::preprocess(face);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(EmbedError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding { values: l2_normalize(raw) })
    }

    fn model_id(&self) -> &str {
        ARCFACE_MODEL_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_output_shape() {
        let face = RgbImage::from_pixel(200, 160, image::Rgb([90, 120, 150]));
        let tensor = ArcFaceEmbedder::preprocess(&face);
        assert_eq!(tensor.shape(), &[1, 3, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let face = RgbImage::from_pixel(112, 112, image::Rgb([128, 0, 255]));
        let tensor = ArcFaceEmbedder::preprocess(&face);
        assert!((tensor[[0, 0, 0, 0]] - (128.0 - ARCFACE_MEAN) / ARCFACE_STD).abs() < 1e-6);
        assert!((tensor[[0, 1, 0, 0]] - (-1.0)).abs() < 1e-6);
        assert!((tensor[[0, 2, 0, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_keeps_exact_size_crop() {
        // 112×112 input skips the resize; corner pixels survive untouched.
        let mut face = RgbImage::from_pixel(112, 112, image::Rgb([0, 0, 0]));
        face.put_pixel(0, 0, image::Rgb([255, 255, 255]));
        let tensor = ArcFaceEmbedder::preprocess(&face);
        assert!((tensor[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 0, 1, 1]] - (-1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_unit_length() {
        let normalized = l2_normalize(vec![3.0, 4.0]);
        let norm: f32 = normalized.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((normalized[0] - 0.6).abs() < 1e-6);
        assert!((normalized[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero_vector_unchanged() {
        assert_eq!(l2_normalize(vec![0.0, 0.0, 0.0]), vec![0.0, 0.0, 0.0]);
    }
}
