//! Anti-spoof (liveness) classification via ONNX Runtime.
//!
//! A MiniFASNet-style classifier judges whether a detected face belongs to a
//! present subject or to a photo/screen replay. [`SpoofGuardedDetector`]
//! composes the classifier with any [`FaceDetect`] implementation so the
//! rest of the pipeline sees a single detector capability that can annotate
//! candidates with a liveness judgment on demand.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

use crate::detect::{DetectError, FaceDetect};
use crate::types::{BoundingBox, DetectedFace};

const SPOOFNET_INPUT_SIZE: usize = 80;
/// MiniFASNet judges a region larger than the face box itself; the border
/// around the face carries most of the replay artifacts (screen bezels,
/// paper edges, moiré).
const SPOOFNET_CROP_SCALE: f32 = 2.7;
/// Class layout of the model's 3-way softmax; index 1 is the genuine class.
const SPOOFNET_REAL_CLASS: usize = 1;

#[derive(Error, Debug)]
pub enum LivenessError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A single anti-spoof judgment.
#[derive(Debug, Clone)]
pub struct LivenessJudgment {
    pub is_live: bool,
    /// Softmax probability of the genuine class, in [0, 1].
    pub score: f32,
}

/// MiniFASNet-style anti-spoof classifier.
pub struct SpoofNet {
    session: Session,
}

impl SpoofNet {
    /// Load the anti-spoof ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, LivenessError> {
        if !Path::new(model_path).exists() {
            return Err(LivenessError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded anti-spoof model");

        Ok(Self { session })
    }

    /// Judge the face at `bbox` within `image`.
    pub fn classify(
        &mut self,
        image: &RgbImage,
        bbox: &BoundingBox,
    ) -> Result<LivenessJudgment, LivenessError> {
        let region = scaled_crop(image, bbox, SPOOFNET_CROP_SCALE);
        let input = Self::preprocess(&region);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, logits) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| LivenessError::InferenceFailed(format!("spoof logits: {e}")))?;

        if logits.len() <= SPOOFNET_REAL_CLASS {
            return Err(LivenessError::InferenceFailed(format!(
                "expected at least {} output classes, got {}",
                SPOOFNET_REAL_CLASS + 1,
                logits.len()
            )));
        }

        let probs = softmax(logits);
        let best = probs
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
            .unwrap_or(0);

        let judgment = LivenessJudgment {
            is_live: best == SPOOFNET_REAL_CLASS,
            score: probs[SPOOFNET_REAL_CLASS],
        };

        tracing::debug!(
            is_live = judgment.is_live,
            score = judgment.score,
            "liveness judgment"
        );

        Ok(judgment)
    }

    /// Resize the crop to the model input; MiniFASNet consumes raw 0-255
    /// values scaled to [0, 1] without mean subtraction.
    fn preprocess(region: &RgbImage) -> Array4<f32> {
        let size = SPOOFNET_INPUT_SIZE as u32;
        let resized = imageops::resize(region, size, size, FilterType::Triangle);

        let mut tensor =
            Array4::<f32>::zeros((1, 3, SPOOFNET_INPUT_SIZE, SPOOFNET_INPUT_SIZE));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
            }
        }

        tensor
    }
}

/// Crop a square region of `scale` times the longer box side, centered on
/// the box and clamped to the image bounds.
fn scaled_crop(image: &RgbImage, bbox: &BoundingBox, scale: f32) -> RgbImage {
    let (img_w, img_h) = image.dimensions();

    let cx = bbox.x + bbox.width / 2.0;
    let cy = bbox.y + bbox.height / 2.0;
    let side = (bbox.width.max(bbox.height) * scale).max(1.0);

    let x0 = (cx - side / 2.0).max(0.0) as u32;
    let y0 = (cy - side / 2.0).max(0.0) as u32;
    let x0 = x0.min(img_w.saturating_sub(1));
    let y0 = y0.min(img_h.saturating_sub(1));
    let w = (side as u32).min(img_w - x0).max(1);
    let h = (side as u32).min(img_h - y0).max(1);

    imageops::crop_imm(image, x0, y0, w, h).to_image()
}

/// Numerically stable softmax.
fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|&x| x / sum).collect()
}

/// Detector adapter that fills in the liveness judgment when asked.
///
/// Only the leading candidate is judged — the gate admits at most that one,
/// and each judgment is a full model inference.
pub struct SpoofGuardedDetector<D: FaceDetect> {
    inner: D,
    spoof: SpoofNet,
}

impl<D: FaceDetect> SpoofGuardedDetector<D> {
    pub fn new(inner: D, spoof: SpoofNet) -> Self {
        Self { inner, spoof }
    }
}

impl<D: FaceDetect> FaceDetect for SpoofGuardedDetector<D> {
    fn detect(
        &mut self,
        image: &RgbImage,
        with_liveness: bool,
    ) -> Result<Vec<DetectedFace>, DetectError> {
        let mut faces = self.inner.detect(image, false)?;

        if with_liveness {
            if let Some(first) = faces.first_mut() {
                let judgment = self.spoof.classify(image, &first.bbox)?;
                first.live = Some(judgment.is_live);
            }
        }

        Ok(faces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn test_softmax_uniform_logits() {
        let probs = softmax(&[0.5, 0.5, 0.5]);
        for p in probs {
            assert!((p - 1.0 / 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_softmax_large_logits_stable() {
        let probs = softmax(&[1000.0, 1001.0, 1002.0]);
        assert!(probs.iter().all(|p| p.is_finite()));
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_scaled_crop_centered() {
        let image = RgbImage::from_pixel(400, 400, image::Rgb([50, 50, 50]));
        let bbox = BoundingBox { x: 180.0, y: 180.0, width: 40.0, height: 40.0 };
        let crop = scaled_crop(&image, &bbox, 2.0);
        // 40 × 2.0 = 80 per side, fully inside the image.
        assert_eq!(crop.dimensions(), (80, 80));
    }

    #[test]
    fn test_scaled_crop_clamped_at_border() {
        let image = RgbImage::from_pixel(100, 100, image::Rgb([50, 50, 50]));
        let bbox = BoundingBox { x: 0.0, y: 0.0, width: 40.0, height: 40.0 };
        let crop = scaled_crop(&image, &bbox, 2.7);
        let (w, h) = crop.dimensions();
        assert!(w <= 100 && h <= 100);
        assert!(w >= 1 && h >= 1);
    }

    #[test]
    fn test_scaled_crop_uses_longer_side() {
        let image = RgbImage::from_pixel(500, 500, image::Rgb([50, 50, 50]));
        let bbox = BoundingBox { x: 200.0, y: 200.0, width: 20.0, height: 60.0 };
        let crop = scaled_crop(&image, &bbox, 2.0);
        // Square region sized from the 60-px side.
        assert_eq!(crop.dimensions(), (120, 120));
    }

    #[test]
    fn test_preprocess_scales_to_unit_range() {
        let region = RgbImage::from_pixel(90, 90, image::Rgb([255, 0, 128]));
        let tensor = SpoofNet::preprocess(&region);
        assert_eq!(tensor.shape(), &[1, 3, SPOOFNET_INPUT_SIZE, SPOOFNET_INPUT_SIZE]);
        assert!((tensor[[0, 0, 40, 40]] - 1.0).abs() < 1e-6);
        assert!(tensor[[0, 1, 40, 40]].abs() < 1e-6);
        assert!((tensor[[0, 2, 40, 40]] - 128.0 / 255.0).abs() < 1e-2);
    }
}
