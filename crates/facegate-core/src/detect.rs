//! SCRFD face detector via ONNX Runtime.
//!
//! The detector deliberately applies only a low internal candidate threshold
//! plus NMS; the acceptance policy lives in [`crate::gate`] so registration
//! and verification share one boundary.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

use crate::types::{BoundingBox, DetectedFace};

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
/// Internal candidate floor. Intentionally far below the gate's 0.95 so the
/// gate sees low-confidence candidates instead of an empty list.
const SCRFD_CANDIDATE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("model file not found: {0} — download det_10g.onnx from insightface")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("liveness classifier failed: {0}")]
    Liveness(#[from] crate::liveness::LivenessError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Capability contract for face detection.
///
/// Returns zero or more scored candidates ordered by confidence descending.
/// Implementations must not enforce an acceptance threshold of their own.
/// When `with_liveness` is set, each judged candidate carries `live`;
/// implementations without an anti-spoof stage leave it `None`.
pub trait FaceDetect {
    fn detect(
        &mut self,
        image: &RgbImage,
        with_liveness: bool,
    ) -> Result<Vec<DetectedFace>, DetectError>;
}

/// Scale and padding used to map detections back to source coordinates.
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// SCRFD-based face detector over RGB images.
pub struct ScrfdDetector {
    session: Session,
    /// Per-stride (score, bbox) output indices for strides [8, 16, 32].
    stride_indices: [(usize, usize); 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectError> {
        if !Path::new(model_path).exists() {
            return Err(DetectError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = model_path,
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 6 {
            return Err(DetectError::InferenceFailed(format!(
                "SCRFD model needs score and bbox outputs for 3 strides, got {} outputs",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self { session, stride_indices })
    }

    /// Preprocess an RGB image into a letterboxed NCHW tensor.
    fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
        let (width, height) = image.dimensions();
        let input = SCRFD_INPUT_SIZE as f32;

        let scale = (input / width as f32).min(input / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).max(1);
        let new_h = ((height as f32 * scale).round() as u32).max(1);
        let pad_x = (input - new_w as f32) / 2.0;
        let pad_y = (input - new_h as f32) / 2.0;

        let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

        // Zero-initialized tensor doubles as padding: a pad pixel of
        // SCRFD_MEAN normalizes to 0.0.
        let mut tensor =
            Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
        let x_off = pad_x.floor() as usize;
        let y_off = pad_y.floor() as usize;

        for (x, y, pixel) in resized.enumerate_pixels() {
            let ty = y as usize + y_off;
            let tx = x as usize + x_off;
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }

        (tensor, Letterbox { scale, pad_x, pad_y })
    }
}

impl FaceDetect for ScrfdDetector {
    /// Detect faces, returning candidates sorted by confidence descending.
    /// `with_liveness` is ignored: SCRFD has no anti-spoof stage, so `live`
    /// stays `None` (see [`crate::liveness::SpoofGuardedDetector`]).
    fn detect(
        &mut self,
        image: &RgbImage,
        _with_liveness: bool,
    ) -> Result<Vec<DetectedFace>, DetectError> {
        let (input, letterbox) = Self::preprocess(image);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();

        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| {
                    DetectError::InferenceFailed(format!("scores stride {stride}: {e}"))
                })?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| {
                    DetectError::InferenceFailed(format!("bboxes stride {stride}: {e}"))
                })?;

            candidates.extend(decode_stride(
                scores,
                bboxes,
                stride,
                &letterbox,
                SCRFD_CANDIDATE_THRESHOLD,
            ));
        }

        let mut result = nms(candidates, SCRFD_NMS_THRESHOLD);
        result.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        tracing::debug!(candidates = result.len(), "SCRFD detection complete");
        Ok(result)
    }
}

/// Discover output tensor ordering by name.
///
/// SCRFD exports name tensors either per stride ("score_8", "bbox_16", ...)
/// or generically; unrecognized names fall back to the standard positional
/// layout ([0-2] = scores, [3-5] = bboxes for strides 8/16/32).
fn discover_output_indices(names: &[String]) -> [(usize, usize); 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named = SCRFD_STRIDES
        .iter()
        .all(|&stride| find("score", stride).is_some() && find("bbox", stride).is_some());

    if named {
        std::array::from_fn(|i| {
            let stride = SCRFD_STRIDES[i];
            (find("score", stride).unwrap(), find("bbox", stride).unwrap())
        })
    } else {
        tracing::debug!(?names, "SCRFD output names not recognized, using positional mapping");
        [(0, 3), (1, 4), (2, 5)]
    }
}

/// Decode anchor-free detections for one stride level back into source
/// image coordinates.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<DetectedFace> {
    let grid = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (cell % grid) as f32 * stride as f32;
        let anchor_cy = (cell / grid) as f32 * stride as f32;

        let off = idx * 4;
        if off + 3 >= bboxes.len() {
            continue;
        }

        // Offsets are distances from the anchor center, in stride units.
        let x1 = anchor_cx - bboxes[off] * stride as f32;
        let y1 = anchor_cy - bboxes[off + 1] * stride as f32;
        let x2 = anchor_cx + bboxes[off + 2] * stride as f32;
        let y2 = anchor_cy + bboxes[off + 3] * stride as f32;

        let orig_x1 = (x1 - letterbox.pad_x) / letterbox.scale;
        let orig_y1 = (y1 - letterbox.pad_y) / letterbox.scale;
        let orig_x2 = (x2 - letterbox.pad_x) / letterbox.scale;
        let orig_y2 = (y2 - letterbox.pad_y) / letterbox.scale;

        detections.push(DetectedFace {
            bbox: BoundingBox {
                x: orig_x1,
                y: orig_y1,
                width: orig_x2 - orig_x1,
                height: orig_y2 - orig_y1,
            },
            confidence: score,
            live: None,
        });
    }

    detections
}

/// Non-Maximum Suppression over candidate faces.
fn nms(mut detections: Vec<DetectedFace>, iou_threshold: f32) -> Vec<DetectedFace> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<DetectedFace> = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());

        for j in (i + 1)..detections.len() {
            if !suppressed[j] && iou(&detections[i].bbox, &detections[j].bbox) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Intersection-over-Union of two boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;

    if union > 0.0 { inter / union } else { 0.0 }
}
