//! Inference engine: owns the models and runs the registration and
//! verification workflows on a dedicated OS thread.
//!
//! Model sessions need `&mut` access and dominate per-request cost, so
//! requests are serialized through an mpsc channel with oneshot replies —
//! HTTP handlers hold a clone-safe [`EngineHandle`] and await their turn.

use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use facegate_core::gate::{self, GateOutcome};
use facegate_core::matcher::{self, MatchDecision};
use facegate_core::preprocess;
use facegate_core::{DetectError, EmbedError, FaceDetect, FaceEmbed};
use facegate_gallery::{CacheError, Gallery, RepresentationCache, StoreError};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectError),
    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedError),
    #[error("gallery error: {0}")]
    Storage(#[from] StoreError),
    #[error("representation cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Why a registration was turned away. These are caller mistakes or soft
/// pipeline outcomes, never system faults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterRejection {
    /// Name empty or outside `[A-Za-z0-9_-]+`.
    InvalidName,
    /// An identity directory with this name already exists.
    AlreadyExists,
    /// No face passed the detection gate in the submitted image.
    NoClearFace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered { name: String },
    Rejected(RegisterRejection),
}

/// Terminal state of the verification pipeline. Every variant except
/// `Verified` is a soft outcome, distinguishable by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyOutcome {
    Verified {
        identity: String,
        similarity_percent: f64,
    },
    /// A nearest reference exists but scored below the threshold.
    Unverified { similarity_percent: f64 },
    /// Identities exist but none own a usable reference image.
    UnknownFace,
    SpoofDetected,
    NoFace,
    EmptyGallery,
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Register {
        name: String,
        image: RgbImage,
        reply: oneshot::Sender<Result<RegisterOutcome, EngineError>>,
    },
    Verify {
        image: RgbImage,
        reply: oneshot::Sender<Result<VerifyOutcome, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Run the registration workflow for `name` with the submitted image.
    pub async fn register(
        &self,
        name: String,
        image: RgbImage,
    ) -> Result<RegisterOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Register { name, image, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Run the verification workflow for the submitted image.
    pub async fn verify(&self, image: RgbImage) -> Result<VerifyOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Verify { image, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread and return its handle.
///
/// Models are loaded by the caller beforehand (fail-fast at startup); the
/// thread only services requests.
pub fn spawn_engine(
    mut detector: Box<dyn FaceDetect + Send>,
    mut embedder: Box<dyn FaceEmbed + Send>,
    gallery: Arc<dyn Gallery>,
    cache: Arc<RepresentationCache>,
    max_image_dim: u32,
) -> EngineHandle {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facegate-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Register { name, image, reply } => {
                        let result = run_register(
                            &name,
                            image,
                            detector.as_mut(),
                            gallery.as_ref(),
                            cache.as_ref(),
                            max_image_dim,
                        );
                        let _ = reply.send(result);
                    }
                    EngineRequest::Verify { image, reply } => {
                        let result = run_verify(
                            image,
                            detector.as_mut(),
                            embedder.as_mut(),
                            gallery.as_ref(),
                            cache.as_ref(),
                            max_image_dim,
                        );
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle { tx }
}

/// Identity names are directory names: alphanumeric, underscore, hyphen.
fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Registration workflow: validate, detect, persist, invalidate the cache.
///
/// Create-only: there is no merge or update path for an existing identity.
fn run_register(
    name: &str,
    image: RgbImage,
    detector: &mut dyn FaceDetect,
    gallery: &dyn Gallery,
    cache: &RepresentationCache,
    max_image_dim: u32,
) -> Result<RegisterOutcome, EngineError> {
    if !valid_name(name) {
        return Ok(RegisterOutcome::Rejected(RegisterRejection::InvalidName));
    }

    if gallery.identity_exists(name) {
        return Ok(RegisterOutcome::Rejected(RegisterRejection::AlreadyExists));
    }

    let image = preprocess::bound_max_dimension(image, max_image_dim);

    // Enrollment photos are deliberate: no liveness requirement here.
    let candidates = detector.detect(&image, false)?;
    let face = match gate::admit(&candidates, false) {
        GateOutcome::Admitted(face) => face,
        GateOutcome::NoFace | GateOutcome::Spoof => {
            tracing::debug!(identity = name, "registration image failed the detection gate");
            return Ok(RegisterOutcome::Rejected(RegisterRejection::NoClearFace));
        }
    };

    let crop = preprocess::crop_box(&image, &face.bbox);

    match gallery.persist_face(name, &crop) {
        Ok(_) => {}
        // Raced with a concurrent registration of the same name.
        Err(StoreError::AlreadyExists(_)) => {
            return Ok(RegisterOutcome::Rejected(RegisterRejection::AlreadyExists));
        }
        Err(e) => {
            // The identity directory may already exist; remove it so the
            // name is not silently burned for future attempts.
            if let Err(cleanup) = gallery.remove_identity(name) {
                tracing::warn!(
                    identity = name,
                    error = %cleanup,
                    "rollback of partial registration failed"
                );
            }
            return Err(e.into());
        }
    }

    cache.invalidate();

    tracing::info!(
        identity = name,
        confidence = face.confidence,
        "identity registered"
    );

    Ok(RegisterOutcome::Registered { name: name.to_string() })
}

/// Verification workflow: preprocess, gate with liveness, crop, match.
fn run_verify(
    image: RgbImage,
    detector: &mut dyn FaceDetect,
    embedder: &mut dyn FaceEmbed,
    gallery: &dyn Gallery,
    cache: &RepresentationCache,
    max_image_dim: u32,
) -> Result<VerifyOutcome, EngineError> {
    // An empty gallery cannot verify anyone; skip the expensive models
    // entirely.
    if gallery.list_identities()?.is_empty() {
        return Ok(VerifyOutcome::EmptyGallery);
    }

    let image = preprocess::bound_max_dimension(image, max_image_dim);

    let candidates = detector.detect(&image, true)?;
    let face = match gate::admit(&candidates, true) {
        GateOutcome::Admitted(face) => face,
        GateOutcome::NoFace => return Ok(VerifyOutcome::NoFace),
        GateOutcome::Spoof => {
            tracing::info!("spoof attempt rejected");
            return Ok(VerifyOutcome::SpoofDetected);
        }
    };

    let crop = preprocess::crop_box(&image, &face.bbox);

    let snapshot = cache.ensure_fresh(gallery, embedder)?;
    let query = embedder.embed(&crop)?;

    match matcher::find_match(&query, &snapshot.entries) {
        None => Ok(VerifyOutcome::UnknownFace),
        Some(MatchDecision::Verified { identity, similarity_percent }) => {
            tracing::info!(identity = %identity, similarity = similarity_percent, "face verified");
            Ok(VerifyOutcome::Verified { identity, similarity_percent })
        }
        Some(MatchDecision::Unverified { similarity_percent }) => {
            Ok(VerifyOutcome::Unverified { similarity_percent })
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use facegate_core::types::{BoundingBox, DetectedFace, Embedding};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Detector stand-in returning a fixed candidate list and counting calls.
    pub struct MockDetector {
        pub faces: Vec<DetectedFace>,
        pub calls: Arc<AtomicUsize>,
    }

    impl MockDetector {
        pub fn with_face(confidence: f32, live: Option<bool>) -> Self {
            Self {
                faces: vec![DetectedFace {
                    bbox: BoundingBox { x: 4.0, y: 4.0, width: 24.0, height: 24.0 },
                    confidence,
                    live,
                }],
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn empty() -> Self {
            Self { faces: Vec::new(), calls: Arc::new(AtomicUsize::new(0)) }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl FaceDetect for MockDetector {
        fn detect(
            &mut self,
            _image: &RgbImage,
            with_liveness: bool,
        ) -> Result<Vec<DetectedFace>, DetectError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut faces = self.faces.clone();
            if !with_liveness {
                for face in &mut faces {
                    face.live = None;
                }
            }
            Ok(faces)
        }
    }

    /// Embedder stand-in: one-hot on whether the crop is predominantly red.
    pub struct MockEmbedder {
        pub calls: Arc<AtomicUsize>,
    }

    impl MockEmbedder {
        pub fn new() -> Self {
            Self { calls: Arc::new(AtomicUsize::new(0)) }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl FaceEmbed for MockEmbedder {
        fn embed(&mut self, face: &RgbImage) -> Result<Embedding, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mean_red = face.pixels().map(|p| p[0] as u32).sum::<u32>()
                / (face.width() * face.height());
            let values = if mean_red > 128 { vec![1.0, 0.0] } else { vec![0.0, 1.0] };
            Ok(Embedding { values })
        }

        fn model_id(&self) -> &str {
            "mock_embedder"
        }
    }

    pub fn red_image() -> RgbImage {
        RgbImage::from_pixel(32, 32, image::Rgb([220, 10, 10]))
    }

    pub fn blue_image() -> RgbImage {
        RgbImage::from_pixel(32, 32, image::Rgb([10, 10, 220]))
    }
}
