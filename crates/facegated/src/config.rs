use std::path::PathBuf;

use facegate_core::preprocess::DEFAULT_MAX_DIMENSION;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Address the HTTP listener binds to.
    pub listen_addr: String,
    /// Gallery root: one sub-directory per registered identity.
    pub gallery_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Cap on the longer side of incoming images, in pixels.
    pub max_image_dim: u32,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with
    /// defaults.
    pub fn from_env() -> Self {
        Self {
            listen_addr: std::env::var("FACEGATE_LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:5000".to_string()),
            gallery_dir: std::env::var("FACEGATE_GALLERY_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./gallery")),
            model_dir: std::env::var("FACEGATE_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./models")),
            max_image_dim: env_u32("FACEGATE_MAX_IMAGE_DIM", DEFAULT_MAX_DIMENSION),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace embedding model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the MiniFASNet anti-spoof model.
    pub fn spoofnet_model_path(&self) -> String {
        self.model_dir
            .join("minifasnet_v2.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
