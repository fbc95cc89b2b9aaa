use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use facegate_core::{ArcFaceEmbedder, FaceEmbed, Metric, ScrfdDetector, SpoofGuardedDetector, SpoofNet};
use facegate_gallery::{DirGallery, Gallery, RepresentationCache};

mod config;
mod engine;
mod http;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = config::Config::from_env();

    let dir_gallery = DirGallery::new(&config.gallery_dir);
    dir_gallery
        .bootstrap()
        .with_context(|| format!("cannot create gallery root {}", config.gallery_dir.display()))?;
    let gallery: Arc<dyn Gallery> = Arc::new(dir_gallery);

    // Fail fast: all three models must load before the listener binds.
    let detector = ScrfdDetector::load(&config.scrfd_model_path())
        .context("loading SCRFD detector")?;
    let spoofnet = SpoofNet::load(&config.spoofnet_model_path())
        .context("loading anti-spoof classifier")?;
    let detector = SpoofGuardedDetector::new(detector, spoofnet);
    let embedder = ArcFaceEmbedder::load(&config.arcface_model_path())
        .context("loading ArcFace embedder")?;

    let cache = Arc::new(RepresentationCache::new(
        &config.gallery_dir,
        embedder.model_id(),
        Metric::Cosine,
    ));

    // A stale artifact from a previous run is deleted now and rebuilt
    // lazily on the first verification.
    if let Err(e) = cache.sweep_stale(gallery.as_ref()) {
        tracing::warn!(error = %e, "startup cache staleness check failed");
    }

    let engine = engine::spawn_engine(
        Box::new(detector),
        Box::new(embedder),
        gallery.clone(),
        cache.clone(),
        config.max_image_dim,
    );

    let state = Arc::new(http::AppState { engine, gallery, cache });
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("cannot bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "facegated listening");

    axum::serve(listener, app).await?;

    Ok(())
}
