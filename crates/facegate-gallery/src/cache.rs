//! Representation cache: precomputed embeddings for every gallery image.
//!
//! The cache is a pure performance artifact — deleting it is always safe and
//! only costs a lazy whole-gallery rebuild on the next match. Validity
//! invariant: every gallery image's modification time is ≤ the cache's
//! built-at time, and the cache was produced by the configured embedding
//! model and metric.
//!
//! Readers take a cheap snapshot pointer; rebuilds run under their own lock
//! and swap the pointer only once the new set is complete, so a concurrent
//! reader always sees either the previous valid cache or the fully rebuilt
//! one, never a half-written state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::SystemTime;
use thiserror::Error;

use facegate_core::{Embedding, FaceEmbed, Metric, ReferenceEmbedding};

use crate::store::{Gallery, StoreError};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("gallery storage unavailable: {0}")]
    Storage(#[from] StoreError),
    #[error("failed to read gallery image {path}: {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("failed to embed gallery image {path}: {source}")]
    Embed {
        path: PathBuf,
        source: facegate_core::EmbedError,
    },
    #[error("cache artifact I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// An immutable, fully built set of reference embeddings.
#[derive(Debug)]
pub struct CacheSnapshot {
    pub model_id: String,
    pub metric: Metric,
    pub built_at: SystemTime,
    /// Ordered by identity name, then image file name. The matcher's
    /// tie-break follows this order.
    pub entries: Vec<ReferenceEmbedding>,
}

impl CacheSnapshot {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// On-disk form of the cache, one JSON file per gallery root.
///
/// `built_at` inside the file is informational; staleness comparisons use
/// the file's own modification time so they stay consistent with the image
/// mtimes they are compared against.
#[derive(Serialize, Deserialize)]
struct CacheArtifact {
    model_id: String,
    metric: Metric,
    built_at: DateTime<Utc>,
    entries: Vec<StoredReference>,
}

#[derive(Serialize, Deserialize)]
struct StoredReference {
    identity: String,
    source: PathBuf,
    embedding: Vec<f32>,
}

/// Derived cache over a gallery root, tagged by embedding model and metric.
pub struct RepresentationCache {
    artifact_path: PathBuf,
    model_id: String,
    metric: Metric,
    current: RwLock<Option<Arc<CacheSnapshot>>>,
    /// Serializes rebuilds; never held while readers consult `current`.
    rebuild: Mutex<()>,
}

impl RepresentationCache {
    pub fn new(gallery_root: &Path, model_id: &str, metric: Metric) -> Self {
        Self {
            artifact_path: gallery_root.join(format!("representations_{model_id}.json")),
            model_id: model_id.to_string(),
            metric,
            current: RwLock::new(None),
            rebuild: Mutex::new(()),
        }
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    /// Current snapshot without any freshness enforcement.
    pub fn snapshot(&self) -> Option<Arc<CacheSnapshot>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Return a snapshot that satisfies the validity invariant, rebuilding
    /// the whole gallery if necessary. An empty gallery yields an empty
    /// snapshot without a rebuild or an artifact write.
    pub fn ensure_fresh(
        &self,
        gallery: &dyn Gallery,
        embedder: &mut dyn FaceEmbed,
    ) -> Result<Arc<CacheSnapshot>, CacheError> {
        let identities = gallery.list_identities()?;
        if identities.is_empty() {
            let empty = Arc::new(self.empty_snapshot());
            self.swap(Some(empty.clone()));
            return Ok(empty);
        }

        let newest = gallery.newest_image_mtime()?;

        if let Some(snapshot) = self.snapshot() {
            if self.is_valid(&snapshot, newest) {
                return Ok(snapshot);
            }
        }

        let _guard = self
            .rebuild
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // Another rebuild may have finished while this one waited.
        if let Some(snapshot) = self.snapshot() {
            if self.is_valid(&snapshot, newest) {
                return Ok(snapshot);
            }
        }

        // A valid artifact on disk (from a previous process run) beats a
        // rebuild.
        if let Some(snapshot) = self.load_artifact(newest) {
            let snapshot = Arc::new(snapshot);
            self.swap(Some(snapshot.clone()));
            return Ok(snapshot);
        }

        let snapshot = Arc::new(self.rebuild_all(gallery, &identities, embedder)?);
        self.swap(Some(snapshot.clone()));
        Ok(snapshot)
    }

    /// Conceptually delete the cache: remove the artifact and drop the
    /// snapshot. The next `ensure_fresh` rebuilds lazily.
    pub fn invalidate(&self) {
        match fs::remove_file(&self.artifact_path) {
            Ok(()) => {
                tracing::debug!(path = %self.artifact_path.display(), "cache artifact removed")
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                // Leaving a stale artifact behind is safe: the mtime check
                // rejects it on the next ensure_fresh.
                tracing::warn!(
                    path = %self.artifact_path.display(),
                    error = %e,
                    "failed to remove cache artifact"
                );
            }
        }
        self.swap(None);
    }

    /// Startup check: delete an artifact that is older than any gallery
    /// image, forcing a rebuild on first use. Returns whether a stale
    /// artifact was removed.
    pub fn sweep_stale(&self, gallery: &dyn Gallery) -> Result<bool, CacheError> {
        if gallery.list_identities()?.is_empty() {
            return Ok(false);
        }
        let Some(newest) = gallery.newest_image_mtime()? else {
            return Ok(false);
        };
        let Ok(meta) = fs::metadata(&self.artifact_path) else {
            return Ok(false); // no artifact — nothing to sweep
        };

        if meta.modified()? < newest {
            tracing::info!(
                path = %self.artifact_path.display(),
                "gallery changed since cache was built, removing stale artifact"
            );
            fs::remove_file(&self.artifact_path)?;
            return Ok(true);
        }

        Ok(false)
    }

    fn empty_snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            model_id: self.model_id.clone(),
            metric: self.metric,
            built_at: SystemTime::now(),
            entries: Vec::new(),
        }
    }

    fn is_valid(&self, snapshot: &CacheSnapshot, newest: Option<SystemTime>) -> bool {
        snapshot.model_id == self.model_id
            && snapshot.metric == self.metric
            && newest.map(|m| snapshot.built_at >= m).unwrap_or(true)
    }

    fn swap(&self, snapshot: Option<Arc<CacheSnapshot>>) {
        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    /// Try to load a valid artifact from disk. Any failure (missing file,
    /// parse error, tag mismatch, staleness) is `None`: absence of a cache
    /// is never an error.
    fn load_artifact(&self, newest: Option<SystemTime>) -> Option<CacheSnapshot> {
        let bytes = fs::read(&self.artifact_path).ok()?;
        let built_at = fs::metadata(&self.artifact_path)
            .and_then(|m| m.modified())
            .ok()?;

        let artifact: CacheArtifact = match serde_json::from_slice(&bytes) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(
                    path = %self.artifact_path.display(),
                    error = %e,
                    "cache artifact unreadable, will rebuild"
                );
                return None;
            }
        };

        if artifact.model_id != self.model_id || artifact.metric != self.metric {
            tracing::info!(
                artifact_model = %artifact.model_id,
                configured_model = %self.model_id,
                "cache artifact built for a different model or metric, will rebuild"
            );
            return None;
        }

        if let Some(newest) = newest {
            if built_at < newest {
                return None;
            }
        }

        let entries = artifact
            .entries
            .into_iter()
            .map(|e| ReferenceEmbedding {
                identity: e.identity,
                source: e.source,
                embedding: Embedding { values: e.embedding },
            })
            .collect::<Vec<_>>();

        tracing::info!(
            path = %self.artifact_path.display(),
            references = entries.len(),
            "loaded representation cache from disk"
        );

        Some(CacheSnapshot {
            model_id: self.model_id.clone(),
            metric: self.metric,
            built_at,
            entries,
        })
    }

    /// Embed every image of every identity and atomically replace the
    /// artifact. Whole-gallery by design: correctness over rebuild
    /// efficiency.
    fn rebuild_all(
        &self,
        gallery: &dyn Gallery,
        identities: &[String],
        embedder: &mut dyn FaceEmbed,
    ) -> Result<CacheSnapshot, CacheError> {
        tracing::info!(identities = identities.len(), "rebuilding representation cache");

        let mut entries = Vec::new();
        for identity in identities {
            for path in gallery.image_files(identity)? {
                let face = image::open(&path)
                    .map_err(|source| CacheError::Image { path: path.clone(), source })?
                    .to_rgb8();
                let embedding = embedder
                    .embed(&face)
                    .map_err(|source| CacheError::Embed { path: path.clone(), source })?;
                entries.push(ReferenceEmbedding {
                    identity: identity.clone(),
                    source: path,
                    embedding,
                });
            }
        }

        let built_at = SystemTime::now();
        self.write_artifact(&entries, built_at)?;

        tracing::info!(references = entries.len(), "representation cache rebuilt");

        Ok(CacheSnapshot {
            model_id: self.model_id.clone(),
            metric: self.metric,
            built_at,
            entries,
        })
    }

    fn write_artifact(
        &self,
        entries: &[ReferenceEmbedding],
        built_at: SystemTime,
    ) -> Result<(), CacheError> {
        let artifact = CacheArtifact {
            model_id: self.model_id.clone(),
            metric: self.metric,
            built_at: DateTime::<Utc>::from(built_at),
            entries: entries
                .iter()
                .map(|e| StoredReference {
                    identity: e.identity.clone(),
                    source: e.source.clone(),
                    embedding: e.embedding.values.clone(),
                })
                .collect(),
        };

        // serde_json::to_vec over in-memory data cannot fail here; treat a
        // failure as the I/O error it would effectively be.
        let bytes = serde_json::to_vec(&artifact)
            .map_err(|e| CacheError::Io(std::io::Error::other(e)))?;

        let tmp_path = self.artifact_path.with_extension("json.tmp");
        fs::write(&tmp_path, &bytes)?;
        fs::rename(&tmp_path, &self.artifact_path)?;
        Ok(())
    }
}
