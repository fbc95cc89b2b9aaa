//! Gallery storage: one sub-directory per registered identity.
//!
//! Layout: `gallery_root/<identity>/<image files>`. Identities are created
//! by registration and only ever removed by external filesystem action, so
//! readers must tolerate directories disappearing between calls.

use image::RgbImage;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

/// Image extensions the staleness scan and cache rebuild consider.
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Deterministic filename for the single enrollment image of an identity.
pub const FACE_IMAGE_NAME: &str = "face.jpg";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("gallery storage unavailable: {0}")]
    Unavailable(#[source] std::io::Error),
    #[error("identity already exists: {0}")]
    AlreadyExists(String),
    #[error("image encode failed: {0}")]
    Encode(#[from] image::ImageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability contract over the gallery directory tree.
///
/// Exists as a trait so workflows and the representation cache can be
/// exercised against in-memory or fault-injecting stand-ins.
pub trait Gallery: Send + Sync {
    fn root(&self) -> &Path;

    /// Registered identity names (immediate sub-directories), sorted.
    fn list_identities(&self) -> Result<Vec<String>, StoreError>;

    fn identity_exists(&self, name: &str) -> bool;

    /// Reference image paths owned by `identity`, sorted by file name.
    fn image_files(&self, identity: &str) -> Result<Vec<PathBuf>, StoreError>;

    /// Most recent modification time across every gallery image, or `None`
    /// when no identity owns any image.
    fn newest_image_mtime(&self) -> Result<Option<SystemTime>, StoreError>;

    /// Persist `image` as the enrollment photo of a new identity and return
    /// its path. Fails with [`StoreError::AlreadyExists`] when the identity
    /// directory is already present.
    fn persist_face(&self, identity: &str, image: &RgbImage) -> Result<PathBuf, StoreError>;

    /// Remove an identity directory and everything beneath it. Used for
    /// rollback of half-finished registrations; absent directories are fine.
    fn remove_identity(&self, identity: &str) -> Result<(), StoreError>;
}

/// Filesystem-backed gallery.
pub struct DirGallery {
    root: PathBuf,
}

impl DirGallery {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    /// Create the gallery root if it does not exist yet.
    pub fn bootstrap(&self) -> Result<(), StoreError> {
        if !self.root.is_dir() {
            tracing::info!(root = %self.root.display(), "creating gallery root");
            fs::create_dir_all(&self.root)?;
        }
        Ok(())
    }

    fn identity_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}

impl Gallery for DirGallery {
    fn root(&self) -> &Path {
        &self.root
    }

    fn list_identities(&self) -> Result<Vec<String>, StoreError> {
        let entries = fs::read_dir(&self.root).map_err(StoreError::Unavailable)?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(StoreError::Unavailable)?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }

        names.sort();
        Ok(names)
    }

    fn identity_exists(&self, name: &str) -> bool {
        self.identity_dir(name).exists()
    }

    fn image_files(&self, identity: &str) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.identity_dir(identity);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            // Tolerate identities deleted between listing and scanning.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Unavailable(e)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(StoreError::Unavailable)?;
            let path = entry.path();
            if path.is_file() && has_image_extension(&path) {
                files.push(path);
            }
        }

        files.sort();
        Ok(files)
    }

    fn newest_image_mtime(&self) -> Result<Option<SystemTime>, StoreError> {
        let mut newest: Option<SystemTime> = None;

        for identity in self.list_identities()? {
            for path in self.image_files(&identity)? {
                let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
                    Ok(t) => t,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(StoreError::Io(e)),
                };
                if newest.map(|n| modified > n).unwrap_or(true) {
                    newest = Some(modified);
                }
            }
        }

        Ok(newest)
    }

    fn persist_face(&self, identity: &str, image: &RgbImage) -> Result<PathBuf, StoreError> {
        let dir = self.identity_dir(identity);
        if dir.exists() {
            return Err(StoreError::AlreadyExists(identity.to_string()));
        }

        fs::create_dir_all(&dir)?;

        // Encode fully in memory, write to a temp name, then rename: the
        // staleness scan must never observe a half-written image.
        let mut encoded = Vec::new();
        image.write_to(&mut Cursor::new(&mut encoded), image::ImageFormat::Jpeg)?;

        let final_path = dir.join(FACE_IMAGE_NAME);
        let tmp_path = dir.join(format!(".{FACE_IMAGE_NAME}.tmp"));
        fs::write(&tmp_path, &encoded)?;
        fs::rename(&tmp_path, &final_path)?;

        tracing::info!(
            identity,
            path = %final_path.display(),
            bytes = encoded.len(),
            "enrollment image persisted"
        );

        Ok(final_path)
    }

    fn remove_identity(&self, identity: &str) -> Result<(), StoreError> {
        let dir = self.identity_dir(identity);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}
