//! facegate-gallery — Identity storage and the derived representation cache.
//!
//! The gallery is a directory tree (`gallery_root/<identity>/<images>`); the
//! cache is a rebuildable JSON artifact of precomputed embeddings kept in
//! sync with it by modification-time comparison.

pub mod cache;
pub mod store;

pub use cache::{CacheError, CacheSnapshot, RepresentationCache};
pub use store::{DirGallery, Gallery, StoreError, FACE_IMAGE_NAME, IMAGE_EXTENSIONS};
