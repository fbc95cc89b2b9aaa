//! Image preprocessing: dimension bounding and face cropping.
//!
//! Every image entering the pipeline passes through [`bound_max_dimension`]
//! first so that detector and embedding latency stays bounded regardless of
//! what the client uploads.

use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::types::BoundingBox;

/// Default cap on the longer image side, in pixels.
pub const DEFAULT_MAX_DIMENSION: u32 = 1024;

/// Downscale `image` so its longer side equals `max_dim`, preserving aspect
/// ratio. Images already within the bound are returned unchanged; this never
/// upscales, so applying it twice with the same bound is a no-op.
///
/// Uses a triangle (area-weighted) filter, which averages the source pixels
/// covered by each output pixel when shrinking.
pub fn bound_max_dimension(image: RgbImage, max_dim: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let longer = width.max(height);
    if longer <= max_dim || max_dim == 0 {
        return image;
    }

    let (new_w, new_h) = if width >= height {
        (max_dim, scale_side(height, max_dim, width))
    } else {
        (scale_side(width, max_dim, height), max_dim)
    };

    imageops::resize(&image, new_w, new_h, FilterType::Triangle)
}

/// Scale `side` by `max_dim / longer`, rounding to nearest and never
/// collapsing to zero.
fn scale_side(side: u32, max_dim: u32, longer: u32) -> u32 {
    let scaled = (side as u64 * max_dim as u64 + longer as u64 / 2) / longer as u64;
    (scaled as u32).max(1)
}

/// Crop the region described by `bbox` out of `image`, clamping the box to
/// the image bounds. Degenerate boxes yield a 1×1 crop rather than panicking.
pub fn crop_box(image: &RgbImage, bbox: &BoundingBox) -> RgbImage {
    let (img_w, img_h) = image.dimensions();

    let x = bbox.x.max(0.0) as u32;
    let y = bbox.y.max(0.0) as u32;
    let x = x.min(img_w.saturating_sub(1));
    let y = y.min(img_h.saturating_sub(1));

    let w = (bbox.width.max(1.0) as u32).min(img_w - x).max(1);
    let h = (bbox.height.max(1.0) as u32).min(img_h - y).max(1);

    imageops::crop_imm(image, x, y, w, h).to_image()
}
