//! Shared types for the preview coordinator.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crop::CropHandle;
use crate::params::CropParams;
use crate::source::SourceError;

/// Re-export so downstream crates can read published images without
/// depending on `image` directly.
pub use image::{Rgb32FImage, RgbImage};

/// Lab image: L in `[0, 100]`, a and b roughly in `[-128, 128]`.
///
/// Stored in an RGB float buffer; the channel order is L, a, b.
pub type LabImage = Rgb32FImage;

/// Width and height of an image or buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Create new dimensions.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total number of pixels.
    #[must_use]
    pub const fn pixel_count(self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Dimensions with width and height exchanged.
    #[must_use]
    pub const fn transposed(self) -> Self {
        Self::new(self.height, self.width)
    }
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// The image a run publishes for display.
///
/// Published results are immutable; a new run publishes a new value. The
/// `valid` flag is cleared (on a copy) when the preview buffers are
/// reallocated, until the next successful run publishes again.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Preview image in monitor color space.
    pub image: Arc<RgbImage>,
    /// Whether `image` matches the current preview geometry.
    pub valid: bool,
    /// Preview scale (full size divided by preview size).
    pub scale: u32,
    /// Crop rectangle the image was produced with.
    pub crop: CropParams,
    /// Version of the parameter snapshot this image reflects.
    pub version: u64,
}

/// Errors from coordinator operations and runs.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// No image source has been assigned yet.
    #[error("no image source has been assigned")]
    NoSource,

    /// A collaborator failed.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// The crop handle does not name a registered crop window.
    #[error("unknown crop window {0:?}")]
    UnknownCrop(CropHandle),

    /// Preview buffers are not allocated yet (no run has reached the
    /// white balance stage).
    #[error("preview buffers are not allocated")]
    NotAllocated,

    /// The worker thread could not be started.
    #[error("failed to spawn the preview worker: {0}")]
    Spawn(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimensions_pixel_count_does_not_overflow() {
        let d = Dimensions::new(100_000, 100_000);
        assert_eq!(d.pixel_count(), 10_000_000_000);
    }

    #[test]
    fn dimensions_display() {
        assert_eq!(Dimensions::new(572, 429).to_string(), "572x429");
        assert_eq!(Dimensions::new(3, 2).transposed(), Dimensions::new(2, 3));
    }

    #[test]
    fn error_messages() {
        assert_eq!(
            ProcessError::NoSource.to_string(),
            "no image source has been assigned"
        );
        let err = ProcessError::from(SourceError::ColorConversion("bad matrix".into()));
        assert_eq!(err.to_string(), "color conversion failed: bad matrix");
    }
}
