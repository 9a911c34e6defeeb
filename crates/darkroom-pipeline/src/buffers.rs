//! Preview buffers and the preview scale.
//!
//! All stage buffers share one size and are reallocated together, only
//! when a scale change actually changes the preview dimensions. Between
//! reallocations no stage writes outside them.

use std::sync::Arc;

use tracing::info;

use crate::config::ScaleLimits;
use crate::listener::SizeListener;
use crate::types::{Dimensions, LabImage, Rgb32FImage, RgbImage};

/// Choose the preview scale.
///
/// Starting from `requested`, the scale is lowered (finer preview) while
/// the preview is shorter than the minimum height, the scale is above 1 and
/// the preview stays below the pixel limit. Returns the scale and the
/// preview dimensions at that scale.
pub fn select_preview_scale(
    requested: u32,
    limits: ScaleLimits,
    size_at: impl Fn(u32) -> Dimensions,
) -> (u32, Dimensions) {
    let mut scale = requested.max(1);
    let mut size = size_at(scale);
    while size.height < limits.min_height && scale > 1 && size.pixel_count() < limits.max_pixels {
        scale -= 1;
        size = size_at(scale);
    }
    (scale, size)
}

/// The chain of preview-resolution images, allocated as one group.
#[derive(Debug)]
pub struct PreviewBuffers {
    /// White-balanced image in the working space.
    pub raw: Rgb32FImage,
    transformed: Rgb32FImage,
    /// Whether the working image is `raw` itself rather than `transformed`.
    aliased: bool,
    /// Lab image after exposure and RGB curves.
    pub lab: LabImage,
    /// Lab image after luminance and color refinement.
    pub refined: LabImage,
    /// Monitor-space image handed to the image listener.
    pub preview: RgbImage,
    /// Output-profile image the histograms are computed from.
    pub analysis: RgbImage,
}

impl PreviewBuffers {
    fn new(size: Dimensions) -> Self {
        let (w, h) = (size.width, size.height);
        Self {
            raw: Rgb32FImage::new(w, h),
            transformed: Rgb32FImage::new(w, h),
            aliased: true,
            lab: LabImage::new(w, h),
            refined: LabImage::new(w, h),
            preview: RgbImage::new(w, h),
            analysis: RgbImage::new(w, h),
        }
    }

    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.raw.width(), self.raw.height())
    }

    /// The image after geometry: `raw` when aliased, else `transformed`.
    #[must_use]
    pub const fn working(&self) -> &Rgb32FImage {
        if self.aliased {
            &self.raw
        } else {
            &self.transformed
        }
    }

    #[must_use]
    pub const fn is_aliased(&self) -> bool {
        self.aliased
    }

    /// Use `raw` as the working image without copying.
    pub const fn alias_working(&mut self) {
        self.aliased = true;
    }

    /// Borrow the geometry stage's input and output; the working image
    /// becomes `transformed`.
    pub const fn transform_pair(&mut self) -> (&Rgb32FImage, &mut Rgb32FImage) {
        self.aliased = false;
        (&self.raw, &mut self.transformed)
    }

    /// Borrow the working image and the Lab output of the RGB stage.
    pub const fn rgb_pair(&mut self) -> (&Rgb32FImage, &mut LabImage) {
        let working = if self.aliased {
            &self.raw
        } else {
            &self.transformed
        };
        (working, &mut self.lab)
    }

    /// Borrow the Lab image and the refined output.
    pub const fn refine_pair(&mut self) -> (&LabImage, &mut LabImage) {
        (&self.lab, &mut self.refined)
    }

    /// Borrow the refined image and both display outputs.
    pub const fn display_outputs(&mut self) -> (&LabImage, &mut RgbImage, &mut RgbImage) {
        (&self.refined, &mut self.preview, &mut self.analysis)
    }
}

/// What [`PreviewState::set_scale`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleOutcome {
    /// Scale actually used.
    pub scale: u32,
    /// Preview dimensions at that scale.
    pub preview: Dimensions,
    /// Whether the buffers were reallocated.
    pub reallocated: bool,
}

/// Preview scale, dimensions and buffers.
#[derive(Debug, Default)]
pub struct PreviewState {
    scale: u32,
    full: Dimensions,
    buffers: Option<PreviewBuffers>,
    generation: u64,
    result_valid: bool,
}

impl PreviewState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a requested scale.
    ///
    /// `size_at` gives the preview dimensions of the source at a scale.
    /// When the chosen dimensions differ from the current buffers, every
    /// buffer is reallocated, the result is marked invalid and each size
    /// listener is notified before this returns.
    pub fn set_scale(
        &mut self,
        requested: u32,
        limits: ScaleLimits,
        full: Dimensions,
        size_at: impl Fn(u32) -> Dimensions,
        size_listeners: &[Arc<dyn SizeListener>],
    ) -> ScaleOutcome {
        let (scale, preview) = select_preview_scale(requested, limits, size_at);
        self.scale = scale;
        self.full = full;

        let reallocated = self.buffers.as_ref().map(PreviewBuffers::dimensions) != Some(preview);
        if reallocated {
            // Drop the old group before allocating the new one.
            self.buffers = None;
            self.buffers = Some(PreviewBuffers::new(preview));
            self.generation += 1;
            self.result_valid = false;
            info!(%full, %preview, scale, generation = self.generation, "preview buffers reallocated");
            for listener in size_listeners {
                listener.size_changed(full, preview, scale);
            }
        }

        ScaleOutcome {
            scale,
            preview,
            reallocated,
        }
    }

    /// Current scale; 0 before the first [`set_scale`](Self::set_scale).
    #[must_use]
    pub const fn scale(&self) -> u32 {
        self.scale
    }

    #[must_use]
    pub const fn full_size(&self) -> Dimensions {
        self.full
    }

    /// Preview dimensions, if allocated.
    #[must_use]
    pub fn preview_size(&self) -> Option<Dimensions> {
        self.buffers.as_ref().map(PreviewBuffers::dimensions)
    }

    /// Incremented on every reallocation.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a result matching the current buffers has been published.
    #[must_use]
    pub const fn result_valid(&self) -> bool {
        self.result_valid
    }

    pub const fn mark_result_valid(&mut self) {
        self.result_valid = true;
    }

    #[must_use]
    pub const fn buffers(&self) -> Option<&PreviewBuffers> {
        self.buffers.as_ref()
    }

    pub const fn buffers_mut(&mut self) -> Option<&mut PreviewBuffers> {
        self.buffers.as_mut()
    }
}
