//! Dispatch policy: which stages a run executes.
//!
//! Everything here is a pure function of the change mask, the detail memo
//! and a few flags, so the policy can be tested without images or threads.
//! The engine consults it before and during a run.

use serde::{Deserialize, Serialize};

use crate::change::ChangeMask;
use crate::config::PreviewDemosaic;
use crate::params::{BayerDemosaic, HighlightMethod, RawParams, ToneCurveParams, XTransDemosaic};

/// Whether raw preprocessing and demosaic were last computed at full
/// detail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailMemo {
    pub preprocess_full_detail: bool,
    pub raw_full_detail: bool,
}

impl DetailMemo {
    /// Preprocessing runs when requested, or when full detail is needed
    /// and the last pass was at reduced detail.
    #[must_use]
    pub const fn needs_preprocess(self, changes: ChangeMask, high_detail: bool) -> bool {
        changes.contains(ChangeMask::PREPROC) || (high_detail && !self.preprocess_full_detail)
    }

    /// Demosaic runs when requested, or when full detail is needed and the
    /// last pass was at reduced detail.
    #[must_use]
    pub const fn needs_demosaic(self, changes: ChangeMask, high_detail: bool) -> bool {
        changes.contains(ChangeMask::RAW) || (high_detail && !self.raw_full_detail)
    }

    pub const fn record_preprocess(&mut self, high_detail: bool) {
        self.preprocess_full_detail = high_detail;
    }

    pub const fn record_demosaic(&mut self, high_detail: bool) {
        self.raw_full_detail = high_detail;
    }

    /// Forget everything, e.g. after a new source was assigned.
    pub const fn reset(&mut self) {
        *self = Self {
            preprocess_full_detail: false,
            raw_full_detail: false,
        };
    }
}

/// Whether this run must compute at full detail.
///
/// Full detail is needed in sidecar mode, when the run carries
/// [`ChangeMask::HIGH_QUAL`], or when any crop window shows the image at
/// skip 1.
#[must_use]
pub fn high_detail_needed(
    changes: ChangeMask,
    preview_demosaic: PreviewDemosaic,
    crop_skips: impl IntoIterator<Item = u32>,
) -> bool {
    matches!(preview_demosaic, PreviewDemosaic::Sidecar)
        || changes.contains(ChangeMask::HIGH_QUAL)
        || crop_skips.into_iter().any(|skip| skip == 1)
}

/// Whether the main pipeline block runs at all.
///
/// In sidecar mode full detail is always on, so it does not by itself
/// force the block.
#[must_use]
pub const fn enters_main_block(
    changes: ChangeMask,
    geometry_changed: bool,
    high_detail: bool,
    preview_demosaic: PreviewDemosaic,
) -> bool {
    changes.contains(ChangeMask::ALL)
        || changes.contains(ChangeMask::MONITOR)
        || geometry_changed
        || (high_detail && !matches!(preview_demosaic, PreviewDemosaic::Sidecar))
}

/// A crop-only change also invalidates the transform when the post-crop
/// vignette is rendered, since the vignette follows the crop rectangle.
#[must_use]
pub fn with_crop_cascade(changes: ChangeMask, pc_vignetting: bool) -> ChangeMask {
    if changes == ChangeMask::CROP && pc_vignetting {
        changes | ChangeMask::TRANSFORM
    } else {
        changes
    }
}

/// Raw parameters for this run: below full detail, demosaic uses the fast
/// method and chromatic aberration correction is skipped.
#[must_use]
pub fn fast_path_raw_params(raw: &RawParams, high_detail: bool) -> RawParams {
    let mut raw = raw.clone();
    if !high_detail {
        if raw.bayer.method != BayerDemosaic::None {
            raw.bayer.method = BayerDemosaic::Fast;
        }
        if raw.xtrans.method != XTransDemosaic::None {
            raw.xtrans.method = XTransDemosaic::Fast;
        }
        raw.bayer.cc_steps = 0;
        raw.xtrans.cc_steps = 0;
    }
    raw
}

/// Color-propagation highlight recovery works on the demosaiced data, so
/// switching away from it (or disabling it) needs a fresh demosaic when
/// the source reports modified RGB data.
#[must_use]
pub fn highlight_redemosaic(tone: &ToneCurveParams, rgb_source_modified: bool) -> bool {
    let color = tone.highlight_method == HighlightMethod::Color;
    rgb_source_modified && (tone.highlight_recovery != color)
}

/// Whether a crop window with a listener is refreshed after the main block.
#[must_use]
pub const fn crop_needs_update(
    changes: ChangeMask,
    geometry_changed: bool,
    high_detail: bool,
    preview_demosaic: PreviewDemosaic,
    skip: u32,
) -> bool {
    geometry_changed
        || (high_detail && !matches!(preview_demosaic, PreviewDemosaic::Sidecar))
        || changes.intersects(
            ChangeMask::MONITOR
                .union(ChangeMask::RGB_CURVE)
                .union(ChangeMask::LUMA_CURVE),
        )
        || skip == 1
}

/// Whether the run publishes a new preview image and histograms.
#[must_use]
pub const fn publishes(changes: ChangeMask, geometry_changed: bool) -> bool {
    geometry_changed || changes.contains(ChangeMask::MONITOR)
}

/// Whether publication recomputes the monitor and analysis images.
///
/// A crop-only or minimal update republishes the existing images.
#[must_use]
pub fn converts_to_monitor(changes: ChangeMask) -> bool {
    (changes != ChangeMask::CROP && changes != ChangeMask::MIN_UPDATE)
        || changes.contains(ChangeMask::MONITOR)
}
