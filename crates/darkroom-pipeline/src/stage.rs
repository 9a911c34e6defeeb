//! The stages of a preview run, in execution order.
//!
//! Each stage declares which [`ChangeMask`] bits schedule it and which bits
//! its execution adds to the running mask. The second set is the structural
//! cascade: once a stage rewrites its output, everything that consumes that
//! output is stale even if the caller's mask did not say so.

use serde::{Deserialize, Serialize};

use crate::change::ChangeMask;

/// One step of the preview pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    /// Raw preprocessing: dark frame, flat field, pixel filters.
    Preprocess,
    /// Raw decode / demosaic.
    Demosaic,
    /// Retinex local-contrast pre-pass.
    Retinex,
    /// White balance, preview extraction and working-space conversion.
    WhiteBalance,
    /// HDR tone mapping and dehaze.
    ToneMap,
    /// Geometric transform (or aliasing when no geometry applies).
    Transform,
    /// Auto exposure and tone curve construction.
    ExposureCurve,
    /// RGB curves and conversion to Lab.
    RgbCurves,
    /// Luminance histogram and luma curve construction.
    LumaCurve,
    /// Luminance and color refinement on the Lab image.
    LuminanceColor,
    /// Monitor color transform update.
    MonitorTransform,
    /// Crop window fan-out.
    CropWindows,
    /// Final RGB conversion and histogram accumulation.
    Histogram,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Self; 13] = [
        Self::Preprocess,
        Self::Demosaic,
        Self::Retinex,
        Self::WhiteBalance,
        Self::ToneMap,
        Self::Transform,
        Self::ExposureCurve,
        Self::RgbCurves,
        Self::LumaCurve,
        Self::LuminanceColor,
        Self::MonitorTransform,
        Self::CropWindows,
        Self::Histogram,
    ];

    /// Human-readable label for progress reporting and diagnostics.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Preprocess => "Raw preprocess",
            Self::Demosaic => "Demosaic",
            Self::Retinex => "Retinex",
            Self::WhiteBalance => "White balance",
            Self::ToneMap => "Tone mapping",
            Self::Transform => "Transform",
            Self::ExposureCurve => "Exposure curve",
            Self::RgbCurves => "RGB curves",
            Self::LumaCurve => "Luma curve",
            Self::LuminanceColor => "Luminance & color",
            Self::MonitorTransform => "Monitor transform",
            Self::CropWindows => "Crop windows",
            Self::Histogram => "RGB conversion & histogram",
        }
    }

    /// Zero-based position in [`Stage::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Mask bits that schedule this stage.
    ///
    /// Some stages have additional triggers that depend on run state (detail
    /// promotion, geometry changes); those are decided by the planner.
    #[must_use]
    pub const fn triggers(self) -> ChangeMask {
        match self {
            Self::Preprocess => ChangeMask::PREPROC,
            Self::Demosaic => ChangeMask::RAW,
            Self::Retinex => ChangeMask::RETINEX.union(ChangeMask::INIT),
            Self::WhiteBalance => ChangeMask::INIT
                .union(ChangeMask::LIN_DENOISE)
                .union(ChangeMask::HDR),
            Self::ToneMap => ChangeMask::HDR,
            Self::Transform => ChangeMask::TRANSFORM,
            Self::ExposureCurve => ChangeMask::AUTO_EXP
                .union(ChangeMask::RGB_CURVE)
                .union(ChangeMask::CROP),
            Self::RgbCurves => ChangeMask::RGB_CURVE,
            Self::LumaCurve => ChangeMask::LUMA_CURVE.union(ChangeMask::CROP),
            Self::LuminanceColor => ChangeMask::REFINE,
            Self::MonitorTransform | Self::Histogram => ChangeMask::MONITOR,
            Self::CropWindows => ChangeMask::NONE,
        }
    }

    /// Mask bits made stale by running this stage.
    #[must_use]
    pub const fn invalidates(self) -> ChangeMask {
        match self {
            Self::Preprocess => ChangeMask::RAW.union(ChangeMask::ALL_NO_RAW),
            Self::Demosaic | Self::Retinex => ChangeMask::ALL_NO_RAW,
            Self::WhiteBalance => ChangeMask::EXPOSURE.union(ChangeMask::TRANSFORM),
            Self::ToneMap => ChangeMask::TRANSFORM.union(ChangeMask::RGB_CURVES),
            Self::Transform => ChangeMask::RGB_CURVES,
            Self::RgbCurves => ChangeMask::LAB_CURVES,
            Self::LumaCurve => ChangeMask::REFINE,
            Self::ExposureCurve
            | Self::LuminanceColor
            | Self::MonitorTransform
            | Self::CropWindows
            | Self::Histogram => ChangeMask::NONE,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_matches_position() {
        for (i, stage) in Stage::ALL.iter().enumerate() {
            assert_eq!(stage.index(), i);
        }
    }

    #[test]
    fn cascades_only_point_downstream() {
        for stage in Stage::ALL {
            let stale = stage.invalidates();
            for upstream in Stage::ALL.iter().take(stage.index() + 1) {
                if upstream.triggers().is_empty() {
                    continue;
                }
                // A stage may share a trigger bit with a later stage (INIT
                // schedules both retinex and white balance), so only check
                // bits that exclusively schedule upstream stages.
                let exclusive = Stage::ALL
                    .iter()
                    .skip(stage.index() + 1)
                    .fold(upstream.triggers(), |bits, later| bits.difference(later.triggers()));
                assert!(
                    !stale.intersects(exclusive),
                    "{stage} invalidates upstream stage {upstream}",
                );
            }
        }
    }

    #[test]
    fn demosaic_forces_white_balance() {
        assert!(
            Stage::Demosaic
                .invalidates()
                .intersects(Stage::WhiteBalance.triggers())
        );
    }
}
