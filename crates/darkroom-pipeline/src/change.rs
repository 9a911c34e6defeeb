//! Change masks: which pipeline stages an edit invalidates.
//!
//! Every edit to the processing parameters carries a [`ChangeMask`]. Masks
//! from edits issued while the worker is busy are OR-ed together, so a
//! single run always processes the union of everything that changed since
//! the previous run started.
//!
//! Callers either build masks from the named bits and composites below or
//! translate a user action through [`EditEvent::changes`].

use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Set of pipeline stages that must be recomputed.
    ///
    /// The individual bits name stages. The composites name the stage
    /// chains that typical edits touch (everything downstream of the edited
    /// stage is included).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ChangeMask: u32 {
        /// Chroma and color refinement on the Lab image.
        const COLOR = 1 << 0;
        /// Luminance refinement on the Lab image.
        const LUMINANCE = 1 << 1;
        /// Luma curve construction.
        const LUMA_CURVE = 1 << 2;
        /// RGB curves and working-space to Lab conversion.
        const RGB_CURVE = 1 << 3;
        /// Auto exposure and tone curve construction.
        const AUTO_EXP = 1 << 4;
        /// Geometric transform.
        const TRANSFORM = 1 << 6;
        /// HDR tone mapping and dehaze.
        const HDR = 1 << 7;
        /// Linear-space denoise (re-runs the white balance stage).
        const LIN_DENOISE = 1 << 8;
        /// White balance and working-space conversion.
        const INIT = 1 << 9;
        /// Raw decode (demosaic).
        const RAW = 1 << 10;
        /// Raw preprocessing (dark frame, flat field, pixel filters).
        const PREPROC = 1 << 11;
        /// Crop rectangle or crop window geometry.
        const CROP = 1 << 12;
        /// Retinex local-contrast pre-pass.
        const RETINEX = 1 << 13;
        /// Monitor color transform and final conversion.
        const MONITOR = 1 << 14;
        /// Force full-detail raw processing for this run.
        const HIGH_QUAL = 1 << 15;
        /// No-op: accepted and drained without running anything.
        const VOID = 1 << 17;

        /// Luminance and color refinement.
        const REFINE = Self::LUMINANCE.bits() | Self::COLOR.bits();
        /// Lab curves and everything after them.
        const LAB_CURVES = Self::LUMA_CURVE.bits() | Self::REFINE.bits();
        /// RGB curves and everything after them.
        const RGB_CURVES = Self::RGB_CURVE.bits() | Self::LAB_CURVES.bits();
        /// Exposure, tone mapping and everything after them.
        const EXPOSURE = Self::HDR.bits() | Self::AUTO_EXP.bits() | Self::RGB_CURVES.bits();
        /// Geometry and everything after it.
        const GEOMETRY = Self::TRANSFORM.bits() | Self::AUTO_EXP.bits() | Self::RGB_CURVES.bits();
        /// Everything downstream of the raw decode.
        const ALL_NO_RAW = Self::INIT.bits()
            | Self::LIN_DENOISE.bits()
            | Self::HDR.bits()
            | Self::TRANSFORM.bits()
            | Self::AUTO_EXP.bits()
            | Self::RGB_CURVES.bits();
        /// Retinex and everything after it.
        const RETINEX_CHAIN = Self::RETINEX.bits() | Self::ALL_NO_RAW.bits();
        /// Every processing stage, from raw preprocessing on.
        const ALL = Self::PREPROC.bits() | Self::RAW.bits() | Self::ALL_NO_RAW.bits();
        /// The mask of the first run after an image is assigned.
        const FIRST = Self::ALL.bits() | Self::MONITOR.bits();
        /// Smallest mask that still refreshes the displayed image.
        const MIN_UPDATE = Self::MONITOR.bits();
    }
}

impl ChangeMask {
    /// The empty mask.
    pub const NONE: Self = Self::empty();

    /// Whether a run must be executed for this mask.
    ///
    /// Any bit other than [`ChangeMask::VOID`] requires processing.
    #[must_use]
    pub const fn requires_processing(self) -> bool {
        !self.difference(Self::VOID).is_empty()
    }
}

/// A user-level edit, mapped to the stages it invalidates.
///
/// This is the closed vocabulary the UI uses instead of hand-assembling
/// masks for every control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EditEvent {
    /// Dark frame, flat field, hot/dead pixel filters, raw black levels.
    RawPreprocess,
    /// Demosaic method, false color suppression, CA auto-correction.
    Demosaic,
    /// Retinex strength or enablement.
    Retinex,
    /// Highlight reconstruction method or enablement.
    HighlightRecovery,
    /// White balance temperature, tint or method.
    WhiteBalance,
    /// Input or working profile.
    ColorManagement,
    /// Linear-space noise reduction.
    Denoise,
    /// Fattal tone mapping or dehaze.
    ToneMapping,
    /// Exposure compensation, black level, highlight compression.
    Exposure,
    /// Auto exposure clip or enablement.
    AutoExposure,
    /// Fine rotation.
    Rotate,
    /// Lens distortion.
    Distortion,
    /// Perspective correction.
    Perspective,
    /// Lens profile corrections.
    LensProfile,
    /// Lens vignetting correction.
    Vignetting,
    /// Post-crop vignette or graduated filter.
    CreativeVignette,
    /// 90-degree rotation or flips.
    Coarse,
    /// Crop rectangle.
    Crop,
    /// Tone curve shape, saturation, channel mixer, black and white.
    RgbCurves,
    /// Lab luminance, contrast or chromaticity curves.
    LabCurves,
    /// Vibrance.
    Vibrance,
    /// Local contrast, edge-preserving decomposition, detail pyramid.
    LocalContrast,
    /// Sharpening (affects full-detail crop windows only).
    Sharpening,
    /// Output profile, intent or black point compensation.
    OutputProfile,
    /// Monitor profile, soft proofing or gamut check.
    MonitorProfile,
    /// Output resize.
    Resize,
    /// Metadata edits; nothing to recompute.
    Metadata,
}

impl EditEvent {
    /// Every edit event, in pipeline order.
    pub const ALL: [Self; 27] = [
        Self::RawPreprocess,
        Self::Demosaic,
        Self::Retinex,
        Self::HighlightRecovery,
        Self::WhiteBalance,
        Self::ColorManagement,
        Self::Denoise,
        Self::ToneMapping,
        Self::Exposure,
        Self::AutoExposure,
        Self::Rotate,
        Self::Distortion,
        Self::Perspective,
        Self::LensProfile,
        Self::Vignetting,
        Self::CreativeVignette,
        Self::Coarse,
        Self::Crop,
        Self::RgbCurves,
        Self::LabCurves,
        Self::Vibrance,
        Self::LocalContrast,
        Self::Sharpening,
        Self::OutputProfile,
        Self::MonitorProfile,
        Self::Resize,
        Self::Metadata,
    ];

    /// Stages this edit invalidates.
    #[must_use]
    pub const fn changes(self) -> ChangeMask {
        match self {
            Self::RawPreprocess => ChangeMask::ALL,
            Self::Demosaic => ChangeMask::RAW.union(ChangeMask::ALL_NO_RAW),
            Self::Retinex => ChangeMask::RETINEX_CHAIN,
            Self::HighlightRecovery | Self::WhiteBalance | Self::ColorManagement => {
                ChangeMask::ALL_NO_RAW
            }
            Self::Denoise => ChangeMask::LIN_DENOISE.union(ChangeMask::GEOMETRY),
            Self::ToneMapping | Self::Exposure => ChangeMask::EXPOSURE,
            Self::AutoExposure => ChangeMask::AUTO_EXP.union(ChangeMask::RGB_CURVES),
            Self::Rotate
            | Self::Distortion
            | Self::Perspective
            | Self::LensProfile
            | Self::Vignetting
            | Self::CreativeVignette => ChangeMask::GEOMETRY,
            Self::Coarse => ChangeMask::ALL_NO_RAW,
            Self::Crop => ChangeMask::CROP,
            Self::RgbCurves => ChangeMask::RGB_CURVES,
            Self::LabCurves => ChangeMask::LAB_CURVES,
            Self::Vibrance | Self::LocalContrast | Self::Sharpening => ChangeMask::REFINE,
            Self::OutputProfile | Self::MonitorProfile => ChangeMask::MONITOR,
            Self::Resize | Self::Metadata => ChangeMask::VOID,
        }
    }

    /// Human-readable name for logs and diagnostics.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::RawPreprocess => "raw preprocess",
            Self::Demosaic => "demosaic",
            Self::Retinex => "retinex",
            Self::HighlightRecovery => "highlight recovery",
            Self::WhiteBalance => "white balance",
            Self::ColorManagement => "color management",
            Self::Denoise => "denoise",
            Self::ToneMapping => "tone mapping",
            Self::Exposure => "exposure",
            Self::AutoExposure => "auto exposure",
            Self::Rotate => "rotate",
            Self::Distortion => "distortion",
            Self::Perspective => "perspective",
            Self::LensProfile => "lens profile",
            Self::Vignetting => "vignetting",
            Self::CreativeVignette => "creative vignette",
            Self::Coarse => "coarse transform",
            Self::Crop => "crop",
            Self::RgbCurves => "rgb curves",
            Self::LabCurves => "lab curves",
            Self::Vibrance => "vibrance",
            Self::LocalContrast => "local contrast",
            Self::Sharpening => "sharpening",
            Self::OutputProfile => "output profile",
            Self::MonitorProfile => "monitor profile",
            Self::Resize => "resize",
            Self::Metadata => "metadata",
        }
    }
}

impl std::fmt::Display for EditEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn all_excludes_monitor_and_void() {
        assert!(!ChangeMask::ALL.contains(ChangeMask::MONITOR));
        assert!(!ChangeMask::ALL.contains(ChangeMask::VOID));
        assert!(!ChangeMask::ALL.contains(ChangeMask::CROP));
        assert!(ChangeMask::FIRST.contains(ChangeMask::ALL | ChangeMask::MONITOR));
    }

    #[test]
    fn void_only_does_not_require_processing() {
        assert!(!ChangeMask::VOID.requires_processing());
        assert!(!ChangeMask::NONE.requires_processing());
        assert!((ChangeMask::VOID | ChangeMask::COLOR).requires_processing());
        assert!(ChangeMask::HIGH_QUAL.requires_processing());
    }

    #[test]
    fn composites_nest() {
        assert!(ChangeMask::ALL_NO_RAW.contains(ChangeMask::GEOMETRY));
        assert!(ChangeMask::GEOMETRY.contains(ChangeMask::RGB_CURVES));
        assert!(ChangeMask::RGB_CURVES.contains(ChangeMask::LAB_CURVES));
        assert!(ChangeMask::LAB_CURVES.contains(ChangeMask::REFINE));
        assert!(ChangeMask::RETINEX_CHAIN.contains(ChangeMask::ALL_NO_RAW));
    }

    #[test]
    fn every_event_maps_to_a_documented_mask() {
        for event in EditEvent::ALL {
            let mask = event.changes();
            assert!(!mask.is_empty(), "{event} maps to an empty mask");
        }
        assert_eq!(EditEvent::MonitorProfile.changes(), ChangeMask::MIN_UPDATE);
        assert!(!EditEvent::Metadata.changes().requires_processing());
        assert!(EditEvent::Demosaic.changes().contains(ChangeMask::INIT));
    }

    #[test]
    fn mask_serializes_as_flag_names() {
        let mask = ChangeMask::MONITOR | ChangeMask::CROP;
        let json = serde_json::to_string(&mask).unwrap();
        let back: ChangeMask = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mask);
    }
}
