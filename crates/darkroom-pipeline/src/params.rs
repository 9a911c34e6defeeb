//! Processing parameters: the snapshot every run works from.
//!
//! [`ProcParams`] is plain data. The coordinator keeps two copies, the one
//! the UI is editing and the one the last run committed, and moves a clone
//! into every run. Method selections are closed enums so an unknown method
//! is a deserialization error rather than a silent fallback.

use serde::{Deserialize, Serialize};

use crate::source::CoarseTransform;

/// A curve given as control points over `[0, 1] x [0, 1]`.
///
/// Fewer than two points means the identity curve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Curve {
    /// Control points, sorted by input value.
    pub points: Vec<[f64; 2]>,
}

impl Curve {
    /// Build a curve from control points.
    #[must_use]
    pub const fn new(points: Vec<[f64; 2]>) -> Self {
        Self { points }
    }

    /// Whether this curve maps every input to itself.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.points.len() < 2 || self.points.iter().all(|[x, y]| (x - y).abs() < f64::EPSILON)
    }

    /// Evaluate the curve with linear interpolation between points.
    #[must_use]
    pub fn eval(&self, x: f64) -> f64 {
        if self.points.len() < 2 {
            return x;
        }
        let mut previous = self.points[0];
        if x <= previous[0] {
            return previous[1];
        }
        for &point in &self.points[1..] {
            if x <= point[0] {
                let span = point[0] - previous[0];
                if span <= 0.0 {
                    return point[1];
                }
                let t = (x - previous[0]) / span;
                return (point[1] - previous[1]).mul_add(t, previous[1]);
            }
            previous = point;
        }
        previous[1]
    }
}

/// Demosaic methods for Bayer sensors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BayerDemosaic {
    #[default]
    Amaze,
    Rcd,
    Dcb,
    Lmmse,
    Igv,
    Ahd,
    Vng4,
    /// Dual demosaic: AMAZE in detailed areas, VNG4 in flat ones.
    AmazeVng4,
    /// Cheap bilinear interpolation used for the interactive preview.
    Fast,
    Mono,
    PixelShift,
    /// Leave the raw mosaic as-is.
    None,
}

impl BayerDemosaic {
    /// Whether this method blends two demosaics by a contrast threshold.
    #[must_use]
    pub const fn is_dual(self) -> bool {
        matches!(self, Self::AmazeVng4 | Self::PixelShift)
    }
}

/// Demosaic methods for X-Trans sensors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XTransDemosaic {
    #[default]
    ThreePass,
    OnePass,
    /// Dual demosaic: three-pass in detailed areas, fast in flat ones.
    FourPass,
    Fast,
    Mono,
    None,
}

impl XTransDemosaic {
    /// Whether this method blends two demosaics by a contrast threshold.
    #[must_use]
    pub const fn is_dual(self) -> bool {
        matches!(self, Self::FourPass)
    }
}

/// How blown highlights are reconstructed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HighlightMethod {
    Luminance,
    CieLab,
    /// Color propagation; works on the demosaiced data itself.
    #[default]
    Color,
    Blend,
}

/// Where the white balance comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WhiteBalanceMethod {
    /// As shot, from the camera metadata.
    #[default]
    Camera,
    /// Estimated from the image content.
    Auto,
    /// The configured temperature and tint.
    Custom,
}

/// Working color spaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkingProfile {
    Srgb,
    AdobeRgb,
    #[default]
    Rec2020,
}

/// ICC rendering intent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RenderingIntent {
    Perceptual,
    #[default]
    Relative,
    Saturation,
    Absolute,
}

/// Where the contrast-by-detail-levels pyramid runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PyramidPlacement {
    /// In RGB, before the black & white conversion.
    BeforeBlackWhite,
    /// In Lab, after the curves.
    #[default]
    AfterCurves,
}

/// Exposure and tone curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToneCurveParams {
    /// Compute exposure settings from the image histogram.
    pub auto_exposure: bool,
    /// Fraction of pixels auto exposure may clip.
    pub clip: f64,
    /// Exposure compensation in EV.
    pub exposure_compensation: f64,
    pub brightness: i32,
    pub contrast: i32,
    pub black: i32,
    pub saturation: i32,
    pub highlight_compression: i32,
    pub highlight_compression_threshold: i32,
    pub shadow_compression: i32,
    pub highlight_recovery: bool,
    pub highlight_method: HighlightMethod,
    pub curve: Curve,
}

impl Default for ToneCurveParams {
    fn default() -> Self {
        Self {
            auto_exposure: false,
            clip: 0.02,
            exposure_compensation: 0.0,
            brightness: 0,
            contrast: 0,
            black: 0,
            saturation: 0,
            highlight_compression: 0,
            highlight_compression_threshold: 0,
            shadow_compression: 50,
            highlight_recovery: false,
            highlight_method: HighlightMethod::default(),
            curve: Curve::default(),
        }
    }
}

/// Lab luminance and chroma adjustments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabCurveParams {
    pub brightness: i32,
    pub contrast: i32,
    /// Chroma scaling in percent, `-100` is grayscale.
    pub chromaticity: i32,
    /// Luminance curve over normalized L.
    pub lightness_curve: Curve,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalContrastParams {
    pub enabled: bool,
    /// Blur radius in full-resolution pixels.
    pub radius: f64,
    pub amount: f64,
}

impl Default for LocalContrastParams {
    fn default() -> Self {
        Self {
            enabled: false,
            radius: 80.0,
            amount: 0.2,
        }
    }
}

/// Per-channel RGB curves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RgbCurvesParams {
    pub red: Curve,
    pub green: Curve,
    pub blue: Curve,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColorToningParams {
    pub enabled: bool,
    pub strength: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VibranceParams {
    pub enabled: bool,
    /// Boost for low-saturation colors, in percent.
    pub pastels: i32,
    /// Boost for already saturated colors, in percent.
    pub saturated: i32,
}

/// White balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhiteBalanceParams {
    pub enabled: bool,
    pub method: WhiteBalanceMethod,
    /// Correlated color temperature in kelvin (custom method).
    pub temperature: f64,
    /// Green/magenta tint (custom method).
    pub green: f64,
    /// Blue/red equalizer.
    pub equal: f64,
    /// Bias applied to the auto white balance temperature.
    pub temp_bias: f64,
}

impl Default for WhiteBalanceParams {
    fn default() -> Self {
        Self {
            enabled: true,
            method: WhiteBalanceMethod::Camera,
            temperature: 6504.0,
            green: 1.0,
            equal: 1.0,
            temp_bias: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColorAppearanceParams {
    pub enabled: bool,
}

/// Edge-preserving decomposition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgePreservingParams {
    pub enabled: bool,
    pub strength: f64,
}

/// Fattal tone mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FattalParams {
    pub enabled: bool,
    pub threshold: i32,
    pub amount: i32,
}

impl Default for FattalParams {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 30,
            amount: 20,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShadowsHighlightsParams {
    pub enabled: bool,
    pub highlights: i32,
    pub shadows: i32,
}

/// Crop rectangle in full-image coordinates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CropParams {
    pub enabled: bool,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// 90-degree rotations and flips.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoarseTransformParams {
    /// Clockwise rotation: 0, 90, 180 or 270.
    pub rotate: u16,
    pub horizontal_flip: bool,
    pub vertical_flip: bool,
}

/// Settings shared by all geometric corrections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommonTransformParams {
    /// Scale up so the transformed image has no empty borders.
    pub auto_fill: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RotateParams {
    /// Counter-clockwise rotation in degrees.
    pub degrees: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DistortionParams {
    /// Radial distortion coefficient; positive values correct barrel.
    pub amount: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LensProfileParams {
    pub use_distortion: bool,
    pub use_vignette: bool,
    pub use_ca: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerspectiveParams {
    pub horizontal: f64,
    pub vertical: f64,
}

/// Graduated filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradientParams {
    pub enabled: bool,
    /// Exposure change at the dark end, in EV.
    pub strength: f64,
}

/// Post-crop vignette.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PcVignetteParams {
    pub enabled: bool,
    /// Exposure change at the corners, in EV.
    pub strength: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaCorrectionParams {
    pub red: f64,
    pub blue: f64,
}

/// Lens vignetting correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VignettingParams {
    /// Brightening at the corners, in percent.
    pub amount: i32,
    /// Radius of the untouched center, in percent of the half diagonal.
    pub radius: i32,
}

impl Default for VignettingParams {
    fn default() -> Self {
        Self {
            amount: 0,
            radius: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMixerParams {
    pub enabled: bool,
    /// Output rows, each mixing red, green, blue in percent.
    pub red: [i32; 3],
    pub green: [i32; 3],
    pub blue: [i32; 3],
}

impl Default for ChannelMixerParams {
    fn default() -> Self {
        Self {
            enabled: false,
            red: [100, 0, 0],
            green: [0, 100, 0],
            blue: [0, 0, 100],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlackWhiteParams {
    pub enabled: bool,
}

/// Color management.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorManagementParams {
    pub input_profile: String,
    pub working_profile: WorkingProfile,
    pub output_profile: String,
    pub output_intent: RenderingIntent,
    pub output_bpc: bool,
}

impl Default for ColorManagementParams {
    fn default() -> Self {
        Self {
            input_profile: "camera".to_owned(),
            working_profile: WorkingProfile::default(),
            output_profile: "sRGB".to_owned(),
            output_intent: RenderingIntent::default(),
            output_bpc: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HsvEqualizerParams {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilmSimulationParams {
    pub enabled: bool,
    pub strength: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SoftLightParams {
    pub enabled: bool,
    pub strength: i32,
}

/// Bayer sensor decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BayerParams {
    pub method: BayerDemosaic,
    /// Chromatic aberration correction iterations.
    pub cc_steps: u32,
    pub border: u32,
    /// Sub-frame for multi-frame raws.
    pub image_num: u32,
    pub dual_demosaic_auto_contrast: bool,
    pub dual_demosaic_contrast: f64,
}

impl Default for BayerParams {
    fn default() -> Self {
        Self {
            method: BayerDemosaic::default(),
            cc_steps: 0,
            border: 4,
            image_num: 0,
            dual_demosaic_auto_contrast: true,
            dual_demosaic_contrast: 20.0,
        }
    }
}

/// X-Trans sensor decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XTransParams {
    pub method: XTransDemosaic,
    pub cc_steps: u32,
    pub dual_demosaic_auto_contrast: bool,
    pub dual_demosaic_contrast: f64,
}

impl Default for XTransParams {
    fn default() -> Self {
        Self {
            method: XTransDemosaic::default(),
            cc_steps: 0,
            dual_demosaic_auto_contrast: true,
            dual_demosaic_contrast: 20.0,
        }
    }
}

/// Raw decoding and preprocessing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawParams {
    pub bayer: BayerParams,
    pub xtrans: XTransParams,
    pub ca_auto_correct: bool,
    pub hot_pixel_filter: bool,
    pub dead_pixel_filter: bool,
    pub dark_frame: Option<String>,
    pub flat_field: Option<String>,
    /// Report the clip value the flat field correction applied.
    pub flat_field_auto_clip: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetinexParams {
    pub enabled: bool,
    pub strength: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaveletParams {
    pub enabled: bool,
}

/// Contrast by detail levels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirPyrEqualizerParams {
    pub enabled: bool,
    pub placement: PyramidPlacement,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DehazeParams {
    pub enabled: bool,
    /// Haze removal strength in percent.
    pub strength: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharpeningParams {
    pub enabled: bool,
    pub amount: i32,
    pub radius: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResizeParams {
    pub enabled: bool,
    pub scale: f64,
}

/// Linear-space noise reduction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DenoiseParams {
    pub enabled: bool,
    pub luma: f64,
    pub chroma: f64,
}

/// Complete set of processing parameters for one image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcParams {
    pub tone_curve: ToneCurveParams,
    pub lab_curve: LabCurveParams,
    pub local_contrast: LocalContrastParams,
    pub rgb_curves: RgbCurvesParams,
    pub color_toning: ColorToningParams,
    pub vibrance: VibranceParams,
    pub white_balance: WhiteBalanceParams,
    pub color_appearance: ColorAppearanceParams,
    pub edge_preserving: EdgePreservingParams,
    pub fattal: FattalParams,
    pub shadows_highlights: ShadowsHighlightsParams,
    pub crop: CropParams,
    pub coarse: CoarseTransformParams,
    pub common_transform: CommonTransformParams,
    pub rotate: RotateParams,
    pub distortion: DistortionParams,
    pub lens_profile: LensProfileParams,
    pub perspective: PerspectiveParams,
    pub gradient: GradientParams,
    pub pc_vignette: PcVignetteParams,
    pub ca_correction: CaCorrectionParams,
    pub vignetting: VignettingParams,
    pub channel_mixer: ChannelMixerParams,
    pub black_white: BlackWhiteParams,
    pub color_management: ColorManagementParams,
    pub hsv_equalizer: HsvEqualizerParams,
    pub film_simulation: FilmSimulationParams,
    pub soft_light: SoftLightParams,
    pub raw: RawParams,
    pub retinex: RetinexParams,
    pub wavelet: WaveletParams,
    pub dir_pyr_equalizer: DirPyrEqualizerParams,
    pub dehaze: DehazeParams,
    pub sharpening: SharpeningParams,
    pub resize: ResizeParams,
    pub denoise: DenoiseParams,
}

impl ProcParams {
    /// Whether the geometric transform stage changes any pixel.
    #[must_use]
    pub fn needs_transform(&self) -> bool {
        self.rotate.degrees.abs() > 1e-6
            || self.distortion.amount.abs() > 1e-6
            || self.perspective.horizontal.abs() > 1e-6
            || self.perspective.vertical.abs() > 1e-6
            || self.vignetting.amount != 0
            || self.needs_pc_vignetting()
            || (self.gradient.enabled && self.gradient.strength.abs() > 1e-6)
    }

    /// Whether the post-crop vignette must be rendered.
    ///
    /// The vignette is anchored to the crop rectangle, so a crop change
    /// alone also invalidates the transform.
    #[must_use]
    pub fn needs_pc_vignetting(&self) -> bool {
        self.pc_vignette.enabled && self.pc_vignette.strength.abs() > 1e-6
    }

    /// The coarse transform handed to the image source.
    #[must_use]
    pub fn coarse(&self) -> CoarseTransform {
        CoarseTransform::new(
            self.coarse.rotate,
            self.coarse.horizontal_flip,
            self.coarse.vertical_flip,
        )
    }
}

/// Parameter groups whose change counts as a panning-related change.
///
/// A panning-related change forces the main pipeline to run and every crop
/// window with a listener to refresh, regardless of the change mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamGroup {
    ToneCurve,
    LabCurve,
    LocalContrast,
    RgbCurves,
    ColorToning,
    Vibrance,
    WhiteBalance,
    ColorAppearance,
    EdgePreserving,
    Fattal,
    ShadowsHighlights,
    Crop,
    Coarse,
    CommonTransform,
    Rotate,
    Distortion,
    LensProfile,
    Perspective,
    Gradient,
    PcVignette,
    CaCorrection,
    Vignetting,
    ChannelMixer,
    BlackWhite,
    ColorManagement,
    HsvEqualizer,
    FilmSimulation,
    SoftLight,
    Raw,
    Retinex,
    Wavelet,
    DirPyrEqualizer,
    Dehaze,
}

/// The groups compared to detect a panning-related change.
///
/// Kept as a table so the policy can be reviewed and extended in one place.
pub const PANNING_GROUPS: [ParamGroup; 33] = [
    ParamGroup::ToneCurve,
    ParamGroup::LabCurve,
    ParamGroup::LocalContrast,
    ParamGroup::RgbCurves,
    ParamGroup::ColorToning,
    ParamGroup::Vibrance,
    ParamGroup::WhiteBalance,
    ParamGroup::ColorAppearance,
    ParamGroup::EdgePreserving,
    ParamGroup::Fattal,
    ParamGroup::ShadowsHighlights,
    ParamGroup::Crop,
    ParamGroup::Coarse,
    ParamGroup::CommonTransform,
    ParamGroup::Rotate,
    ParamGroup::Distortion,
    ParamGroup::LensProfile,
    ParamGroup::Perspective,
    ParamGroup::Gradient,
    ParamGroup::PcVignette,
    ParamGroup::CaCorrection,
    ParamGroup::Vignetting,
    ParamGroup::ChannelMixer,
    ParamGroup::BlackWhite,
    ParamGroup::ColorManagement,
    ParamGroup::HsvEqualizer,
    ParamGroup::FilmSimulation,
    ParamGroup::SoftLight,
    ParamGroup::Raw,
    ParamGroup::Retinex,
    ParamGroup::Wavelet,
    ParamGroup::DirPyrEqualizer,
    ParamGroup::Dehaze,
];

impl ParamGroup {
    /// Whether this group differs between two snapshots.
    #[must_use]
    pub fn differs(self, a: &ProcParams, b: &ProcParams) -> bool {
        match self {
            Self::ToneCurve => a.tone_curve != b.tone_curve,
            Self::LabCurve => a.lab_curve != b.lab_curve,
            Self::LocalContrast => a.local_contrast != b.local_contrast,
            Self::RgbCurves => a.rgb_curves != b.rgb_curves,
            Self::ColorToning => a.color_toning != b.color_toning,
            Self::Vibrance => a.vibrance != b.vibrance,
            Self::WhiteBalance => a.white_balance != b.white_balance,
            Self::ColorAppearance => a.color_appearance != b.color_appearance,
            Self::EdgePreserving => a.edge_preserving != b.edge_preserving,
            Self::Fattal => a.fattal != b.fattal,
            Self::ShadowsHighlights => a.shadows_highlights != b.shadows_highlights,
            Self::Crop => a.crop != b.crop,
            Self::Coarse => a.coarse != b.coarse,
            Self::CommonTransform => a.common_transform != b.common_transform,
            Self::Rotate => a.rotate != b.rotate,
            Self::Distortion => a.distortion != b.distortion,
            Self::LensProfile => a.lens_profile != b.lens_profile,
            Self::Perspective => a.perspective != b.perspective,
            Self::Gradient => a.gradient != b.gradient,
            Self::PcVignette => a.pc_vignette != b.pc_vignette,
            Self::CaCorrection => a.ca_correction != b.ca_correction,
            Self::Vignetting => a.vignetting != b.vignetting,
            Self::ChannelMixer => a.channel_mixer != b.channel_mixer,
            Self::BlackWhite => a.black_white != b.black_white,
            Self::ColorManagement => a.color_management != b.color_management,
            Self::HsvEqualizer => a.hsv_equalizer != b.hsv_equalizer,
            Self::FilmSimulation => a.film_simulation != b.film_simulation,
            Self::SoftLight => a.soft_light != b.soft_light,
            Self::Raw => a.raw != b.raw,
            Self::Retinex => a.retinex != b.retinex,
            Self::Wavelet => a.wavelet != b.wavelet,
            Self::DirPyrEqualizer => a.dir_pyr_equalizer != b.dir_pyr_equalizer,
            Self::Dehaze => a.dehaze != b.dehaze,
        }
    }
}

/// Whether going from `previous` to `next` is a panning-related change.
#[must_use]
pub fn is_panning_change(previous: &ProcParams, next: &ProcParams) -> bool {
    PANNING_GROUPS
        .iter()
        .any(|group| group.differs(previous, next))
}

/// The panning groups that differ, in table order.
#[must_use]
pub fn changed_groups(previous: &ProcParams, next: &ProcParams) -> Vec<ParamGroup> {
    PANNING_GROUPS
        .iter()
        .copied()
        .filter(|group| group.differs(previous, next))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn identical_snapshots_are_not_a_panning_change() {
        let params = ProcParams::default();
        assert!(!is_panning_change(&params, &params.clone()));
        assert!(changed_groups(&params, &params).is_empty());
    }

    #[test]
    fn rotation_is_a_panning_change() {
        let previous = ProcParams::default();
        let mut next = previous.clone();
        next.rotate.degrees = 1.5;
        assert!(is_panning_change(&previous, &next));
        assert_eq!(changed_groups(&previous, &next), vec![ParamGroup::Rotate]);
    }

    #[test]
    fn sharpening_is_not_a_panning_change() {
        let previous = ProcParams::default();
        let mut next = previous.clone();
        next.sharpening.enabled = true;
        next.sharpening.amount = 200;
        next.resize.enabled = true;
        assert!(!is_panning_change(&previous, &next));
    }

    #[test]
    fn panning_table_has_no_duplicates() {
        for (i, group) in PANNING_GROUPS.iter().enumerate() {
            assert!(!PANNING_GROUPS[i + 1..].contains(group), "{group:?} listed twice");
        }
    }

    #[test]
    fn needs_transform_tracks_geometry() {
        let mut params = ProcParams::default();
        assert!(!params.needs_transform());
        params.pc_vignette.enabled = true;
        assert!(!params.needs_transform(), "zero strength vignette is a no-op");
        params.pc_vignette.strength = -1.0;
        assert!(params.needs_transform());
        assert!(params.needs_pc_vignetting());
    }

    #[test]
    fn curve_interpolates_between_points() {
        let curve = Curve::new(vec![[0.0, 0.0], [0.5, 0.25], [1.0, 1.0]]);
        assert!(!curve.is_identity());
        assert!((curve.eval(0.25) - 0.125).abs() < 1e-9);
        assert!((curve.eval(0.75) - 0.625).abs() < 1e-9);
        assert!((curve.eval(2.0) - 1.0).abs() < 1e-9);
        assert!(Curve::default().is_identity());
    }

    #[test]
    fn unknown_demosaic_method_is_rejected() {
        let err = serde_json::from_str::<BayerDemosaic>("\"Bilinear\"");
        assert!(err.is_err());
        let ok: BayerDemosaic = serde_json::from_str("\"Rcd\"").unwrap();
        assert_eq!(ok, BayerDemosaic::Rcd);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let params: ProcParams =
            serde_json::from_str(r#"{"rotate": {"degrees": 2.0}}"#).unwrap();
        assert!((params.rotate.degrees - 2.0).abs() < f64::EPSILON);
        assert_eq!(params.white_balance, WhiteBalanceParams::default());
    }
}
