//! Tone and Lab curve construction.
//!
//! Curves are sampled into lookup tables once per run and then applied per
//! pixel by the processing stages.

use serde::{Deserialize, Serialize};

use crate::params::{Curve, LabCurveParams, RgbCurvesParams, ToneCurveParams};

/// Entries in every lookup table.
pub const LUT_SIZE: usize = 4096;

/// A sampled curve over `[0, 1]` with linear interpolation.
#[derive(Debug, Clone, PartialEq)]
pub struct Lut {
    values: Vec<f32>,
}

impl Lut {
    /// Sample `f` at [`LUT_SIZE`] evenly spaced inputs.
    #[allow(clippy::cast_precision_loss)]
    pub fn from_fn(f: impl Fn(f64) -> f64) -> Self {
        let last = (LUT_SIZE - 1) as f64;
        #[allow(clippy::cast_possible_truncation)]
        let values = (0..LUT_SIZE).map(|i| f(i as f64 / last) as f32).collect();
        Self { values }
    }

    /// The identity table.
    #[must_use]
    pub fn identity() -> Self {
        Self::from_fn(|x| x)
    }

    /// Look up `x` (clamped to `[0, 1]`).
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn sample(&self, x: f32) -> f32 {
        let pos = x.clamp(0.0, 1.0) * (LUT_SIZE - 1) as f32;
        let i = (pos as usize).min(LUT_SIZE - 2);
        let t = pos - i as f32;
        (self.values[i + 1] - self.values[i]).mul_add(t, self.values[i])
    }
}

/// Exposure settings a run actually applies.
///
/// Either copied from the snapshot or computed by auto exposure; kept in
/// engine state so a later run without the auto exposure bit reuses them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExposureSettings {
    /// Exposure compensation in EV.
    pub compensation: f64,
    pub brightness: i32,
    pub contrast: i32,
    pub black: i32,
    pub highlight_compression: i32,
    pub highlight_compression_threshold: i32,
}

impl ExposureSettings {
    /// The settings stored in a snapshot.
    #[must_use]
    pub const fn from_params(tone: &ToneCurveParams) -> Self {
        Self {
            compensation: tone.exposure_compensation,
            brightness: tone.brightness,
            contrast: tone.contrast,
            black: tone.black,
            highlight_compression: tone.highlight_compression,
            highlight_compression_threshold: tone.highlight_compression_threshold,
        }
    }
}

/// Estimate exposure settings from a luminance histogram.
///
/// `histogram` bins cover `[0, 1]` linearly. `clip` is the fraction of
/// pixels allowed to clip at the white point.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn auto_exposure(histogram: &[u32], clip: f64) -> ExposureSettings {
    let total: u64 = histogram.iter().map(|&c| u64::from(c)).sum();
    if total == 0 || histogram.len() < 2 {
        return ExposureSettings::default();
    }
    let bins = histogram.len() as f64;
    let allowed = (total as f64 * clip.clamp(0.0, 1.0)).round();

    // White point: the lowest bin above which at most `allowed` pixels lie.
    let mut above = 0.0;
    let mut white_bin = histogram.len() - 1;
    for (i, &count) in histogram.iter().enumerate().rev() {
        above += f64::from(count);
        if above > allowed {
            white_bin = i;
            break;
        }
    }
    let white = (white_bin as f64 + 1.0) / bins;
    let compensation = (1.0 / white).log2().clamp(-5.0, 12.0);

    // Black point: where the darkest `clip` fraction ends.
    let mut below = 0.0;
    let mut black_bin = 0;
    for (i, &count) in histogram.iter().enumerate() {
        below += f64::from(count);
        if below > allowed {
            black_bin = i;
            break;
        }
    }
    #[allow(clippy::cast_possible_truncation)]
    let black = ((black_bin as f64 / bins) * 1000.0).round().min(200.0) as i32;
    #[allow(clippy::cast_possible_truncation)]
    let highlight_compression = (compensation.max(0.0) * 20.0).round().min(100.0) as i32;

    ExposureSettings {
        compensation,
        brightness: 0,
        contrast: 0,
        black,
        highlight_compression,
        highlight_compression_threshold: 0,
    }
}

/// Lookup tables the RGB stage applies.
#[derive(Debug, Clone)]
pub struct ToneCurves {
    /// Exposure, black point, highlight compression, contrast and the tone
    /// curve, from linear input to linear output.
    pub tone: Lut,
    /// Gain applied before `tone` (the LUT domain is `[0, 1]`).
    pub gain: f32,
    pub red: Option<Lut>,
    pub green: Option<Lut>,
    pub blue: Option<Lut>,
    /// Saturation change in percent.
    pub saturation: i32,
}

/// Soft-clip values above `threshold` into `[threshold, 1]`.
fn compress_highlights(v: f64, amount: f64, threshold: f64) -> f64 {
    if amount <= 0.0 || v <= threshold {
        return v.min(1.0);
    }
    let range = 1.0 - threshold;
    let excess = (v - threshold) / range;
    threshold + range * excess / amount.mul_add(excess, 1.0).max(1.0)
}

fn contrast_curve(v: f64, contrast: i32) -> f64 {
    if contrast == 0 {
        return v;
    }
    let k = f64::from(contrast) / 100.0;
    let centered = v - 0.5;
    k.mul_add(centered * (1.0 - (2.0 * centered).abs()), v).clamp(0.0, 1.0)
}

fn optional_lut(curve: &Curve) -> Option<Lut> {
    (!curve.is_identity()).then(|| Lut::from_fn(|x| curve.eval(x)))
}

impl ToneCurves {
    /// Build the tables for a run.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(
        exposure: &ExposureSettings,
        tone: &ToneCurveParams,
        rgb: &RgbCurvesParams,
    ) -> Self {
        // The LUT covers [0, HEADROOM]; the gain folds exposure and range.
        const HEADROOM: f64 = 4.0;
        let gain = 2f64.powf(exposure.compensation);
        let black = f64::from(exposure.black) / 1000.0;
        let amount = f64::from(exposure.highlight_compression) / 100.0;
        let threshold =
            (f64::from(exposure.highlight_compression_threshold) / 100.0).clamp(0.0, 0.99);
        let brightness = f64::from(exposure.brightness) / 200.0;
        let contrast = exposure.contrast;
        let curve = tone.curve.clone();

        let table = Lut::from_fn(move |x| {
            let linear = x * HEADROOM;
            let lifted = ((linear - black) / (1.0 - black).max(1e-6)).max(0.0);
            let compressed = compress_highlights(lifted, amount, threshold);
            let bright = (compressed + brightness * (1.0 - compressed)).clamp(0.0, 1.0);
            curve.eval(contrast_curve(bright, contrast))
        });

        Self {
            tone: table,
            gain: (gain / HEADROOM) as f32,
            red: optional_lut(&rgb.red),
            green: optional_lut(&rgb.green),
            blue: optional_lut(&rgb.blue),
            saturation: tone.saturation,
        }
    }

    /// Apply exposure and curves to one linear RGB pixel.
    #[must_use]
    pub fn apply(&self, rgb: [f32; 3]) -> [f32; 3] {
        let mut out = rgb.map(|v| self.tone.sample(v * self.gain));
        for (value, lut) in out.iter_mut().zip([&self.red, &self.green, &self.blue]) {
            if let Some(lut) = lut {
                *value = lut.sample(*value);
            }
        }
        if self.saturation != 0 {
            let luma = 0.2126f32.mul_add(out[0], 0.7152f32.mul_add(out[1], 0.0722 * out[2]));
            #[allow(clippy::cast_precision_loss)]
            let factor = 1.0 + self.saturation as f32 / 100.0;
            out = out.map(|v| (v - luma).mul_add(factor, luma).clamp(0.0, 1.0));
        }
        out
    }
}

/// Lookup tables and factors the Lab refinement stage applies.
#[derive(Debug, Clone)]
pub struct LabCurves {
    /// Lightness curve over `L / 100`.
    pub lightness: Lut,
    /// Chroma multiplier.
    pub chroma_scale: f32,
}

impl LabCurves {
    /// Build the Lab tables.
    ///
    /// `luma_histogram` is the lightness distribution of the image entering
    /// the curve; contrast pivots around its median so it does not shift
    /// overall brightness.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn build(params: &LabCurveParams, luma_histogram: &[u32]) -> Self {
        let pivot = median_position(luma_histogram).unwrap_or(0.5);
        let brightness = f64::from(params.brightness) / 200.0;
        let contrast = f64::from(params.contrast) / 100.0;
        let curve = params.lightness_curve.clone();
        let lightness = Lut::from_fn(move |x| {
            let bright = (x + brightness * (1.0 - x)).clamp(0.0, 1.0);
            let contrasted = contrast.mul_add(bright - pivot, bright).clamp(0.0, 1.0);
            curve.eval(contrasted)
        });
        Self {
            lightness,
            chroma_scale: (1.0 + params.chromaticity as f32 / 100.0).max(0.0),
        }
    }
}

/// Position of the median sample in `[0, 1]`, or `None` for an empty
/// histogram.
#[allow(clippy::cast_precision_loss)]
fn median_position(histogram: &[u32]) -> Option<f64> {
    let total: u64 = histogram.iter().map(|&c| u64::from(c)).sum();
    if total == 0 {
        return None;
    }
    let mut seen = 0u64;
    for (i, &count) in histogram.iter().enumerate() {
        seen += u64::from(count);
        if seen * 2 >= total {
            return Some((i as f64 + 0.5) / histogram.len() as f64);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_lut_samples_linearly() {
        let lut = Lut::identity();
        for x in [0.0, 0.1, 0.5, 0.99, 1.0] {
            assert!((lut.sample(x) - x).abs() < 1e-4);
        }
        assert!((lut.sample(-1.0)).abs() < 1e-6);
        assert!((lut.sample(3.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn neutral_tone_curves_preserve_midtones() {
        let curves = ToneCurves::build(
            &ExposureSettings::default(),
            &ToneCurveParams::default(),
            &RgbCurvesParams::default(),
        );
        let out = curves.apply([0.18, 0.5, 0.75]);
        assert!((out[0] - 0.18).abs() < 1e-3);
        assert!((out[1] - 0.5).abs() < 1e-3);
        assert!((out[2] - 0.75).abs() < 1e-3);
    }

    #[test]
    fn positive_exposure_brightens() {
        let exposure = ExposureSettings {
            compensation: 1.0,
            ..ExposureSettings::default()
        };
        let curves = ToneCurves::build(
            &exposure,
            &ToneCurveParams::default(),
            &RgbCurvesParams::default(),
        );
        let out = curves.apply([0.2, 0.2, 0.2]);
        assert!((out[0] - 0.4).abs() < 1e-3);
    }

    #[test]
    fn auto_exposure_lifts_dark_image() {
        // All pixels in the lowest quarter.
        let mut histogram = vec![0u32; 256];
        for bin in histogram.iter_mut().take(64) {
            *bin = 100;
        }
        let settings = auto_exposure(&histogram, 0.0);
        assert!((settings.compensation - 2.0).abs() < 1e-9);
        assert!(settings.highlight_compression > 0);
    }

    #[test]
    fn auto_exposure_of_empty_histogram_is_neutral() {
        assert_eq!(auto_exposure(&[], 0.02), ExposureSettings::default());
        assert_eq!(auto_exposure(&[0; 16], 0.02), ExposureSettings::default());
    }

    #[test]
    fn chromaticity_scales_chroma() {
        let params = LabCurveParams {
            chromaticity: -100,
            ..LabCurveParams::default()
        };
        assert!(LabCurves::build(&params, &[]).chroma_scale.abs() < f32::EPSILON);
        let params = LabCurveParams {
            chromaticity: 50,
            ..LabCurveParams::default()
        };
        assert!((LabCurves::build(&params, &[]).chroma_scale - 1.5).abs() < 1e-6);
    }

    #[test]
    fn median_position_of_uniform_histogram() {
        let m = median_position(&[1, 1, 1, 1]).unwrap_or_default();
        assert!((m - 0.375).abs() < 1e-9);
        assert!(median_position(&[0, 0]).is_none());
    }
}
