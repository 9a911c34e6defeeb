//! Histograms published after every displayed run.
//!
//! Accumulation fans out over rows with rayon and folds per-thread partial
//! histograms back together, so no bin is ever shared between threads.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::types::{LabImage, RgbImage};

/// Number of bins of the display histograms.
pub const BINS: usize = 256;

/// Number of bins of the luminance histogram feeding the luma curve.
pub const LUMA_CURVE_BINS: usize = 1024;

/// Chroma mapped to the last bin.
const MAX_CHROMA: f32 = 180.0;

/// One histogram per RGB channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHistograms {
    pub red: Vec<u32>,
    pub green: Vec<u32>,
    pub blue: Vec<u32>,
}

impl ChannelHistograms {
    /// Empty histograms with `bins` bins each.
    #[must_use]
    pub fn new(bins: usize) -> Self {
        Self {
            red: vec![0; bins],
            green: vec![0; bins],
            blue: vec![0; bins],
        }
    }

    /// Number of samples counted in the red channel.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.red.iter().map(|&c| u64::from(c)).sum()
    }

    fn merge(mut self, other: &Self) -> Self {
        add_bins(&mut self.red, &other.red);
        add_bins(&mut self.green, &other.green);
        add_bins(&mut self.blue, &other.blue);
        self
    }
}

impl Default for ChannelHistograms {
    fn default() -> Self {
        Self::new(BINS)
    }
}

/// Everything the histogram listener receives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Histograms {
    /// Output-profile RGB inside the crop rectangle.
    pub rgb: ChannelHistograms,
    /// Lab lightness inside the crop rectangle.
    pub luma: Vec<u32>,
    /// Lab chroma inside the crop rectangle.
    pub chroma: Vec<u32>,
    /// Lightness of the image entering the luma curve.
    pub luma_curve_input: Vec<u32>,
    /// Raw channel histograms, when the source provides them.
    pub raw: Option<ChannelHistograms>,
}

/// Rectangle in preview coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PreviewRect {
    /// The rectangle covering a whole image.
    #[must_use]
    pub const fn covering(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

#[derive(Clone)]
struct Accumulator {
    rgb: ChannelHistograms,
    luma: Vec<u32>,
    chroma: Vec<u32>,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            rgb: ChannelHistograms::new(BINS),
            luma: vec![0; BINS],
            chroma: vec![0; BINS],
        }
    }

    fn merge(self, other: Self) -> Self {
        let mut luma = self.luma;
        let mut chroma = self.chroma;
        add_bins(&mut luma, &other.luma);
        add_bins(&mut chroma, &other.chroma);
        Self {
            rgb: self.rgb.merge(&other.rgb),
            luma,
            chroma,
        }
    }
}

fn add_bins(into: &mut [u32], from: &[u32]) {
    for (a, b) in into.iter_mut().zip(from) {
        *a += b;
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn bin(value: f32, max: f32, bins: usize) -> usize {
    let t = (value / max).clamp(0.0, 1.0);
    ((t * (bins - 1) as f32) as usize).min(bins - 1)
}

/// Accumulate RGB, lightness and chroma histograms over `area`.
///
/// `analysis` and `lab` must have the same dimensions; `area` is clamped
/// to them.
#[must_use]
pub fn accumulate(analysis: &RgbImage, lab: &LabImage, area: PreviewRect) -> Histograms {
    let width = analysis.width().min(lab.width());
    let height = analysis.height().min(lab.height());
    let x0 = area.x.min(width);
    let y0 = area.y.min(height);
    let x1 = area.x.saturating_add(area.width).min(width);
    let y1 = area.y.saturating_add(area.height).min(height);

    let acc = (y0..y1)
        .into_par_iter()
        .fold(Accumulator::new, |mut acc, y| {
            for x in x0..x1 {
                let [r, g, b] = analysis.get_pixel(x, y).0;
                acc.rgb.red[usize::from(r)] += 1;
                acc.rgb.green[usize::from(g)] += 1;
                acc.rgb.blue[usize::from(b)] += 1;
                let [l, a, bb] = lab.get_pixel(x, y).0;
                acc.luma[bin(l, 100.0, BINS)] += 1;
                acc.chroma[bin(a.hypot(bb), MAX_CHROMA, BINS)] += 1;
            }
            acc
        })
        .reduce(Accumulator::new, Accumulator::merge);

    Histograms {
        rgb: acc.rgb,
        luma: acc.luma,
        chroma: acc.chroma,
        luma_curve_input: Vec::new(),
        raw: None,
    }
}

/// Lightness histogram of a whole Lab image with [`LUMA_CURVE_BINS`] bins.
#[must_use]
pub fn luminance_histogram(lab: &LabImage) -> Vec<u32> {
    let data: &[f32] = lab.as_raw();
    data.par_chunks_exact(3)
        .fold(
            || vec![0u32; LUMA_CURVE_BINS],
            |mut hist, pixel| {
                hist[bin(pixel[0], 100.0, LUMA_CURVE_BINS)] += 1;
                hist
            },
        )
        .reduce(
            || vec![0u32; LUMA_CURVE_BINS],
            |mut a, b| {
                add_bins(&mut a, &b);
                a
            },
        )
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    #[test]
    fn accumulate_counts_every_pixel_in_area() {
        let analysis = RgbImage::from_pixel(8, 4, Rgb([10, 20, 30]));
        let lab = LabImage::from_pixel(8, 4, Rgb([50.0, 0.0, 0.0]));
        let hist = accumulate(&analysis, &lab, PreviewRect::covering(8, 4));
        assert_eq!(hist.rgb.red[10], 32);
        assert_eq!(hist.rgb.green[20], 32);
        assert_eq!(hist.rgb.blue[30], 32);
        assert_eq!(hist.rgb.total(), 32);
        assert_eq!(hist.luma.iter().sum::<u32>(), 32);
        assert_eq!(hist.chroma[0], 32);
    }

    #[test]
    fn accumulate_respects_crop_area() {
        let analysis = RgbImage::from_pixel(8, 4, Rgb([0, 0, 0]));
        let lab = LabImage::from_pixel(8, 4, Rgb([0.0, 0.0, 0.0]));
        let area = PreviewRect {
            x: 2,
            y: 1,
            width: 3,
            height: 2,
        };
        assert_eq!(accumulate(&analysis, &lab, area).rgb.total(), 6);
    }

    #[test]
    fn accumulate_clamps_oversized_area() {
        let analysis = RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]));
        let lab = LabImage::from_pixel(4, 4, Rgb([0.0, 0.0, 0.0]));
        let area = PreviewRect {
            x: 2,
            y: 2,
            width: 100,
            height: 100,
        };
        assert_eq!(accumulate(&analysis, &lab, area).rgb.total(), 4);
    }

    #[test]
    fn luminance_histogram_bins_extremes() {
        let mut lab = LabImage::from_pixel(2, 1, Rgb([0.0, 0.0, 0.0]));
        lab.put_pixel(1, 0, Rgb([100.0, 0.0, 0.0]));
        let hist = luminance_histogram(&lab);
        assert_eq!(hist.len(), LUMA_CURVE_BINS);
        assert_eq!(hist[0], 1);
        assert_eq!(hist[LUMA_CURVE_BINS - 1], 1);
    }
}
