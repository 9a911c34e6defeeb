//! Per-pixel processing invoked by the stages.
//!
//! All functions work on images sampled from the full-resolution frame at
//! some origin and skip, so the main preview and the crop windows share
//! them. Rows are processed in parallel with rayon.

use image::{ImageBuffer, Luma, Rgb};
use imageproc::filter::gaussian_blur_f32;
use imageproc::geometric_transformations::{Interpolation, warp_into_with};
use rayon::prelude::*;

use crate::color::{LabConverter, MonitorTransform};
use crate::curves::{LabCurves, ToneCurves};
use crate::params::{
    ChannelMixerParams, DehazeParams, FattalParams, LocalContrastParams, ProcParams,
    VibranceParams, WorkingProfile,
};
use crate::types::{Dimensions, LabImage, Rgb32FImage, RgbImage};

/// Chroma treated as fully saturated by vibrance.
const VIBRANCE_MAX_CHROMA: f32 = 120.0;

/// Where a sampled image sits in the full-resolution frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    /// Full-resolution position of pixel `(0, 0)`.
    pub origin: (f64, f64),
    /// Full-resolution pixels per sampled pixel.
    pub skip: f64,
}

impl Sampling {
    /// Sampling of the whole frame at `scale`.
    #[must_use]
    pub fn preview(scale: u32) -> Self {
        Self {
            origin: (0.0, 0.0),
            skip: f64::from(scale.max(1)),
        }
    }

    fn full_position(self, x: f64, y: f64) -> (f64, f64) {
        (
            x.mul_add(self.skip, self.origin.0),
            y.mul_add(self.skip, self.origin.1),
        )
    }

    fn sampled_position(self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.origin.0) / self.skip,
            (y - self.origin.1) / self.skip,
        )
    }
}

/// Geometric corrections and exposure falloffs in full-resolution
/// coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometryMap {
    center: (f64, f64),
    half_diagonal: f64,
    height: f64,
    sin: f64,
    cos: f64,
    zoom: f64,
    distortion: f64,
    perspective: (f64, f64),
    vignette_amount: f64,
    vignette_radius: f64,
    pc_vignette: Option<PcVignette>,
    gradient: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PcVignette {
    center: (f64, f64),
    half_diagonal: f64,
    strength: f64,
}

/// Zoom that hides the empty borders rotation and distortion leave.
#[must_use]
pub fn fill_scale(params: &ProcParams, full: Dimensions) -> f64 {
    if !params.common_transform.auto_fill || full.width == 0 || full.height == 0 {
        return 1.0;
    }
    let theta = params.rotate.degrees.to_radians();
    let (w, h) = (f64::from(full.width), f64::from(full.height));
    let aspect = (w / h).max(h / w);
    let rotation = theta.sin().abs().mul_add(aspect, theta.cos().abs());
    rotation * (1.0 + params.distortion.amount.max(0.0))
}

impl GeometryMap {
    /// Build the map for a snapshot and full image size.
    #[must_use]
    pub fn new(params: &ProcParams, full: Dimensions) -> Self {
        let (w, h) = (f64::from(full.width), f64::from(full.height));
        let theta = params.rotate.degrees.to_radians();
        let crop = &params.crop;
        let pc_vignette = params.needs_pc_vignetting().then(|| {
            let (cx, cy, cw, ch) = if crop.enabled && crop.width > 0 && crop.height > 0 {
                (
                    f64::from(crop.x),
                    f64::from(crop.y),
                    f64::from(crop.width),
                    f64::from(crop.height),
                )
            } else {
                (0.0, 0.0, w, h)
            };
            PcVignette {
                center: (cw.mul_add(0.5, cx), ch.mul_add(0.5, cy)),
                half_diagonal: (cw.hypot(ch) / 2.0).max(1.0),
                strength: params.pc_vignette.strength,
            }
        });
        Self {
            center: (w / 2.0, h / 2.0),
            half_diagonal: (w.hypot(h) / 2.0).max(1.0),
            height: h.max(1.0),
            sin: theta.sin(),
            cos: theta.cos(),
            zoom: fill_scale(params, full),
            distortion: params.distortion.amount,
            perspective: (
                params.perspective.horizontal / 100.0,
                params.perspective.vertical / 100.0,
            ),
            vignette_amount: f64::from(params.vignetting.amount) / 100.0,
            vignette_radius: (f64::from(params.vignetting.radius) / 100.0).clamp(0.0, 0.99),
            pc_vignette,
            gradient: (params.gradient.enabled && params.gradient.strength.abs() > 1e-6)
                .then_some(params.gradient.strength),
        }
    }

    /// Whether pixels move at all.
    #[must_use]
    pub fn is_geometric(&self) -> bool {
        self.sin.abs() > 1e-9
            || (self.zoom - 1.0).abs() > 1e-9
            || self.distortion.abs() > 1e-9
            || self.perspective.0.abs() > 1e-9
            || self.perspective.1.abs() > 1e-9
    }

    /// Whether any exposure falloff applies.
    #[must_use]
    pub fn has_gain(&self) -> bool {
        self.vignette_amount.abs() > 1e-9 || self.pc_vignette.is_some() || self.gradient.is_some()
    }

    /// Source position of an output position.
    #[must_use]
    pub fn source(&self, x: f64, y: f64) -> (f64, f64) {
        let (cx, cy) = self.center;
        let (dx, dy) = ((x - cx) / self.zoom, (y - cy) / self.zoom);
        let (rx, ry) = (
            self.cos.mul_add(dx, -(self.sin * dy)),
            self.sin.mul_add(dx, self.cos * dy),
        );
        let (kh, kv) = self.perspective;
        let px = rx * kv.mul_add(ry / self.half_diagonal, 1.0);
        let py = ry * kh.mul_add(rx / self.half_diagonal, 1.0);
        let r = px.hypot(py) / self.half_diagonal;
        let radial = self.distortion.mul_add(r * r, 1.0);
        (px.mul_add(radial, cx), py.mul_add(radial, cy))
    }

    /// Exposure multiplier at an output position.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn gain(&self, x: f64, y: f64) -> f32 {
        let mut gain = 1.0;
        if self.vignette_amount.abs() > 1e-9 {
            let r = (x - self.center.0).hypot(y - self.center.1) / self.half_diagonal;
            if r > self.vignette_radius {
                let t = (r - self.vignette_radius) / (1.0 - self.vignette_radius);
                gain *= self.vignette_amount.mul_add(t * t, 1.0);
            }
        }
        if let Some(pc) = self.pc_vignette {
            let r = ((x - pc.center.0).hypot(y - pc.center.1) / pc.half_diagonal).min(1.0);
            gain *= (pc.strength * r * r).exp2();
        }
        if let Some(strength) = self.gradient {
            gain *= (strength * (1.0 - (y / self.height).clamp(0.0, 1.0))).exp2();
        }
        gain.max(0.0) as f32
    }

    /// Full-resolution source positions of points given in output
    /// coordinates.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn source_points(&self, points: &[(u32, u32)], full: Dimensions) -> Vec<(u32, u32)> {
        points
            .iter()
            .filter_map(|&(x, y)| {
                let (sx, sy) = self.source(f64::from(x), f64::from(y));
                let inside = sx >= 0.0
                    && sy >= 0.0
                    && sx < f64::from(full.width)
                    && sy < f64::from(full.height);
                inside.then(|| (sx as u32, sy as u32))
            })
            .collect()
    }
}

/// Apply the geometric transform and falloffs from `src` into `dest`.
///
/// Both images use the same sampling. Output pixels whose source falls
/// outside `src` are black.
pub fn transform(src: &Rgb32FImage, dest: &mut Rgb32FImage, map: &GeometryMap, at: Sampling) {
    transform_between(src, at, dest, at, map);
}

/// Like [`transform`], for a `src` sampled at a different origin than
/// `dest`, e.g. the source footprint of a crop window.
///
/// Without a geometric change both images must cover the same area.
#[allow(clippy::cast_possible_truncation)]
pub fn transform_between(
    src: &Rgb32FImage,
    from: Sampling,
    dest: &mut Rgb32FImage,
    at: Sampling,
    map: &GeometryMap,
) {
    if map.is_geometric() {
        let map = *map;
        warp_into_with(
            src,
            move |x, y| {
                let (fx, fy) = at.full_position(f64::from(x), f64::from(y));
                let (sx, sy) = map.source(fx, fy);
                let (px, py) = from.sampled_position(sx, sy);
                (px as f32, py as f32)
            },
            Interpolation::Bilinear,
            Rgb([0.0, 0.0, 0.0]),
            dest,
        );
    } else {
        dest.copy_from_slice(src);
    }

    if map.has_gain() {
        let stride = dest.width() as usize * 3;
        let data: &mut [f32] = dest;
        data.par_chunks_mut(stride)
            .enumerate()
            .for_each(|(y, row)| {
                #[allow(clippy::cast_precision_loss)]
                let y = y as f64;
                for (x, pixel) in row.chunks_exact_mut(3).enumerate() {
                    #[allow(clippy::cast_precision_loss)]
                    let (fx, fy) = at.full_position(x as f64, y);
                    let gain = map.gain(fx, fy);
                    for v in pixel {
                        *v *= gain;
                    }
                }
            });
    }
}

/// Global HDR compression and dehaze on linear working-space RGB.
#[allow(clippy::cast_possible_truncation)]
pub fn tone_map(image: &mut Rgb32FImage, fattal: &FattalParams, dehaze: &DehazeParams) {
    let haze = if dehaze.enabled {
        (f64::from(dehaze.strength) / 100.0 * 0.5).clamp(0.0, 0.9) as f32
    } else {
        0.0
    };
    let compression = fattal
        .enabled
        .then(|| (1.0 + f64::from(fattal.amount.max(0)) / 5.0) as f32);

    let data: &mut [f32] = image;
    data.par_chunks_exact_mut(3).for_each(|pixel| {
        if haze > 0.0 {
            let dark = pixel[0].min(pixel[1]).min(pixel[2]).max(0.0);
            for v in pixel.iter_mut() {
                *v = ((*v - haze * dark) / (1.0 - haze)).max(0.0);
            }
        }
        if let Some(c) = compression {
            let y = 0.2126f32.mul_add(pixel[0], 0.7152f32.mul_add(pixel[1], 0.0722 * pixel[2]));
            if y > 1e-6 {
                let mapped = (y * c).ln_1p() / c.ln_1p();
                let ratio = mapped / y;
                for v in pixel.iter_mut() {
                    *v *= ratio;
                }
            }
        }
    });
}

fn mix(mixer: &ChannelMixerParams, rgb: [f32; 3]) -> [f32; 3] {
    #[allow(clippy::cast_precision_loss)]
    let row = |weights: [i32; 3]| {
        weights
            .iter()
            .zip(rgb)
            .map(|(&w, v)| w as f32 / 100.0 * v)
            .sum::<f32>()
    };
    [row(mixer.red), row(mixer.green), row(mixer.blue)]
}

/// Options of the RGB stage besides the curves.
#[derive(Debug, Clone, Copy)]
pub struct RgbOptions<'a> {
    pub mixer: &'a ChannelMixerParams,
    pub black_white: bool,
    pub working: WorkingProfile,
}

/// Apply exposure, curves, channel mixer and black & white, then convert
/// to Lab.
pub fn rgb_to_lab(src: &Rgb32FImage, dest: &mut LabImage, curves: &ToneCurves, options: RgbOptions<'_>) {
    let converter = LabConverter::new(options.working);
    let src_data: &[f32] = src;
    let dest_data: &mut [f32] = dest;
    dest_data
        .par_chunks_exact_mut(3)
        .zip(src_data.par_chunks_exact(3))
        .for_each(|(out, pixel)| {
            let mut rgb = [pixel[0], pixel[1], pixel[2]];
            if options.mixer.enabled {
                rgb = mix(options.mixer, rgb);
            }
            rgb = curves.apply(rgb);
            if options.black_white {
                let y = 0.2126f32.mul_add(rgb[0], 0.7152f32.mul_add(rgb[1], 0.0722 * rgb[2]));
                rgb = [y; 3];
            }
            out.copy_from_slice(&converter.rgb_to_lab(rgb));
        });
}

/// Local contrast as applied at a particular sampling.
#[derive(Debug, Clone, Copy)]
pub struct LocalContrast {
    sigma: f32,
    amount: f32,
}

impl LocalContrast {
    /// Local contrast for images sampled every `skip` pixels, or `None`
    /// when disabled.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn at(params: &LocalContrastParams, skip: f64) -> Option<Self> {
        params.enabled.then(|| Self {
            sigma: ((params.radius / skip.max(1.0)) as f32).max(0.5),
            amount: params.amount as f32,
        })
    }
}

/// Lab curves, chroma, vibrance and local contrast.
pub fn refine_lab(
    src: &LabImage,
    dest: &mut LabImage,
    curves: &LabCurves,
    vibrance: &VibranceParams,
    local_contrast: Option<LocalContrast>,
) {
    #[allow(clippy::cast_precision_loss)]
    let (pastels, saturated) = if vibrance.enabled {
        (vibrance.pastels as f32 / 100.0, vibrance.saturated as f32 / 100.0)
    } else {
        (0.0, 0.0)
    };
    let src_data: &[f32] = src;
    let dest_data: &mut [f32] = dest;
    dest_data
        .par_chunks_exact_mut(3)
        .zip(src_data.par_chunks_exact(3))
        .for_each(|(out, pixel)| {
            let l = curves.lightness.sample(pixel[0] / 100.0) * 100.0;
            let mut a = pixel[1] * curves.chroma_scale;
            let mut b = pixel[2] * curves.chroma_scale;
            if pastels != 0.0 || saturated != 0.0 {
                let t = (a.hypot(b) / VIBRANCE_MAX_CHROMA).min(1.0);
                let boost = saturated.mul_add(t, pastels.mul_add(1.0 - t, 1.0)).max(0.0);
                a *= boost;
                b *= boost;
            }
            out[0] = l;
            out[1] = a;
            out[2] = b;
        });

    if let Some(lc) = local_contrast {
        let lightness: ImageBuffer<Luma<f32>, Vec<f32>> =
            ImageBuffer::from_fn(dest.width(), dest.height(), |x, y| {
                Luma([dest.get_pixel(x, y).0[0]])
            });
        let blurred = gaussian_blur_f32(&lightness, lc.sigma);
        let dest_data: &mut [f32] = dest;
        dest_data
            .par_chunks_exact_mut(3)
            .zip(blurred.as_raw().par_iter())
            .for_each(|(out, &base)| {
                out[0] = lc.amount.mul_add(out[0] - base, out[0]).clamp(0.0, 100.0);
            });
    }
}

/// Convert Lab to monitor RGB and, when given, output-profile RGB.
pub fn lab_to_display(
    lab: &LabImage,
    transform: &MonitorTransform,
    monitor: &mut RgbImage,
    analysis: Option<&mut RgbImage>,
) {
    let lab_data: &[f32] = lab;
    let monitor_data: &mut [u8] = monitor;
    match analysis {
        Some(analysis) => {
            let analysis_data: &mut [u8] = analysis;
            monitor_data
                .par_chunks_exact_mut(3)
                .zip(analysis_data.par_chunks_exact_mut(3))
                .zip(lab_data.par_chunks_exact(3))
                .for_each(|((out, work), pixel)| {
                    let lab = [pixel[0], pixel[1], pixel[2]];
                    out.copy_from_slice(&transform.to_monitor(lab));
                    work.copy_from_slice(&transform.to_output(lab));
                });
        }
        None => {
            monitor_data
                .par_chunks_exact_mut(3)
                .zip(lab_data.par_chunks_exact(3))
                .for_each(|(out, pixel)| {
                    out.copy_from_slice(&transform.to_monitor([pixel[0], pixel[1], pixel[2]]));
                });
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::color::{BuiltinProfiles, MonitorSettings};
    use crate::curves::ExposureSettings;
    use crate::params::{ColorManagementParams, LabCurveParams, RgbCurvesParams, ToneCurveParams};

    #[allow(clippy::cast_precision_loss)]
    fn gradient(width: u32, height: u32) -> Rgb32FImage {
        Rgb32FImage::from_fn(width, height, |x, _| {
            let v = x as f32 / width as f32;
            Rgb([v, v, v])
        })
    }

    #[test]
    fn identity_geometry_copies() {
        let params = ProcParams::default();
        let map = GeometryMap::new(&params, Dimensions::new(40, 20));
        assert!(!map.is_geometric());
        assert!(!map.has_gain());
        let src = gradient(4, 2);
        let mut dest = Rgb32FImage::new(4, 2);
        transform(&src, &mut dest, &map, Sampling::preview(10));
        assert_eq!(dest, src);
    }

    #[test]
    fn source_of_center_is_center() {
        let mut params = ProcParams::default();
        params.rotate.degrees = 30.0;
        params.distortion.amount = 0.2;
        let map = GeometryMap::new(&params, Dimensions::new(400, 200));
        let (x, y) = map.source(200.0, 100.0);
        assert!((x - 200.0).abs() < 1e-9 && (y - 100.0).abs() < 1e-9);
    }

    #[test]
    fn fill_scale_for_rotation() {
        let mut params = ProcParams::default();
        params.common_transform.auto_fill = true;
        assert!((fill_scale(&params, Dimensions::new(300, 200)) - 1.0).abs() < 1e-12);
        params.rotate.degrees = 90.0;
        let zoom = fill_scale(&params, Dimensions::new(300, 200));
        assert!((zoom - 1.5).abs() < 1e-9);
    }

    #[test]
    fn vignetting_brightens_corners_only() {
        let mut params = ProcParams::default();
        params.vignetting.amount = 50;
        params.vignetting.radius = 50;
        let map = GeometryMap::new(&params, Dimensions::new(100, 100));
        assert!((map.gain(50.0, 50.0) - 1.0).abs() < 1e-6);
        assert!(map.gain(0.0, 0.0) > 1.4);
    }

    #[test]
    fn dehaze_removes_dark_channel() {
        let mut image = Rgb32FImage::from_pixel(1, 1, Rgb([0.6, 0.4, 0.2]));
        let dehaze = DehazeParams {
            enabled: true,
            strength: 100,
        };
        tone_map(&mut image, &FattalParams::default(), &dehaze);
        let [r, g, b] = image.get_pixel(0, 0).0;
        assert!(r > 0.6 && g > 0.4);
        assert!((b - 0.2).abs() < 1e-6);
    }

    #[test]
    fn neutral_pipeline_round_trips_gray() {
        let src = Rgb32FImage::from_pixel(2, 2, Rgb([0.18, 0.18, 0.18]));
        let mut lab = LabImage::new(2, 2);
        let curves = ToneCurves::build(
            &ExposureSettings::default(),
            &ToneCurveParams::default(),
            &RgbCurvesParams::default(),
        );
        let mixer = ChannelMixerParams::default();
        rgb_to_lab(
            &src,
            &mut lab,
            &curves,
            RgbOptions {
                mixer: &mixer,
                black_white: false,
                working: WorkingProfile::Srgb,
            },
        );
        let [l, a, b] = lab.get_pixel(0, 0).0;
        assert!((l - 49.5).abs() < 0.5, "L = {l}");
        assert!(a.abs() < 0.1 && b.abs() < 0.1);

        let mut refined = LabImage::new(2, 2);
        let lab_curves = LabCurves::build(&LabCurveParams::default(), &[]);
        refine_lab(&lab, &mut refined, &lab_curves, &VibranceParams::default(), None);
        assert!((refined.get_pixel(1, 1).0[0] - l).abs() < 0.05);

        let monitor_transform = MonitorTransform::build(
            &BuiltinProfiles,
            &MonitorSettings::default(),
            &ColorManagementParams::default(),
        )
        .unwrap();
        let mut monitor = RgbImage::new(2, 2);
        let mut analysis = RgbImage::new(2, 2);
        lab_to_display(&refined, &monitor_transform, &mut monitor, Some(&mut analysis));
        let [r, g, b] = monitor.get_pixel(0, 0).0;
        // 18% gray encodes to about 118 in sRGB.
        assert!((i32::from(r) - 118).abs() <= 2, "r = {r}");
        assert_eq!(r, g);
        assert_eq!(g, b);
        assert_eq!(monitor, analysis);
    }

    #[test]
    fn local_contrast_keeps_flat_images_flat() {
        let lab = LabImage::from_pixel(8, 8, Rgb([40.0, 0.0, 0.0]));
        let mut refined = LabImage::new(8, 8);
        let curves = LabCurves::build(&LabCurveParams::default(), &[]);
        let params = LocalContrastParams {
            enabled: true,
            radius: 10.0,
            amount: 1.0,
        };
        refine_lab(
            &lab,
            &mut refined,
            &curves,
            &VibranceParams::default(),
            LocalContrast::at(&params, 1.0),
        );
        for pixel in refined.pixels() {
            assert!((pixel.0[0] - 40.0).abs() < 0.05);
        }
    }
}
