//! A deterministic image source for tests, benchmarks and demos.
//!
//! [`SyntheticSource`] renders a smooth color gradient at any sensor size
//! and records every call in a shared [`SourceProbe`], so callers can
//! assert which stages touched the source. An optional [`SourceGate`]
//! blocks inside preprocessing until released, which lets a test hold a
//! run in flight while it issues more edits.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::color::ColorTemp;
use crate::histogram::{BINS, ChannelHistograms};
use crate::params::{
    BayerDemosaic, ColorManagementParams, LensProfileParams, RawParams, ToneCurveParams,
};
use crate::source::{
    CoarseTransform, DecodeInfo, ImageSource, SensorInfo, SensorType, SourceError, Viewport,
};
use crate::types::{Dimensions, Rgb32FImage};

/// How long a gated preprocess waits for its release before giving up.
const GATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Grid used for whole-image statistics.
const STATS_GRID: u32 = 64;

/// Call counters and failure switches shared with a [`SyntheticSource`].
#[derive(Debug, Default)]
pub struct SourceProbe {
    preprocess_calls: AtomicUsize,
    demosaic_calls: AtomicUsize,
    get_image_calls: AtomicUsize,
    convert_calls: AtomicUsize,
    auto_exposure_calls: AtomicUsize,
    last_bayer_method: Mutex<Option<BayerDemosaic>>,
    fail_color_conversion: AtomicBool,
    fail_demosaic: AtomicBool,
}

impl SourceProbe {
    #[must_use]
    pub fn preprocess_calls(&self) -> usize {
        self.preprocess_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn demosaic_calls(&self) -> usize {
        self.demosaic_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn get_image_calls(&self) -> usize {
        self.get_image_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn convert_calls(&self) -> usize {
        self.convert_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn auto_exposure_calls(&self) -> usize {
        self.auto_exposure_calls.load(Ordering::SeqCst)
    }

    /// Bayer method of the most recent demosaic.
    #[must_use]
    pub fn last_demosaic(&self) -> Option<BayerDemosaic> {
        *self
            .last_bayer_method
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every color conversion fail until switched off again.
    pub fn set_fail_color_conversion(&self, fail: bool) {
        self.fail_color_conversion.store(fail, Ordering::SeqCst);
    }

    /// Make every demosaic fail until switched off again.
    pub fn set_fail_demosaic(&self, fail: bool) {
        self.fail_demosaic.store(fail, Ordering::SeqCst);
    }
}

/// Test-side handle of a gated source.
///
/// Each preprocess call announces itself on [`entered`](Self::entered) and
/// then waits for one [`release`](Self::release). Dropping the handle
/// releases every current and future wait.
#[derive(Debug)]
pub struct SourceGate {
    entered: Receiver<()>,
    release: Sender<()>,
}

impl SourceGate {
    /// Wait until a preprocess call is blocked on the gate.
    #[must_use]
    pub fn wait_entered(&self, timeout: Duration) -> bool {
        self.entered.recv_timeout(timeout).is_ok()
    }

    /// Let one blocked preprocess call continue.
    pub fn release(&self) {
        // A send only fails once the source is gone, and then nothing waits.
        let _ = self.release.send(());
    }
}

#[derive(Debug)]
struct GateSide {
    entered: Sender<()>,
    release: Receiver<()>,
}

/// A source rendering a deterministic gradient.
#[derive(Debug)]
pub struct SyntheticSource {
    sensor_size: Dimensions,
    info: SensorInfo,
    camera_wb: ColorTemp,
    frames: u32,
    current_frame: u32,
    flat_field_clip: Option<f64>,
    probe: Arc<SourceProbe>,
    gate: Option<GateSide>,
}

impl SyntheticSource {
    /// Camera white balance of every synthetic image.
    pub const CAMERA_WB: ColorTemp = ColorTemp::new(5200.0, 1.0, 1.0);

    /// A Bayer source with the given sensor size.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            sensor_size: Dimensions::new(width.max(1), height.max(1)),
            info: SensorInfo::default(),
            camera_wb: Self::CAMERA_WB,
            frames: 1,
            current_frame: 0,
            flat_field_clip: None,
            probe: Arc::new(SourceProbe::default()),
            gate: None,
        }
    }

    /// Use another sensor layout.
    #[must_use]
    pub fn with_sensor(mut self, sensor: SensorType, monochrome: bool) -> Self {
        self.info = SensorInfo { sensor, monochrome };
        self
    }

    /// Pretend to be a multi-frame raw.
    #[must_use]
    pub fn with_frames(mut self, frames: u32) -> Self {
        self.frames = if frames == 0 { 1 } else { frames };
        self
    }

    /// Block every preprocess call until the returned gate releases it.
    #[must_use]
    pub fn gated(mut self) -> (Self, SourceGate) {
        let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        self.gate = Some(GateSide {
            entered: entered_tx,
            release: release_rx,
        });
        (
            self,
            SourceGate {
                entered: entered_rx,
                release: release_tx,
            },
        )
    }

    /// The probe recording this source's calls.
    #[must_use]
    pub fn probe(&self) -> Arc<SourceProbe> {
        Arc::clone(&self.probe)
    }

    /// Scene-referred value at a sensor position, before white balance.
    #[allow(clippy::cast_precision_loss)]
    fn neutral(&self, x: u32, y: u32) -> [f32; 3] {
        let fx = x as f32 / self.sensor_size.width as f32;
        let fy = y as f32 / self.sensor_size.height as f32;
        let value = [
            0.6f32.mul_add(fx, 0.1),
            0.5f32.mul_add(fy, 0.1),
            (0.25 * (1.0 - fx)).mul_add(fy, 0.35),
        ];
        if self.info.monochrome {
            let y = (value[0] + value[1] + value[2]) / 3.0;
            [y; 3]
        } else {
            value
        }
    }

    /// Raw value at a sensor position, as the camera recorded it.
    #[allow(clippy::cast_possible_truncation)]
    fn raw(&self, x: u32, y: u32) -> [f32; 3] {
        let camera = self.camera_wb.multipliers();
        let neutral = self.neutral(x, y);
        [0, 1, 2].map(|c| neutral[c] / camera[c] as f32)
    }

    fn grid_points(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let step_x = (self.sensor_size.width / STATS_GRID).max(1);
        let step_y = (self.sensor_size.height / STATS_GRID).max(1);
        (0..self.sensor_size.height)
            .step_by(step_y as usize)
            .flat_map(move |y| {
                (0..self.sensor_size.width)
                    .step_by(step_x as usize)
                    .map(move |x| (x, y))
            })
    }

    fn mean_raw(&self, points: impl Iterator<Item = (u32, u32)>) -> Option<[f64; 3]> {
        let mut sum = [0.0f64; 3];
        let mut count = 0u32;
        for (x, y) in points {
            let raw = self.raw(x, y);
            for (s, v) in sum.iter_mut().zip(raw) {
                *s += f64::from(v);
            }
            count += 1;
        }
        (count > 0).then(|| sum.map(|s| s / f64::from(count)))
    }
}

fn gray_world(mean: [f64; 3]) -> [f64; 3] {
    let [r, g, b] = mean.map(|v| v.max(1e-9));
    [g / r, 1.0, g / b]
}

impl ImageSource for SyntheticSource {
    fn sensor(&self) -> SensorInfo {
        self.info
    }

    fn full_size(&self, coarse: CoarseTransform) -> Dimensions {
        coarse.apply(self.sensor_size)
    }

    fn frame_count(&self) -> u32 {
        self.frames
    }

    fn select_frame(&mut self, frame: u32) {
        self.current_frame = frame.min(self.frames - 1);
    }

    fn preprocess(
        &mut self,
        raw: &RawParams,
        _lens: &LensProfileParams,
        _coarse: CoarseTransform,
    ) -> Result<(), SourceError> {
        self.probe.preprocess_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            // Both channels are only closed when the gate handle is gone.
            let _ = gate.entered.send(());
            let _ = gate.release.recv_timeout(GATE_TIMEOUT);
        }
        self.flat_field_clip = raw.flat_field.as_ref().map(|_| 0.94);
        Ok(())
    }

    fn flat_field_clip_value(&self) -> Option<f64> {
        self.flat_field_clip
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn raw_histogram(&self) -> Option<ChannelHistograms> {
        let mut hist = ChannelHistograms::new(BINS);
        let last = (BINS - 1) as f32;
        for (x, y) in self.grid_points() {
            let [r, g, b] = self.raw(x, y).map(|v| (v.clamp(0.0, 1.0) * last) as usize);
            hist.red[r] += 1;
            hist.green[g] += 1;
            hist.blue[b] += 1;
        }
        Some(hist)
    }

    fn demosaic(&mut self, raw: &RawParams) -> Result<DecodeInfo, SourceError> {
        self.probe.demosaic_calls.fetch_add(1, Ordering::SeqCst);
        if self.probe.fail_demosaic.load(Ordering::SeqCst) {
            return Err(SourceError::Decode("injected demosaic failure".to_owned()));
        }
        *self
            .probe
            .last_bayer_method
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(raw.bayer.method);

        let (dual, auto, contrast) = match self.info.sensor {
            SensorType::XTrans => (
                raw.xtrans.method.is_dual(),
                raw.xtrans.dual_demosaic_auto_contrast,
                raw.xtrans.dual_demosaic_contrast,
            ),
            _ => (
                raw.bayer.method.is_dual(),
                raw.bayer.dual_demosaic_auto_contrast,
                raw.bayer.dual_demosaic_contrast,
            ),
        };
        Ok(DecodeInfo {
            sensor: self.sensor_size,
            contrast_threshold: (dual && auto).then_some(contrast * 0.8),
        })
    }

    fn camera_white_balance(&self) -> ColorTemp {
        self.camera_wb
    }

    fn auto_white_balance_multipliers(&self) -> Option<[f64; 3]> {
        self.mean_raw(self.grid_points()).map(gray_world)
    }

    fn spot_white_balance(
        &self,
        points: &[(u32, u32)],
        coarse: CoarseTransform,
        equal: f64,
    ) -> Option<ColorTemp> {
        let full = coarse.apply(self.sensor_size);
        let inside = points
            .iter()
            .filter(|&&(x, y)| x < full.width && y < full.height)
            .map(|&(x, y)| coarse.to_sensor(x, y, self.sensor_size));
        self.mean_raw(inside)
            .map(|mean| ColorTemp::from_multipliers(gray_world(mean), equal, 0.0))
    }

    fn get_image(
        &self,
        wb: &ColorTemp,
        coarse: CoarseTransform,
        viewport: Viewport,
        _tone: &ToneCurveParams,
        dest: &mut Rgb32FImage,
    ) -> Result<(), SourceError> {
        self.probe.get_image_calls.fetch_add(1, Ordering::SeqCst);
        let full = coarse.apply(self.sensor_size);
        let out = viewport.output_dimensions();
        if !viewport.fits(full) || dest.dimensions() != (out.width, out.height) {
            return Err(SourceError::OutOfBounds(viewport));
        }
        let skip = viewport.skip.max(1);
        #[allow(clippy::cast_possible_truncation)]
        let multipliers = wb.multipliers().map(|m| m as f32);
        for (x, y, pixel) in dest.enumerate_pixels_mut() {
            let fx = (viewport.x + x * skip).min(full.width - 1);
            let fy = (viewport.y + y * skip).min(full.height - 1);
            let (sx, sy) = coarse.to_sensor(fx, fy, self.sensor_size);
            let raw = self.raw(sx, sy);
            pixel.0 = [0, 1, 2].map(|c| raw[c] * multipliers[c]);
        }
        Ok(())
    }

    fn convert_color_space(
        &self,
        _image: &mut Rgb32FImage,
        icm: &ColorManagementParams,
        _wb: &ColorTemp,
    ) -> Result<(), SourceError> {
        self.probe.convert_calls.fetch_add(1, Ordering::SeqCst);
        if self.probe.fail_color_conversion.load(Ordering::SeqCst) {
            return Err(SourceError::ColorConversion(format!(
                "no transform from {:?}",
                icm.input_profile
            )));
        }
        // Synthetic camera RGB is already expressed in the working space.
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn auto_exposure_histogram(&self) -> Result<Vec<u32>, SourceError> {
        self.probe.auto_exposure_calls.fetch_add(1, Ordering::SeqCst);
        let mut hist = vec![0u32; BINS];
        let last = (BINS - 1) as f32;
        for (x, y) in self.grid_points() {
            let [r, g, b] = self.neutral(x, y);
            let luma = 0.2126f32.mul_add(r, 0.7152f32.mul_add(g, 0.0722 * b));
            hist[((luma.clamp(0.0, 1.0) * last) as usize).min(BINS - 1)] += 1;
        }
        Ok(hist)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn camera_white_balance_restores_neutral() {
        let source = SyntheticSource::new(100, 50);
        let viewport = Viewport::full(Dimensions::new(100, 50), 10);
        let out = viewport.output_dimensions();
        let mut image = Rgb32FImage::new(out.width, out.height);
        source
            .get_image(
                &SyntheticSource::CAMERA_WB,
                CoarseTransform::default(),
                viewport,
                &ToneCurveParams::default(),
                &mut image,
            )
            .unwrap();
        let expected = source.neutral(50, 20);
        let got = image.get_pixel(5, 2).0;
        for (a, b) in got.iter().zip(expected) {
            assert!((a - b).abs() < 1e-5);
        }
        assert_eq!(source.probe().get_image_calls(), 1);
    }

    #[test]
    fn get_image_rejects_out_of_bounds() {
        let source = SyntheticSource::new(100, 50);
        let viewport = Viewport {
            x: 90,
            y: 0,
            width: 20,
            height: 10,
            skip: 1,
        };
        let mut image = Rgb32FImage::new(20, 10);
        let err = source
            .get_image(
                &ColorTemp::D65,
                CoarseTransform::default(),
                viewport,
                &ToneCurveParams::default(),
                &mut image,
            )
            .unwrap_err();
        assert_eq!(err, SourceError::OutOfBounds(viewport));
    }

    #[test]
    fn rotated_source_swaps_full_size() {
        let source = SyntheticSource::new(400, 300);
        let coarse = CoarseTransform::new(90, false, false);
        assert_eq!(source.full_size(coarse), Dimensions::new(300, 400));
        assert_eq!(source.preview_size(coarse, 10), Dimensions::new(30, 40));
    }

    #[test]
    fn demosaic_records_method_and_fails_on_request() {
        let mut source = SyntheticSource::new(10, 10);
        let probe = source.probe();
        let mut raw = RawParams::default();
        raw.bayer.method = BayerDemosaic::Fast;
        source.demosaic(&raw).unwrap();
        assert_eq!(probe.last_demosaic(), Some(BayerDemosaic::Fast));

        probe.set_fail_demosaic(true);
        assert!(matches!(
            source.demosaic(&raw),
            Err(SourceError::Decode(_))
        ));
        assert_eq!(probe.demosaic_calls(), 2);
    }

    #[test]
    fn dual_demosaic_reports_contrast() {
        let mut source = SyntheticSource::new(10, 10);
        let mut raw = RawParams::default();
        raw.bayer.method = BayerDemosaic::AmazeVng4;
        let info = source.demosaic(&raw).unwrap();
        assert!(info.contrast_threshold.is_some());
        raw.bayer.method = BayerDemosaic::Amaze;
        assert!(source.demosaic(&raw).unwrap().contrast_threshold.is_none());
    }

    #[test]
    fn auto_exposure_histogram_counts_grid() {
        let source = SyntheticSource::new(640, 640);
        let hist = source.auto_exposure_histogram().unwrap();
        assert_eq!(hist.iter().sum::<u32>(), 64 * 64);
    }

    #[test]
    fn spot_white_balance_ignores_points_outside() {
        let source = SyntheticSource::new(10, 10);
        assert!(
            source
                .spot_white_balance(&[(50, 50)], CoarseTransform::default(), 1.0)
                .is_none()
        );
        assert!(
            source
                .spot_white_balance(&[(5, 5)], CoarseTransform::default(), 1.0)
                .is_some()
        );
    }
}
