//! Crop windows: views of a region of the image at their own detail.
//!
//! A crop window reads its region straight from the image source at its
//! own skip and replays the preview stages on it, reusing the curves and
//! the monitor transform the main run just built. Windows are refreshed
//! after the main pipeline, never during it.
//!
//! A detail window at skip 1 wants full-detail raw data. It asks its host
//! through [`CropHost::request_full_detail`]; while a run is in progress
//! the host defers the request to the next run instead of starting one.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::change::ChangeMask;
use crate::color::{ColorTemp, MonitorTransform};
use crate::curves::{LabCurves, ToneCurves};
use crate::ops::{
    GeometryMap, LocalContrast, RgbOptions, Sampling, lab_to_display, refine_lab, rgb_to_lab,
    tone_map, transform_between,
};
use crate::params::ProcParams;
use crate::source::{ImageSource, SourceError, Viewport};
use crate::types::{Dimensions, LabImage, Rgb32FImage, RgbImage};

slotmap::new_key_type! {
    /// Handle of a registered crop window.
    pub struct CropHandle;
}

/// A rectangle in full-resolution image coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CropArea {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropArea {
    #[must_use]
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The part of this area inside an image of size `full`, or `None`
    /// when nothing is left.
    #[must_use]
    pub fn clamped(self, full: Dimensions) -> Option<Self> {
        let x = self.x.min(full.width);
        let y = self.y.min(full.height);
        let width = self.width.min(full.width - x);
        let height = self.height.min(full.height - y);
        (width > 0 && height > 0).then_some(Self::new(x, y, width, height))
    }

    const fn viewport(self, skip: u32) -> Viewport {
        Viewport {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            skip,
        }
    }
}

/// Receives the images of one crop window.
pub trait CropListener: Send + Sync {
    /// A new monitor-space image of `area`, sampled every `skip` pixels.
    fn crop_image_ready(&self, image: &RgbImage, area: CropArea, skip: u32);
}

/// What a crop window may ask of the coordinator that owns it.
pub trait CropHost {
    /// Whether the last raw decode ran at full detail.
    fn high_quality_computed(&self) -> bool;

    /// Ask for a full-detail raw decode.
    fn request_full_detail(&self);
}

/// Everything a crop update reads from the finished main run.
#[derive(Clone, Copy)]
pub struct CropInputs<'a> {
    pub source: &'a dyn ImageSource,
    pub params: &'a ProcParams,
    /// White balance the main run resolved.
    pub wb: &'a ColorTemp,
    pub tone_curves: &'a ToneCurves,
    pub lab_curves: &'a LabCurves,
    pub monitor: &'a MonitorTransform,
    /// Full image size after the coarse transform.
    pub full: Dimensions,
}

#[derive(Debug)]
struct CropBuffers {
    fetched: Rgb32FImage,
    working: Rgb32FImage,
    lab: LabImage,
    refined: LabImage,
    display: RgbImage,
}

impl CropBuffers {
    fn new(size: Dimensions) -> Self {
        let (w, h) = (size.width, size.height);
        Self {
            fetched: Rgb32FImage::new(w, h),
            working: Rgb32FImage::new(w, h),
            lab: LabImage::new(w, h),
            refined: LabImage::new(w, h),
            display: RgbImage::new(w, h),
        }
    }

    fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.display.width(), self.display.height())
    }
}

/// A registered crop window.
pub struct CropWindow {
    area: CropArea,
    skip: u32,
    detail_window: bool,
    listener: Option<Arc<dyn CropListener>>,
    force_update: bool,
    buffers: Option<CropBuffers>,
    refined_valid: bool,
}

impl CropWindow {
    /// A window with an empty area at skip 1.
    #[must_use]
    pub const fn new(detail_window: bool) -> Self {
        Self {
            area: CropArea::new(0, 0, 0, 0),
            skip: 1,
            detail_window,
            listener: None,
            force_update: true,
            buffers: None,
            refined_valid: false,
        }
    }

    #[must_use]
    pub const fn area(&self) -> CropArea {
        self.area
    }

    #[must_use]
    pub const fn skip(&self) -> u32 {
        self.skip
    }

    #[must_use]
    pub const fn is_detail_window(&self) -> bool {
        self.detail_window
    }

    #[must_use]
    pub const fn has_listener(&self) -> bool {
        self.listener.is_some()
    }

    /// Whether the window was moved or rewired since its last update.
    #[must_use]
    pub const fn needs_refresh(&self) -> bool {
        self.force_update
    }

    /// Move or resize the window; the next update recomputes it fully.
    pub fn set_window(&mut self, area: CropArea, skip: u32) {
        self.area = area;
        self.skip = skip.max(1);
        self.force_update = true;
    }

    pub fn set_listener(&mut self, listener: Option<Arc<dyn CropListener>>) {
        self.listener = listener;
        self.force_update = true;
    }

    /// Refresh the window after a main run and deliver the image.
    ///
    /// Only the monitor conversion is redone when the window is current
    /// and `changes` touches nothing but the monitor transform. Returns
    /// whether the listener received an image.
    ///
    /// # Errors
    ///
    /// Returns the collaborator's error if reading or converting the
    /// region fails; the window is then fully recomputed next time.
    pub fn update(
        &mut self,
        changes: ChangeMask,
        geometry_changed: bool,
        inputs: &CropInputs<'_>,
        host: &dyn CropHost,
    ) -> Result<bool, SourceError> {
        let Some(listener) = self.listener.clone() else {
            return Ok(false);
        };
        if self.detail_window && self.skip == 1 && !host.high_quality_computed() {
            debug!("detail window at skip 1 requests full detail");
            host.request_full_detail();
        }
        let Some(area) = self.area.clamped(inputs.full) else {
            trace!(area = ?self.area, "crop window outside the image");
            return Ok(false);
        };

        let out = area.viewport(self.skip).output_dimensions();
        if self.buffers.as_ref().map(CropBuffers::dimensions) != Some(out) {
            self.buffers = Some(CropBuffers::new(out));
            self.refined_valid = false;
        }
        let buffers = self.buffers.get_or_insert_with(|| CropBuffers::new(out));

        let monitor_only = !geometry_changed
            && !self.force_update
            && self.refined_valid
            && changes
                .difference(ChangeMask::MONITOR | ChangeMask::VOID)
                .is_empty();
        if !monitor_only {
            self.refined_valid = false;
            recompute(buffers, area, self.skip, inputs)?;
            self.refined_valid = true;
        }

        lab_to_display(&buffers.refined, inputs.monitor, &mut buffers.display, None);
        self.force_update = false;
        trace!(?area, skip = self.skip, monitor_only, "crop window updated");
        listener.crop_image_ready(&buffers.display, area, self.skip);
        Ok(true)
    }
}

impl std::fmt::Debug for CropWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CropWindow")
            .field("area", &self.area)
            .field("skip", &self.skip)
            .field("detail_window", &self.detail_window)
            .field("listener", &self.listener.is_some())
            .field("force_update", &self.force_update)
            .finish_non_exhaustive()
    }
}

/// Run the preview stages on one window.
fn recompute(
    buffers: &mut CropBuffers,
    area: CropArea,
    skip: u32,
    inputs: &CropInputs<'_>,
) -> Result<(), SourceError> {
    let params = inputs.params;
    let map = GeometryMap::new(params, inputs.full);
    let footprint = if map.is_geometric() {
        source_footprint(&map, area, inputs.full)
    } else {
        area
    };

    let fetch = footprint.viewport(skip);
    let fetch_size = fetch.output_dimensions();
    if buffers.fetched.dimensions() != (fetch_size.width, fetch_size.height) {
        buffers.fetched = Rgb32FImage::new(fetch_size.width, fetch_size.height);
    }
    inputs.source.get_image(
        inputs.wb,
        params.coarse(),
        fetch,
        &params.tone_curve,
        &mut buffers.fetched,
    )?;
    inputs
        .source
        .convert_color_space(&mut buffers.fetched, &params.color_management, inputs.wb)?;
    if params.fattal.enabled || params.dehaze.enabled {
        tone_map(&mut buffers.fetched, &params.fattal, &params.dehaze);
    }

    let skip = f64::from(skip);
    let from = Sampling {
        origin: (f64::from(footprint.x), f64::from(footprint.y)),
        skip,
    };
    let at = Sampling {
        origin: (f64::from(area.x), f64::from(area.y)),
        skip,
    };
    transform_between(&buffers.fetched, from, &mut buffers.working, at, &map);

    rgb_to_lab(
        &buffers.working,
        &mut buffers.lab,
        inputs.tone_curves,
        RgbOptions {
            mixer: &params.channel_mixer,
            black_white: params.black_white.enabled,
            working: params.color_management.working_profile,
        },
    );
    refine_lab(
        &buffers.lab,
        &mut buffers.refined,
        inputs.lab_curves,
        &params.vibrance,
        LocalContrast::at(&params.local_contrast, skip),
    );
    Ok(())
}

/// Bounding box of the source pixels an output area reads, padded for
/// interpolation and clamped to the image.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::similar_names
)]
fn source_footprint(map: &GeometryMap, area: CropArea, full: Dimensions) -> CropArea {
    const STEPS: u32 = 16;
    const PAD: f64 = 2.0;

    let (x0, y0) = (f64::from(area.x), f64::from(area.y));
    let (w, h) = (f64::from(area.width), f64::from(area.height));
    let mut min = (f64::INFINITY, f64::INFINITY);
    let mut max = (f64::NEG_INFINITY, f64::NEG_INFINITY);
    for i in 0..=STEPS {
        let t = f64::from(i) / f64::from(STEPS);
        let edges = [
            (w.mul_add(t, x0), y0),
            (w.mul_add(t, x0), y0 + h),
            (x0, h.mul_add(t, y0)),
            (x0 + w, h.mul_add(t, y0)),
        ];
        for (x, y) in edges {
            let (sx, sy) = map.source(x, y);
            min = (min.0.min(sx), min.1.min(sy));
            max = (max.0.max(sx), max.1.max(sy));
        }
    }

    let (fw, fh) = (f64::from(full.width), f64::from(full.height));
    let left = (min.0 - PAD).floor().clamp(0.0, fw - 1.0);
    let top = (min.1 - PAD).floor().clamp(0.0, fh - 1.0);
    let right = (max.0 + PAD).ceil().clamp(left + 1.0, fw);
    let bottom = (max.1 + PAD).ceil().clamp(top + 1.0, fh);
    CropArea::new(
        left as u32,
        top as u32,
        (right - left) as u32,
        (bottom - top) as u32,
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::color::{BuiltinProfiles, MonitorSettings};
    use crate::curves::ExposureSettings;
    use crate::synthetic::SyntheticSource;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(Dimensions, CropArea, u32)>>);

    impl CropListener for Recorder {
        fn crop_image_ready(&self, image: &RgbImage, area: CropArea, skip: u32) {
            let size = Dimensions::new(image.width(), image.height());
            self.0.lock().unwrap().push((size, area, skip));
        }
    }

    struct Host {
        high_quality: bool,
        requested: AtomicBool,
    }

    impl Host {
        const fn new(high_quality: bool) -> Self {
            Self {
                high_quality,
                requested: AtomicBool::new(false),
            }
        }
    }

    impl CropHost for Host {
        fn high_quality_computed(&self) -> bool {
            self.high_quality
        }

        fn request_full_detail(&self) {
            self.requested.store(true, Ordering::SeqCst);
        }
    }

    struct Fixture {
        source: SyntheticSource,
        params: ProcParams,
        tone: ToneCurves,
        lab: LabCurves,
        monitor: MonitorTransform,
    }

    impl Fixture {
        fn new(params: ProcParams) -> Self {
            let exposure = ExposureSettings::from_params(&params.tone_curve);
            Self {
                source: SyntheticSource::new(400, 300),
                tone: ToneCurves::build(&exposure, &params.tone_curve, &params.rgb_curves),
                lab: LabCurves::build(&params.lab_curve, &[]),
                monitor: MonitorTransform::build(
                    &BuiltinProfiles,
                    &MonitorSettings::default(),
                    &params.color_management,
                )
                .unwrap(),
                params,
            }
        }

        fn inputs(&self) -> CropInputs<'_> {
            CropInputs {
                source: &self.source,
                params: &self.params,
                wb: &SyntheticSource::CAMERA_WB,
                tone_curves: &self.tone,
                lab_curves: &self.lab,
                monitor: &self.monitor,
                full: Dimensions::new(400, 300),
            }
        }
    }

    fn window(recorder: &Arc<Recorder>, area: CropArea, skip: u32) -> CropWindow {
        let mut window = CropWindow::new(false);
        window.set_window(area, skip);
        let listener: Arc<dyn CropListener> = recorder.clone();
        window.set_listener(Some(listener));
        window
    }

    #[test]
    fn without_listener_nothing_happens() {
        let fixture = Fixture::new(ProcParams::default());
        let mut window = CropWindow::new(true);
        window.set_window(CropArea::new(0, 0, 50, 50), 1);
        let host = Host::new(false);
        let updated = window
            .update(ChangeMask::ALL, true, &fixture.inputs(), &host)
            .unwrap();
        assert!(!updated);
        assert!(!host.requested.load(Ordering::SeqCst));
        assert_eq!(fixture.source.probe().get_image_calls(), 0);
    }

    #[test]
    fn delivers_image_at_window_skip() {
        let fixture = Fixture::new(ProcParams::default());
        let recorder = Arc::new(Recorder::default());
        let mut window = window(&recorder, CropArea::new(100, 50, 101, 60), 2);
        let host = Host::new(true);

        assert!(
            window
                .update(ChangeMask::NONE, false, &fixture.inputs(), &host)
                .unwrap()
        );
        let delivered = recorder.0.lock().unwrap().clone();
        assert_eq!(
            delivered,
            vec![(Dimensions::new(51, 30), CropArea::new(100, 50, 101, 60), 2)]
        );
    }

    #[test]
    fn monitor_change_only_reconverts() {
        let fixture = Fixture::new(ProcParams::default());
        let probe = fixture.source.probe();
        let recorder = Arc::new(Recorder::default());
        let mut window = window(&recorder, CropArea::new(0, 0, 80, 80), 4);
        let host = Host::new(true);

        window
            .update(ChangeMask::ALL, false, &fixture.inputs(), &host)
            .unwrap();
        assert_eq!(probe.get_image_calls(), 1);

        window
            .update(ChangeMask::MONITOR, false, &fixture.inputs(), &host)
            .unwrap();
        assert_eq!(probe.get_image_calls(), 1);

        window
            .update(ChangeMask::MONITOR, true, &fixture.inputs(), &host)
            .unwrap();
        assert_eq!(probe.get_image_calls(), 2);
        assert_eq!(recorder.0.lock().unwrap().len(), 3);
    }

    #[test]
    fn moving_the_window_forces_recompute() {
        let fixture = Fixture::new(ProcParams::default());
        let probe = fixture.source.probe();
        let recorder = Arc::new(Recorder::default());
        let mut window = window(&recorder, CropArea::new(0, 0, 80, 80), 4);
        let host = Host::new(true);
        window
            .update(ChangeMask::NONE, false, &fixture.inputs(), &host)
            .unwrap();

        window.set_window(CropArea::new(40, 40, 80, 80), 4);
        window
            .update(ChangeMask::MONITOR, false, &fixture.inputs(), &host)
            .unwrap();
        assert_eq!(probe.get_image_calls(), 2);
    }

    #[test]
    fn detail_window_requests_full_detail_once_needed() {
        let fixture = Fixture::new(ProcParams::default());
        let recorder = Arc::new(Recorder::default());
        let mut window = CropWindow::new(true);
        window.set_window(CropArea::new(0, 0, 40, 40), 1);
        let listener: Arc<dyn CropListener> = recorder.clone();
        window.set_listener(Some(listener));

        let reduced = Host::new(false);
        window
            .update(ChangeMask::NONE, false, &fixture.inputs(), &reduced)
            .unwrap();
        assert!(reduced.requested.load(Ordering::SeqCst));

        let full = Host::new(true);
        window
            .update(ChangeMask::NONE, false, &fixture.inputs(), &full)
            .unwrap();
        assert!(!full.requested.load(Ordering::SeqCst));
    }

    #[test]
    fn area_is_clamped_to_the_image() {
        assert_eq!(
            CropArea::new(350, 250, 100, 100).clamped(Dimensions::new(400, 300)),
            Some(CropArea::new(350, 250, 50, 50))
        );
        assert_eq!(
            CropArea::new(500, 0, 10, 10).clamped(Dimensions::new(400, 300)),
            None
        );
    }

    #[test]
    fn rotated_window_reads_a_larger_footprint() {
        let mut params = ProcParams::default();
        params.rotate.degrees = 10.0;
        let fixture = Fixture::new(params);
        let map = GeometryMap::new(&fixture.params, fixture.inputs().full);
        let area = CropArea::new(150, 100, 100, 100);
        let footprint = source_footprint(&map, area, fixture.inputs().full);
        assert!(footprint.width > area.width);
        assert!(footprint.x < area.x);

        let recorder = Arc::new(Recorder::default());
        let mut window = window(&recorder, area, 1);
        window
            .update(ChangeMask::ALL, true, &fixture.inputs(), &Host::new(true))
            .unwrap();
        assert_eq!(recorder.0.lock().unwrap()[0].0, Dimensions::new(100, 100));
    }

    #[test]
    fn failing_conversion_invalidates_the_window() {
        let fixture = Fixture::new(ProcParams::default());
        let probe = fixture.source.probe();
        let recorder = Arc::new(Recorder::default());
        let mut window = window(&recorder, CropArea::new(0, 0, 40, 40), 2);
        let host = Host::new(true);
        window
            .update(ChangeMask::NONE, false, &fixture.inputs(), &host)
            .unwrap();

        probe.set_fail_color_conversion(true);
        assert!(
            window
                .update(ChangeMask::COLOR, false, &fixture.inputs(), &host)
                .is_err()
        );
        probe.set_fail_color_conversion(false);
        window
            .update(ChangeMask::MONITOR, false, &fixture.inputs(), &host)
            .unwrap();
        assert_eq!(probe.get_image_calls(), 3);
    }
}
