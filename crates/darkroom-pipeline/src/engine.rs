//! Run execution.
//!
//! The [`Engine`] owns everything a run touches: the image source, the
//! preview buffers, the detail memo, crop windows and the values derived
//! during earlier runs (resolved white balance, exposure, curves, monitor
//! transform). The coordinator keeps it behind the run lock, so exactly one
//! run or run-lock query uses it at a time.
//!
//! A run receives an immutable parameter snapshot and the coalesced change
//! mask. It decides once, before the main block, whether full detail is
//! needed, then walks the stages in order. Each executed stage ORs its
//! structural cascade into the running mask, so later stages see what an
//! earlier one made stale.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, trace, warn};
use web_time::Instant;

use crate::buffers::{PreviewState, ScaleOutcome};
use crate::change::ChangeMask;
use crate::color::{
    BuiltinProfiles, ColorTemp, MonitorSettings, MonitorTransform, OutputProfileKey, ProfileStore,
};
use crate::config::CoordinatorConfig;
use crate::crop::{CropArea, CropHandle, CropHost, CropInputs, CropWindow};
use crate::curves::{ExposureSettings, LabCurves, ToneCurves, auto_exposure};
use crate::diagnostics::{RunDiagnostics, RunOutcome};
use crate::histogram::{
    ChannelHistograms, Histograms, PreviewRect, accumulate, luminance_histogram,
};
use crate::listener::Listeners;
use crate::ops::{
    GeometryMap, LocalContrast, RgbOptions, Sampling, fill_scale, lab_to_display, refine_lab,
    rgb_to_lab, tone_map, transform,
};
use crate::params::{
    CropParams, ProcParams, WhiteBalanceMethod, WhiteBalanceParams, is_panning_change,
};
use crate::plan::{
    DetailMemo, converts_to_monitor, crop_needs_update, enters_main_block, fast_path_raw_params,
    high_detail_needed, highlight_redemosaic, publishes, with_crop_cascade,
};
use crate::source::{CoarseTransform, ImageSource, SensorType, Viewport};
use crate::stage::Stage;
use crate::types::{Dimensions, ProcessError, RunResult};

/// The slot a run publishes its result into.
pub type Publication = RwLock<Option<Arc<RunResult>>>;

/// What a run needs from the coordinator besides the snapshot.
pub struct RunContext<'a> {
    /// Listener snapshot for this run.
    pub listeners: &'a Listeners,
    pub published: &'a Publication,
    /// Called when a detail window asks for full detail.
    pub request_full_detail: &'a dyn Fn(),
}

/// One unit of work taken from the pending state.
#[derive(Debug, Clone)]
pub struct RunJob {
    pub params: ProcParams,
    pub monitor: MonitorSettings,
    pub version: u64,
    pub changes: ChangeMask,
}

/// What a run reports back.
#[derive(Debug)]
pub struct RunReport {
    pub diagnostics: RunDiagnostics,
    /// Stages a failed run left stale; empty after a successful run.
    pub carry: ChangeMask,
}

/// Auto white balance, remembered for the inputs it was computed with.
#[derive(Debug, Clone, Copy)]
struct AutoWhiteBalance {
    equal: u64,
    temp_bias: u64,
    wb: ColorTemp,
}

/// Per-run state.
struct Run {
    params: ProcParams,
    version: u64,
    todo: ChangeMask,
    geometry_changed: bool,
    high_detail: bool,
    diag: RunDiagnostics,
}

impl Run {
    fn finish(&mut self, stage: Stage, started: Instant, detail: impl Into<String>) {
        self.diag.record(stage, started.elapsed(), detail);
        self.todo |= stage.invalidates();
    }
}

/// Log and report the start of a stage.
fn enter(stage: Stage, listeners: &Listeners) -> Instant {
    trace!(stage = stage.label(), "stage started");
    if let Some(progress) = &listeners.progress {
        #[allow(clippy::cast_precision_loss)]
        let fraction = (stage.index() + 1) as f64 / Stage::ALL.len() as f64;
        progress.set_progress(stage.label(), fraction);
    }
    Instant::now()
}

/// Crop host seen by crop windows during a run.
struct RunCropHost<'a> {
    high_quality: bool,
    request: &'a dyn Fn(),
}

impl CropHost for RunCropHost<'_> {
    fn high_quality_computed(&self) -> bool {
        self.high_quality
    }

    fn request_full_detail(&self) {
        (self.request)();
    }
}

/// Pipeline state guarded by the run lock.
pub struct Engine {
    config: CoordinatorConfig,
    source: Option<Box<dyn ImageSource>>,
    profiles: Box<dyn ProfileStore>,
    /// Whether a demosaic succeeded since the source was assigned.
    primed: bool,
    /// Snapshot of the last successful run.
    committed: Option<ProcParams>,
    requested_scale: u32,
    preview: PreviewState,
    memo: DetailMemo,
    crops: slotmap::SlotMap<CropHandle, CropWindow>,

    wb: ColorTemp,
    auto_wb: Option<AutoWhiteBalance>,
    exposure: ExposureSettings,
    tone_curves: ToneCurves,
    luma_histogram: Vec<u32>,
    lab_curves: LabCurves,
    monitor_settings: MonitorSettings,
    monitor: Option<MonitorTransform>,
    monitor_key: Option<OutputProfileKey>,
    raw_histogram: Option<ChannelHistograms>,
    histograms: Option<Histograms>,
}

impl Engine {
    #[must_use]
    pub fn new(config: CoordinatorConfig) -> Self {
        let params = ProcParams::default();
        let exposure = ExposureSettings::from_params(&params.tone_curve);
        Self {
            requested_scale: config.initial_scale,
            config,
            source: None,
            profiles: Box::new(BuiltinProfiles),
            primed: false,
            committed: None,
            preview: PreviewState::new(),
            memo: DetailMemo::default(),
            crops: slotmap::SlotMap::with_key(),
            wb: ColorTemp::D65,
            auto_wb: None,
            tone_curves: ToneCurves::build(&exposure, &params.tone_curve, &params.rgb_curves),
            exposure,
            luma_histogram: Vec::new(),
            lab_curves: LabCurves::build(&params.lab_curve, &[]),
            monitor_settings: MonitorSettings::default(),
            monitor: None,
            monitor_key: None,
            raw_histogram: None,
            histograms: None,
        }
    }

    /// Replace the image source. Everything derived from the old source is
    /// forgotten; the next run processes the image from scratch.
    pub fn assign(&mut self, source: Box<dyn ImageSource>) {
        info!(
            full = %source.full_size(CoarseTransform::default()),
            sensor = ?source.sensor().sensor,
            "image source assigned"
        );
        self.source = Some(source);
        self.primed = false;
        self.committed = None;
        self.memo.reset();
        self.auto_wb = None;
        self.raw_histogram = None;
        self.histograms = None;
    }

    pub fn set_profile_store(&mut self, store: Box<dyn ProfileStore>) {
        self.profiles = store;
        self.monitor_key = None;
    }

    /// Execute one run.
    ///
    /// Never panics on collaborator failure: the error is reported through
    /// the progress listener and the diagnostics, the published result is
    /// left alone and the stale stages come back as [`RunReport::carry`].
    pub fn run(&mut self, job: RunJob, ctx: &RunContext<'_>) -> RunReport {
        let started = Instant::now();
        let RunJob {
            params,
            monitor,
            version,
            changes,
        } = job;
        self.monitor_settings = monitor;
        let mut run = Run {
            params,
            version,
            todo: changes,
            geometry_changed: false,
            high_detail: false,
            diag: RunDiagnostics::new(version, changes),
        };

        let Some(mut source) = self.source.take() else {
            debug!(version, ?changes, "no image source; run skipped");
            return RunReport {
                diagnostics: run.diag,
                carry: changes,
            };
        };
        debug!(version, ?changes, "run started");
        let result = self.execute(source.as_mut(), &mut run, ctx);
        self.source = Some(source);

        run.diag.preview = self.preview.preview_size();
        run.diag.scale = self.preview.scale();
        run.diag.total_duration = started.elapsed();
        let Run {
            params,
            todo,
            mut diag,
            ..
        } = run;

        let carry = match result {
            Ok(published) => {
                diag.outcome = if published {
                    RunOutcome::Published
                } else {
                    RunOutcome::NotPublished
                };
                self.committed = Some(params);
                debug!(
                    version,
                    stages = diag.stages.len(),
                    published,
                    elapsed_ms = diag.total_duration.as_secs_f64() * 1000.0,
                    "run finished"
                );
                ChangeMask::NONE
            }
            Err(err) => {
                let message = err.to_string();
                warn!(version, error = %message, "run failed; keeping the previous result");
                if let Some(progress) = &ctx.listeners.progress {
                    progress.error(&message);
                }
                diag.outcome = RunOutcome::Failed(message);
                todo
            }
        };

        if let Some(listener) = &ctx.listeners.diagnostics {
            listener.run_finished(&diag);
        }
        RunReport {
            diagnostics: diag,
            carry,
        }
    }

    fn execute(
        &mut self,
        source: &mut dyn ImageSource,
        run: &mut Run,
        ctx: &RunContext<'_>,
    ) -> Result<bool, ProcessError> {
        if !self.primed {
            run.todo |= ChangeMask::ALL;
        }
        run.geometry_changed = self
            .committed
            .as_ref()
            .is_none_or(|previous| is_panning_change(previous, &run.params));
        run.todo = with_crop_cascade(run.todo, run.params.needs_pc_vignetting());
        run.high_detail = high_detail_needed(
            run.todo,
            self.config.preview_demosaic,
            self.crops.values().map(CropWindow::skip),
        );
        run.diag.geometry_changed = run.geometry_changed;
        run.diag.high_detail = run.high_detail;

        if enters_main_block(
            run.todo,
            run.geometry_changed,
            run.high_detail,
            self.config.preview_demosaic,
        ) {
            self.main_block(source, run, ctx)?;
        }

        self.update_crops(source, run, ctx)?;

        if !publishes(run.todo, run.geometry_changed) {
            return Ok(false);
        }
        self.publish(run, ctx)?;
        Ok(true)
    }

    fn main_block(
        &mut self,
        source: &mut dyn ImageSource,
        run: &mut Run,
        ctx: &RunContext<'_>,
    ) -> Result<(), ProcessError> {
        let listeners = ctx.listeners;
        if let Some(listener) = &listeners.frame_count {
            listener.frame_count_changed(source.frame_count(), run.params.raw.bayer.image_num);
        }
        if let Some(listener) = &listeners.image_type {
            listener.image_type_changed(source.sensor());
        }

        self.raw_stages(source, run, listeners)?;
        self.white_balance_stage(source, run, ctx)?;
        self.preview_stages(&*source, run, listeners)?;
        self.monitor_stage(run, listeners)?;
        Ok(())
    }

    /// Preprocess, demosaic and retinex.
    fn raw_stages(
        &mut self,
        source: &mut dyn ImageSource,
        run: &mut Run,
        listeners: &Listeners,
    ) -> Result<(), ProcessError> {
        let high = run.high_detail;
        let raw = fast_path_raw_params(&run.params.raw, high);
        let detail = if high { "full detail" } else { "fast" };

        if self.memo.needs_preprocess(run.todo, high) {
            let started = enter(Stage::Preprocess, listeners);
            source.select_frame(run.params.raw.bayer.image_num);
            source.preprocess(&raw, &run.params.lens_profile, run.params.coarse())?;
            if run.params.raw.flat_field_auto_clip
                && let (Some(listener), Some(clip)) =
                    (&listeners.flat_field, source.flat_field_clip_value())
            {
                listener.flat_field_clip_changed(clip);
            }
            self.raw_histogram = source.raw_histogram();
            self.memo.record_preprocess(high);
            run.finish(Stage::Preprocess, started, detail);
        }

        let redemosaic = highlight_redemosaic(&run.params.tone_curve, source.is_rgb_source_modified());
        if self.memo.needs_demosaic(run.todo, high) || redemosaic {
            let started = enter(Stage::Demosaic, listeners);
            let info = source.demosaic(&raw)?;
            let (method, auto_contrast) = match source.sensor().sensor {
                SensorType::XTrans => (
                    format!("{:?}", raw.xtrans.method),
                    raw.xtrans.dual_demosaic_auto_contrast,
                ),
                _ => (
                    format!("{:?}", raw.bayer.method),
                    raw.bayer.dual_demosaic_auto_contrast,
                ),
            };
            if auto_contrast
                && let (Some(listener), Some(threshold)) =
                    (&listeners.auto_contrast, info.contrast_threshold)
            {
                listener.contrast_threshold_changed(threshold);
            }
            if run.params.retinex.enabled {
                source.prepare_retinex(&run.params.retinex, &run.params.color_management)?;
            }
            self.memo.record_demosaic(high);
            self.primed = true;
            self.auto_wb = None;
            run.finish(Stage::Demosaic, started, format!("{method} ({detail})"));
        }

        if run.params.retinex.enabled && run.todo.intersects(Stage::Retinex.triggers()) {
            let started = enter(Stage::Retinex, listeners);
            let stats = source.retinex(&run.params.retinex)?;
            if let Some(listener) = &listeners.retinex {
                listener.retinex_stats_changed(stats);
            }
            run.finish(Stage::Retinex, started, "");
        }
        Ok(())
    }

    /// Highlight recovery, white balance, preview scale and extraction of
    /// the working-space preview.
    fn white_balance_stage(
        &mut self,
        source: &mut dyn ImageSource,
        run: &mut Run,
        ctx: &RunContext<'_>,
    ) -> Result<(), ProcessError> {
        if !run.todo.intersects(Stage::WhiteBalance.triggers()) {
            return Ok(());
        }
        let started = enter(Stage::WhiteBalance, ctx.listeners);
        source.highlight_recovery(&run.params.tone_curve);
        self.wb = self.resolve_white_balance(&*source, &run.params.white_balance, ctx.listeners);

        let coarse = run.params.coarse();
        let outcome = self.apply_scale(&*source, coarse, ctx.listeners, ctx.published);
        let full = source.full_size(coarse);
        let buffers = self
            .preview
            .buffers_mut()
            .ok_or(ProcessError::NotAllocated)?;
        source.get_image(
            &self.wb,
            coarse,
            Viewport::full(full, outcome.scale),
            &run.params.tone_curve,
            &mut buffers.raw,
        )?;
        source.convert_color_space(&mut buffers.raw, &run.params.color_management, &self.wb)?;
        run.finish(
            Stage::WhiteBalance,
            started,
            format!(
                "{:.0}K, {} at scale {}",
                self.wb.temperature, outcome.preview, outcome.scale
            ),
        );
        Ok(())
    }

    /// Tone mapping, geometry, exposure and curves, Lab refinement.
    fn preview_stages(
        &mut self,
        source: &dyn ImageSource,
        run: &mut Run,
        listeners: &Listeners,
    ) -> Result<(), ProcessError> {
        let scale = self.preview.scale();
        let full = self.preview.full_size();
        let buffers = self
            .preview
            .buffers_mut()
            .ok_or(ProcessError::NotAllocated)?;
        let params = &run.params;

        if run.todo.intersects(Stage::ToneMap.triggers())
            && (params.fattal.enabled || params.dehaze.enabled)
        {
            let started = enter(Stage::ToneMap, listeners);
            tone_map(&mut buffers.raw, &params.fattal, &params.dehaze);
            run.diag.record(Stage::ToneMap, started.elapsed(), "");
            run.todo |= Stage::ToneMap.invalidates();
        }

        if run.todo.intersects(Stage::Transform.triggers()) {
            let started = enter(Stage::Transform, listeners);
            let detail = if params.needs_transform() {
                let map = GeometryMap::new(params, full);
                let (src, dest) = buffers.transform_pair();
                transform(src, dest, &map, Sampling::preview(scale));
                "warped"
            } else {
                buffers.alias_working();
                "aliased"
            };
            run.diag.record(Stage::Transform, started.elapsed(), detail);
            run.todo |= Stage::Transform.invalidates();
        }

        if run.todo.intersects(Stage::ExposureCurve.triggers()) {
            let started = enter(Stage::ExposureCurve, listeners);
            let tone = &params.tone_curve;
            if !tone.auto_exposure {
                self.exposure = ExposureSettings::from_params(tone);
            } else if run.todo.contains(ChangeMask::AUTO_EXP) {
                let histogram = source.auto_exposure_histogram()?;
                self.exposure = auto_exposure(&histogram, tone.clip);
                if let Some(listener) = &listeners.auto_exposure {
                    listener.auto_exposure_changed(&self.exposure);
                }
            }
            self.tone_curves = ToneCurves::build(&self.exposure, tone, &params.rgb_curves);
            run.diag.record(
                Stage::ExposureCurve,
                started.elapsed(),
                format!("{:+.2} EV", self.exposure.compensation),
            );
        }

        if run.todo.intersects(Stage::RgbCurves.triggers()) {
            let started = enter(Stage::RgbCurves, listeners);
            let (working, lab) = buffers.rgb_pair();
            rgb_to_lab(
                working,
                lab,
                &self.tone_curves,
                RgbOptions {
                    mixer: &params.channel_mixer,
                    black_white: params.black_white.enabled,
                    working: params.color_management.working_profile,
                },
            );
            run.diag.record(Stage::RgbCurves, started.elapsed(), "");
            run.todo |= Stage::RgbCurves.invalidates();
        }

        if run.todo.intersects(Stage::LumaCurve.triggers()) {
            let started = enter(Stage::LumaCurve, listeners);
            self.luma_histogram = luminance_histogram(&buffers.lab);
            self.lab_curves = LabCurves::build(&params.lab_curve, &self.luma_histogram);
            run.diag.record(Stage::LumaCurve, started.elapsed(), "");
            run.todo |= Stage::LumaCurve.invalidates();
        }

        if run.todo.intersects(Stage::LuminanceColor.triggers()) {
            let started = enter(Stage::LuminanceColor, listeners);
            let (lab, refined) = buffers.refine_pair();
            refine_lab(
                lab,
                refined,
                &self.lab_curves,
                &params.vibrance,
                LocalContrast::at(&params.local_contrast, f64::from(scale)),
            );
            run.diag.record(Stage::LuminanceColor, started.elapsed(), "");
        }
        Ok(())
    }

    /// Rebuild the monitor transform when asked to or when the output
    /// profile settings moved.
    fn monitor_stage(&mut self, run: &mut Run, listeners: &Listeners) -> Result<(), ProcessError> {
        let key = OutputProfileKey::of(&run.params.color_management);
        let stale = self.monitor.is_none() || self.monitor_key.as_ref() != Some(&key);
        if !run.todo.contains(ChangeMask::MONITOR) && !stale {
            return Ok(());
        }
        let started = enter(Stage::MonitorTransform, listeners);
        self.monitor = Some(MonitorTransform::build(
            self.profiles.as_ref(),
            &self.monitor_settings,
            &run.params.color_management,
        )?);
        self.monitor_key = Some(key);
        run.finish(
            Stage::MonitorTransform,
            started,
            format!(
                "{} -> {}",
                run.params.color_management.output_profile, self.monitor_settings.profile
            ),
        );
        Ok(())
    }

    /// Refresh the crop windows that need it.
    fn update_crops(
        &mut self,
        source: &dyn ImageSource,
        run: &mut Run,
        ctx: &RunContext<'_>,
    ) -> Result<(), ProcessError> {
        let preview_demosaic = self.config.preview_demosaic;
        let due: Vec<CropHandle> = self
            .crops
            .iter()
            .filter(|(_, window)| {
                window.has_listener()
                    && (window.needs_refresh()
                        || crop_needs_update(
                            run.todo,
                            run.geometry_changed,
                            run.high_detail,
                            preview_demosaic,
                            window.skip(),
                        ))
            })
            .map(|(handle, _)| handle)
            .collect();
        if due.is_empty() {
            return Ok(());
        }
        let Some(monitor) = self.monitor.as_ref() else {
            debug!("no monitor transform yet; crop windows skipped");
            return Ok(());
        };

        let started = enter(Stage::CropWindows, ctx.listeners);
        let host = RunCropHost {
            high_quality: self.memo.raw_full_detail,
            request: ctx.request_full_detail,
        };
        let inputs = CropInputs {
            source,
            params: &run.params,
            wb: &self.wb,
            tone_curves: &self.tone_curves,
            lab_curves: &self.lab_curves,
            monitor,
            full: source.full_size(run.params.coarse()),
        };
        let mut updated = 0;
        for handle in due {
            if let Some(window) = self.crops.get_mut(handle)
                && window.update(run.todo, run.geometry_changed, &inputs, &host)?
            {
                updated += 1;
            }
        }
        run.diag.crops_updated = updated;
        run.finish(Stage::CropWindows, started, format!("{updated} updated"));
        Ok(())
    }

    /// Convert for display, accumulate histograms, publish and notify.
    fn publish(&mut self, run: &mut Run, ctx: &RunContext<'_>) -> Result<(), ProcessError> {
        let started = enter(Stage::Histogram, ctx.listeners);
        let scale = self.preview.scale();
        let monitor = self.monitor.as_ref().ok_or(ProcessError::NotAllocated)?;
        let buffers = self
            .preview
            .buffers_mut()
            .ok_or(ProcessError::NotAllocated)?;

        let converted = converts_to_monitor(run.todo);
        if converted {
            let area = histogram_area(&run.params.crop, scale, buffers.dimensions());
            let (refined, preview, analysis) = buffers.display_outputs();
            lab_to_display(refined, monitor, preview, Some(analysis));
            let mut histograms = accumulate(&buffers.analysis, &buffers.refined, area);
            histograms.luma_curve_input.clone_from(&self.luma_histogram);
            histograms.raw.clone_from(&self.raw_histogram);
            self.histograms = Some(histograms);
        }

        let result = Arc::new(RunResult {
            image: Arc::new(buffers.preview.clone()),
            valid: true,
            scale,
            crop: run.params.crop.clone(),
            version: run.version,
        });
        let first = !self.preview.result_valid();
        *ctx
            .published
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&result));
        self.preview.mark_result_valid();
        run.finish(
            Stage::Histogram,
            started,
            if converted { "converted" } else { "reused" },
        );

        if let Some(listener) = &ctx.listeners.image {
            if first {
                listener.set_image(&result);
            }
            listener.image_ready(&result);
        }
        if let (Some(listener), Some(histograms)) = (&ctx.listeners.histogram, &self.histograms) {
            listener.histogram_changed(histograms);
        }
        Ok(())
    }

    fn apply_scale(
        &mut self,
        source: &dyn ImageSource,
        coarse: CoarseTransform,
        listeners: &Listeners,
        published: &Publication,
    ) -> ScaleOutcome {
        let full = source.full_size(coarse);
        let outcome = self.preview.set_scale(
            self.requested_scale,
            self.config.scale_limits(),
            full,
            |scale| source.preview_size(coarse, scale),
            listeners.size_listeners(),
        );
        if outcome.reallocated {
            let mut slot = published.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(current) = slot.as_ref().filter(|result| result.valid) {
                let stale = RunResult {
                    valid: false,
                    ..RunResult::clone(current)
                };
                *slot = Some(Arc::new(stale));
            }
        }
        outcome
    }

    /// Request a new preview scale and apply it right away.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::NoSource`] before a source is assigned; the
    /// scale is still remembered for the first run.
    pub fn set_scale(
        &mut self,
        requested: u32,
        params: &ProcParams,
        listeners: &Listeners,
        published: &Publication,
    ) -> Result<ScaleOutcome, ProcessError> {
        self.requested_scale = requested.max(1);
        let source = self.source.take().ok_or(ProcessError::NoSource)?;
        let outcome = self.apply_scale(source.as_ref(), params.coarse(), listeners, published);
        self.source = Some(source);
        Ok(outcome)
    }

    fn source(&self) -> Result<&dyn ImageSource, ProcessError> {
        self.source.as_deref().ok_or(ProcessError::NoSource)
    }

    fn resolve_white_balance(
        &mut self,
        source: &dyn ImageSource,
        params: &WhiteBalanceParams,
        listeners: &Listeners,
    ) -> ColorTemp {
        if !params.enabled {
            return ColorTemp::D65;
        }
        match params.method {
            WhiteBalanceMethod::Camera => source.camera_white_balance(),
            WhiteBalanceMethod::Custom => {
                ColorTemp::new(params.temperature, params.green, params.equal)
            }
            WhiteBalanceMethod::Auto => {
                let (equal, temp_bias) = (params.equal.to_bits(), params.temp_bias.to_bits());
                let wb = match self.auto_wb {
                    Some(cached) if cached.equal == equal && cached.temp_bias == temp_bias => {
                        cached.wb
                    }
                    _ => {
                        let wb = auto_white_balance(source, params.equal, params.temp_bias);
                        self.auto_wb = Some(AutoWhiteBalance {
                            equal,
                            temp_bias,
                            wb,
                        });
                        wb
                    }
                };
                if let Some(listener) = &listeners.auto_white_balance {
                    listener.white_balance_changed(wb);
                }
                wb
            }
        }
    }

    /// White balance that neutralizes a square of side `2 * radius + 1`
    /// around `(x, y)` in output coordinates.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::NoSource`] before a source is assigned.
    pub fn spot_white_balance(
        &self,
        params: &ProcParams,
        x: u32,
        y: u32,
        radius: u32,
    ) -> Result<ColorTemp, ProcessError> {
        let source = self.source()?;
        let coarse = params.coarse();
        let full = source.full_size(coarse);
        // Clamped to the image so the sample never outgrows it.
        let right = x.saturating_add(radius).min(full.width.saturating_sub(1));
        let bottom = y.saturating_add(radius).min(full.height.saturating_sub(1));
        let points: Vec<(u32, u32)> = (y.saturating_sub(radius)..=bottom)
            .flat_map(|py| (x.saturating_sub(radius)..=right).map(move |px| (px, py)))
            .collect();
        let mapped = GeometryMap::new(params, full).source_points(&points, full);
        let wb = &params.white_balance;
        Ok(source
            .spot_white_balance(&mapped, coarse, wb.equal)
            .unwrap_or_else(|| ColorTemp::new(wb.temperature, wb.green, wb.equal)))
    }

    /// The largest centred rectangle of aspect `ratio` (width / height;
    /// `0` keeps the image aspect) that the geometric transform fills.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::NoSource`] before a source is assigned.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn auto_crop_region(&self, params: &ProcParams, ratio: f64) -> Result<CropArea, ProcessError> {
        let full = self.source()?.full_size(params.coarse());
        let fill = 1.0 / fill_scale(params, full).max(1.0);
        let (full_w, full_h) = (f64::from(full.width), f64::from(full.height));
        let (mut w, mut h) = if ratio > 0.0 {
            let w = full_w * fill;
            (w, w / ratio)
        } else {
            (full_w * fill, full_h * fill)
        };
        if ratio > 0.0 && h > full_h * fill {
            h = full_h * fill;
            w = h * ratio;
        }
        Ok(CropArea::new(
            ((full_w - w) / 2.0) as u32,
            ((full_h - h) / 2.0) as u32,
            w as u32,
            h as u32,
        ))
    }

    /// Automatic white balance for the given inputs.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::NoSource`] before a source is assigned.
    pub fn auto_white_balance(&self, equal: f64, temp_bias: f64) -> Result<ColorTemp, ProcessError> {
        Ok(auto_white_balance(self.source()?, equal, temp_bias))
    }

    /// As-shot white balance.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::NoSource`] before a source is assigned.
    pub fn camera_white_balance(&self) -> Result<ColorTemp, ProcessError> {
        Ok(self.source()?.camera_white_balance())
    }

    #[must_use]
    pub fn preview_dimensions(&self) -> Option<Dimensions> {
        self.preview.preview_size()
    }

    #[must_use]
    pub const fn detail_memo(&self) -> DetailMemo {
        self.memo
    }

    #[must_use]
    pub const fn high_quality_computed(&self) -> bool {
        self.memo.raw_full_detail
    }

    pub fn crops_mut(&mut self) -> &mut slotmap::SlotMap<CropHandle, CropWindow> {
        &mut self.crops
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("has_source", &self.source.is_some())
            .field("primed", &self.primed)
            .field("scale", &self.preview.scale())
            .field("memo", &self.memo)
            .field("crops", &self.crops.len())
            .finish_non_exhaustive()
    }
}

fn auto_white_balance(source: &dyn ImageSource, equal: f64, temp_bias: f64) -> ColorTemp {
    source
        .auto_white_balance_multipliers()
        .map_or_else(
            || source.camera_white_balance(),
            |multipliers| ColorTemp::from_multipliers(multipliers, equal, temp_bias),
        )
}

/// The crop rectangle in preview coordinates, or the whole preview when
/// cropping is off.
fn histogram_area(crop: &CropParams, scale: u32, preview: Dimensions) -> PreviewRect {
    let scale = scale.max(1);
    if crop.enabled && crop.width > 0 && crop.height > 0 {
        PreviewRect {
            x: crop.x / scale,
            y: crop.y / scale,
            width: crop.width.div_ceil(scale),
            height: crop.height.div_ceil(scale),
        }
    } else {
        PreviewRect::covering(preview.width, preview.height)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::PreviewDemosaic;
    use crate::listener::{
        AutoContrastListener, AutoExposureListener, AutoWhiteBalanceListener, FlatFieldListener,
        FrameCountListener, HistogramListener, ImageListener, ImageTypeListener, RetinexListener,
    };
    use crate::params::BayerDemosaic;
    use crate::source::{RetinexStats, SensorInfo};
    use crate::synthetic::{SourceProbe, SyntheticSource};

    #[derive(Default)]
    struct Events {
        set_image: AtomicUsize,
        image_ready: AtomicUsize,
        histograms: AtomicUsize,
        frames: Mutex<Vec<(u32, u32)>>,
        sensors: Mutex<Vec<SensorInfo>>,
        white_balance: Mutex<Vec<ColorTemp>>,
        auto_exposure: AtomicUsize,
        flat_field: Mutex<Vec<f64>>,
        contrast: Mutex<Vec<f64>>,
        retinex: AtomicUsize,
    }

    impl ImageListener for Events {
        fn set_image(&self, _result: &Arc<RunResult>) {
            self.set_image.fetch_add(1, Ordering::SeqCst);
        }

        fn image_ready(&self, _result: &Arc<RunResult>) {
            self.image_ready.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl HistogramListener for Events {
        fn histogram_changed(&self, _histograms: &Histograms) {
            self.histograms.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl FrameCountListener for Events {
        fn frame_count_changed(&self, count: u32, selected: u32) {
            self.frames.lock().unwrap().push((count, selected));
        }
    }

    impl ImageTypeListener for Events {
        fn image_type_changed(&self, info: SensorInfo) {
            self.sensors.lock().unwrap().push(info);
        }
    }

    impl AutoWhiteBalanceListener for Events {
        fn white_balance_changed(&self, wb: ColorTemp) {
            self.white_balance.lock().unwrap().push(wb);
        }
    }

    impl AutoExposureListener for Events {
        fn auto_exposure_changed(&self, _settings: &ExposureSettings) {
            self.auto_exposure.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl FlatFieldListener for Events {
        fn flat_field_clip_changed(&self, clip: f64) {
            self.flat_field.lock().unwrap().push(clip);
        }
    }

    impl AutoContrastListener for Events {
        fn contrast_threshold_changed(&self, threshold: f64) {
            self.contrast.lock().unwrap().push(threshold);
        }
    }

    impl RetinexListener for Events {
        fn retinex_stats_changed(&self, _stats: RetinexStats) {
            self.retinex.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        engine: Engine,
        probe: Arc<SourceProbe>,
        events: Arc<Events>,
        listeners: Listeners,
        published: Publication,
        requests: AtomicUsize,
        version: u64,
    }

    impl Harness {
        fn new(source: SyntheticSource) -> Self {
            Self::with_config(source, CoordinatorConfig::default())
        }

        fn with_config(source: SyntheticSource, config: CoordinatorConfig) -> Self {
            let probe = source.probe();
            let mut engine = Engine::new(config);
            engine.assign(Box::new(source));
            let events = Arc::new(Events::default());
            let mut listeners = Listeners::default();
            listeners.image = Some(events.clone());
            listeners.histogram = Some(events.clone());
            listeners.frame_count = Some(events.clone());
            listeners.image_type = Some(events.clone());
            listeners.auto_white_balance = Some(events.clone());
            listeners.auto_exposure = Some(events.clone());
            listeners.flat_field = Some(events.clone());
            listeners.auto_contrast = Some(events.clone());
            listeners.retinex = Some(events.clone());
            Self {
                engine,
                probe,
                events,
                listeners,
                published: RwLock::new(None),
                requests: AtomicUsize::new(0),
                version: 0,
            }
        }

        fn run(&mut self, params: &ProcParams, changes: ChangeMask) -> RunReport {
            self.version += 1;
            let request = || {
                self.requests.fetch_add(1, Ordering::SeqCst);
            };
            let ctx = RunContext {
                listeners: &self.listeners,
                published: &self.published,
                request_full_detail: &request,
            };
            let job = RunJob {
                params: params.clone(),
                monitor: MonitorSettings::default(),
                version: self.version,
                changes,
            };
            self.engine.run(job, &ctx)
        }

        fn published(&self) -> Option<Arc<RunResult>> {
            self.published.read().unwrap().clone()
        }
    }

    fn stages(report: &RunReport) -> Vec<Stage> {
        report.diagnostics.executed_stages().collect()
    }

    #[test]
    fn first_run_processes_everything() {
        let mut h = Harness::new(SyntheticSource::new(400, 300));
        let report = h.run(&ProcParams::default(), ChangeMask::MONITOR);
        assert_eq!(report.diagnostics.outcome, RunOutcome::Published);
        assert!(report.diagnostics.executed(Stage::Preprocess));
        assert!(report.diagnostics.executed(Stage::Demosaic));
        assert!(report.diagnostics.executed(Stage::WhiteBalance));
        assert!(report.diagnostics.executed(Stage::Histogram));
        assert_eq!(report.carry, ChangeMask::NONE);

        let result = h.published().unwrap();
        assert!(result.valid);
        assert_eq!(result.version, 1);
        assert_eq!(result.image.dimensions(), (400, 300));
        assert_eq!(h.events.set_image.load(Ordering::SeqCst), 1);
        assert_eq!(h.events.image_ready.load(Ordering::SeqCst), 1);
        assert_eq!(h.events.frames.lock().unwrap().as_slice(), &[(1, 0)]);
        assert_eq!(h.events.sensors.lock().unwrap().len(), 1);
    }

    #[test]
    fn monitor_edit_runs_only_monitor_and_histogram() {
        let mut h = Harness::new(SyntheticSource::new(400, 300));
        let params = ProcParams::default();
        h.run(&params, ChangeMask::FIRST);

        let report = h.run(&params, ChangeMask::MONITOR);
        assert_eq!(
            stages(&report),
            vec![Stage::MonitorTransform, Stage::Histogram]
        );
        assert_eq!(h.probe.demosaic_calls(), 1);
        assert_eq!(h.events.histograms.load(Ordering::SeqCst), 2);
        assert_eq!(h.events.set_image.load(Ordering::SeqCst), 1);
        assert_eq!(h.events.image_ready.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn tonal_edit_without_snapshot_change_does_not_publish() {
        let mut h = Harness::new(SyntheticSource::new(400, 300));
        let params = ProcParams::default();
        h.run(&params, ChangeMask::FIRST);

        let report = h.run(&params, ChangeMask::COLOR);
        assert!(stages(&report).is_empty());
        assert_eq!(report.diagnostics.outcome, RunOutcome::NotPublished);
        assert_eq!(h.published().unwrap().version, 1);
    }

    #[test]
    fn panning_change_reruns_the_affected_chain() {
        let mut h = Harness::new(SyntheticSource::new(400, 300));
        let mut params = ProcParams::default();
        h.run(&params, ChangeMask::FIRST);

        params.rotate.degrees = 2.0;
        let report = h.run(&params, ChangeMask::GEOMETRY);
        assert!(report.diagnostics.geometry_changed);
        assert_eq!(
            stages(&report),
            vec![
                Stage::Transform,
                Stage::ExposureCurve,
                Stage::RgbCurves,
                Stage::LumaCurve,
                Stage::LuminanceColor,
                Stage::Histogram,
            ]
        );
        assert_eq!(h.published().unwrap().version, 2);
    }

    #[test]
    fn full_detail_crop_promotes_demosaic_once() {
        let mut h = Harness::new(SyntheticSource::new(400, 300));
        let params = ProcParams::default();
        h.run(&params, ChangeMask::FIRST);
        assert_eq!(h.probe.last_demosaic(), Some(BayerDemosaic::Fast));
        assert!(!h.engine.detail_memo().raw_full_detail);

        h.engine.crops_mut().insert(CropWindow::new(true));
        let report = h.run(&params, ChangeMask::COLOR);
        assert!(report.diagnostics.high_detail);
        assert!(report.diagnostics.executed(Stage::Demosaic));
        assert_eq!(h.probe.last_demosaic(), Some(BayerDemosaic::Amaze));
        assert!(h.engine.high_quality_computed());

        let report = h.run(&params, ChangeMask::LUMINANCE);
        assert!(!report.diagnostics.executed(Stage::Demosaic));
        assert_eq!(h.probe.demosaic_calls(), 2);
    }

    #[test]
    fn failed_conversion_keeps_previous_result() {
        let mut h = Harness::new(SyntheticSource::new(400, 300));
        let mut params = ProcParams::default();
        h.run(&params, ChangeMask::FIRST);
        let before = h.published().unwrap();
        let pixels = before.image.as_raw().clone();

        h.probe.set_fail_color_conversion(true);
        params.white_balance.temperature = 3000.0;
        params.white_balance.method = WhiteBalanceMethod::Custom;
        let report = h.run(&params, ChangeMask::ALL_NO_RAW);
        assert!(matches!(
            report.diagnostics.outcome,
            RunOutcome::Failed(ref message) if message.contains("color conversion")
        ));
        assert!(report.carry.contains(ChangeMask::INIT));

        let after = h.published().unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert!(after.valid);
        assert_eq!(after.image.as_raw(), &pixels);
    }

    #[test]
    fn auto_white_balance_is_reported() {
        let mut h = Harness::new(SyntheticSource::new(400, 300));
        let mut params = ProcParams::default();
        params.white_balance.method = WhiteBalanceMethod::Auto;
        h.run(&params, ChangeMask::FIRST);
        h.run(&params, ChangeMask::ALL_NO_RAW | ChangeMask::MONITOR);

        let reported = h.events.white_balance.lock().unwrap().clone();
        assert_eq!(reported.len(), 2);
        assert_eq!(reported[0], reported[1]);
        assert_eq!(reported[0], h.engine.auto_white_balance(1.0, 0.0).unwrap());
    }

    #[test]
    fn no_source_skips_and_carries() {
        let mut engine = Engine::new(CoordinatorConfig::default());
        let published = RwLock::new(None);
        let listeners = Listeners::default();
        let ctx = RunContext {
            listeners: &listeners,
            published: &published,
            request_full_detail: &|| {},
        };
        let report = engine.run(
            RunJob {
                params: ProcParams::default(),
                monitor: MonitorSettings::default(),
                version: 1,
                changes: ChangeMask::COLOR,
            },
            &ctx,
        );
        assert_eq!(report.carry, ChangeMask::COLOR);
        assert!(report.diagnostics.stages.is_empty());
        assert!(matches!(
            engine.camera_white_balance(),
            Err(ProcessError::NoSource)
        ));
    }

    #[test]
    fn rescale_invalidates_published_result() {
        let mut h = Harness::new(SyntheticSource::new(4000, 3000));
        let params = ProcParams::default();
        h.run(&params, ChangeMask::FIRST);
        assert_eq!(h.engine.preview_dimensions(), Some(Dimensions::new(572, 429)));

        let outcome = h
            .engine
            .set_scale(4, &params, &h.listeners, &h.published)
            .unwrap();
        assert!(outcome.reallocated);
        assert_eq!(outcome.preview, Dimensions::new(1000, 750));
        assert!(!h.published().unwrap().valid);

        h.run(&params, ChangeMask::ALL_NO_RAW | ChangeMask::MONITOR);
        assert!(h.published().unwrap().valid);
        assert_eq!(h.events.set_image.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn auto_crop_centres_the_requested_ratio() {
        let h = Harness::new(SyntheticSource::new(400, 300));
        let params = ProcParams::default();
        let area = h.engine.auto_crop_region(&params, 1.5).unwrap();
        assert_eq!(area, CropArea::new(0, 16, 400, 266));
        let square = h.engine.auto_crop_region(&params, 1.0).unwrap();
        assert_eq!(square, CropArea::new(50, 0, 300, 300));
        let whole = h.engine.auto_crop_region(&params, 0.0).unwrap();
        assert_eq!(whole, CropArea::new(0, 0, 400, 300));
    }

    #[test]
    fn spot_white_balance_falls_back_outside_the_image() {
        let h = Harness::new(SyntheticSource::new(400, 300));
        let mut params = ProcParams::default();
        params.white_balance.temperature = 4321.0;
        let inside = h.engine.spot_white_balance(&params, 200, 150, 4).unwrap();
        assert!((inside.temperature - 4321.0).abs() > 1.0);

        params.rotate.degrees = 45.0;
        let outside = h.engine.spot_white_balance(&params, 0, 0, 0).unwrap();
        assert!((outside.temperature - 4321.0).abs() < 1e-9);
    }

    #[test]
    fn crop_rectangle_limits_histogram_area() {
        let crop = CropParams {
            enabled: true,
            x: 100,
            y: 50,
            width: 201,
            height: 100,
        };
        let area = histogram_area(&crop, 2, Dimensions::new(200, 150));
        assert_eq!((area.x, area.y, area.width, area.height), (50, 25, 101, 50));
        let whole = histogram_area(&CropParams::default(), 2, Dimensions::new(200, 150));
        assert_eq!((whole.width, whole.height), (200, 150));
    }

    #[test]
    fn auto_exposure_is_reported_when_recomputed() {
        let mut h = Harness::new(SyntheticSource::new(400, 300));
        let mut params = ProcParams::default();
        params.tone_curve.auto_exposure = true;
        h.run(&params, ChangeMask::FIRST);
        assert_eq!(h.events.auto_exposure.load(Ordering::SeqCst), 1);

        let report = h.run(&params, ChangeMask::MONITOR);
        assert!(!report.diagnostics.executed(Stage::ExposureCurve));
        assert_eq!(h.events.auto_exposure.load(Ordering::SeqCst), 1);

        params.tone_curve.contrast = 10;
        let report = h.run(&params, ChangeMask::EXPOSURE);
        assert!(report.diagnostics.executed(Stage::ExposureCurve));
        assert_eq!(h.events.auto_exposure.load(Ordering::SeqCst), 2);

        params.lab_curve.contrast = 5;
        let report = h.run(&params, ChangeMask::LAB_CURVES);
        assert!(!report.diagnostics.executed(Stage::ExposureCurve));
        assert_eq!(h.events.auto_exposure.load(Ordering::SeqCst), 2);
        assert_eq!(h.probe.auto_exposure_calls(), 2);
    }

    #[test]
    fn flat_field_clip_is_reported_per_preprocess() {
        let mut h = Harness::new(SyntheticSource::new(400, 300));
        let mut params = ProcParams::default();
        params.raw.flat_field = Some("flat.dng".to_owned());
        params.raw.flat_field_auto_clip = true;
        h.run(&params, ChangeMask::FIRST);
        assert_eq!(h.events.flat_field.lock().unwrap().as_slice(), &[0.94]);

        let report = h.run(&params, ChangeMask::MONITOR);
        assert!(!report.diagnostics.executed(Stage::Preprocess));
        assert_eq!(h.events.flat_field.lock().unwrap().len(), 1);

        h.run(&params, ChangeMask::ALL);
        assert_eq!(h.events.flat_field.lock().unwrap().len(), 2);

        params.raw.flat_field_auto_clip = false;
        let report = h.run(&params, ChangeMask::ALL);
        assert!(report.diagnostics.executed(Stage::Preprocess));
        assert_eq!(h.events.flat_field.lock().unwrap().len(), 2);
    }

    #[test]
    fn dual_demosaic_contrast_is_reported_per_demosaic() {
        let sidecar = CoordinatorConfig {
            preview_demosaic: PreviewDemosaic::Sidecar,
            ..CoordinatorConfig::default()
        };
        let mut h = Harness::with_config(SyntheticSource::new(400, 300), sidecar);
        let mut params = ProcParams::default();
        params.raw.bayer.method = BayerDemosaic::AmazeVng4;
        h.run(&params, ChangeMask::FIRST);
        let reported = h.events.contrast.lock().unwrap().clone();
        assert_eq!(reported.len(), 1);
        assert!((reported[0] - 16.0).abs() < 1e-9);

        let report = h.run(&params, ChangeMask::MONITOR);
        assert!(!report.diagnostics.executed(Stage::Demosaic));
        assert_eq!(h.events.contrast.lock().unwrap().len(), 1);

        let report = h.run(&params, ChangeMask::ALL);
        assert!(report.diagnostics.executed(Stage::Demosaic));
        assert_eq!(h.events.contrast.lock().unwrap().len(), 2);

        // The fast preview demosaic has no threshold to report.
        let mut fast = Harness::new(SyntheticSource::new(400, 300));
        fast.run(&params, ChangeMask::FIRST);
        assert_eq!(fast.probe.last_demosaic(), Some(BayerDemosaic::Fast));
        assert!(fast.events.contrast.lock().unwrap().is_empty());
    }

    #[test]
    fn retinex_stats_are_reported_per_pass() {
        let mut h = Harness::new(SyntheticSource::new(400, 300));
        let mut params = ProcParams::default();
        params.retinex.enabled = true;
        let report = h.run(&params, ChangeMask::FIRST);
        assert!(report.diagnostics.executed(Stage::Retinex));
        assert_eq!(h.events.retinex.load(Ordering::SeqCst), 1);

        h.run(&params, ChangeMask::MONITOR);
        params.lab_curve.contrast = 5;
        let report = h.run(&params, ChangeMask::LAB_CURVES);
        assert!(!report.diagnostics.executed(Stage::Retinex));
        assert_eq!(h.events.retinex.load(Ordering::SeqCst), 1);

        params.retinex.strength = 20;
        let report = h.run(&params, ChangeMask::RETINEX_CHAIN);
        assert!(report.diagnostics.executed(Stage::Retinex));
        assert_eq!(h.events.retinex.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn spot_sample_is_clamped_to_the_image() {
        let h = Harness::new(SyntheticSource::new(400, 300));
        let mut params = ProcParams::default();
        params.white_balance.temperature = 4321.0;
        let whole = h.engine.spot_white_balance(&params, 200, 150, 400).unwrap();
        let huge = h
            .engine
            .spot_white_balance(&params, 200, 150, 100_000)
            .unwrap();
        assert_eq!(whole, huge);

        let beyond = h.engine.spot_white_balance(&params, 5000, 5000, 2).unwrap();
        assert!((beyond.temperature - 4321.0).abs() < 1e-9);
    }
}
