//! darkroom-bench: replay an edit session against the preview coordinator.
//!
//! Assigns a synthetic raw image of the requested size, applies a scripted
//! sequence of edits and prints the diagnostics of every run the worker
//! performed. Useful for:
//!
//! - Checking which stages each kind of edit recomputes
//! - Measuring per-stage durations at a given preview scale
//! - Watching edits coalesce when they are issued faster than runs finish
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin darkroom-bench -- [OPTIONS]
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::process::ExitCode;
use std::sync::{Arc, Mutex, PoisonError};

use clap::Parser;
use darkroom_pipeline::crop::CropListener;
use darkroom_pipeline::listener::{DiagnosticsListener, ProgressListener};
use darkroom_pipeline::params::WhiteBalanceMethod;
use darkroom_pipeline::synthetic::SyntheticSource;
use darkroom_pipeline::types::RgbImage;
use darkroom_pipeline::{
    ChangeMask, Coordinator, CoordinatorConfig, CropArea, EditEvent, ProcParams, RunDiagnostics,
};
use tracing::info;

/// Edit session replay and diagnostics for the darkroom preview pipeline.
///
/// Runs the coordinator on a synthetic image and prints per-run stage
/// timings.
#[derive(Parser)]
#[command(name = "darkroom-bench", version)]
struct Cli {
    /// Width of the synthetic sensor in pixels.
    #[arg(long, default_value_t = 4000)]
    width: u32,

    /// Height of the synthetic sensor in pixels.
    #[arg(long, default_value_t = 3000)]
    height: u32,

    /// Requested preview scale (defaults to the configured initial scale).
    #[arg(long, value_parser = clap::builder::RangedU64ValueParser::<u32>::new().range(1..))]
    scale: Option<u32>,

    /// Number of scripted edits after the initial run.
    #[arg(long, default_value_t = 5)]
    edits: usize,

    /// Issue all edits without waiting for runs in between.
    #[arg(long)]
    burst: bool,

    /// Register a detail crop window at skip 1 in the image centre.
    #[arg(long)]
    detail_crop: bool,

    /// Output diagnostics as JSON instead of human-readable reports.
    #[arg(long)]
    json: bool,

    /// Full coordinator config as a JSON string.
    ///
    /// When provided, `--scale` is ignored.
    #[arg(long)]
    config_json: Option<String>,

    /// Initial processing parameters as a JSON string.
    #[arg(long)]
    params_json: Option<String>,
}

/// Build the coordinator config from CLI arguments.
fn config_from_cli(cli: &Cli) -> Result<CoordinatorConfig, String> {
    if let Some(ref json) = cli.config_json {
        return serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"));
    }
    let mut config = CoordinatorConfig::default();
    if let Some(scale) = cli.scale {
        config.initial_scale = scale;
    }
    Ok(config)
}

fn params_from_cli(cli: &Cli) -> Result<ProcParams, String> {
    cli.params_json.as_ref().map_or_else(
        || Ok(ProcParams::default()),
        |json| serde_json::from_str(json).map_err(|e| format!("Error parsing --params-json: {e}")),
    )
}

/// Collects the diagnostics of every run.
#[derive(Default)]
struct Collector {
    runs: Mutex<Vec<RunDiagnostics>>,
    crop_images: Mutex<usize>,
}

impl Collector {
    fn take(&self) -> Vec<RunDiagnostics> {
        std::mem::take(&mut *self.runs.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn crop_images(&self) -> usize {
        *self.crop_images.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DiagnosticsListener for Collector {
    fn run_finished(&self, diagnostics: &RunDiagnostics) {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(diagnostics.clone());
    }
}

impl ProgressListener for Collector {
    fn set_progress_state(&self, _busy: bool) {}

    fn error(&self, message: &str) {
        eprintln!("Run failed: {message}");
    }
}

impl CropListener for Collector {
    fn crop_image_ready(&self, _image: &RgbImage, _area: CropArea, _skip: u32) {
        *self
            .crop_images
            .lock()
            .unwrap_or_else(PoisonError::into_inner) += 1;
    }
}

/// Apply the `step`-th scripted edit.
fn scripted_edit(coordinator: &Coordinator, step: usize) -> EditEvent {
    let event = match step % 5 {
        0 => EditEvent::Exposure,
        1 => EditEvent::WhiteBalance,
        2 => EditEvent::Rotate,
        3 => EditEvent::LabCurves,
        _ => EditEvent::MonitorProfile,
    };
    if event == EditEvent::MonitorProfile {
        let (soft_proof, gamut_check) = coordinator.soft_proofing();
        coordinator.set_soft_proofing(!soft_proof, gamut_check);
    }

    let mut edit = coordinator.begin_edit();
    match event {
        EditEvent::Exposure => edit.tone_curve.exposure_compensation += 0.1,
        EditEvent::WhiteBalance => {
            edit.white_balance.method = WhiteBalanceMethod::Custom;
            edit.white_balance.temperature -= 100.0;
        }
        EditEvent::Rotate => edit.rotate.degrees += 0.5,
        EditEvent::LabCurves => edit.lab_curve.contrast += 5,
        _ => {}
    }
    edit.commit_event(event);
    event
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = match config_from_cli(&cli) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };
    let params = match params_from_cli(&cli) {
        Ok(p) => p,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let coordinator = match Coordinator::new(config.clone()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error creating coordinator: {e}");
            return ExitCode::FAILURE;
        }
    };

    let collector = Arc::new(Collector::default());
    coordinator.update_listeners(|listeners| {
        listeners.diagnostics = Some(collector.clone());
        listeners.progress = Some(collector.clone());
    });

    eprintln!("Image: synthetic {}x{}", cli.width, cli.height);
    eprintln!("Config: {config:#?}");
    eprintln!("Edits: {} ({})", cli.edits, if cli.burst { "burst" } else { "sequential" });
    eprintln!();

    coordinator.assign(SyntheticSource::new(cli.width, cli.height));
    let mut edit = coordinator.begin_edit();
    *edit = params;
    edit.commit(ChangeMask::FIRST);
    coordinator.wait_until_idle();

    if cli.detail_crop {
        let handle = coordinator.register_crop(true);
        let area = CropArea::new(
            (cli.width / 2).saturating_sub(128),
            (cli.height / 2).saturating_sub(128),
            256,
            256,
        );
        let crop_listener: Arc<dyn CropListener> = collector.clone();
        let registered = coordinator
            .set_crop_listener(handle, Some(crop_listener))
            .and_then(|()| coordinator.set_crop_window(handle, area, 1));
        if let Err(e) = registered {
            eprintln!("Error registering crop window: {e}");
            return ExitCode::FAILURE;
        }
        coordinator.wait_until_idle();
    }

    for step in 0..cli.edits {
        let event = scripted_edit(&coordinator, step);
        info!(step, event = event.label(), "edit issued");
        if !cli.burst {
            coordinator.wait_until_idle();
        }
    }
    coordinator.wait_until_idle();

    let runs = collector.take();
    if cli.json {
        match serde_json::to_string_pretty(&runs) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error serializing diagnostics: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        for diagnostics in &runs {
            println!("{}", diagnostics.report());
            println!();
        }
        print_summary(&runs, collector.crop_images());
    }

    let failed = runs
        .iter()
        .any(|d| matches!(d.outcome, darkroom_pipeline::RunOutcome::Failed(_)));
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Print aggregated statistics across all runs.
#[allow(clippy::cast_precision_loss)]
fn print_summary(runs: &[RunDiagnostics], crop_images: usize) {
    println!("Summary ({} runs)\n{}", runs.len(), "=".repeat(60));
    if runs.is_empty() {
        println!("Warning: no runs were recorded");
        return;
    }

    let durations: Vec<f64> = runs
        .iter()
        .map(|d| d.total_duration.as_secs_f64() * 1000.0)
        .collect();
    let min = durations.iter().copied().reduce(f64::min).unwrap_or(0.0);
    let max = durations.iter().copied().reduce(f64::max).unwrap_or(0.0);
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;
    println!("Total duration: min={min:.3}ms  mean={mean:.3}ms  max={max:.3}ms");
    println!("Crop images delivered: {crop_images}");

    println!();
    println!("{:<28} {:>6} {:>12}", "Stage", "Runs", "Mean (ms)");
    println!("{}", "-".repeat(48));
    for stage in darkroom_pipeline::Stage::ALL {
        let stage_durations: Vec<f64> = runs
            .iter()
            .flat_map(|d| d.stages.iter())
            .filter(|timing| timing.stage == stage)
            .map(|timing| timing.duration.as_secs_f64() * 1000.0)
            .collect();
        if stage_durations.is_empty() {
            continue;
        }
        let stage_mean = stage_durations.iter().sum::<f64>() / stage_durations.len() as f64;
        println!(
            "{:<28} {:>6} {stage_mean:>10.3}ms",
            stage.label(),
            stage_durations.len()
        );
    }
}
