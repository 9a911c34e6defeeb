//! Callback interfaces the coordinator notifies.
//!
//! Every listener is optional. Listeners are called synchronously from the
//! worker thread (or from the caller's thread for [`SizeListener`] when
//! [`Coordinator::set_scale`](crate::Coordinator::set_scale) is called
//! directly), so implementations must be `Send + Sync` and should return
//! quickly.
//!
//! Single-subscriber slots keep the last registration. Size listeners may
//! have any number of subscribers.

use std::sync::Arc;

use crate::color::ColorTemp;
use crate::curves::ExposureSettings;
use crate::diagnostics::RunDiagnostics;
use crate::histogram::Histograms;
use crate::source::{RetinexStats, SensorInfo};
use crate::types::{Dimensions, RunResult};

/// Busy state, progress and errors.
pub trait ProgressListener: Send + Sync {
    /// The worker started (`true`) or finished (`false`) draining edits.
    fn set_progress_state(&self, busy: bool);

    /// Progress inside a run: the stage label and the fraction of stages
    /// done.
    fn set_progress(&self, _label: &str, _fraction: f64) {}

    /// A run was aborted.
    fn error(&self, message: &str);
}

/// Receives published preview images.
pub trait ImageListener: Send + Sync {
    /// First publication after the preview buffers were reallocated.
    fn set_image(&self, _result: &Arc<RunResult>) {}

    /// Every publication.
    fn image_ready(&self, result: &Arc<RunResult>);
}

pub trait HistogramListener: Send + Sync {
    fn histogram_changed(&self, histograms: &Histograms);
}

/// Notified when the preview dimensions change.
pub trait SizeListener: Send + Sync {
    fn size_changed(&self, full: Dimensions, preview: Dimensions, scale: u32);
}

/// Auto exposure computed new settings.
pub trait AutoExposureListener: Send + Sync {
    fn auto_exposure_changed(&self, settings: &ExposureSettings);
}

/// Auto white balance resolved a temperature and tint.
pub trait AutoWhiteBalanceListener: Send + Sync {
    fn white_balance_changed(&self, wb: ColorTemp);
}

/// A dual demosaic picked its contrast threshold automatically.
pub trait AutoContrastListener: Send + Sync {
    fn contrast_threshold_changed(&self, threshold: f64);
}

pub trait FrameCountListener: Send + Sync {
    fn frame_count_changed(&self, count: u32, selected: u32);
}

/// Flat field correction reported its automatic clip value.
pub trait FlatFieldListener: Send + Sync {
    fn flat_field_clip_changed(&self, clip: f64);
}

pub trait ImageTypeListener: Send + Sync {
    fn image_type_changed(&self, info: SensorInfo);
}

pub trait RetinexListener: Send + Sync {
    fn retinex_stats_changed(&self, stats: RetinexStats);
}

/// Receives the diagnostics of every finished run.
pub trait DiagnosticsListener: Send + Sync {
    fn run_finished(&self, diagnostics: &RunDiagnostics);
}

/// The registered listeners.
///
/// Each run works on a snapshot of this set, so registering a listener
/// never waits for a run and takes effect from the next one.
#[derive(Clone, Default)]
pub struct Listeners {
    pub progress: Option<Arc<dyn ProgressListener>>,
    pub image: Option<Arc<dyn ImageListener>>,
    pub histogram: Option<Arc<dyn HistogramListener>>,
    pub auto_exposure: Option<Arc<dyn AutoExposureListener>>,
    pub auto_white_balance: Option<Arc<dyn AutoWhiteBalanceListener>>,
    pub auto_contrast: Option<Arc<dyn AutoContrastListener>>,
    pub frame_count: Option<Arc<dyn FrameCountListener>>,
    pub flat_field: Option<Arc<dyn FlatFieldListener>>,
    pub image_type: Option<Arc<dyn ImageTypeListener>>,
    pub retinex: Option<Arc<dyn RetinexListener>>,
    pub diagnostics: Option<Arc<dyn DiagnosticsListener>>,
    size: Vec<Arc<dyn SizeListener>>,
}

impl Listeners {
    /// Subscribe to size changes.
    pub fn add_size_listener(&mut self, listener: Arc<dyn SizeListener>) {
        self.size.push(listener);
    }

    /// Remove a size subscription; returns whether it was registered.
    pub fn remove_size_listener(&mut self, listener: &Arc<dyn SizeListener>) -> bool {
        let before = self.size.len();
        self.size.retain(|l| !Arc::ptr_eq(l, listener));
        self.size.len() != before
    }

    /// All size subscribers, in registration order.
    #[must_use]
    pub fn size_listeners(&self) -> &[Arc<dyn SizeListener>] {
        &self.size
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("progress", &self.progress.is_some())
            .field("image", &self.image.is_some())
            .field("histogram", &self.histogram.is_some())
            .field("size", &self.size.len())
            .finish_non_exhaustive()
    }
}
