//! darkroom-pipeline: Preview update coordinator for raw photo editing (sans-UI).
//!
//! Edits to the processing parameters are committed together with a
//! [`ChangeMask`] naming the stages they invalidate. A background worker
//! coalesces pending masks and recomputes only what is stale:
//!
//! raw preprocess -> demosaic -> retinex -> white balance & working space ->
//! tone mapping -> geometry -> exposure curve -> RGB curves -> luma curve ->
//! luminance & color refinement -> monitor transform -> crop windows ->
//! RGB conversion & histograms.
//!
//! This crate has **no UI dependencies**. Raw decoding and color
//! management are reached through the [`ImageSource`] and
//! [`ProfileStore`] traits; results reach the application through the
//! listener traits in [`listener`]. [`synthetic::SyntheticSource`] renders
//! a deterministic gradient for tests and benchmarks.

pub mod buffers;
pub mod change;
pub mod color;
pub mod config;
pub mod coordinator;
pub mod crop;
pub mod curves;
pub mod diagnostics;
mod engine;
pub mod histogram;
pub mod listener;
pub mod ops;
pub mod params;
pub mod plan;
pub mod source;
pub mod stage;
pub mod synthetic;
pub mod types;

pub use buffers::ScaleOutcome;
pub use change::{ChangeMask, EditEvent};
pub use color::{BuiltinProfiles, ColorTemp, ProfileStore};
pub use config::{CoordinatorConfig, PreviewDemosaic};
pub use coordinator::{Coordinator, EditTransaction};
pub use crop::{CropArea, CropHandle, CropListener};
pub use diagnostics::{RunDiagnostics, RunOutcome, StageTiming};
pub use histogram::{ChannelHistograms, Histograms};
pub use listener::Listeners;
pub use params::ProcParams;
pub use plan::DetailMemo;
pub use source::{ImageSource, SourceError};
pub use stage::Stage;
pub use types::{Dimensions, ProcessError, RunResult};
