//! The public face of the preview pipeline.
//!
//! A [`Coordinator`] owns one background worker thread and two locks:
//!
//! - the **parameter lock** guards the pending snapshot, the accumulated
//!   change mask and the worker state. It is held while an
//!   [`EditTransaction`] is open and briefly at the top of every run.
//! - the **run lock** guards the [`Engine`] for the whole duration of a
//!   run. Synchronous queries (spot white balance, auto crop, crop
//!   registration) take it too, so they wait for an in-flight run.
//!
//! Edits committed while a run is in flight are coalesced: the worker
//! takes the union of everything pending when it starts its next run, and
//! only the latest snapshot. The engine never holds the parameter lock
//! while waiting for the run lock, so the two cannot deadlock.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::buffers::ScaleOutcome;
use crate::change::{ChangeMask, EditEvent};
use crate::color::{ColorTemp, MonitorSettings, ProfileStore};
use crate::config::CoordinatorConfig;
use crate::crop::{CropArea, CropHandle, CropListener, CropWindow};
use crate::diagnostics::RunDiagnostics;
use crate::engine::{Engine, Publication, RunContext, RunJob};
use crate::listener::Listeners;
use crate::params::{ProcParams, RenderingIntent};
use crate::plan::DetailMemo;
use crate::source::ImageSource;
use crate::types::{Dimensions, ProcessError, RunResult};

/// Name of the worker thread.
const WORKER_NAME: &str = "darkroom-preview";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State behind the parameter lock.
#[derive(Debug, Default)]
struct Pending {
    params: ProcParams,
    monitor: MonitorSettings,
    /// Bits committed since the worker last took them.
    changes: ChangeMask,
    /// Bits a failed run left stale; they join the next run.
    carried: ChangeMask,
    version: u64,
    running: bool,
    stopped: bool,
    destroying: bool,
}

impl Pending {
    const fn has_work(&self) -> bool {
        !self.stopped && !self.destroying && self.changes.requires_processing()
    }
}

struct Shared {
    pending: Mutex<Pending>,
    /// Signalled whenever the worker goes idle.
    idle: Condvar,
    /// The run lock.
    engine: Mutex<Engine>,
    /// Set while the engine executes a run.
    in_run: AtomicBool,
    published: Publication,
    diagnostics: Mutex<Option<RunDiagnostics>>,
    listeners: RwLock<Arc<Listeners>>,
    wake: Sender<()>,
}

impl Shared {
    fn listeners(&self) -> Arc<Listeners> {
        Arc::clone(&self.listeners.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn wake_worker(&self) {
        // A full channel already holds a wake-up the worker has not seen.
        let _ = self.wake.try_send(());
    }

    fn schedule(&self, changes: ChangeMask) {
        let wake = {
            let mut pending = lock(&self.pending);
            if pending.destroying {
                return;
            }
            pending.changes |= changes;
            pending.stopped = false;
            pending.has_work()
        };
        if wake {
            self.wake_worker();
        }
    }

    /// A crop window asked for full detail. During a run the request is
    /// queued for the next run instead of starting one from inside this
    /// one.
    fn request_full_detail(&self) {
        if self.in_run.load(Ordering::SeqCst) {
            debug!("full detail requested during a run; deferred");
            lock(&self.pending).changes |= ChangeMask::HIGH_QUAL;
        } else {
            self.schedule(ChangeMask::HIGH_QUAL);
        }
    }

    fn params(&self) -> ProcParams {
        lock(&self.pending).params.clone()
    }
}

/// Worker thread body: sleep until woken, then drain pending work.
fn worker(shared: &Shared, wake: &Receiver<()>) {
    debug!("preview worker started");
    while wake.recv().is_ok() {
        if lock(&shared.pending).destroying {
            break;
        }
        drain(shared);
    }
    debug!("preview worker stopped");
}

/// Run until no work is pending.
fn drain(shared: &Shared) {
    {
        let mut pending = lock(&shared.pending);
        if !pending.has_work() {
            return;
        }
        pending.running = true;
    }
    let listeners = shared.listeners();
    if let Some(progress) = &listeners.progress {
        progress.set_progress_state(true);
    }

    loop {
        let job = {
            let mut pending = lock(&shared.pending);
            if !pending.has_work() {
                pending.running = false;
                shared.idle.notify_all();
                break;
            }
            let changes = pending.changes | pending.carried;
            pending.changes = ChangeMask::NONE;
            pending.carried = ChangeMask::NONE;
            RunJob {
                params: pending.params.clone(),
                monitor: pending.monitor.clone(),
                version: pending.version,
                changes,
            }
        };

        let listeners = shared.listeners();
        let request = || shared.request_full_detail();
        let report = {
            let mut engine = lock(&shared.engine);
            shared.in_run.store(true, Ordering::SeqCst);
            let report = engine.run(
                job,
                &RunContext {
                    listeners: &listeners,
                    published: &shared.published,
                    request_full_detail: &request,
                },
            );
            shared.in_run.store(false, Ordering::SeqCst);
            report
        };

        lock(&shared.pending).carried |= report.carry;
        *lock(&shared.diagnostics) = Some(report.diagnostics);
    }

    if let Some(progress) = &shared.listeners().progress {
        progress.set_progress_state(false);
    }
}

/// Coordinates preview recomputation for one image.
///
/// Dropping the coordinator discards pending work, waits for an in-flight
/// run to finish and joins the worker.
pub struct Coordinator {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Coordinator {
    /// Create a coordinator and start its (idle) worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Spawn`] if the thread cannot be started.
    pub fn new(config: CoordinatorConfig) -> Result<Self, ProcessError> {
        info!(?config, "creating coordinator");
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending::default()),
            idle: Condvar::new(),
            engine: Mutex::new(Engine::new(config)),
            in_run: AtomicBool::new(false),
            published: RwLock::new(None),
            diagnostics: Mutex::new(None),
            listeners: RwLock::new(Arc::new(Listeners::default())),
            wake: wake_tx,
        });
        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(WORKER_NAME.to_owned())
                .spawn(move || worker(&shared, &wake_rx))?
        };
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Attach the image to process. Waits for an in-flight run.
    ///
    /// Nothing runs until the next edit or
    /// [`start_processing`](Self::start_processing); the first run after an
    /// assignment processes the image from scratch.
    pub fn assign(&self, source: impl ImageSource + 'static) {
        lock(&self.shared.engine).assign(Box::new(source));
    }

    /// Replace the profile lookup used for the monitor transform.
    pub fn set_profile_store(&self, store: impl ProfileStore + 'static) {
        lock(&self.shared.engine).set_profile_store(Box::new(store));
    }

    /// Open an edit on the pending snapshot.
    ///
    /// The parameter lock is held until the transaction is committed or
    /// dropped. Calls that touch the pending state (parameters, version,
    /// display settings, run-lock queries) block until then on other
    /// threads and deadlock on the thread holding the transaction, so read
    /// the draft through the transaction instead. Dropping without
    /// committing discards the edit.
    #[must_use]
    pub fn begin_edit(&self) -> EditTransaction<'_> {
        let pending = lock(&self.shared.pending);
        let draft = pending.params.clone();
        EditTransaction {
            shared: &self.shared,
            pending,
            draft,
        }
    }

    /// Schedule a run without changing the parameters. Resumes processing
    /// after [`stop_processing`](Self::stop_processing).
    pub fn start_processing(&self, changes: ChangeMask) {
        self.shared.schedule(changes);
    }

    /// Discard the pending changes and wait for an in-flight run.
    ///
    /// No run starts until the next commit or
    /// [`start_processing`](Self::start_processing). Stages a failed run
    /// left stale are kept for that run.
    pub fn stop_processing(&self) {
        let mut pending = lock(&self.shared.pending);
        pending.stopped = true;
        pending.changes = ChangeMask::NONE;
        while pending.running {
            pending = self
                .shared
                .idle
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
        info!("processing stopped");
    }

    /// Block until the worker has nothing left to do.
    pub fn wait_until_idle(&self) {
        let mut pending = lock(&self.shared.pending);
        while pending.running || pending.has_work() {
            pending = self
                .shared
                .idle
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Whether a run is in flight or about to start.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        let pending = lock(&self.shared.pending);
        pending.running || pending.has_work()
    }

    /// A copy of the pending snapshot.
    #[must_use]
    pub fn params(&self) -> ProcParams {
        self.shared.params()
    }

    /// Version of the pending snapshot; bumped by every commit.
    #[must_use]
    pub fn version(&self) -> u64 {
        lock(&self.shared.pending).version
    }

    /// Register a crop window. Detail windows ask for full detail when
    /// shown at skip 1.
    pub fn register_crop(&self, detail_window: bool) -> CropHandle {
        let handle = lock(&self.shared.engine)
            .crops_mut()
            .insert(CropWindow::new(detail_window));
        debug!(?handle, detail_window, "crop window registered");
        handle
    }

    /// # Errors
    ///
    /// Returns [`ProcessError::UnknownCrop`] if the handle is not
    /// registered.
    pub fn unregister_crop(&self, handle: CropHandle) -> Result<(), ProcessError> {
        if lock(&self.shared.engine).crops_mut().remove(handle).is_none() {
            return Err(ProcessError::UnknownCrop(handle));
        }
        debug!(?handle, "crop window unregistered");
        Ok(())
    }

    /// Move or resize a crop window and schedule its refresh.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::UnknownCrop`] if the handle is not
    /// registered.
    pub fn set_crop_window(
        &self,
        handle: CropHandle,
        area: CropArea,
        skip: u32,
    ) -> Result<(), ProcessError> {
        lock(&self.shared.engine)
            .crops_mut()
            .get_mut(handle)
            .ok_or(ProcessError::UnknownCrop(handle))?
            .set_window(area, skip);
        self.start_processing(ChangeMask::CROP);
        Ok(())
    }

    /// Attach or detach the listener of a crop window. The window is
    /// refreshed by the next run.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::UnknownCrop`] if the handle is not
    /// registered.
    pub fn set_crop_listener(
        &self,
        handle: CropHandle,
        listener: Option<Arc<dyn CropListener>>,
    ) -> Result<(), ProcessError> {
        lock(&self.shared.engine)
            .crops_mut()
            .get_mut(handle)
            .ok_or(ProcessError::UnknownCrop(handle))?
            .set_listener(listener);
        Ok(())
    }

    /// White balance that neutralizes the square of side `2 * radius + 1`
    /// around `(x, y)` in full image coordinates.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::NoSource`] before a source is assigned.
    pub fn sample_spot_white_balance(
        &self,
        x: u32,
        y: u32,
        radius: u32,
    ) -> Result<ColorTemp, ProcessError> {
        let params = self.shared.params();
        lock(&self.shared.engine).spot_white_balance(&params, x, y, radius)
    }

    /// Largest centred rectangle of the given aspect ratio (`0` keeps the
    /// image aspect) that the geometric transform fills.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::NoSource`] before a source is assigned.
    pub fn compute_auto_crop_region(&self, ratio: f64) -> Result<CropArea, ProcessError> {
        let params = self.shared.params();
        lock(&self.shared.engine).auto_crop_region(&params, ratio)
    }

    /// # Errors
    ///
    /// Returns [`ProcessError::NoSource`] before a source is assigned.
    pub fn auto_white_balance(&self, equal: f64, temp_bias: f64) -> Result<ColorTemp, ProcessError> {
        lock(&self.shared.engine).auto_white_balance(equal, temp_bias)
    }

    /// # Errors
    ///
    /// Returns [`ProcessError::NoSource`] before a source is assigned.
    pub fn camera_white_balance(&self) -> Result<ColorTemp, ProcessError> {
        lock(&self.shared.engine).camera_white_balance()
    }

    /// Request a preview scale.
    ///
    /// When the preview dimensions change the buffers are reallocated, the
    /// published result is marked invalid, size listeners are notified
    /// before this returns and a run is scheduled to refill the preview.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::NoSource`] before a source is assigned; the
    /// requested scale still applies to the first run.
    pub fn set_scale(&self, requested: u32) -> Result<ScaleOutcome, ProcessError> {
        let params = self.shared.params();
        let listeners = self.shared.listeners();
        let outcome = lock(&self.shared.engine).set_scale(
            requested,
            &params,
            &listeners,
            &self.shared.published,
        )?;
        if outcome.reallocated {
            self.start_processing(ChangeMask::ALL_NO_RAW | ChangeMask::MONITOR);
        }
        Ok(outcome)
    }

    /// Current preview dimensions, once allocated.
    #[must_use]
    pub fn preview_dimensions(&self) -> Option<Dimensions> {
        lock(&self.shared.engine).preview_dimensions()
    }

    #[must_use]
    pub fn detail_memo(&self) -> DetailMemo {
        lock(&self.shared.engine).detail_memo()
    }

    /// Whether the raw data was last demosaiced at full detail.
    #[must_use]
    pub fn high_quality_computed(&self) -> bool {
        lock(&self.shared.engine).high_quality_computed()
    }

    /// Takes effect on the next run carrying [`ChangeMask::MONITOR`].
    pub fn set_monitor_profile(&self, profile: impl Into<String>, intent: RenderingIntent) {
        let mut pending = lock(&self.shared.pending);
        pending.monitor.profile = profile.into();
        pending.monitor.intent = intent;
    }

    #[must_use]
    pub fn monitor_profile(&self) -> (String, RenderingIntent) {
        let pending = lock(&self.shared.pending);
        (pending.monitor.profile.clone(), pending.monitor.intent)
    }

    /// Takes effect on the next run carrying [`ChangeMask::MONITOR`].
    pub fn set_soft_proofing(&self, soft_proof: bool, gamut_check: bool) {
        let mut pending = lock(&self.shared.pending);
        pending.monitor.soft_proof = soft_proof;
        pending.monitor.gamut_check = gamut_check;
    }

    /// `(soft_proof, gamut_check)`.
    #[must_use]
    pub fn soft_proofing(&self) -> (bool, bool) {
        let pending = lock(&self.shared.pending);
        (pending.monitor.soft_proof, pending.monitor.gamut_check)
    }

    /// Change listener registrations. Runs already in flight keep the set
    /// they started with.
    pub fn update_listeners(&self, update: impl FnOnce(&mut Listeners)) {
        let mut slot = self
            .shared
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next = Listeners::clone(&slot);
        update(&mut next);
        *slot = Arc::new(next);
    }

    /// The last published result.
    #[must_use]
    pub fn result(&self) -> Option<Arc<RunResult>> {
        self.shared
            .published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Diagnostics of the last finished run.
    #[must_use]
    pub fn last_diagnostics(&self) -> Option<RunDiagnostics> {
        lock(&self.shared.diagnostics).clone()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        {
            let mut pending = lock(&self.shared.pending);
            pending.destroying = true;
            pending.changes = ChangeMask::NONE;
        }
        self.shared.wake_worker();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!("preview worker panicked");
        }
        debug!("coordinator dropped");
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("pending", &*lock(&self.shared.pending))
            .field("in_run", &self.shared.in_run.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// An open edit of the pending snapshot.
///
/// Dereferences to the draft parameters. [`commit`](Self::commit) writes
/// the draft back, ORs the mask into the accumulated changes and wakes the
/// worker; dropping the transaction discards the draft.
pub struct EditTransaction<'a> {
    shared: &'a Shared,
    pending: MutexGuard<'a, Pending>,
    draft: ProcParams,
}

impl EditTransaction<'_> {
    /// Publish the edit and schedule the stages in `changes`. Returns the
    /// new snapshot version.
    pub fn commit(self, changes: ChangeMask) -> u64 {
        let Self {
            shared,
            mut pending,
            draft,
        } = self;
        pending.params = draft;
        pending.changes |= changes;
        pending.stopped = false;
        pending.version += 1;
        let version = pending.version;
        let wake = pending.has_work();
        drop(pending);
        debug!(version, ?changes, "edit committed");
        if wake {
            shared.wake_worker();
        }
        version
    }

    /// Commit with the stages a user-level edit invalidates.
    pub fn commit_event(self, event: EditEvent) -> u64 {
        self.commit(event.changes())
    }
}

impl Deref for EditTransaction<'_> {
    type Target = ProcParams;

    fn deref(&self) -> &ProcParams {
        &self.draft
    }
}

impl DerefMut for EditTransaction<'_> {
    fn deref_mut(&mut self) -> &mut ProcParams {
        &mut self.draft
    }
}

impl std::fmt::Debug for EditTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditTransaction")
            .field("version", &self.pending.version)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::listener::DiagnosticsListener;
    use crate::synthetic::SyntheticSource;

    #[derive(Default)]
    struct Runs(Mutex<Vec<RunDiagnostics>>);

    impl DiagnosticsListener for Runs {
        fn run_finished(&self, diagnostics: &RunDiagnostics) {
            self.0.lock().unwrap().push(diagnostics.clone());
        }
    }

    #[test]
    fn full_detail_requested_during_a_run_is_deferred() {
        let coordinator = Coordinator::new(CoordinatorConfig::default()).unwrap();
        let runs = Arc::new(Runs::default());
        coordinator.update_listeners(|listeners| listeners.diagnostics = Some(runs.clone()));
        let (source, gate) = SyntheticSource::new(400, 300).gated();
        coordinator.assign(source);

        coordinator.begin_edit().commit(ChangeMask::FIRST);
        assert!(gate.wait_entered(Duration::from_secs(5)));
        assert!(coordinator.shared.in_run.load(Ordering::SeqCst));

        // Two detail windows asking from inside the same run.
        coordinator.shared.request_full_detail();
        coordinator.shared.request_full_detail();
        assert!(
            lock(&coordinator.shared.pending)
                .changes
                .contains(ChangeMask::HIGH_QUAL)
        );

        gate.release();
        // The follow-up run preprocesses again at full detail.
        assert!(gate.wait_entered(Duration::from_secs(5)));
        gate.release();
        coordinator.wait_until_idle();

        let runs = runs.0.lock().unwrap().clone();
        assert_eq!(runs.len(), 2);
        assert!(!runs[0].high_detail);
        assert_eq!(runs[1].changes, ChangeMask::HIGH_QUAL);
        assert!(runs[1].high_detail);
        assert!(coordinator.high_quality_computed());
    }
}
