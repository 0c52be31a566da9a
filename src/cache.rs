// Cache module
// WindowedFrameCache keeps a bounded run of frames around the playback cursor. Navigation
// only touches memory; a background worker refills the forward queue from the FrameStore.
//
// Lock order: the refill lock may be held while taking the navigation lock, never the other
// way round. The navigation lock is never held across a store call.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::CacheConfig;
use crate::runtime::Runtime;
use crate::scheduler::{RefillReason, RefillRequest, RefillScheduler};
use crate::store::{Frame, FrameIndex, FrameStore, RecordingId, RecordingMeta, StoreError};
use crate::window::{FetchPlan, RefillPlan, Skip, Splice, Window};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Recording not found: {0}")]
    RecordingNotFound(RecordingId),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Runtime error: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("Background seek stopped before completing")]
    WorkerStopped,
}

/// Result of one refill pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefillOutcome {
    /// Another pass held the refill lock; this one was dropped.
    Skipped,
    /// The forward queue was within bounds.
    Idle,
    /// The forward queue was over target and lost this many frames from its tail.
    TrimmedForward(usize),
    /// This many frames were added to the forward queue.
    Filled(usize),
    /// The probe passed the end of the recording without finding frames.
    Exhausted,
    /// A seek flushed the window while the batch was in flight.
    Discarded,
}

/// Counters describing refill activity since the cache was built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub refill_requests: u64,
    pub refill_requests_coalesced: u64,
    pub refills_completed: u64,
    pub refills_skipped: u64,
    pub refills_failed: u64,
    /// Passes that found nothing after the last resident frame.
    pub refills_exhausted: u64,
    pub frames_fetched: u64,
    pub empty_probes: u64,
}

#[derive(Debug, Clone, Copy)]
enum Acquire {
    // Background passes give way to one already running.
    Try,
    // Seeks wait so the requested position is honoured before they return.
    Wait,
}

#[derive(Default)]
struct Counters {
    refills_completed: AtomicU64,
    refills_skipped: AtomicU64,
    refills_failed: AtomicU64,
    refills_exhausted: AtomicU64,
    frames_fetched: AtomicU64,
    empty_probes: AtomicU64,
}

// Everything behind the navigation lock.
struct NavState {
    window: Window,
    config: CacheConfig,
}

// State shared between the cache handle, the refill worker and async seeks.
struct Shared {
    meta: RecordingMeta,
    store: Arc<dyn FrameStore>,
    nav: Mutex<NavState>,
    refill_lock: Mutex<()>,
    // Observers, written under the navigation lock, read without it.
    forward_len: AtomicUsize,
    history_len: AtomicUsize,
    cursor: AtomicU64,
    counters: Counters,
}

impl Shared {
    fn nav(&self) -> MutexGuard<'_, NavState> {
        // Window state is consistent between statements, so a panic elsewhere leaves it usable.
        self.nav.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, window: &Window) {
        self.forward_len.store(window.forward_len(), Ordering::Release);
        self.history_len.store(window.history_len(), Ordering::Release);
        self.cursor.store(window.cursor(), Ordering::Release);
    }

    fn advance(&self) -> Option<Frame> {
        let mut nav = self.nav();
        let frame = nav.window.advance();
        self.publish(&nav.window);
        frame
    }

    fn retreat(&self) -> Option<Frame> {
        let mut nav = self.nav();
        let frame = nav.window.retreat();
        self.publish(&nav.window);
        frame
    }

    /// Returns the number of frames drained in-window, or zero after a seek.
    fn skip_forward(&self, seconds: f64) -> Result<usize, CacheError> {
        let skip = {
            let mut nav = self.nav();
            let frames = nav.config.seconds_to_frames(seconds);
            let skip = nav.window.skip_forward(frames);
            self.publish(&nav.window);
            skip
        };
        match skip {
            Skip::Drained(moved) => Ok(moved),
            Skip::OutOfWindow(target) => self.seek_to_index(target).map(|_| 0),
        }
    }

    fn skip_backward(&self, seconds: f64) -> Result<(), CacheError> {
        let skip = {
            let mut nav = self.nav();
            let frames = nav.config.seconds_to_frames(seconds);
            let skip = nav.window.skip_backward(frames);
            self.publish(&nav.window);
            skip
        };
        match skip {
            Skip::Drained(_) => Ok(()),
            Skip::OutOfWindow(target) => self.seek_to_index(target),
        }
    }

    fn fraction_to_index(&self, fraction: f64) -> FrameIndex {
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        let offset = (fraction * self.meta.span() as f64).round() as FrameIndex;
        self.meta.clamp_index(self.meta.min_frame_index.saturating_add(offset))
    }

    fn seek_to_fraction(&self, fraction: f64) -> Result<(), CacheError> {
        self.seek_to_index(self.fraction_to_index(fraction))
    }

    fn seek_to_index(&self, index: FrameIndex) -> Result<(), CacheError> {
        let target = self.meta.clamp_index(index);
        {
            let mut nav = self.nav();
            nav.window.request_seek(target);
            self.publish(&nav.window);
        }
        info!(recording = %self.meta.id, index = target, "seek requested");

        let result = self.refill(Acquire::Wait);

        let mut nav = self.nav();
        nav.window.settle_after_seek(target);
        self.publish(&nav.window);
        debug!(
            recording = %self.meta.id,
            index = target,
            cursor = nav.window.cursor(),
            forward = nav.window.forward_len(),
            "seek settled"
        );
        result.map(|_| ())
    }

    /// One refill pass. At most one runs at a time per cache.
    fn refill(&self, acquire: Acquire) -> Result<RefillOutcome, CacheError> {
        let _guard = match acquire {
            Acquire::Wait => self.refill_lock.lock().unwrap_or_else(PoisonError::into_inner),
            Acquire::Try => match self.refill_lock.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    self.counters.refills_skipped.fetch_add(1, Ordering::Relaxed);
                    return Ok(RefillOutcome::Skipped);
                }
            },
        };

        let plan = {
            let mut nav = self.nav();
            let plan = nav.window.plan_refill();
            self.publish(&nav.window);
            plan
        };

        let result = match plan {
            RefillPlan::Idle => Ok(RefillOutcome::Idle),
            RefillPlan::TrimmedForward(trimmed) => Ok(RefillOutcome::TrimmedForward(trimmed)),
            RefillPlan::Fetch(plan) => self.top_up(plan),
        };

        {
            let mut nav = self.nav();
            nav.window.trim_history();
            self.publish(&nav.window);
        }

        match &result {
            Ok(outcome) => {
                self.counters.refills_completed.fetch_add(1, Ordering::Relaxed);
                if *outcome == RefillOutcome::Exhausted {
                    self.counters.refills_exhausted.fetch_add(1, Ordering::Relaxed);
                }
                trace!(recording = %self.meta.id, ?outcome, "refill pass done");
            }
            Err(_) => {
                self.counters.refills_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    /// Fetches batches until the forward queue is back above the refill threshold, so a
    /// window wider than one batch fills in a single pass.
    fn top_up(&self, first: FetchPlan) -> Result<RefillOutcome, CacheError> {
        let mut plan = first;
        let mut filled = 0;
        loop {
            let outcome = self.fetch_and_splice(&plan)?;
            let RefillOutcome::Filled(appended) = outcome else {
                return Ok(if filled > 0 { RefillOutcome::Filled(filled) } else { outcome });
            };
            filled += appended;
            if appended == 0 {
                return Ok(RefillOutcome::Filled(filled));
            }

            let next = {
                let mut nav = self.nav();
                let next = nav.window.plan_refill();
                self.publish(&nav.window);
                next
            };
            match next {
                RefillPlan::Fetch(next) => plan = next,
                _ => return Ok(RefillOutcome::Filled(filled)),
            }
        }
    }

    fn fetch_and_splice(&self, plan: &FetchPlan) -> Result<RefillOutcome, CacheError> {
        let Some(batch) = self.probe(plan)? else {
            debug!(recording = %self.meta.id, start = plan.start, "no frames left to fetch");
            return Ok(RefillOutcome::Exhausted);
        };
        let fetched = batch.len();
        self.counters.frames_fetched.fetch_add(fetched as u64, Ordering::Relaxed);

        let splice = {
            let mut nav = self.nav();
            let splice = nav.window.splice(plan.epoch, batch);
            self.publish(&nav.window);
            splice
        };
        match splice {
            Splice::Appended(appended) => {
                debug!(
                    recording = %self.meta.id,
                    start = plan.start,
                    fetched,
                    appended,
                    seek = plan.seek,
                    "forward queue refilled"
                );
                Ok(RefillOutcome::Filled(appended))
            }
            Splice::Discarded => {
                debug!(recording = %self.meta.id, epoch = plan.epoch, "stale batch discarded");
                Ok(RefillOutcome::Discarded)
            }
        }
    }

    /// Walks forward from `plan.start` in steps of `plan.count` until a query returns frames
    /// or the start passes the end of the recording. Runs without the navigation lock.
    fn probe(&self, plan: &FetchPlan) -> Result<Option<Vec<Frame>>, StoreError> {
        let step = plan.count.max(1) as u64;
        let mut start = plan.start;
        while start <= self.meta.max_frame_index {
            let batch = self.store.frames(self.meta.id, start, plan.count, plan.frame_rate)?;
            if !batch.is_empty() {
                return Ok(Some(batch));
            }
            self.counters.empty_probes.fetch_add(1, Ordering::Relaxed);
            start = match start.checked_add(step) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(None)
    }
}

async fn run_refill_worker(shared: Arc<Shared>, mut requests: mpsc::Receiver<RefillRequest>) {
    while let Some(request) = requests.recv().await {
        let pass = Arc::clone(&shared);
        match tokio::task::spawn_blocking(move || pass.refill(Acquire::Try)).await {
            Ok(Ok(outcome)) => {
                trace!(reason = ?request.reason, ?outcome, "background refill finished");
            }
            Ok(Err(e)) => {
                warn!(recording = %shared.meta.id, reason = ?request.reason, error = %e, "background refill failed");
            }
            Err(e) => {
                warn!(recording = %shared.meta.id, error = %e, "background refill task aborted");
            }
        }
    }
    debug!(recording = %shared.meta.id, "refill worker stopped");
}

/// Windowed cache of frames around a playback cursor.
///
/// `advance` and `retreat` only touch memory and never wait on the store; an empty return
/// means the forward queue is still buffering and the caller should try again next tick.
/// Skips that leave the buffered window and every seek block the calling thread until the
/// store has been queried for the new position.
pub struct WindowedFrameCache {
    shared: Arc<Shared>,
    scheduler: RefillScheduler,
    worker: Option<JoinHandle<()>>,
    runtime: Option<Runtime>,
}

impl WindowedFrameCache {
    /// Build a cache over `recording` and queue its initial fill.
    /// Only the metadata lookup happens on the calling thread.
    pub fn new(
        recording: RecordingId,
        store: Arc<dyn FrameStore>,
        config: CacheConfig,
    ) -> Result<Self, CacheError> {
        Self::with_worker_threads(recording, store, config, 1)
    }

    pub(crate) fn with_worker_threads(
        recording: RecordingId,
        store: Arc<dyn FrameStore>,
        config: CacheConfig,
        worker_threads: usize,
    ) -> Result<Self, CacheError> {
        config.validate()?;
        let meta = store
            .recording_meta(recording)?
            .ok_or(CacheError::RecordingNotFound(recording))?;
        if meta.min_frame_index > meta.max_frame_index {
            return Err(StoreError::Corrupt(format!(
                "{} has min index {} above max index {}",
                recording, meta.min_frame_index, meta.max_frame_index
            ))
            .into());
        }

        let runtime = Runtime::with_worker_threads(worker_threads)?;
        let window = Window::new(meta.min_frame_index, config.window_params());
        let shared = Arc::new(Shared {
            meta,
            store,
            nav: Mutex::new(NavState { window, config }),
            refill_lock: Mutex::new(()),
            forward_len: AtomicUsize::new(0),
            history_len: AtomicUsize::new(0),
            cursor: AtomicU64::new(meta.min_frame_index),
            counters: Counters::default(),
        });

        let (scheduler, requests) = RefillScheduler::new();
        let worker = runtime.spawn(run_refill_worker(Arc::clone(&shared), requests));
        scheduler.request(RefillReason::Initial);

        info!(
            recording = %recording,
            min = meta.min_frame_index,
            max = meta.max_frame_index,
            window = config.target_window_size(),
            batch = config.frames_per_query(),
            "frame cache created"
        );
        Ok(Self {
            shared,
            scheduler,
            worker: Some(worker),
            runtime: Some(runtime),
        })
    }

    /// Returns the next frame and moves the cursor onto it, or `None` while buffering.
    /// Every call also queues a background refill check.
    pub fn advance(&self) -> Option<Frame> {
        let frame = self.shared.advance();
        self.scheduler.request(RefillReason::Advance);
        frame
    }

    /// Steps back to the most recently returned frame, or `None` once history is exhausted.
    pub fn retreat(&self) -> Option<Frame> {
        self.shared.retreat()
    }

    /// Moves the cursor `seconds` ahead. Drains buffered frames when the target is resident,
    /// otherwise seeks there and blocks until the store answered.
    pub fn skip_forward(&self, seconds: f64) -> Result<(), CacheError> {
        if self.shared.skip_forward(seconds)? > 0 {
            self.scheduler.request(RefillReason::Skip);
        }
        Ok(())
    }

    /// Moves the cursor `seconds` back, seeking when the history does not reach that far.
    pub fn skip_backward(&self, seconds: f64) -> Result<(), CacheError> {
        self.shared.skip_backward(seconds)
    }

    /// Seeks to a position given as a fraction of the recording, clamped to `[0, 1]`.
    ///
    /// Discards the whole window and refetches from the new position on the calling thread.
    /// Returns once the cursor is committed; store errors are returned here.
    pub fn seek_to_fraction(&self, fraction: f64) -> Result<(), CacheError> {
        self.shared.seek_to_fraction(fraction)
    }

    /// Seeks to an absolute frame index, clamped to the recording's bounds.
    pub fn seek_to_index(&self, index: FrameIndex) -> Result<(), CacheError> {
        self.shared.seek_to_index(index)
    }

    /// Same as `seek_to_fraction` but runs on the cache's blocking pool.
    ///
    /// The seek starts right away; the returned future resolves once it has settled. A seek
    /// that panicked or was cancelled by the cache shutting down yields `WorkerStopped`.
    pub fn seek_to_fraction_async(
        &self,
        fraction: f64,
    ) -> impl Future<Output = Result<(), CacheError>> + Send + 'static {
        let shared = Arc::clone(&self.shared);
        let handle = self
            .runtime
            .as_ref()
            .map(|runtime| runtime.spawn_blocking(move || shared.seek_to_fraction(fraction)));
        async move {
            let handle = handle.ok_or(CacheError::WorkerStopped)?;
            handle.await.map_err(|e| {
                warn!(error = %e, "background seek did not complete");
                CacheError::WorkerStopped
            })?
        }
    }

    /// Discards every buffered frame and refills around the current cursor.
    pub fn clear(&self) -> Result<(), CacheError> {
        let cursor = self.shared.nav().window.cursor();
        self.shared.seek_to_index(cursor)
    }

    /// Applies new window sizing, then clears so no frame fetched under the old one survives.
    pub fn set_config(&self, config: CacheConfig) -> Result<(), CacheError> {
        config.validate()?;
        {
            let mut nav = self.shared.nav();
            nav.config = config;
            nav.window.set_params(config.window_params());
        }
        info!(
            recording = %self.shared.meta.id,
            window = config.target_window_size(),
            batch = config.frames_per_query(),
            "cache reconfigured"
        );
        self.clear()
    }

    /// Queues a refill check without moving the cursor, for consumers that poll while paused.
    pub fn poll_refill(&self) -> bool {
        self.scheduler.request(RefillReason::Poll)
    }

    /// Cursor position within the recording, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        let span = self.shared.meta.span();
        if span == 0 {
            return 0.0;
        }
        let offset = self.cursor_index().saturating_sub(self.shared.meta.min_frame_index);
        (offset as f64 / span as f64).clamp(0.0, 1.0)
    }

    pub fn forward_buffer_size(&self) -> usize {
        self.shared.forward_len.load(Ordering::Acquire)
    }

    pub fn history_buffer_size(&self) -> usize {
        self.shared.history_len.load(Ordering::Acquire)
    }

    pub fn cursor_index(&self) -> FrameIndex {
        self.shared.cursor.load(Ordering::Acquire)
    }

    pub fn recording_meta(&self) -> RecordingMeta {
        self.shared.meta
    }

    pub fn config(&self) -> CacheConfig {
        self.shared.nav().config
    }

    pub fn target_window_size(&self) -> usize {
        self.shared.nav().window.params().target
    }

    pub fn frames_per_query(&self) -> usize {
        self.shared.nav().window.params().frames_per_query
    }

    pub fn stats(&self) -> CacheStats {
        let counters = &self.shared.counters;
        CacheStats {
            refill_requests: self.scheduler.accepted(),
            refill_requests_coalesced: self.scheduler.coalesced(),
            refills_completed: counters.refills_completed.load(Ordering::Relaxed),
            refills_skipped: counters.refills_skipped.load(Ordering::Relaxed),
            refills_failed: counters.refills_failed.load(Ordering::Relaxed),
            refills_exhausted: counters.refills_exhausted.load(Ordering::Relaxed),
            frames_fetched: counters.frames_fetched.load(Ordering::Relaxed),
            empty_probes: counters.empty_probes.load(Ordering::Relaxed),
        }
    }
}

impl Drop for WindowedFrameCache {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        // A refill stuck in the store keeps its blocking thread; don't wait for it here.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
