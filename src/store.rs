// Backing store abstraction module
// Defines the FrameStore interface the cache pulls frames through, the metadata and frame
// types that cross it, and an in-memory store used by tests, benches and the demo.

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;

/// Position of a frame within its recording. Larger means later.
pub type FrameIndex = u64;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Corrupt frame data: {0}")]
    Corrupt(String),
    #[error("Store error: {0}")]
    Other(String),
}

/// Identifies one recording in a backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordingId(pub u64);

impl fmt::Display for RecordingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "recording#{}", self.0)
    }
}

/// Bounds and native rate of a recording, fetched once when a cache is built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordingMeta {
    pub id: RecordingId,
    pub min_frame_index: FrameIndex,
    pub max_frame_index: FrameIndex,
    pub native_frame_rate: f64,
}

impl RecordingMeta {
    /// Number of index steps between the first and last frame.
    pub fn span(&self) -> FrameIndex {
        self.max_frame_index.saturating_sub(self.min_frame_index)
    }

    pub fn clamp_index(&self, index: FrameIndex) -> FrameIndex {
        index.clamp(self.min_frame_index, self.max_frame_index)
    }
}

/// One ordered unit of sensor data. The payload is opaque to the cache.
/// Cloning is cheap: the payload buffer is shared, never copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub index: FrameIndex,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(index: FrameIndex, payload: impl Into<Bytes>) -> Self {
        Self {
            index,
            payload: payload.into(),
        }
    }
}

/// Query interface over the frames of stored recordings.
///
/// Implementations are called from the cache's refill worker and, during seeks, from the
/// caller's thread, so they must be usable from several threads at once.
pub trait FrameStore: Send + Sync {
    /// Returns the metadata for `recording`, or `None` if the store does not know it.
    fn recording_meta(&self, recording: RecordingId) -> Result<Option<RecordingMeta>, StoreError>;

    /// Fetches up to `count` frames of `recording` starting at `start`.
    ///
    /// The result is ascending by index and never contains an index below `start`. It may be
    /// shorter than `count` or empty when the recording has a gap there. `frame_rate` is the
    /// consumer's effective playback rate, which stores are free to use for decimation.
    fn frames(
        &self,
        recording: RecordingId,
        start: FrameIndex,
        count: usize,
        frame_rate: f64,
    ) -> Result<Vec<Frame>, StoreError>;
}

struct MemoryRecording {
    meta: RecordingMeta,
    frames: BTreeMap<FrameIndex, Bytes>,
}

/// In-memory FrameStore.
///
/// `frames` answers with the stored frames whose index falls in `[start, start + count)`, so
/// holes in a recording show up as short or empty batches exactly like a sparse SQL range
/// query would. Latency and failures can be injected to exercise the cache's refill paths.
pub struct MemoryFrameStore {
    recordings: RwLock<HashMap<RecordingId, MemoryRecording>>,
    latency: Option<Duration>,
    failing: AtomicBool,
    queries: AtomicUsize,
}

impl MemoryFrameStore {
    pub fn new() -> Self {
        Self {
            recordings: RwLock::new(HashMap::new()),
            latency: None,
            failing: AtomicBool::new(false),
            queries: AtomicUsize::new(0),
        }
    }

    /// Sleep for `latency` inside every `frames` call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Registers a recording, replacing any earlier one with the same id.
    /// Frames outside the metadata bounds are ignored.
    pub fn insert_recording(&self, meta: RecordingMeta, frames: impl IntoIterator<Item = Frame>) {
        let frames = frames
            .into_iter()
            .filter(|f| f.index >= meta.min_frame_index && f.index <= meta.max_frame_index)
            .map(|f| (f.index, f.payload))
            .collect();
        let mut recordings = self.recordings.write().unwrap_or_else(PoisonError::into_inner);
        recordings.insert(meta.id, MemoryRecording { meta, frames });
    }

    /// Registers a recording with a frame at every index in its bounds, skipping `gaps`.
    /// Each payload is the little-endian encoding of its index.
    pub fn insert_dense(&self, meta: RecordingMeta, gaps: &[std::ops::Range<FrameIndex>]) {
        let frames = (meta.min_frame_index..=meta.max_frame_index)
            .filter(|i| !gaps.iter().any(|g| g.contains(i)))
            .map(|i| Frame::new(i, Bytes::copy_from_slice(&i.to_le_bytes())));
        self.insert_recording(meta, frames);
    }

    /// While set, every `frames` call fails with `StoreError::Unavailable`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `frames` calls served so far, failed ones included.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl Default for MemoryFrameStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameStore for MemoryFrameStore {
    fn recording_meta(&self, recording: RecordingId) -> Result<Option<RecordingMeta>, StoreError> {
        let recordings = self.recordings.read().unwrap_or_else(PoisonError::into_inner);
        Ok(recordings.get(&recording).map(|r| r.meta))
    }

    fn frames(
        &self,
        recording: RecordingId,
        start: FrameIndex,
        count: usize,
        _frame_rate: f64,
    ) -> Result<Vec<Frame>, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{} is offline", recording)));
        }

        let recordings = self.recordings.read().unwrap_or_else(PoisonError::into_inner);
        let rec = recordings
            .get(&recording)
            .ok_or_else(|| StoreError::Other(format!("unknown {}", recording)))?;
        let end = start.saturating_add(count as u64);
        Ok(rec
            .frames
            .range(start..end)
            .map(|(&index, payload)| Frame::new(index, payload.clone()))
            .collect())
    }
}
