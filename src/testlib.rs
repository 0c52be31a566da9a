//! Test utilities for framewindow-rs
// Store fixtures and a polling helper shared by unit tests, integration tests and benches.

use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::store::{FrameIndex, MemoryFrameStore, RecordingId, RecordingMeta};

/// Metadata for a recording at 10 fps spanning `[min, max]`.
pub fn recording_meta(id: u64, min: FrameIndex, max: FrameIndex) -> RecordingMeta {
    RecordingMeta {
        id: RecordingId(id),
        min_frame_index: min,
        max_frame_index: max,
        native_frame_rate: 10.0,
    }
}

/// A store holding one recording with a frame at every index in `[min, max]` except `gaps`.
pub fn dense_store(id: u64, min: FrameIndex, max: FrameIndex, gaps: &[Range<FrameIndex>]) -> Arc<MemoryFrameStore> {
    let store = Arc::new(MemoryFrameStore::new());
    store.insert_dense(recording_meta(id, min, max), gaps);
    store
}

/// Decodes the payload written by `MemoryFrameStore::insert_dense`.
pub fn payload_index(payload: &[u8]) -> Option<FrameIndex> {
    let bytes: [u8; 8] = payload.try_into().ok()?;
    Some(FrameIndex::from_le_bytes(bytes))
}

/// Polls `condition` every millisecond until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
