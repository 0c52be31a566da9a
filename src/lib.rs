//! framewindow-rs — windowed frame cache for real-time playback of recorded sensor frames
//!
//! A [`WindowedFrameCache`] keeps a bounded window of frames around a playback cursor,
//! prefetches ahead of it on a background worker and keeps a trailing history for reverse
//! navigation. Frames come from any [`FrameStore`].

pub mod cache;
pub mod config;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod testlib;
mod window;

pub use cache::{CacheError, CacheStats, RefillOutcome, WindowedFrameCache};
pub use config::{CacheConfig, WindowedFrameCacheBuilder};
pub use store::{Frame, FrameIndex, FrameStore, MemoryFrameStore, RecordingId, RecordingMeta, StoreError};

static CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the crate semantic version string.
pub fn version() -> &'static str {
    CRATE_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_semver_like() {
        assert!(version().split('.').count() >= 3);
    }
}
