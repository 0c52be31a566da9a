//! Configuration and builder for WindowedFrameCache

use std::sync::Arc;

use crate::cache::{CacheError, WindowedFrameCache};
use crate::store::{FrameStore, RecordingId};
use crate::window::WindowParams;

/// Largest window accepted on each side of the cursor: 600 s at 1000 fps.
pub const MAX_WINDOW_FRAMES: usize = 600_000;
/// Largest store batch accepted: two seconds at 1000 fps.
pub const MAX_FRAMES_PER_QUERY: usize = 2_000;

/// Sizing of the cache window.
///
/// `buffer_duration_seconds` is the span kept on each side of the cursor, `frame_rate` the
/// effective playback rate used to turn seconds into frame counts. `refill_threshold` is the
/// fraction of the target window at or below which the forward queue is topped up again; it
/// stays below one so a full window never triggers a fetch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheConfig {
    pub buffer_duration_seconds: f64,
    pub frame_rate: f64,
    pub refill_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            buffer_duration_seconds: 2.0,
            frame_rate: 10.0,
            refill_threshold: 0.8,
        }
    }
}

impl CacheConfig {
    pub fn new(buffer_duration_seconds: f64, frame_rate: f64) -> Self {
        Self {
            buffer_duration_seconds,
            frame_rate,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if !(self.buffer_duration_seconds.is_finite() && self.buffer_duration_seconds > 0.0) {
            return Err(CacheError::InvalidConfig(format!(
                "buffer_duration_seconds must be positive, got {}",
                self.buffer_duration_seconds
            )));
        }
        if !(self.frame_rate.is_finite() && self.frame_rate > 0.0) {
            return Err(CacheError::InvalidConfig(format!(
                "frame_rate must be positive, got {}",
                self.frame_rate
            )));
        }
        if !(self.refill_threshold > 0.0 && self.refill_threshold < 1.0) {
            return Err(CacheError::InvalidConfig(format!(
                "refill_threshold must be in (0, 1), got {}",
                self.refill_threshold
            )));
        }
        let window = (self.buffer_duration_seconds * self.frame_rate).ceil();
        if window > MAX_WINDOW_FRAMES as f64 {
            return Err(CacheError::InvalidConfig(format!(
                "window of {} frames exceeds the limit of {}",
                window, MAX_WINDOW_FRAMES
            )));
        }
        if self.frames_per_query() > MAX_FRAMES_PER_QUERY {
            return Err(CacheError::InvalidConfig(format!(
                "batch of {} frames exceeds the limit of {}",
                self.frames_per_query(),
                MAX_FRAMES_PER_QUERY
            )));
        }
        Ok(())
    }

    /// Frames kept on each side of the cursor: `ceil(buffer × rate)`, at least one.
    pub fn target_window_size(&self) -> usize {
        ((self.buffer_duration_seconds * self.frame_rate).ceil() as usize).max(1)
    }

    /// Frames requested per store query: two seconds worth, at least one.
    pub fn frames_per_query(&self) -> usize {
        ((2.0 * self.frame_rate).round() as usize).max(1)
    }

    /// Converts a playback duration into a frame count at this rate.
    pub fn seconds_to_frames(&self, seconds: f64) -> usize {
        if !seconds.is_finite() || seconds <= 0.0 {
            return 0;
        }
        (seconds * self.frame_rate).round() as usize
    }

    pub(crate) fn window_params(&self) -> WindowParams {
        let target = self.target_window_size();
        WindowParams {
            target,
            frames_per_query: self.frames_per_query(),
            frame_rate: self.frame_rate,
            refill_below: ((target as f64 * self.refill_threshold).floor() as usize).min(target - 1),
        }
    }
}

/// Builder for WindowedFrameCache.
/// Setters clamp their input into a sane range instead of failing.
#[derive(Debug, Clone)]
pub struct WindowedFrameCacheBuilder {
    config: CacheConfig,
    worker_threads: usize, // Default: 1, Range: 1-16
}

impl Default for WindowedFrameCacheBuilder {
    fn default() -> Self {
        Self {
            config: CacheConfig::default(),
            worker_threads: 1,
        }
    }
}

impl WindowedFrameCacheBuilder {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn buffer_duration_seconds(mut self, secs: f64) -> Self {
        self.config.buffer_duration_seconds = secs.clamp(0.1, 600.0);
        self
    }
    pub fn frame_rate(mut self, fps: f64) -> Self {
        self.config.frame_rate = fps.clamp(0.1, 1000.0);
        self
    }
    pub fn refill_threshold(mut self, fraction: f64) -> Self {
        self.config.refill_threshold = fraction.clamp(0.1, 0.95);
        self
    }
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.clamp(1, 16);
        self
    }
    pub fn config(&self) -> CacheConfig {
        self.config
    }
    /// Build a cache over `recording`; fails if the store does not know the recording.
    pub fn build(
        self,
        recording: RecordingId,
        store: Arc<dyn FrameStore>,
    ) -> Result<WindowedFrameCache, CacheError> {
        WindowedFrameCache::with_worker_threads(recording, store, self.config, self.worker_threads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sizing() {
        let config = CacheConfig::default();
        assert_eq!(config.target_window_size(), 20);
        assert_eq!(config.frames_per_query(), 20);
        let params = config.window_params();
        assert_eq!(params.refill_below, 16);
        assert_eq!(params.frame_rate, 10.0);
    }

    #[test]
    fn test_sizing_rounds_and_floors_at_one() {
        let config = CacheConfig::new(0.05, 1.0);
        assert_eq!(config.target_window_size(), 1);
        assert_eq!(config.frames_per_query(), 2);
        assert_eq!(config.window_params().refill_below, 0);

        let config = CacheConfig::new(1.5, 29.97);
        assert_eq!(config.target_window_size(), 45);
        assert_eq!(config.frames_per_query(), 60);
    }

    #[test]
    fn test_seconds_to_frames() {
        let config = CacheConfig::new(2.0, 10.0);
        assert_eq!(config.seconds_to_frames(1.0), 10);
        assert_eq!(config.seconds_to_frames(0.26), 3);
        assert_eq!(config.seconds_to_frames(-4.0), 0);
        assert_eq!(config.seconds_to_frames(f64::NAN), 0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(CacheConfig::default().validate().is_ok());
        assert!(CacheConfig::new(0.0, 10.0).validate().is_err());
        assert!(CacheConfig::new(2.0, f64::INFINITY).validate().is_err());
        let config = CacheConfig {
            refill_threshold: 1.5,
            ..CacheConfig::default()
        };
        assert!(matches!(config.validate(), Err(CacheError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_oversized_windows() {
        assert!(CacheConfig::new(600.0, 1000.0).validate().is_ok());
        assert!(matches!(
            CacheConfig::new(1e300, 10.0).validate(),
            Err(CacheError::InvalidConfig(_))
        ));
        assert!(CacheConfig::new(601.0, 1000.0).validate().is_err());
        // Small window, but two seconds at this rate is far too large a batch.
        assert!(CacheConfig::new(0.001, 1e6).validate().is_err());
    }

    #[test]
    fn test_threshold_of_one_is_rejected() {
        let config = CacheConfig {
            refill_threshold: 1.0,
            ..CacheConfig::default()
        };
        assert!(matches!(config.validate(), Err(CacheError::InvalidConfig(_))));

        let config = CacheConfig {
            refill_threshold: 0.99,
            ..CacheConfig::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.window_params().refill_below, 19);
        assert!(config.window_params().refill_below < config.target_window_size());
    }

    #[test]
    fn test_builder_defaults_and_overrides() {
        let builder = WindowedFrameCacheBuilder::new();
        assert_eq!(builder.config(), CacheConfig::default());
        assert_eq!(builder.worker_threads, 1);

        let builder = builder
            .buffer_duration_seconds(5.0)
            .frame_rate(30.0)
            .refill_threshold(0.5)
            .worker_threads(4);
        assert_eq!(builder.config().buffer_duration_seconds, 5.0);
        assert_eq!(builder.config().frame_rate, 30.0);
        assert_eq!(builder.config().refill_threshold, 0.5);
        assert_eq!(builder.worker_threads, 4);
    }

    #[test]
    fn test_builder_clamps() {
        let builder = WindowedFrameCacheBuilder::new()
            .buffer_duration_seconds(0.0)
            .frame_rate(1e9)
            .refill_threshold(0.0)
            .worker_threads(0);
        assert_eq!(builder.config().buffer_duration_seconds, 0.1);
        assert_eq!(WindowedFrameCacheBuilder::new().refill_threshold(1.0).config().refill_threshold, 0.95);
        assert_eq!(builder.config().frame_rate, 1000.0);
        assert_eq!(builder.config().refill_threshold, 0.1);
        assert_eq!(builder.worker_threads, 1);
    }
}
