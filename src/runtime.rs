// Async runtime module
// Each cache owns a small Tokio runtime that hosts its refill worker and the blocking
// store calls the worker makes.

use tokio::runtime::{Builder, Runtime as TokioRuntime};

/// Builder for creating a Runtime with configurable worker threads.
pub struct RuntimeBuilder {
    // Number of worker threads for the runtime. Defaults to one; refills are single-flight.
    worker_threads: usize,
    thread_name: String,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            worker_threads: 1,
            thread_name: "frame-refill".to_string(),
        }
    }

    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn build(self) -> Result<Runtime, std::io::Error> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(self.worker_threads)
            .thread_name(self.thread_name)
            .enable_all()
            .build()?;
        Ok(Runtime { runtime })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps the Tokio runtime a cache schedules its background work on.
pub struct Runtime {
    runtime: TokioRuntime,
}

impl Runtime {
    pub fn with_worker_threads(threads: usize) -> Result<Self, std::io::Error> {
        RuntimeBuilder::new().worker_threads(threads).build()
    }

    /// Spawn a task on this runtime and return a JoinHandle to await its result.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    /// Run a blocking closure on the runtime's blocking pool.
    pub fn spawn_blocking<F, T>(&self, f: F) -> tokio::task::JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.runtime.spawn_blocking(f)
    }

    /// Shut down without waiting for in-flight blocking work.
    /// Safe to call from inside another async context, unlike dropping the runtime.
    pub fn shutdown_background(self) {
        self.runtime.shutdown_background();
    }
}
