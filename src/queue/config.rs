//! Queue configuration

/// Default number of queued requests before a barrier at the head of
/// the queue is submitted
pub const DEFAULT_BARRIER_THRESHOLD: usize = 50;

/// Configuration for a [`BlockQueue`](super::BlockQueue)
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue length below which a barrier at the head is deferred so
    /// more writes can accumulate behind it. Flushes and outstanding
    /// flush waiters override the deferral.
    pub barrier_threshold: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            barrier_threshold: DEFAULT_BARRIER_THRESHOLD,
        }
    }
}

impl QueueConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the barrier submit threshold
    pub fn with_barrier_threshold(mut self, threshold: usize) -> Self {
        self.barrier_threshold = threshold;
        self
    }
}
