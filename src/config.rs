//! Registry configuration.

use std::time::Duration;

/// Configuration for [`crate::System`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemConfig {
    dispatch_capacity: usize,
    acquisition_timeout: Duration,
    continuous_buffer_count: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            dispatch_capacity: 64,
            acquisition_timeout: Duration::from_millis(5000),
            continuous_buffer_count: 5,
        }
    }
}

impl SystemConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how many driver events may wait for the dispatch thread.
    #[must_use]
    pub fn with_dispatch_capacity(mut self, capacity: usize) -> Self {
        self.dispatch_capacity = capacity.max(1);
        self
    }

    /// Set the default per-frame timeout for synchronous grabs.
    #[must_use]
    pub const fn with_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.acquisition_timeout = timeout;
        self
    }

    /// Set the default number of frames used for continuous acquisition.
    #[must_use]
    pub fn with_continuous_buffer_count(mut self, count: usize) -> Self {
        self.continuous_buffer_count = count.max(1);
        self
    }

    /// Dispatch channel capacity.
    pub const fn dispatch_capacity(&self) -> usize {
        self.dispatch_capacity
    }

    /// Default per-frame timeout for synchronous grabs.
    pub const fn acquisition_timeout(&self) -> Duration {
        self.acquisition_timeout
    }

    /// Default number of frames for continuous acquisition.
    pub const fn continuous_buffer_count(&self) -> usize {
        self.continuous_buffer_count
    }
}
