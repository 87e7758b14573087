//! Switch configuration.

use std::time::Duration;

/// Default cap on concurrently dialing per-peer queues.
pub const DEFAULT_MAX_PARALLEL_DIALS: usize = 10;

/// Default grace period for draining connection tasks on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Configuration for the switch.
#[derive(Debug, Clone)]
pub struct SwitchConfig {
    /// Maximum number of per-peer dial queues active at once.
    pub max_parallel_dials: usize,

    /// How long to wait for accepted-connection tasks to finish on `stop`.
    pub shutdown_grace: Duration,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            max_parallel_dials: DEFAULT_MAX_PARALLEL_DIALS,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl SwitchConfig {
    /// Create a configuration with the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cap on concurrently dialing per-peer queues.
    pub fn with_max_parallel_dials(mut self, cap: usize) -> Self {
        self.max_parallel_dials = cap;
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}
