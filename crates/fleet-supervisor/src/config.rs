//! Supervisor timings.

use std::time::Duration;

/// Timing knobs for the supervisor. Every field has a default.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// Pause between ticks.
    pub tick_interval: Duration,
    /// Pause after a tick that failed or timed out.
    pub retry_delay: Duration,
    /// Upper bound on a single tick. Clamped to `lock_ttl`.
    pub tick_timeout: Duration,
    /// Lease on the supervisor lock.
    pub lock_ttl: Duration,
    /// A node never picked up by the provider is failed after this long.
    pub pending_timeout: Duration,
    /// A started node that never registered is failed after this long.
    pub starting_timeout: Duration,
    /// A draining node is reported as stuck after this long.
    pub finishing_timeout: Duration,
    /// How long `TERMINATED` nodes are kept before removal.
    pub terminated_retention: Duration,
    /// How long `ERROR` nodes are kept before removal.
    pub error_retention: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            retry_delay: Duration::from_secs(5),
            tick_timeout: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(60),
            pending_timeout: Duration::from_secs(15 * 60),
            starting_timeout: Duration::from_secs(5 * 60),
            finishing_timeout: Duration::from_secs(24 * 60 * 60),
            terminated_retention: Duration::from_secs(24 * 60 * 60),
            error_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}
