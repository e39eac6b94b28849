//! Tunable constants for the synchronization core.
//!
//! Every timing and sizing knob lives here so hosts and tests can construct
//! a session with their own values instead of patching consts scattered
//! across modules.

use std::time::Duration;

/// Configuration for one order-sync session.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Minimum gap between two fallback polls of the remote store.
    pub poll_throttle: Duration,
    /// Consecutive connection failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit stays open before a fresh attempt is allowed.
    pub circuit_cooldown: Duration,
    /// Delay before the forced cache refresh that follows a status update
    /// or a bulk import.
    pub forced_refresh_delay: Duration,
    /// Coalescing window for refresh-needed events.
    pub refresh_debounce: Duration,
    /// Upper bound on orders pulled by a full refresh.
    pub fetch_limit: usize,
    /// Chunk size for bulk status/delete requests.
    pub bulk_batch_size: usize,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// Gap between change-feed polls while a subscription is live.
    pub change_poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_throttle: Duration::from_secs(25),
            failure_threshold: 5,
            circuit_cooldown: Duration::from_secs(300),
            forced_refresh_delay: Duration::from_millis(500),
            refresh_debounce: Duration::from_millis(300),
            fetch_limit: 100,
            bulk_batch_size: 20,
            request_timeout: Duration::from_secs(30),
            change_poll_interval: Duration::from_secs(2),
        }
    }
}
