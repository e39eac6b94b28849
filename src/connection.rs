//! Connection policy: circuit breaker and polling throttle.
//!
//! Pure local bookkeeping around the realtime channel's health. Records
//! consecutive subscription failures, opens a circuit once they pile up,
//! and rations the polling fallback so a dead push channel never turns
//! into a request flood. No I/O happens here and nothing can fail.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::SyncConfig;

#[derive(Debug, Default)]
struct ConnState {
    connected: bool,
    failures: u32,
    last_failure: Option<Instant>,
    circuit_open: bool,
    fallback_mode: bool,
    last_poll: Option<Instant>,
}

/// Per-session connection health tracker. Shared read-only by everything
/// that needs to pick between push and polling.
pub struct ConnectionPolicy {
    failure_threshold: u32,
    circuit_cooldown: Duration,
    poll_throttle: Duration,
    state: Mutex<ConnState>,
}

impl ConnectionPolicy {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            circuit_cooldown: config.circuit_cooldown,
            poll_throttle: config.poll_throttle,
            state: Mutex::new(ConnState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a new subscription attempt is worthwhile. An open circuit
    /// closes itself (and forgets its failures) once the cool-down window
    /// has passed since the last recorded failure.
    pub fn should_attempt_connection(&self) -> bool {
        self.should_attempt_connection_at(Instant::now())
    }

    fn should_attempt_connection_at(&self, now: Instant) -> bool {
        let mut state = self.lock();
        if !state.circuit_open {
            return true;
        }
        let cooled_down = state
            .last_failure
            .map(|at| now.duration_since(at) > self.circuit_cooldown)
            .unwrap_or(true);
        if cooled_down {
            info!("connection circuit cool-down elapsed, closing circuit");
            state.circuit_open = false;
            state.failures = 0;
            state.last_failure = None;
            return true;
        }
        false
    }

    /// Record one failed connection attempt (or a lost channel). Opens the
    /// circuit and enters fallback mode at the threshold.
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    fn record_failure_at(&self, now: Instant) {
        let mut state = self.lock();
        state.connected = false;
        state.failures = state.failures.saturating_add(1);
        state.last_failure = Some(now);
        debug!(failures = state.failures, "connection failure recorded");
        if state.failures >= self.failure_threshold && !state.circuit_open {
            warn!(
                failures = state.failures,
                "connection circuit opened, switching to polling fallback"
            );
            state.circuit_open = true;
            state.fallback_mode = true;
        }
    }

    /// A subscription confirmed open: forget the failure history and leave
    /// fallback mode.
    pub fn mark_connected(&self) {
        let mut state = self.lock();
        state.connected = true;
        state.failures = 0;
        state.last_failure = None;
        state.circuit_open = false;
        state.fallback_mode = false;
    }

    pub fn mark_disconnected(&self) {
        self.lock().connected = false;
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn is_fallback(&self) -> bool {
        self.lock().fallback_mode
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    /// Run `fetch` at most once per throttle window; otherwise a silent
    /// no-op. The last-poll mark only advances when the fetch actually
    /// runs.
    pub async fn throttled_fetch<F, Fut>(&self, fetch: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        if self.take_poll_slot_at(Instant::now()) {
            fetch().await;
        } else {
            debug!("fallback poll suppressed by throttle window");
        }
    }

    fn take_poll_slot_at(&self, now: Instant) -> bool {
        let mut state = self.lock();
        let due = state
            .last_poll
            .map(|at| now.duration_since(at) >= self.poll_throttle)
            .unwrap_or(true);
        if due {
            state.last_poll = Some(now);
        }
        due
    }
}

// ===========================================================================
// Tests
// ===========================================================================
