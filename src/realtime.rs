//! Realtime subscription lifecycle.
//!
//! Owns the single live change-feed subscription for a session:
//! `Idle -> Connecting -> Subscribed`, back to `Idle` on cleanup or after a
//! failure is recorded. Setup attempts are gated by the connection policy
//! and by a reentrancy guard so overlapping calls cannot stack channels.
//! No business logic lives here; events flow straight to the handler the
//! orchestrator supplies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::connection::ConnectionPolicy;
use crate::store::{ChangeHandler, ChannelLostHandler, OrderStore, SubscriptionHandle};

/// Where the channel currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Subscribed,
}

struct Shared {
    state: Mutex<ChannelState>,
    policy: Arc<ConnectionPolicy>,
}

impl Shared {
    fn set_state(&self, next: ChannelState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }
}

/// Manages at most one push subscription per user session.
pub struct SubscriptionManager {
    shared: Arc<Shared>,
    setup_in_flight: AtomicBool,
    handle: Mutex<Option<SubscriptionHandle>>,
}

impl SubscriptionManager {
    pub fn new(policy: Arc<ConnectionPolicy>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ChannelState::Idle),
                policy,
            }),
            setup_in_flight: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attempt to open the change feed. Returns `true` when a subscription
    /// is live afterwards. No-ops (returning `false`) while another setup
    /// is in flight or while the policy forbids attempts; any previous
    /// subscription is torn down first.
    pub async fn setup(
        &self,
        store: &dyn OrderStore,
        user_id: &str,
        on_event: ChangeHandler,
    ) -> bool {
        if self.setup_in_flight.swap(true, Ordering::SeqCst) {
            debug!("subscription setup already in flight, skipping");
            return false;
        }
        let subscribed = self.setup_inner(store, user_id, on_event).await;
        self.setup_in_flight.store(false, Ordering::SeqCst);
        subscribed
    }

    async fn setup_inner(
        &self,
        store: &dyn OrderStore,
        user_id: &str,
        on_event: ChangeHandler,
    ) -> bool {
        if !self.shared.policy.should_attempt_connection() {
            debug!("connection circuit open, skipping subscription attempt");
            return false;
        }

        self.drop_handle();
        self.shared.set_state(ChannelState::Connecting);

        let shared = Arc::clone(&self.shared);
        let on_lost: ChannelLostHandler = Arc::new(move || {
            warn!("realtime channel lost");
            shared.set_state(ChannelState::Idle);
            shared.policy.record_failure();
            shared.policy.mark_disconnected();
        });

        match store.subscribe(user_id, on_event, on_lost).await {
            Ok(handle) => {
                *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                self.shared.set_state(ChannelState::Subscribed);
                self.shared.policy.mark_connected();
                info!(user_id = %user_id, "realtime subscription established");
                true
            }
            Err(error) => {
                warn!(user_id = %user_id, error = %error, "realtime subscription failed");
                self.shared.set_state(ChannelState::Idle);
                self.shared.policy.record_failure();
                false
            }
        }
    }

    /// Tear down whatever is active. Safe to call when nothing is; never
    /// fails; teardown problems are logged and swallowed.
    pub fn cleanup(&self) {
        self.drop_handle();
        self.shared.set_state(ChannelState::Idle);
        self.shared.policy.mark_disconnected();
    }

    fn drop_handle(&self) {
        let previous = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = previous {
            handle.unsubscribe();
            debug!("previous realtime subscription torn down");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::testutil::MockOrderStore;
    use std::sync::Arc;

    fn manager() -> (SubscriptionManager, Arc<ConnectionPolicy>) {
        let policy = Arc::new(ConnectionPolicy::new(&SyncConfig::default()));
        (SubscriptionManager::new(Arc::clone(&policy)), policy)
    }

    #[tokio::test]
    async fn test_setup_marks_connected_on_success() {
        let (manager, policy) = manager();
        let store = MockOrderStore::new();

        let subscribed = manager
            .setup(&store, "user-1", Arc::new(|_| {}))
            .await;
        assert!(subscribed);
        assert_eq!(manager.state(), ChannelState::Subscribed);
        assert!(policy.is_connected());
    }

    #[tokio::test]
    async fn test_setup_failure_records_policy_failure() {
        let (manager, policy) = manager();
        let store = MockOrderStore::new();
        store.fail_subscribe.store(true, Ordering::SeqCst);

        let subscribed = manager
            .setup(&store, "user-1", Arc::new(|_| {}))
            .await;
        assert!(!subscribed);
        assert_eq!(manager.state(), ChannelState::Idle);
        assert_eq!(policy.failure_count(), 1);
        assert!(!policy.is_connected());
    }

    #[tokio::test]
    async fn test_setup_skipped_while_circuit_open() {
        let (manager, policy) = manager();
        let store = MockOrderStore::new();
        for _ in 0..5 {
            policy.record_failure();
        }

        let subscribed = manager
            .setup(&store, "user-1", Arc::new(|_| {}))
            .await;
        assert!(!subscribed);
        assert_eq!(store.subscribe_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resubscribe_tears_down_previous_channel() {
        let (manager, _policy) = manager();
        let store = MockOrderStore::new();

        assert!(manager.setup(&store, "user-1", Arc::new(|_| {})).await);
        assert!(manager.setup(&store, "user-1", Arc::new(|_| {})).await);
        assert_eq!(store.subscribe_calls.load(Ordering::SeqCst), 2);
        // Only the second channel is still live.
        assert_eq!(store.active_subscriptions(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let (manager, policy) = manager();
        let store = MockOrderStore::new();

        assert!(manager.setup(&store, "user-1", Arc::new(|_| {})).await);
        manager.cleanup();
        manager.cleanup();
        assert_eq!(manager.state(), ChannelState::Idle);
        assert!(!policy.is_connected());
        assert_eq!(store.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_lost_channel_records_failure() {
        let (manager, policy) = manager();
        let store = MockOrderStore::new();

        assert!(manager.setup(&store, "user-1", Arc::new(|_| {})).await);
        store.drop_channels();
        assert_eq!(policy.failure_count(), 1);
        assert_eq!(manager.state(), ChannelState::Idle);
        assert!(!policy.is_connected());
    }
}
