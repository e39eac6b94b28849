//! In-process event bus for order changes.
//!
//! Decouples the cache mutations from whatever UI surfaces care about them:
//! any listener can ask for a refresh without holding a reference to the
//! code that made the change. One bus per session, injected, never a
//! process global.
//!
//! Every specific event automatically fans out a second, generic
//! `RefreshNeeded` event with the same payload, so consumers may subscribe
//! to one change kind or to the catch-all.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::model::OrderStatus;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderEventKind {
    Created,
    Updated,
    Deleted,
    StatusChanged,
    BulkImported,
    /// Generic catch-all; re-emitted automatically after every other kind.
    RefreshNeeded,
}

#[derive(Debug, Clone)]
pub struct OrderEvent {
    pub kind: OrderEventKind,
    pub order_id: Option<String>,
    /// Set for `StatusChanged`.
    pub status: Option<OrderStatus>,
    /// Set for `BulkImported`.
    pub count: Option<usize>,
    pub at: DateTime<Utc>,
}

impl OrderEvent {
    fn base(kind: OrderEventKind) -> Self {
        Self {
            kind,
            order_id: None,
            status: None,
            count: None,
            at: Utc::now(),
        }
    }

    pub fn created(order_id: &str) -> Self {
        Self {
            order_id: Some(order_id.to_string()),
            ..Self::base(OrderEventKind::Created)
        }
    }

    pub fn updated(order_id: &str) -> Self {
        Self {
            order_id: Some(order_id.to_string()),
            ..Self::base(OrderEventKind::Updated)
        }
    }

    pub fn deleted(order_id: &str) -> Self {
        Self {
            order_id: Some(order_id.to_string()),
            ..Self::base(OrderEventKind::Deleted)
        }
    }

    pub fn status_changed(order_id: &str, status: OrderStatus) -> Self {
        Self {
            order_id: Some(order_id.to_string()),
            status: Some(status),
            ..Self::base(OrderEventKind::StatusChanged)
        }
    }

    pub fn bulk_imported(count: usize) -> Self {
        Self {
            count: Some(count),
            ..Self::base(OrderEventKind::BulkImported)
        }
    }

    pub fn refresh_needed() -> Self {
        Self::base(OrderEventKind::RefreshNeeded)
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

type Listener = Arc<dyn Fn(&OrderEvent) + Send + Sync>;

struct Registry {
    buckets: Mutex<HashMap<OrderEventKind, Vec<(u64, Listener)>>>,
    next_id: AtomicU64,
}

/// The bus itself. Cheap to clone; clones share the listener registry.
#[derive(Clone)]
pub struct OrderEvents {
    registry: Arc<Registry>,
}

impl Default for OrderEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderEvents {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                buckets: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a listener for one event kind. The returned guard
    /// unsubscribes explicitly; dropping it without calling
    /// [`Subscription::unsubscribe`] leaves the listener registered for the
    /// bus lifetime.
    pub fn on(
        &self,
        kind: OrderEventKind,
        listener: impl Fn(&OrderEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let mut buckets = self
            .registry
            .buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        buckets
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        Subscription {
            registry: Arc::downgrade(&self.registry),
            kind,
            id,
        }
    }

    /// Synchronously deliver `event` to its listeners, then re-emit it as
    /// `RefreshNeeded` unless it already is one. A panicking listener is
    /// caught and logged; the remaining listeners still run.
    pub fn emit(&self, event: OrderEvent) {
        self.dispatch(&event);
        if event.kind != OrderEventKind::RefreshNeeded {
            let follow_up = OrderEvent {
                kind: OrderEventKind::RefreshNeeded,
                ..event
            };
            self.dispatch(&follow_up);
        }
    }

    fn dispatch(&self, event: &OrderEvent) {
        // Snapshot under the lock, invoke outside it: listeners may
        // unsubscribe themselves (or register others) mid-dispatch.
        let listeners: Vec<Listener> = {
            let buckets = self
                .registry
                .buckets
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            buckets
                .get(&event.kind)
                .map(|bucket| bucket.iter().map(|(_, l)| Arc::clone(l)).collect())
                .unwrap_or_default()
        };

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(kind = ?event.kind, "event listener panicked; continuing with remaining listeners");
            }
        }
    }

    /// Drop all listeners for one kind, or every listener when `kind` is
    /// `None`.
    pub fn remove_all(&self, kind: Option<OrderEventKind>) {
        let mut buckets = self
            .registry
            .buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match kind {
            Some(kind) => {
                buckets.remove(&kind);
            }
            None => buckets.clear(),
        }
    }

    pub fn listener_count(&self, kind: OrderEventKind) -> usize {
        let buckets = self
            .registry
            .buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        buckets.get(&kind).map(Vec::len).unwrap_or(0)
    }
}

/// Unsubscribe guard returned by [`OrderEvents::on`]. Safe to call more
/// than once; safe to call after the bus is gone.
pub struct Subscription {
    registry: Weak<Registry>,
    kind: OrderEventKind,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut buckets = registry.buckets.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bucket) = buckets.get_mut(&self.kind) {
            bucket.retain(|(id, _)| *id != self.id);
            if bucket.is_empty() {
                buckets.remove(&self.kind);
                debug!(kind = ?self.kind, "last listener removed, bucket freed");
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
