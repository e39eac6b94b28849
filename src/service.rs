//! Order cache and synchronization orchestrator.
//!
//! [`OrderService`] is the single writer over the in-memory order cache the
//! UI reads from. Local mutations go to the remote store first and apply
//! the server echo optimistically; the realtime change feed reconciles the
//! cache from the other direction; and when the push channel is unhealthy,
//! throttled polling quietly backstops it. Mutations announce themselves on
//! the event bus so unrelated surfaces can react without wiring.
//!
//! Mutations are deliberately not serialized against each other: two
//! racing writes to the same order resolve last-response-wins.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::connection::ConnectionPolicy;
use crate::error::OrderError;
use crate::events::{OrderEvent, OrderEventKind, OrderEvents, Subscription};
use crate::financial::FinancialSync;
use crate::import::parse_orders_csv;
use crate::model::{NewOrder, Order, OrderPatch, OrderStatus};
use crate::realtime::{ChannelState, SubscriptionManager};
use crate::store::{
    ChangeEvent, ChangeHandler, CompletionOutcome, OrderStore, ReversalOutcome, StockCheck,
};

/// Outcome of a bulk import; partial success is normal, never an error.
#[derive(Debug, Clone)]
pub struct BulkImportOutcome {
    pub success_count: usize,
    pub total_count: usize,
    /// One message per failed entry.
    pub errors: Vec<String>,
}

/// One user session's order state: cache, selection, connection health and
/// the mutation surface. Construct once per signed-in user and share via
/// the returned [`Arc`].
pub struct OrderService {
    user_id: String,
    config: SyncConfig,
    store: Arc<dyn OrderStore>,
    financial: Arc<dyn FinancialSync>,
    events: OrderEvents,
    policy: Arc<ConnectionPolicy>,
    subscription: SubscriptionManager,
    cache: Mutex<Vec<Order>>,
    selection: Mutex<HashSet<String>>,
    /// Generation counter for scheduled refreshes; only the newest
    /// scheduled refresh actually runs, which is what coalesces bursts.
    refresh_generation: AtomicU64,
    weak: Weak<OrderService>,
}

fn sort_newest_first(orders: &mut [Order]) {
    orders.sort_by(|a, b| {
        b.order_date
            .cmp(&a.order_date)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
}

impl OrderService {
    pub fn new(
        user_id: impl Into<String>,
        store: Arc<dyn OrderStore>,
        financial: Arc<dyn FinancialSync>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let policy = Arc::new(ConnectionPolicy::new(&config));
        Arc::new_cyclic(|weak| Self {
            user_id: user_id.into(),
            subscription: SubscriptionManager::new(Arc::clone(&policy)),
            policy,
            store,
            financial,
            events: OrderEvents::new(),
            cache: Mutex::new(Vec::new()),
            selection: Mutex::new(HashSet::new()),
            refresh_generation: AtomicU64::new(0),
            weak: weak.clone(),
            config,
        })
    }

    pub fn events(&self) -> &OrderEvents {
        &self.events
    }

    pub fn connection(&self) -> &ConnectionPolicy {
        &self.policy
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, Vec<Order>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_selection(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.selection.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Snapshot of the cache, newest order date first. Callers own the
    /// clone; mutations go through this service, never through the
    /// snapshot.
    pub fn orders(&self) -> Vec<Order> {
        self.lock_cache().clone()
    }

    pub fn order_by_id(&self, id: &str) -> Option<Order> {
        self.lock_cache().iter().find(|o| o.id == id).cloned()
    }

    pub fn orders_by_status(&self, status: OrderStatus) -> Vec<Order> {
        self.lock_cache()
            .iter()
            .filter(|o| o.status == status)
            .cloned()
            .collect()
    }

    pub fn orders_in_range(&self, from: NaiveDate, to: NaiveDate) -> Vec<Order> {
        self.lock_cache()
            .iter()
            .filter(|o| o.order_date >= from && o.order_date <= to)
            .cloned()
            .collect()
    }

    // -----------------------------------------------------------------------
    // Refresh
    // -----------------------------------------------------------------------

    /// Full bounded fetch, replacing the cache wholesale. Overlapping calls
    /// are safe: each replaces the whole cache, last writer wins.
    pub async fn refresh(&self) -> Result<usize, OrderError> {
        let mut orders = self
            .store
            .fetch(&self.user_id, self.config.fetch_limit)
            .await?;
        sort_newest_first(&mut orders);
        let count = orders.len();
        *self.lock_cache() = orders;
        debug!(count, "order cache refreshed");
        Ok(count)
    }

    /// Run `refresh` after `delay`, superseding any refresh scheduled
    /// earlier. Used for the forced post-status refresh and for coalescing
    /// refresh-needed bursts.
    fn schedule_refresh(&self, delay: Duration) {
        let generation = self.refresh_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let Some(service) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if service.refresh_generation.load(Ordering::SeqCst) != generation {
                return; // superseded by a newer schedule
            }
            if let Err(error) = service.refresh().await {
                warn!(error = %error, "scheduled refresh failed");
            }
        });
    }

    /// In fallback mode every successful mutation also asks for a throttled
    /// poll, so a dead push channel degrades to polling instead of drift.
    async fn fallback_poll(&self) {
        if !self.policy.is_fallback() {
            return;
        }
        self.policy
            .throttled_fetch(|| async {
                if let Err(error) = self.refresh().await {
                    warn!(error = %error, "fallback poll refresh failed");
                }
            })
            .await;
    }

    // -----------------------------------------------------------------------
    // Guards
    // -----------------------------------------------------------------------

    /// Terminal orders accept no further edits or status changes. Orders
    /// the cache does not know stay the server's call.
    fn ensure_mutable(&self, id: &str) -> Result<(), OrderError> {
        let cache = self.lock_cache();
        match cache.iter().find(|o| o.id == id) {
            Some(order) if order.status.is_terminal() => Err(OrderError::TerminalStatus {
                id: id.to_string(),
                status: order.status,
            }),
            _ => Ok(()),
        }
    }

    /// Replace the cached entity with the server echo wholesale; partial
    /// client fields are never merged in.
    fn replace_cached(&self, order: Order) {
        let mut cache = self.lock_cache();
        if let Some(slot) = cache.iter_mut().find(|o| o.id == order.id) {
            *slot = order;
        } else {
            cache.push(order);
            sort_newest_first(&mut cache);
        }
    }

    // -----------------------------------------------------------------------
    // Single-entity mutations
    // -----------------------------------------------------------------------

    /// Validate and persist a draft. On success the server's canonical row
    /// lands at the front of the cache (deduplicated against a racing
    /// realtime insert) and a `Created` event fires. On failure the cache
    /// is untouched; no retry is attempted.
    pub async fn create(&self, draft: NewOrder) -> Result<Order, OrderError> {
        draft.validate().map_err(OrderError::Validation)?;

        let order = self.store.insert(&self.user_id, &draft).await?;
        {
            let mut cache = self.lock_cache();
            cache.retain(|o| o.id != order.id);
            cache.insert(0, order.clone());
        }
        info!(order_id = %order.id, order_number = %order.order_number, "order created");
        self.events.emit(OrderEvent::created(&order.id));
        self.fallback_poll().await;
        Ok(order)
    }

    /// Partial update. The echo replaces the cached entity; client fields
    /// are never merged locally.
    pub async fn update(&self, id: &str, patch: OrderPatch) -> Result<Order, OrderError> {
        self.ensure_mutable(id)?;

        let order = self.store.update(&self.user_id, id, &patch).await?;
        self.replace_cached(order.clone());
        debug!(order_id = %id, "order updated");
        self.events.emit(OrderEvent::updated(id));
        self.fallback_poll().await;
        Ok(order)
    }

    /// Status-only update: same cache/event contract as [`update`], plus a
    /// forced refresh shortly after (push delivery has gaps) and the
    /// one-shot financial sync when the echoed status is `completed`.
    ///
    /// [`update`]: OrderService::update
    pub async fn update_status(
        &self,
        id: &str,
        status: OrderStatus,
    ) -> Result<Order, OrderError> {
        self.ensure_mutable(id)?;

        let order = self.store.update_status(&self.user_id, id, status).await?;
        self.replace_cached(order.clone());
        info!(order_id = %id, status = %order.status, "order status updated");
        self.events.emit(OrderEvent::status_changed(id, order.status));

        if order.status == OrderStatus::Completed {
            self.spawn_financial_sync(order.clone());
        }
        self.schedule_refresh(self.config.forced_refresh_delay);
        self.fallback_poll().await;
        Ok(order)
    }

    /// Delete remotely, then drop the row from the cache and from the
    /// active selection so nothing keeps pointing at a gone entity.
    pub async fn delete(&self, id: &str) -> Result<(), OrderError> {
        self.store.delete(&self.user_id, id).await?;

        self.lock_cache().retain(|o| o.id != id);
        if self.lock_selection().remove(id) {
            debug!(order_id = %id, "deleted order removed from selection");
        }
        info!(order_id = %id, "order deleted");
        self.events.emit(OrderEvent::deleted(id));
        self.fallback_poll().await;
        Ok(())
    }

    fn spawn_financial_sync(&self, order: Order) {
        let financial = Arc::clone(&self.financial);
        let user_id = self.user_id.clone();
        tokio::spawn(async move {
            match financial.sync_completed_order(&order, &user_id).await {
                Ok(()) => {
                    debug!(order_id = %order.id, "completed order synced to financial ledger")
                }
                Err(error) => {
                    // Best effort only; the status change stands regardless.
                    warn!(order_id = %order.id, error = %error, "financial sync failed");
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Bulk operations
    // -----------------------------------------------------------------------

    /// Create drafts sequentially; failures are collected, not fatal. The
    /// cache is updated once at the end with every created order merged in,
    /// one `BulkImported` event fires with the success count, and a full
    /// refresh is scheduled to reconcile whatever the per-row results
    /// missed.
    pub async fn bulk_create(&self, drafts: Vec<NewOrder>) -> BulkImportOutcome {
        let total_count = drafts.len();
        let mut created: Vec<Order> = Vec::new();
        let mut errors: Vec<String> = Vec::new();

        for (index, draft) in drafts.into_iter().enumerate() {
            if let Err(violations) = draft.validate() {
                errors.push(format!(
                    "entry {} ({}): {}",
                    index + 1,
                    draft.customer_name,
                    violations.join("; ")
                ));
                continue;
            }
            match self.store.insert(&self.user_id, &draft).await {
                Ok(order) => created.push(order),
                Err(error) => {
                    warn!(entry = index + 1, error = %error, "bulk import entry failed");
                    errors.push(format!("entry {} ({}): {error}", index + 1, draft.customer_name));
                }
            }
        }

        let success_count = created.len();
        if success_count > 0 {
            let mut cache = self.lock_cache();
            for order in created {
                if let Some(slot) = cache.iter_mut().find(|o| o.id == order.id) {
                    *slot = order;
                } else {
                    cache.push(order);
                }
            }
            sort_newest_first(&mut cache);
        }

        info!(success_count, total_count, "bulk import finished");
        self.events.emit(OrderEvent::bulk_imported(success_count));
        self.schedule_refresh(self.config.forced_refresh_delay);
        self.fallback_poll().await;

        BulkImportOutcome {
            success_count,
            total_count,
            errors,
        }
    }

    /// Parse CSV text and import the resulting drafts in one go.
    pub async fn import_csv(&self, csv_text: &str) -> Result<BulkImportOutcome, OrderError> {
        let drafts = parse_orders_csv(csv_text)?;
        Ok(self.bulk_create(drafts).await)
    }

    /// One remote bulk call, then the intended end-state applied to every
    /// input id in the cache (server-side batching is opaque here) and one
    /// event per id.
    pub async fn bulk_update_status(
        &self,
        ids: &[String],
        status: OrderStatus,
    ) -> Result<(), OrderError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.store
            .bulk_update_status(&self.user_id, ids, status)
            .await?;

        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let now = Utc::now();
        {
            let mut cache = self.lock_cache();
            for order in cache.iter_mut() {
                if wanted.contains(order.id.as_str()) {
                    order.status = status;
                    order.updated_at = now;
                }
            }
        }
        info!(count = ids.len(), status = %status, "bulk status update applied");
        for id in ids {
            self.events.emit(OrderEvent::status_changed(id, status));
        }
        self.fallback_poll().await;
        Ok(())
    }

    /// Bulk delete with the same optimistic end-state rule; also clears the
    /// deleted ids out of the selection.
    pub async fn bulk_delete(&self, ids: &[String]) -> Result<(), OrderError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.store.bulk_delete(&self.user_id, ids).await?;

        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        self.lock_cache()
            .retain(|o| !wanted.contains(o.id.as_str()));
        {
            let mut selection = self.lock_selection();
            for id in ids {
                selection.remove(id);
            }
        }
        info!(count = ids.len(), "bulk delete applied");
        for id in ids {
            self.events.emit(OrderEvent::deleted(id));
        }
        self.fallback_poll().await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Completion procedures
    // -----------------------------------------------------------------------

    /// Stock-sufficiency check for the completion dialog.
    pub async fn can_complete(&self, id: &str) -> Result<StockCheck, OrderError> {
        Ok(self.store.can_complete_order(id).await?)
    }

    /// Run the server-side completion procedure (status change plus stock
    /// deduction in one transaction), then reconcile the cache from the
    /// canonical row and fire the financial sync.
    pub async fn complete_with_stock_deduction(
        &self,
        id: &str,
    ) -> Result<CompletionOutcome, OrderError> {
        self.ensure_mutable(id)?;

        let outcome = self.store.complete_order_and_deduct_stock(id).await?;
        if outcome.success {
            if let Some(order) = self.store.fetch_by_id(&self.user_id, id).await? {
                self.replace_cached(order.clone());
                self.events.emit(OrderEvent::status_changed(id, order.status));
                if order.status == OrderStatus::Completed {
                    self.spawn_financial_sync(order);
                }
            }
            info!(
                order_id = %id,
                stock_items = outcome.stock_items_updated.unwrap_or(0),
                "order completed with stock deduction"
            );
        } else {
            warn!(
                order_id = %id,
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "order completion refused"
            );
        }
        self.fallback_poll().await;
        Ok(outcome)
    }

    /// Undo a completion: the server restores stock and the prior status,
    /// and the cache picks up the canonical row afterwards.
    pub async fn reverse_completion(&self, id: &str) -> Result<ReversalOutcome, OrderError> {
        let outcome = self.store.reverse_order_completion(id).await?;
        if outcome.success {
            if let Some(order) = self.store.fetch_by_id(&self.user_id, id).await? {
                self.replace_cached(order.clone());
                self.events.emit(OrderEvent::status_changed(id, order.status));
            }
            info!(order_id = %id, "order completion reversed");
        }
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Realtime reconciliation
    // -----------------------------------------------------------------------

    /// Apply one realtime delta. Idempotent: replaying a change leaves the
    /// cache as it was. This is the only partial reconciliation path; full
    /// refreshes replace everything.
    pub fn apply_change(&self, change: ChangeEvent) {
        let mut cache = self.lock_cache();
        match change {
            ChangeEvent::Insert(order) => {
                if cache.iter().any(|o| o.id == order.id) {
                    return;
                }
                debug!(order_id = %order.id, "realtime insert applied");
                cache.push(order);
                sort_newest_first(&mut cache);
            }
            ChangeEvent::Update(order) => {
                match cache.iter_mut().find(|o| o.id == order.id) {
                    Some(slot) => {
                        debug!(order_id = %order.id, "realtime update applied");
                        *slot = order;
                    }
                    // A scheduled refresh will converge the cache.
                    None => debug!(order_id = %order.id, "realtime update for uncached order ignored"),
                }
            }
            ChangeEvent::Delete { id } => {
                cache.retain(|o| o.id != id);
            }
        }
    }

    /// Open the realtime channel, routing deltas into [`apply_change`].
    /// No-op while another attempt is in flight or the circuit is open.
    ///
    /// [`apply_change`]: OrderService::apply_change
    pub async fn setup_realtime(&self) -> bool {
        let weak = self.weak.clone();
        let handler: ChangeHandler = Arc::new(move |change| {
            if let Some(service) = weak.upgrade() {
                service.apply_change(change);
            }
        });
        self.subscription
            .setup(self.store.as_ref(), &self.user_id, handler)
            .await
    }

    pub fn teardown_realtime(&self) {
        self.subscription.cleanup();
    }

    pub fn realtime_state(&self) -> ChannelState {
        self.subscription.state()
    }

    pub fn is_connected(&self) -> bool {
        self.policy.is_connected()
    }

    /// Subscribe this service to its own `RefreshNeeded` events, coalescing
    /// bursts through the debounce window. Keep the returned guard if the
    /// listener should ever be detached.
    pub fn bind_refresh_listener(&self) -> Subscription {
        let weak = self.weak.clone();
        let debounce = self.config.refresh_debounce;
        self.events.on(OrderEventKind::RefreshNeeded, move |_event| {
            if let Some(service) = weak.upgrade() {
                service.schedule_refresh(debounce);
            }
        })
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    pub fn select(&self, id: &str) {
        self.lock_selection().insert(id.to_string());
    }

    pub fn deselect(&self, id: &str) {
        self.lock_selection().remove(id);
    }

    pub fn is_selected(&self, id: &str) -> bool {
        self.lock_selection().contains(id)
    }

    pub fn selected_ids(&self) -> HashSet<String> {
        self.lock_selection().clone()
    }

    pub fn clear_selection(&self) {
        self.lock_selection().clear();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
