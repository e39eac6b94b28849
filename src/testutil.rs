//! Shared test doubles: an in-memory [`OrderStore`] plus sample-data
//! builders used across the module test suites.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;
use crate::model::{NewOrder, Order, OrderItem, OrderPatch, OrderStatus};
use crate::store::{
    ChangeEvent, ChangeHandler, ChannelLostHandler, CompletionOutcome, OrderPage, OrderStore,
    ReversalOutcome, StockCheck, SubscriptionHandle,
};

pub(crate) fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("test date")
}

pub(crate) fn sample_order(id: &str, order_date: &str, status: OrderStatus) -> Order {
    let mut order = Order {
        id: id.to_string(),
        user_id: "user-1".to_string(),
        order_number: format!("ORD-{id}"),
        customer_name: format!("Customer {id}"),
        customer_phone: None,
        customer_email: None,
        shipping_address: None,
        order_date: date(order_date),
        completed_date: None,
        items: vec![OrderItem::manual("Widget", 2, 100.0)],
        subtotal: 0.0,
        tax: 0.0,
        total_amount: 0.0,
        status,
        notes: String::new(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    order.recompute_totals();
    order
}

pub(crate) fn sample_draft(customer: &str, order_date: &str) -> NewOrder {
    let mut draft = NewOrder::new(customer, date(order_date));
    draft.items.push(OrderItem::manual("Widget", 1, 100.0));
    draft.recompute_totals();
    draft
}

struct Channel {
    token: CancellationToken,
    on_event: ChangeHandler,
    on_lost: ChannelLostHandler,
}

/// In-memory remote store with the same echo semantics as the hosted
/// backend: inserts assign ids/numbers/timestamps, updates echo the stored
/// row, completion remembers the prior status for reversal.
#[derive(Default)]
pub(crate) struct MockOrderStore {
    pub orders: Mutex<Vec<Order>>,
    pub insert_counter: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    /// Customer names whose inserts are rejected.
    pub fail_insert_for: Mutex<HashSet<String>>,
    pub fail_bulk: AtomicBool,
    pub fail_subscribe: AtomicBool,
    pub subscribe_calls: AtomicUsize,
    prior_status: Mutex<HashMap<String, OrderStatus>>,
    channels: Mutex<Vec<Channel>>,
}

impl MockOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, orders: Vec<Order>) {
        *self.orders.lock().unwrap() = orders;
    }

    pub fn next_insert_id(&self) -> String {
        format!("ord-{}", self.insert_counter.load(Ordering::SeqCst) + 1)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !c.token.is_cancelled())
            .count()
    }

    /// Kill every live channel, notifying listeners like a dead feed would.
    pub fn drop_channels(&self) {
        let channels = self.channels.lock().unwrap();
        for channel in channels.iter() {
            if !channel.token.is_cancelled() {
                channel.token.cancel();
                (channel.on_lost)();
            }
        }
    }

    /// Push a realtime change through every live channel.
    pub fn push_change(&self, event: ChangeEvent) {
        let channels = self.channels.lock().unwrap();
        for channel in channels.iter() {
            if !channel.token.is_cancelled() {
                (channel.on_event)(event.clone());
            }
        }
    }

    fn echo(&self, id: &str) -> Result<Order, StoreError> {
        self.orders
            .lock()
            .unwrap()
            .iter()
            .find(|o| o.id == id)
            .cloned()
            .ok_or_else(|| StoreError::Status {
                status: 404,
                message: format!("order {id} not found"),
            })
    }
}

#[async_trait]
impl OrderStore for MockOrderStore {
    async fn fetch(&self, _user_id: &str, limit: usize) -> Result<Vec<Order>, StoreError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let mut orders = self.orders.lock().unwrap().clone();
        orders.sort_by(|a, b| b.order_date.cmp(&a.order_date));
        orders.truncate(limit);
        Ok(orders)
    }

    async fn fetch_page(
        &self,
        _user_id: &str,
        page: usize,
        page_size: usize,
    ) -> Result<OrderPage, StoreError> {
        let orders = self.orders.lock().unwrap().clone();
        let total_count = orders.len();
        let start = page.saturating_sub(1) * page_size;
        let page_orders = orders.into_iter().skip(start).take(page_size).collect();
        Ok(OrderPage {
            orders: page_orders,
            total_count,
        })
    }

    async fn fetch_by_id(&self, _user_id: &str, id: &str) -> Result<Option<Order>, StoreError> {
        Ok(self
            .orders
            .lock()
            .unwrap()
            .iter()
            .find(|o| o.id == id)
            .cloned())
    }

    async fn insert(&self, user_id: &str, draft: &NewOrder) -> Result<Order, StoreError> {
        if self
            .fail_insert_for
            .lock()
            .unwrap()
            .contains(draft.customer_name.as_str())
        {
            return Err(StoreError::Other(format!(
                "insert rejected for {}",
                draft.customer_name
            )));
        }

        let n = self.insert_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        let order = Order {
            id: format!("ord-{n}"),
            user_id: user_id.to_string(),
            order_number: draft
                .order_number
                .clone()
                .unwrap_or_else(|| format!("ORD-{n:05}")),
            customer_name: draft.customer_name.clone(),
            customer_phone: draft.customer_phone.clone(),
            customer_email: draft.customer_email.clone(),
            shipping_address: draft.shipping_address.clone(),
            order_date: draft.order_date,
            completed_date: draft.completed_date,
            items: draft.items.clone(),
            subtotal: draft.subtotal,
            tax: draft.tax,
            total_amount: draft.total_amount,
            status: draft.status,
            notes: draft.notes.clone(),
            created_at: now,
            updated_at: now,
        };
        // A racing realtime insert may already have landed this row.
        let mut orders = self.orders.lock().unwrap();
        if !orders.iter().any(|o| o.id == order.id) {
            orders.push(order.clone());
        }
        Ok(order)
    }

    async fn update(
        &self,
        _user_id: &str,
        id: &str,
        patch: &OrderPatch,
    ) -> Result<Order, StoreError> {
        {
            let mut orders = self.orders.lock().unwrap();
            let order = orders.iter_mut().find(|o| o.id == id).ok_or_else(|| {
                StoreError::Status {
                    status: 404,
                    message: format!("order {id} not found"),
                }
            })?;
            if let Some(v) = patch.customer_name.clone() {
                order.customer_name = v;
            }
            if let Some(v) = patch.notes.clone() {
                order.notes = v;
            }
            if let Some(v) = patch.items.clone() {
                order.items = v;
            }
            if let Some(v) = patch.subtotal {
                order.subtotal = v;
            }
            if let Some(v) = patch.tax {
                order.tax = v;
            }
            if let Some(v) = patch.total_amount {
                order.total_amount = v;
            }
            if let Some(v) = patch.status {
                order.status = v;
            }
            if let Some(v) = patch.order_date {
                order.order_date = v;
            }
            order.updated_at = Utc::now();
        }
        self.echo(id)
    }

    async fn update_status(
        &self,
        _user_id: &str,
        id: &str,
        status: OrderStatus,
    ) -> Result<Order, StoreError> {
        {
            let mut orders = self.orders.lock().unwrap();
            let order = orders.iter_mut().find(|o| o.id == id).ok_or_else(|| {
                StoreError::Status {
                    status: 404,
                    message: format!("order {id} not found"),
                }
            })?;
            order.status = status;
            if status == OrderStatus::Completed {
                order.completed_date = Some(Utc::now().date_naive());
            }
            order.updated_at = Utc::now();
        }
        self.echo(id)
    }

    async fn delete(&self, _user_id: &str, id: &str) -> Result<(), StoreError> {
        self.orders.lock().unwrap().retain(|o| o.id != id);
        Ok(())
    }

    async fn bulk_update_status(
        &self,
        _user_id: &str,
        ids: &[String],
        status: OrderStatus,
    ) -> Result<(), StoreError> {
        if self.fail_bulk.load(Ordering::SeqCst) {
            return Err(StoreError::Other("bulk update rejected".to_string()));
        }
        let mut orders = self.orders.lock().unwrap();
        for order in orders.iter_mut() {
            if ids.iter().any(|id| *id == order.id) {
                order.status = status;
                order.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn bulk_delete(&self, _user_id: &str, ids: &[String]) -> Result<(), StoreError> {
        if self.fail_bulk.load(Ordering::SeqCst) {
            return Err(StoreError::Other("bulk delete rejected".to_string()));
        }
        self.orders
            .lock()
            .unwrap()
            .retain(|o| !ids.iter().any(|id| *id == o.id));
        Ok(())
    }

    async fn can_complete_order(&self, _order_id: &str) -> Result<StockCheck, StoreError> {
        Ok(StockCheck {
            can_complete: true,
            total_ingredients: 3,
            available_ingredients: 3,
            insufficient_stock: Vec::new(),
        })
    }

    async fn complete_order_and_deduct_stock(
        &self,
        order_id: &str,
    ) -> Result<CompletionOutcome, StoreError> {
        let mut orders = self.orders.lock().unwrap();
        let Some(order) = orders.iter_mut().find(|o| o.id == order_id) else {
            return Ok(CompletionOutcome {
                success: false,
                message: None,
                order_number: None,
                total_amount: None,
                stock_items_updated: None,
                error: Some("order not found".to_string()),
                details: Vec::new(),
            });
        };
        self.prior_status
            .lock()
            .unwrap()
            .insert(order.id.clone(), order.status);
        order.status = OrderStatus::Completed;
        order.completed_date = Some(Utc::now().date_naive());
        order.updated_at = Utc::now();
        Ok(CompletionOutcome {
            success: true,
            message: Some("order completed".to_string()),
            order_number: Some(order.order_number.clone()),
            total_amount: Some(order.total_amount),
            stock_items_updated: Some(order.items.len() as i64),
            error: None,
            details: Vec::new(),
        })
    }

    async fn reverse_order_completion(
        &self,
        order_id: &str,
    ) -> Result<ReversalOutcome, StoreError> {
        let prior = self
            .prior_status
            .lock()
            .unwrap()
            .remove(order_id)
            .unwrap_or(OrderStatus::Pending);
        let mut orders = self.orders.lock().unwrap();
        let Some(order) = orders.iter_mut().find(|o| o.id == order_id) else {
            return Ok(ReversalOutcome {
                success: false,
                message: None,
                stock_items_restored: None,
                error: Some("order not found".to_string()),
            });
        };
        order.status = prior;
        order.completed_date = None;
        order.updated_at = Utc::now();
        Ok(ReversalOutcome {
            success: true,
            message: Some("completion reversed".to_string()),
            stock_items_restored: Some(order.items.len() as i64),
            error: None,
        })
    }

    async fn subscribe(
        &self,
        _user_id: &str,
        on_event: ChangeHandler,
        on_lost: ChannelLostHandler,
    ) -> Result<SubscriptionHandle, StoreError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(StoreError::Other("subscribe rejected".to_string()));
        }
        let token = CancellationToken::new();
        self.channels.lock().unwrap().push(Channel {
            token: token.clone(),
            on_event,
            on_lost,
        });
        Ok(SubscriptionHandle::new(token))
    }
}
