//! Remote Order Store boundary.
//!
//! [`OrderStore`] is the contract every backend implementation satisfies
//! (the production HTTP client in `api`, mocks in tests). The wire row
//! shapes live here too: the backend speaks the historical snake_case
//! column names with a couple of camelCase legacy aliases, and `OrderRow`
//! is the single place that vocabulary is translated into the canonical
//! model. Nothing outside this module reads a wire field.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::StoreError;
use crate::model::{NewOrder, Order, OrderItem, OrderPatch, OrderStatus};

// ---------------------------------------------------------------------------
// Change feed
// ---------------------------------------------------------------------------

/// A row-level change pushed by the remote store.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Insert(Order),
    Update(Order),
    Delete { id: String },
}

/// Receives realtime changes. Invoked from the subscription's background
/// task; implementations must be cheap and non-blocking.
pub type ChangeHandler = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// Invoked once when a confirmed subscription dies and will deliver no
/// further events.
pub type ChannelLostHandler = Arc<dyn Fn() + Send + Sync>;

/// Handle for one live subscription. Unsubscribing (or dropping the
/// handle) cancels the feed; both are idempotent.
pub struct SubscriptionHandle {
    token: CancellationToken,
}

impl SubscriptionHandle {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn unsubscribe(&self) {
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// ---------------------------------------------------------------------------
// Business procedure results
// ---------------------------------------------------------------------------

/// One ingredient the stock check found short.
#[derive(Debug, Clone, Deserialize)]
pub struct StockShortage {
    #[serde(default, alias = "ingredient_name", alias = "nama")]
    pub ingredient: String,
    #[serde(default)]
    pub required: f64,
    #[serde(default)]
    pub available: f64,
    #[serde(default)]
    pub unit: Option<String>,
}

/// Result of the `can_complete_order` stock-sufficiency procedure.
#[derive(Debug, Clone, Deserialize)]
pub struct StockCheck {
    #[serde(default, alias = "canComplete")]
    pub can_complete: bool,
    #[serde(default, alias = "totalIngredients")]
    pub total_ingredients: i64,
    #[serde(default, alias = "availableIngredients")]
    pub available_ingredients: i64,
    #[serde(default, alias = "insufficientStock")]
    pub insufficient_stock: Vec<StockShortage>,
}

/// Result of `complete_order_and_deduct_stock`.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionOutcome {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, alias = "orderNumber")]
    pub order_number: Option<String>,
    #[serde(default, alias = "totalAmount")]
    pub total_amount: Option<f64>,
    #[serde(default, alias = "stockItemsUpdated")]
    pub stock_items_updated: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub details: Vec<String>,
}

/// Result of `reverse_order_completion`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReversalOutcome {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, alias = "stockItemsRestored")]
    pub stock_items_restored: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// One page of orders plus the total row count.
#[derive(Debug, Clone)]
pub struct OrderPage {
    pub orders: Vec<Order>,
    pub total_count: usize,
}

// ---------------------------------------------------------------------------
// The store contract
// ---------------------------------------------------------------------------

/// Everything the synchronization core needs from the hosted backend.
/// Every operation is scoped to the owning user; cross-user access fails
/// on the server side.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Most recent orders for the user, newest order date first, bounded
    /// by `limit`.
    async fn fetch(&self, user_id: &str, limit: usize) -> Result<Vec<Order>, StoreError>;

    async fn fetch_page(
        &self,
        user_id: &str,
        page: usize,
        page_size: usize,
    ) -> Result<OrderPage, StoreError>;

    async fn fetch_by_id(&self, user_id: &str, id: &str) -> Result<Option<Order>, StoreError>;

    /// Persist a draft. The server assigns id, order number and timestamps
    /// and echoes the canonical row.
    async fn insert(&self, user_id: &str, draft: &NewOrder) -> Result<Order, StoreError>;

    /// Partial update; only fields set in the patch change. Echoes the
    /// canonical row.
    async fn update(&self, user_id: &str, id: &str, patch: &OrderPatch)
        -> Result<Order, StoreError>;

    /// Status-only update; cheaper than a full patch and by far the most
    /// frequent mutation.
    async fn update_status(
        &self,
        user_id: &str,
        id: &str,
        status: OrderStatus,
    ) -> Result<Order, StoreError>;

    async fn delete(&self, user_id: &str, id: &str) -> Result<(), StoreError>;

    async fn bulk_update_status(
        &self,
        user_id: &str,
        ids: &[String],
        status: OrderStatus,
    ) -> Result<(), StoreError>;

    async fn bulk_delete(&self, user_id: &str, ids: &[String]) -> Result<(), StoreError>;

    /// Stock-sufficiency check; opaque business logic on the server.
    async fn can_complete_order(&self, order_id: &str) -> Result<StockCheck, StoreError>;

    async fn complete_order_and_deduct_stock(
        &self,
        order_id: &str,
    ) -> Result<CompletionOutcome, StoreError>;

    async fn reverse_order_completion(&self, order_id: &str)
        -> Result<ReversalOutcome, StoreError>;

    /// Open the row-change feed for the user. Resolves once the channel is
    /// confirmed open; `on_lost` fires if a confirmed channel later dies.
    async fn subscribe(
        &self,
        user_id: &str,
        on_event: ChangeHandler,
        on_lost: ChannelLostHandler,
    ) -> Result<SubscriptionHandle, StoreError>;
}

// ---------------------------------------------------------------------------
// Wire rows
// ---------------------------------------------------------------------------

/// Raw order row as the backend serves it. Numeric columns occasionally
/// arrive as strings from older exports, so amounts decode leniently.
#[derive(Debug, Default, Deserialize)]
pub struct OrderRow {
    #[serde(default)]
    pub id: String,
    #[serde(default, alias = "userId")]
    pub user_id: String,
    #[serde(default, alias = "nomorPesanan", alias = "order_number")]
    pub nomor_pesanan: Option<String>,
    #[serde(default, alias = "namaPelanggan", alias = "customer_name")]
    pub nama_pelanggan: Option<String>,
    #[serde(default, alias = "teleponPelanggan", alias = "customer_phone")]
    pub telepon_pelanggan: Option<String>,
    #[serde(default, alias = "emailPelanggan", alias = "customer_email")]
    pub email_pelanggan: Option<String>,
    #[serde(default, alias = "alamatPengiriman", alias = "shipping_address")]
    pub alamat_pengiriman: Option<String>,
    #[serde(default, alias = "orderDate", alias = "order_date")]
    pub tanggal: Option<String>,
    #[serde(default, alias = "tanggalSelesai", alias = "completed_date")]
    pub tanggal_selesai: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// Either a JSON array or (from older rows) a JSON-encoded string.
    #[serde(default)]
    pub items: Option<Value>,
    #[serde(default, deserialize_with = "de_f64_lenient")]
    pub subtotal: Option<f64>,
    #[serde(default, alias = "tax", deserialize_with = "de_f64_lenient")]
    pub pajak: Option<f64>,
    #[serde(
        default,
        alias = "totalPesanan",
        alias = "total_amount",
        deserialize_with = "de_f64_lenient"
    )]
    pub total_pesanan: Option<f64>,
    #[serde(default, alias = "notes")]
    pub catatan: Option<String>,
    #[serde(default, alias = "createdAt")]
    pub created_at: Option<String>,
    #[serde(default, alias = "updatedAt")]
    pub updated_at: Option<String>,
}

fn de_f64_lenient<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }))
}

/// `2025-01-31`, an RFC 3339 timestamp, or `31/01/2025`.
pub(crate) fn parse_wire_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc).date_naive());
    }
    NaiveDate::parse_from_str(trimmed, "%d/%m/%Y").ok()
}

fn parse_wire_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn parse_wire_items(raw: Option<Value>, order_id: &str) -> Vec<OrderItem> {
    let array = match raw {
        Some(Value::Array(items)) => items,
        Some(Value::String(encoded)) => match serde_json::from_str::<Value>(&encoded) {
            Ok(Value::Array(items)) => items,
            _ => {
                warn!(order_id = %order_id, "order items column held unparseable JSON, treating as empty");
                Vec::new()
            }
        },
        _ => Vec::new(),
    };

    array
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<OrderItem>(value) {
            Ok(item) => Some(item),
            Err(error) => {
                warn!(order_id = %order_id, error = %error, "dropping malformed order item");
                None
            }
        })
        .collect()
}

impl OrderRow {
    /// Translate a wire row into the canonical model. A row without an id
    /// or a readable order date is malformed and rejected; the fetch paths
    /// drop such rows and keep the rest of the batch.
    pub fn into_order(self) -> Result<Order, StoreError> {
        let id = self.id.trim().to_string();
        if id.is_empty() {
            return Err(StoreError::Decode("order row is missing an id".to_string()));
        }

        let order_date = self
            .tanggal
            .as_deref()
            .and_then(parse_wire_date)
            .ok_or_else(|| {
                StoreError::Decode(format!("order {id} has no readable order date"))
            })?;

        let status = self
            .status
            .as_deref()
            .and_then(OrderStatus::parse)
            .unwrap_or(OrderStatus::Pending);

        let items = parse_wire_items(self.items, &id);

        Ok(Order {
            user_id: self.user_id,
            order_number: self.nomor_pesanan.unwrap_or_default(),
            customer_name: self
                .nama_pelanggan
                .unwrap_or_else(|| "Unknown Customer".to_string()),
            customer_phone: self.telepon_pelanggan.filter(|s| !s.is_empty()),
            customer_email: self.email_pelanggan.filter(|s| !s.is_empty()),
            shipping_address: self.alamat_pengiriman.filter(|s| !s.is_empty()),
            order_date,
            completed_date: self.tanggal_selesai.as_deref().and_then(parse_wire_date),
            items,
            subtotal: self.subtotal.unwrap_or(0.0),
            tax: self.pajak.unwrap_or(0.0),
            total_amount: self.total_pesanan.unwrap_or(0.0),
            status,
            notes: self.catatan.unwrap_or_default(),
            created_at: parse_wire_timestamp(self.created_at.as_deref()),
            updated_at: parse_wire_timestamp(self.updated_at.as_deref()),
            id,
        })
    }
}

/// Build the insert body for a draft, in the backend's column vocabulary.
pub fn insert_payload(user_id: &str, draft: &NewOrder) -> Value {
    let mut body = json!({
        "user_id": user_id,
        "nama_pelanggan": draft.customer_name.trim(),
        "telepon_pelanggan": draft.customer_phone.as_deref().unwrap_or(""),
        "email_pelanggan": draft.customer_email.as_deref().unwrap_or(""),
        "alamat_pengiriman": draft.shipping_address.as_deref().unwrap_or(""),
        "tanggal": draft.order_date.format("%Y-%m-%d").to_string(),
        "status": draft.status.as_str(),
        "items": serde_json::to_value(&draft.items).unwrap_or_else(|_| Value::Array(Vec::new())),
        "subtotal": draft.subtotal,
        "pajak": draft.tax,
        "total_pesanan": draft.total_amount,
        "catatan": draft.notes,
    });
    if let Some(number) = draft.order_number.as_deref() {
        body["nomor_pesanan"] = Value::String(number.to_string());
    }
    if let Some(done) = draft.completed_date {
        body["tanggal_selesai"] = Value::String(done.format("%Y-%m-%d").to_string());
    }
    body
}

/// Build the update body for a patch; only set fields are serialized.
pub fn patch_payload(patch: &OrderPatch) -> Value {
    let mut body = serde_json::Map::new();
    if let Some(v) = patch.customer_name.as_deref() {
        body.insert("nama_pelanggan".into(), Value::String(v.trim().to_string()));
    }
    if let Some(v) = patch.customer_phone.as_deref() {
        body.insert("telepon_pelanggan".into(), Value::String(v.to_string()));
    }
    if let Some(v) = patch.customer_email.as_deref() {
        body.insert("email_pelanggan".into(), Value::String(v.to_string()));
    }
    if let Some(v) = patch.shipping_address.as_deref() {
        body.insert("alamat_pengiriman".into(), Value::String(v.to_string()));
    }
    if let Some(v) = patch.order_date {
        body.insert("tanggal".into(), Value::String(v.format("%Y-%m-%d").to_string()));
    }
    if let Some(v) = patch.completed_date {
        body.insert(
            "tanggal_selesai".into(),
            Value::String(v.format("%Y-%m-%d").to_string()),
        );
    }
    if let Some(items) = patch.items.as_ref() {
        body.insert(
            "items".into(),
            serde_json::to_value(items).unwrap_or_else(|_| Value::Array(Vec::new())),
        );
    }
    if let Some(v) = patch.subtotal {
        body.insert("subtotal".into(), json!(v));
    }
    if let Some(v) = patch.tax {
        body.insert("pajak".into(), json!(v));
    }
    if let Some(v) = patch.total_amount {
        body.insert("total_pesanan".into(), json!(v));
    }
    if let Some(v) = patch.status {
        body.insert("status".into(), Value::String(v.as_str().to_string()));
    }
    if let Some(v) = patch.notes.as_deref() {
        body.insert("catatan".into(), Value::String(v.to_string()));
    }
    Value::Object(body)
}

// ===========================================================================
// Tests
// ===========================================================================
