//! Admin dashboard API client.
//!
//! Production [`OrderStore`] over the hosted backend's REST/RPC surface:
//! order CRUD under `/api/orders`, business procedures under `/api/rpc`,
//! and the row-change feed under `/api/orders/changes`. Authentication is
//! a per-terminal API key header, same as the rest of the admin API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::StoreError;
use crate::model::{NewOrder, Order, OrderPatch, OrderStatus};
use crate::store::{
    insert_payload, patch_payload, ChangeEvent, ChangeHandler, ChannelLostHandler,
    CompletionOutcome, OrderPage, OrderRow, OrderStore, ReversalOutcome, StockCheck,
    SubscriptionHandle,
};

/// Consecutive change-feed poll failures tolerated before the channel is
/// declared lost.
const CHANGE_FEED_MAX_FAILURES: u32 = 3;

/// Delay inserted between bulk request chunks so a big selection does not
/// trip the backend rate limiter.
const BULK_CHUNK_STAGGER: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the admin dashboard URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn percent_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for b in input.bytes() {
        let is_unreserved =
            b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~';
        if is_unreserved {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    encoded
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn friendly_error(url: &str, err: reqwest::Error) -> StoreError {
    if err.is_connect() {
        return StoreError::Unreachable {
            url: url.to_string(),
        };
    }
    if err.is_timeout() {
        return StoreError::Timeout {
            url: url.to_string(),
        };
    }
    StoreError::Network {
        url: url.to_string(),
        source: err,
    }
}

fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Admin dashboard endpoint not found".to_string(),
        429 => "Admin dashboard is rate limiting requests".to_string(),
        s if s >= 500 => format!("Admin dashboard server error (HTTP {s})"),
        s => format!("Unexpected response from admin dashboard (HTTP {s})"),
    }
}

/// Build a [`StoreError::Status`], keeping server-supplied validation
/// detail when the body carries any.
fn error_from_response(status: StatusCode, body_text: &str) -> StoreError {
    let message = if let Ok(body) = serde_json::from_str::<Value>(body_text) {
        let base = body
            .get("error")
            .or_else(|| body.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| status_message(status));
        match body.get("details").or_else(|| body.get("errors")) {
            Some(details) => format!("{base}: {details}"),
            None => base,
        }
    } else if !body_text.trim().is_empty() {
        format!("{}: {}", status_message(status), body_text.trim())
    } else {
        status_message(status)
    };

    StoreError::Status {
        status: status.as_u16(),
        message,
    }
}

// ---------------------------------------------------------------------------
// Request plumbing
// ---------------------------------------------------------------------------

async fn request_json(
    client: &Client,
    base_url: &str,
    api_key: &str,
    method: Method,
    path: &str,
    body: Option<&Value>,
) -> Result<Value, StoreError> {
    let full_url = format!("{base_url}{path}");
    let mut request = client
        .request(method, &full_url)
        .header("X-POS-API-Key", api_key)
        .header("Content-Type", "application/json");
    if let Some(body) = body {
        request = request.json(body);
    }

    let response = request
        .send()
        .await
        .map_err(|e| friendly_error(base_url, e))?;
    let status = response.status();
    let body_text = response.text().await.unwrap_or_default();

    if !status.is_success() {
        return Err(error_from_response(status, &body_text));
    }
    if body_text.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body_text)
        .map_err(|e| StoreError::Decode(format!("invalid JSON from admin dashboard: {e}")))
}

/// Decode a list of wire rows, dropping malformed ones so a single bad row
/// never kills the batch.
fn decode_rows(rows: Vec<Value>) -> Vec<Order> {
    rows.into_iter()
        .filter_map(|value| {
            let row = match serde_json::from_value::<OrderRow>(value) {
                Ok(row) => row,
                Err(error) => {
                    warn!(error = %error, "skipping undecodable order row");
                    return None;
                }
            };
            match row.into_order() {
                Ok(order) => Some(order),
                Err(error) => {
                    warn!(error = %error, "skipping malformed order row");
                    None
                }
            }
        })
        .collect()
}

/// Pull the order array out of a response that is either a bare array or
/// an `{ "orders": [...] }` envelope.
fn order_array(value: Value) -> Vec<Value> {
    match value {
        Value::Array(rows) => rows,
        Value::Object(mut map) => match map.remove("orders").or_else(|| map.remove("data")) {
            Some(Value::Array(rows)) => rows,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn decode_single(value: Value) -> Result<Order, StoreError> {
    let row_value = match value {
        Value::Object(ref map) if map.contains_key("order") => value["order"].clone(),
        other => other,
    };
    serde_json::from_value::<OrderRow>(row_value)
        .map_err(|e| StoreError::Decode(format!("invalid order row: {e}")))?
        .into_order()
}

/// RPC results sometimes come back as a JSON-encoded string; unwrap one
/// level before decoding.
fn rpc_value(value: Value) -> Value {
    match value {
        Value::String(encoded) => serde_json::from_str(&encoded).unwrap_or(Value::Null),
        other => other,
    }
}

fn parse_change(value: &Value) -> Option<ChangeEvent> {
    let kind = value
        .get("type")
        .or_else(|| value.get("event"))
        .and_then(Value::as_str)?
        .to_ascii_lowercase();
    let row = value
        .get("order")
        .or_else(|| value.get("row"))
        .or_else(|| value.get("record"))
        .cloned();

    match kind.as_str() {
        "insert" | "update" => {
            let order = serde_json::from_value::<OrderRow>(row?)
                .ok()?
                .into_order()
                .ok()?;
            if kind == "insert" {
                Some(ChangeEvent::Insert(order))
            } else {
                Some(ChangeEvent::Update(order))
            }
        }
        "delete" => {
            let id = value
                .get("id")
                .or_else(|| value.get("order_id"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| {
                    row.as_ref()
                        .and_then(|r| r.get("id"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })?;
            Some(ChangeEvent::Delete { id })
        }
        other => {
            debug!(kind = other, "ignoring unknown change kind");
            None
        }
    }
}

async fn poll_changes(
    client: &Client,
    base_url: &str,
    api_key: &str,
    user_id: &str,
    cursor: &str,
) -> Result<(Vec<ChangeEvent>, String), StoreError> {
    let path = format!(
        "/api/orders/changes?user_id={}&since={}",
        percent_encode(user_id),
        percent_encode(cursor)
    );
    let body = request_json(client, base_url, api_key, Method::GET, &path, None).await?;

    let next_cursor = body
        .get("cursor")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| cursor.to_string());
    let events = body
        .get("changes")
        .and_then(Value::as_array)
        .map(|changes| changes.iter().filter_map(parse_change).collect())
        .unwrap_or_default();
    Ok((events, next_cursor))
}

// ---------------------------------------------------------------------------
// The client
// ---------------------------------------------------------------------------

/// Authenticated HTTP client for the hosted order store.
pub struct HttpOrderStore {
    base_url: String,
    api_key: String,
    client: Client,
    config: SyncConfig,
}

impl HttpOrderStore {
    pub fn new(base_url: &str, api_key: &str, config: SyncConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| StoreError::Other(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: normalize_base_url(base_url),
            api_key: api_key.trim().to_string(),
            client,
            config,
        })
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, StoreError> {
        request_json(&self.client, &self.base_url, &self.api_key, method, path, body).await
    }
}

#[async_trait]
impl OrderStore for HttpOrderStore {
    async fn fetch(&self, user_id: &str, limit: usize) -> Result<Vec<Order>, StoreError> {
        let path = format!(
            "/api/orders?user_id={}&limit={limit}",
            percent_encode(user_id)
        );
        let body = self.request(Method::GET, &path, None).await?;
        Ok(decode_rows(order_array(body)))
    }

    async fn fetch_page(
        &self,
        user_id: &str,
        page: usize,
        page_size: usize,
    ) -> Result<OrderPage, StoreError> {
        let path = format!(
            "/api/orders?user_id={}&page={page}&page_size={page_size}",
            percent_encode(user_id)
        );
        let body = self.request(Method::GET, &path, None).await?;
        let total_count = body
            .get("total_count")
            .or_else(|| body.get("totalCount"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        Ok(OrderPage {
            orders: decode_rows(order_array(body)),
            total_count,
        })
    }

    async fn fetch_by_id(&self, user_id: &str, id: &str) -> Result<Option<Order>, StoreError> {
        let path = format!(
            "/api/orders/{}?user_id={}",
            percent_encode(id),
            percent_encode(user_id)
        );
        match self.request(Method::GET, &path, None).await {
            Ok(body) => Ok(Some(decode_single(body)?)),
            Err(StoreError::Status { status: 404, .. }) => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn insert(&self, user_id: &str, draft: &NewOrder) -> Result<Order, StoreError> {
        let body = insert_payload(user_id, draft);
        let response = self.request(Method::POST, "/api/orders", Some(&body)).await?;
        let order = decode_single(response)?;
        info!(order_id = %order.id, order_number = %order.order_number, "order inserted");
        Ok(order)
    }

    async fn update(
        &self,
        user_id: &str,
        id: &str,
        patch: &OrderPatch,
    ) -> Result<Order, StoreError> {
        let mut body = patch_payload(patch);
        body["user_id"] = Value::String(user_id.to_string());
        let path = format!("/api/orders/{}", percent_encode(id));
        let response = self.request(Method::PATCH, &path, Some(&body)).await?;
        decode_single(response)
    }

    async fn update_status(
        &self,
        user_id: &str,
        id: &str,
        status: OrderStatus,
    ) -> Result<Order, StoreError> {
        let body = json!({ "user_id": user_id, "status": status.as_str() });
        let path = format!("/api/orders/{}/status", percent_encode(id));
        let response = self.request(Method::PATCH, &path, Some(&body)).await?;
        decode_single(response)
    }

    async fn delete(&self, user_id: &str, id: &str) -> Result<(), StoreError> {
        let path = format!(
            "/api/orders/{}?user_id={}",
            percent_encode(id),
            percent_encode(user_id)
        );
        self.request(Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn bulk_update_status(
        &self,
        user_id: &str,
        ids: &[String],
        status: OrderStatus,
    ) -> Result<(), StoreError> {
        for (index, chunk) in ids.chunks(self.config.bulk_batch_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(BULK_CHUNK_STAGGER).await;
            }
            let body = json!({
                "user_id": user_id,
                "ids": chunk,
                "status": status.as_str(),
            });
            self.request(Method::POST, "/api/orders/bulk/status", Some(&body))
                .await?;
        }
        Ok(())
    }

    async fn bulk_delete(&self, user_id: &str, ids: &[String]) -> Result<(), StoreError> {
        for (index, chunk) in ids.chunks(self.config.bulk_batch_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(BULK_CHUNK_STAGGER).await;
            }
            let body = json!({ "user_id": user_id, "ids": chunk });
            self.request(Method::POST, "/api/orders/bulk/delete", Some(&body))
                .await?;
        }
        Ok(())
    }

    async fn can_complete_order(&self, order_id: &str) -> Result<StockCheck, StoreError> {
        let body = json!({ "order_id": order_id });
        let response = self
            .request(Method::POST, "/api/rpc/can_complete_order", Some(&body))
            .await?;
        serde_json::from_value(rpc_value(response))
            .map_err(|e| StoreError::Decode(format!("invalid stock check result: {e}")))
    }

    async fn complete_order_and_deduct_stock(
        &self,
        order_id: &str,
    ) -> Result<CompletionOutcome, StoreError> {
        let body = json!({ "order_id": order_id });
        let response = self
            .request(
                Method::POST,
                "/api/rpc/complete_order_and_deduct_stock",
                Some(&body),
            )
            .await?;
        serde_json::from_value(rpc_value(response))
            .map_err(|e| StoreError::Decode(format!("invalid completion result: {e}")))
    }

    async fn reverse_order_completion(
        &self,
        order_id: &str,
    ) -> Result<ReversalOutcome, StoreError> {
        let body = json!({ "order_id": order_id });
        let response = self
            .request(Method::POST, "/api/rpc/reverse_order_completion", Some(&body))
            .await?;
        serde_json::from_value(rpc_value(response))
            .map_err(|e| StoreError::Decode(format!("invalid reversal result: {e}")))
    }

    /// Change-feed subscription: the first poll both confirms the channel
    /// and seeds the cursor; after that a background task keeps polling on
    /// a short interval until cancelled or the feed dies repeatedly.
    async fn subscribe(
        &self,
        user_id: &str,
        on_event: ChangeHandler,
        on_lost: ChannelLostHandler,
    ) -> Result<SubscriptionHandle, StoreError> {
        let initial_cursor = Utc::now().to_rfc3339();
        let (events, mut cursor) = poll_changes(
            &self.client,
            &self.base_url,
            &self.api_key,
            user_id,
            &initial_cursor,
        )
        .await?;
        for event in events {
            on_event(event);
        }

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let api_key = self.api_key.clone();
        let user_id = user_id.to_string();
        let interval = self.config.change_poll_interval;

        tokio::spawn(async move {
            let mut consecutive_failures = 0u32;
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                match poll_changes(&client, &base_url, &api_key, &user_id, &cursor).await {
                    Ok((events, next_cursor)) => {
                        consecutive_failures = 0;
                        cursor = next_cursor;
                        for event in events {
                            on_event(event);
                        }
                    }
                    Err(error) => {
                        consecutive_failures += 1;
                        warn!(
                            error = %error,
                            consecutive_failures,
                            "change feed poll failed"
                        );
                        if consecutive_failures >= CHANGE_FEED_MAX_FAILURES {
                            on_lost();
                            break;
                        }
                    }
                }
            }
            debug!(user_id = %user_id, "change feed loop stopped");
        });

        Ok(SubscriptionHandle::new(token))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
