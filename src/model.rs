//! Canonical order data model.
//!
//! One internal representation for orders no matter what a wire row or a
//! CSV column calls a field. All renaming happens in the store boundary
//! adapter (`store::OrderRow`) and the CSV importer; business code never
//! does multi-key lookups.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status lifecycle
// ---------------------------------------------------------------------------

/// Order lifecycle status.
///
/// `processing` and `shipped` are legacy spellings still emitted by older
/// backend rows; they decode to `Preparing` and `Ready` and are never
/// written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    #[serde(alias = "processing")]
    Preparing,
    #[serde(alias = "shipped")]
    Ready,
    Delivered,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 7] = [
        OrderStatus::Pending,
        OrderStatus::Confirmed,
        OrderStatus::Preparing,
        OrderStatus::Ready,
        OrderStatus::Delivered,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// Parse a wire status string, accepting the legacy spellings.
    /// Unknown values map to `None`; callers decide the fallback.
    pub fn parse(raw: &str) -> Option<OrderStatus> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(OrderStatus::Pending),
            "confirmed" => Some(OrderStatus::Confirmed),
            "preparing" | "processing" => Some(OrderStatus::Preparing),
            "ready" | "shipped" => Some(OrderStatus::Ready),
            "delivered" => Some(OrderStatus::Delivered),
            "completed" => Some(OrderStatus::Completed),
            "cancelled" | "canceled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal orders accept no further edits or status changes; only the
    /// explicit completion-reversal procedure moves them back.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    /// The canonical single-step lifecycle. Bulk operations may jump
    /// states, so this is advisory for hosts rather than enforced on every
    /// mutation; terminality is the hard rule.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match self {
            Pending => matches!(next, Confirmed | Cancelled),
            Confirmed => matches!(next, Preparing | Cancelled),
            Preparing => matches!(next, Ready | Cancelled),
            Ready => matches!(next, Delivered | Completed),
            Delivered => matches!(next, Completed),
            Completed | Cancelled => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Line items
// ---------------------------------------------------------------------------

/// How a recipe-linked item is priced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingMode {
    PerPortion,
    PerPiece,
}

/// One line of an order.
///
/// Items travel as an opaque JSON column on the wire, so this struct doubles
/// as the wire shape; legacy camelCase keys are accepted on decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: String,
    pub name: String,
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(alias = "price", alias = "unitPrice", alias = "harga")]
    pub unit_price: f64,
    #[serde(default)]
    pub total: f64,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "recipeId")]
    pub recipe_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "recipeCategory")]
    pub recipe_category: Option<String>,
    #[serde(default, alias = "isFromRecipe")]
    pub is_from_recipe: bool,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "pricingMode")]
    pub pricing_mode: Option<PricingMode>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "pricePerPortion")]
    pub price_per_portion: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "pricePerPiece")]
    pub price_per_piece: Option<f64>,
}

impl OrderItem {
    /// A manual (non-recipe) item with a freely chosen unit price.
    pub fn manual(name: impl Into<String>, quantity: u32, unit_price: f64) -> Self {
        let mut item = Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            quantity,
            unit: None,
            unit_price,
            total: 0.0,
            recipe_id: None,
            recipe_category: None,
            is_from_recipe: false,
            pricing_mode: None,
            price_per_portion: None,
            price_per_piece: None,
        };
        item.recompute_total();
        item
    }

    /// `total` is always `quantity * unit_price`; call after any edit.
    pub fn recompute_total(&mut self) {
        self.total = f64::from(self.quantity) * self.unit_price;
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// A customer order as the cache and the UI see it.
///
/// `created_at`/`updated_at` are server-assigned; the client only ever
/// carries them through from a store echo or a realtime row.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: String,
    pub user_id: String,
    pub order_number: String,
    pub customer_name: String,
    pub customer_phone: Option<String>,
    pub customer_email: Option<String>,
    pub shipping_address: Option<String>,
    pub order_date: NaiveDate,
    /// Stamped by the backend when the order reaches `completed`; feeds the
    /// per-day revenue views.
    pub completed_date: Option<NaiveDate>,
    pub items: Vec<OrderItem>,
    pub subtotal: f64,
    pub tax: f64,
    pub total_amount: f64,
    pub status: OrderStatus,
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Re-derive totals from the line items. Only meaningful while an order
    /// is being edited; persisted totals are authoritative once stored.
    pub fn recompute_totals(&mut self) {
        for item in &mut self.items {
            item.recompute_total();
        }
        self.subtotal = self.items.iter().map(|i| i.total).sum();
        self.total_amount = self.subtotal + self.tax;
    }
}

// ---------------------------------------------------------------------------
// Drafts and patches
// ---------------------------------------------------------------------------

/// A not-yet-persisted order; the server assigns id, number and timestamps.
#[derive(Debug, Clone)]
pub struct NewOrder {
    /// Pre-assigned number (e.g. from an import); server generates one when
    /// absent.
    pub order_number: Option<String>,
    pub customer_name: String,
    pub customer_phone: Option<String>,
    pub customer_email: Option<String>,
    pub shipping_address: Option<String>,
    pub order_date: NaiveDate,
    pub completed_date: Option<NaiveDate>,
    pub items: Vec<OrderItem>,
    pub subtotal: f64,
    pub tax: f64,
    pub total_amount: f64,
    pub status: OrderStatus,
    pub notes: String,
}

const CUSTOMER_NAME_MIN: usize = 2;
const CUSTOMER_NAME_MAX: usize = 100;
const ITEMS_PER_ORDER_MAX: usize = 50;
const PHONE_MIN: usize = 8;
const PHONE_MAX: usize = 16;
const EMAIL_MAX: usize = 254;
const NOTES_MAX: usize = 1000;

impl NewOrder {
    pub fn new(customer_name: impl Into<String>, order_date: NaiveDate) -> Self {
        Self {
            order_number: None,
            customer_name: customer_name.into(),
            customer_phone: None,
            customer_email: None,
            shipping_address: None,
            order_date,
            completed_date: None,
            items: Vec::new(),
            subtotal: 0.0,
            tax: 0.0,
            total_amount: 0.0,
            status: OrderStatus::Pending,
            notes: String::new(),
        }
    }

    /// Re-derive `subtotal` and `total_amount` from the items.
    pub fn recompute_totals(&mut self) {
        for item in &mut self.items {
            item.recompute_total();
        }
        self.subtotal = self.items.iter().map(|i| i.total).sum();
        self.total_amount = self.subtotal + self.tax;
    }

    /// Check the draft before it is ever sent anywhere. Returns every
    /// violated rule as a human-readable message.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let name = self.customer_name.trim();
        if name.is_empty() {
            errors.push("customer name is required".to_string());
        } else if name.chars().count() < CUSTOMER_NAME_MIN {
            errors.push(format!("customer name must be at least {CUSTOMER_NAME_MIN} characters"));
        } else if name.chars().count() > CUSTOMER_NAME_MAX {
            errors.push(format!("customer name must be at most {CUSTOMER_NAME_MAX} characters"));
        }

        if self.items.is_empty() {
            errors.push("order needs at least one item".to_string());
        } else if self.items.len() > ITEMS_PER_ORDER_MAX {
            errors.push(format!("order may carry at most {ITEMS_PER_ORDER_MAX} items"));
        }

        if self.total_amount <= 0.0 {
            errors.push("order total must be greater than zero".to_string());
        }

        if let Some(phone) = self.customer_phone.as_deref().filter(|p| !p.is_empty()) {
            let digits_ok = phone
                .char_indices()
                .all(|(i, c)| c.is_ascii_digit() || (i == 0 && c == '+'));
            if !digits_ok || phone.len() < PHONE_MIN || phone.len() > PHONE_MAX {
                errors.push("customer phone must be 8-16 digits, optionally prefixed with +".to_string());
            }
        }

        if let Some(email) = self.customer_email.as_deref().filter(|e| !e.is_empty()) {
            let well_formed = email.len() <= EMAIL_MAX
                && email.contains('@')
                && email.rsplit('@').next().is_some_and(|domain| domain.contains('.'));
            if !well_formed {
                errors.push("customer email is not a valid address".to_string());
            }
        }

        if self.notes.chars().count() > NOTES_MAX {
            errors.push(format!("notes must be at most {NOTES_MAX} characters"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Partial update for an existing order. `None` fields stay untouched on
/// the server; the cache is never patched from this struct, only from the
/// server echo.
#[derive(Debug, Clone, Default)]
pub struct OrderPatch {
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub customer_email: Option<String>,
    pub shipping_address: Option<String>,
    pub order_date: Option<NaiveDate>,
    pub completed_date: Option<NaiveDate>,
    pub items: Option<Vec<OrderItem>>,
    pub subtotal: Option<f64>,
    pub tax: Option<f64>,
    pub total_amount: Option<f64>,
    pub status: Option<OrderStatus>,
    pub notes: Option<String>,
}

impl OrderPatch {
    pub fn is_empty(&self) -> bool {
        self.customer_name.is_none()
            && self.customer_phone.is_none()
            && self.customer_email.is_none()
            && self.shipping_address.is_none()
            && self.order_date.is_none()
            && self.completed_date.is_none()
            && self.items.is_none()
            && self.subtotal.is_none()
            && self.tax.is_none()
            && self.total_amount.is_none()
            && self.status.is_none()
            && self.notes.is_none()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_terminal_statuses_accept_no_transitions() {
        assert!(OrderStatus::Completed.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        for next in OrderStatus::ALL {
            assert!(!OrderStatus::Completed.can_transition_to(next));
            assert!(!OrderStatus::Cancelled.can_transition_to(next));
        }
    }

    #[test]
    fn test_lifecycle_matrix() {
        use OrderStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Ready));
        assert!(Confirmed.can_transition_to(Preparing));
        assert!(Preparing.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Delivered));
        assert!(Ready.can_transition_to(Completed));
        assert!(Delivered.can_transition_to(Completed));
        assert!(!Delivered.can_transition_to(Cancelled));
    }

    #[test]
    fn test_status_parse_accepts_legacy_spellings() {
        assert_eq!(OrderStatus::parse("processing"), Some(OrderStatus::Preparing));
        assert_eq!(OrderStatus::parse("shipped"), Some(OrderStatus::Ready));
        assert_eq!(OrderStatus::parse(" Completed "), Some(OrderStatus::Completed));
        assert_eq!(OrderStatus::parse("canceled"), Some(OrderStatus::Cancelled));
        assert_eq!(OrderStatus::parse("unknown"), None);
    }

    #[test]
    fn test_item_total_recompute() {
        let mut item = OrderItem::manual("Brownies", 3, 25_000.0);
        assert_eq!(item.total, 75_000.0);
        item.quantity = 5;
        item.recompute_total();
        assert_eq!(item.total, 125_000.0);
    }

    #[test]
    fn test_item_decodes_legacy_camel_case_keys() {
        let raw = r#"{
            "id": "it-1",
            "name": "Nastar",
            "quantity": 2,
            "price": 50000,
            "total": 100000,
            "isFromRecipe": true,
            "recipeId": "rcp-9",
            "pricingMode": "per_portion",
            "pricePerPortion": 50000
        }"#;
        let item: OrderItem = serde_json::from_str(raw).unwrap();
        assert_eq!(item.unit_price, 50_000.0);
        assert!(item.is_from_recipe);
        assert_eq!(item.recipe_id.as_deref(), Some("rcp-9"));
        assert_eq!(item.pricing_mode, Some(PricingMode::PerPortion));
    }

    #[test]
    fn test_draft_validation_reports_every_violation() {
        let mut draft = NewOrder::new("", date("2025-01-10"));
        draft.total_amount = 0.0;
        let errors = draft.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("customer name")));
        assert!(errors.iter().any(|e| e.contains("at least one item")));
        assert!(errors.iter().any(|e| e.contains("greater than zero")));
    }

    #[test]
    fn test_draft_validation_passes_minimal_order() {
        let mut draft = NewOrder::new("Acme Bakery", date("2025-01-10"));
        draft.items.push(OrderItem::manual("Widget", 2, 100.0));
        draft.recompute_totals();
        assert!(draft.validate().is_ok());
        assert_eq!(draft.total_amount, 200.0);
    }

    #[test]
    fn test_draft_validation_checks_optional_contact_fields() {
        let mut draft = NewOrder::new("Acme Bakery", date("2025-01-10"));
        draft.items.push(OrderItem::manual("Widget", 1, 50.0));
        draft.recompute_totals();
        draft.customer_phone = Some("abc".to_string());
        draft.customer_email = Some("not-an-email".to_string());
        let errors = draft.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("phone")));
        assert!(errors.iter().any(|e| e.contains("email")));
    }

    #[test]
    fn test_order_totals_follow_items_and_tax() {
        let mut order = Order {
            id: "ord-1".into(),
            user_id: "user-1".into(),
            order_number: "ORD-001".into(),
            customer_name: "Acme".into(),
            customer_phone: None,
            customer_email: None,
            shipping_address: None,
            order_date: date("2025-01-01"),
            completed_date: None,
            items: vec![OrderItem::manual("A", 2, 100.0), OrderItem::manual("B", 1, 50.0)],
            subtotal: 0.0,
            tax: 25.0,
            total_amount: 0.0,
            status: OrderStatus::Pending,
            notes: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        order.recompute_totals();
        assert_eq!(order.subtotal, 250.0);
        assert_eq!(order.total_amount, 275.0);
    }
}
