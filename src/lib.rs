//! The Small Orders - order management sync core.
//!
//! Client-side state layer for the order module of the admin application:
//! an in-memory order cache kept consistent with the hosted backend through
//! optimistic mutation, a realtime change feed guarded by a circuit
//! breaker, and throttled polling fallback. UI toolkits sit on top of
//! [`OrderService`] and the [`OrderEvents`] bus; persistence and business
//! procedures (stock deduction, completion) stay on the server.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod api;
mod config;
mod connection;
mod error;
mod events;
mod financial;
mod import;
mod model;
mod realtime;
mod recipe;
mod service;
mod store;

#[cfg(test)]
pub(crate) mod testutil;

pub use api::{normalize_base_url, HttpOrderStore};
pub use config::SyncConfig;
pub use connection::ConnectionPolicy;
pub use error::{ImportError, OrderError, StoreError};
pub use events::{OrderEvent, OrderEventKind, OrderEvents, Subscription};
pub use financial::{DisabledFinancialSync, FinancialSync};
pub use import::parse_orders_csv;
pub use model::{NewOrder, Order, OrderItem, OrderPatch, OrderStatus, PricingMode};
pub use realtime::{ChannelState, SubscriptionManager};
pub use recipe::{order_item_from_recipe, reprice_for_mode, RecipeRef, RecipeSource};
pub use service::{BulkImportOutcome, OrderService};
pub use store::{
    ChangeEvent, ChangeHandler, ChannelLostHandler, CompletionOutcome, OrderPage, OrderStore,
    ReversalOutcome, StockCheck, StockShortage, SubscriptionHandle,
};

/// Install the default tracing subscriber (env-filtered, compact format).
/// Hosts embedding this crate in a larger application should configure
/// their own subscriber instead; calling this twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
