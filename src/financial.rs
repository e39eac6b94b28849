//! Financial ledger collaborator.
//!
//! When an order reaches `completed` the orchestrator hands it to this
//! collaborator exactly once, best-effort: the spawn-and-forget call site
//! logs failures and never lets them touch the status update that
//! triggered them.

use async_trait::async_trait;
use tracing::debug;

use crate::model::Order;

/// Posts completed orders into the host's financial ledger.
#[async_trait]
pub trait FinancialSync: Send + Sync {
    async fn sync_completed_order(&self, order: &Order, user_id: &str) -> Result<(), String>;
}

/// No-op implementation for hosts without a ledger.
#[derive(Debug, Default)]
pub struct DisabledFinancialSync;

#[async_trait]
impl FinancialSync for DisabledFinancialSync {
    async fn sync_completed_order(&self, order: &Order, _user_id: &str) -> Result<(), String> {
        debug!(order_id = %order.id, "financial sync disabled, skipping completed order");
        Ok(())
    }
}
