//! Error taxonomy for the order sync core.
//!
//! Transport and HTTP-status problems surface as [`StoreError`] with
//! operator-readable messages; the orchestrator wraps them into
//! [`OrderError`] together with local validation and lifecycle rejections.

use thiserror::Error;

use crate::model::OrderStatus;

/// Failures raised by a remote order store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Cannot reach admin dashboard at {url}")]
    Unreachable { url: String },

    #[error("Connection to {url} timed out")]
    Timeout { url: String },

    #[error("Network error communicating with {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Non-2xx response; `message` carries server-supplied detail when the
    /// body had any.
    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },

    #[error("Invalid response from admin dashboard: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// True for failures that typically clear up on their own (worth a
    /// retry or a fallback poll rather than an operator page).
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unreachable { .. }
            | StoreError::Timeout { .. }
            | StoreError::Network { .. } => true,
            StoreError::Status { status, .. } => *status == 429 || *status >= 500,
            StoreError::Decode(_) | StoreError::Other(_) => false,
        }
    }
}

/// Failures surfaced by the orchestrator's public operations.
#[derive(Debug, Error)]
pub enum OrderError {
    /// One message per violated rule; the mutation was never attempted.
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// The order already reached a terminal status; only an explicit
    /// completion reversal can bring it back.
    #[error("order {id} is {status} and can no longer be changed")]
    TerminalStatus { id: String, status: OrderStatus },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Import(#[from] ImportError),
}

/// Fatal CSV import problems. Row-level issues are skipped, not raised.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
}
