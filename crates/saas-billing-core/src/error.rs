//! Error types for saas-billing.

use crate::ids::IdError;

/// Result type for saas-billing operations.
pub type Result<T> = std::result::Result<T, BillingError>;

/// Errors that can occur in saas-billing operations.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// The tenant has no subscription.
    #[error("subscription not found: {tenant_id}")]
    NotFound {
        /// The tenant that was looked up.
        tenant_id: String,
    },

    /// The requested operation is not allowed from the current state.
    #[error("invalid transition from {status}: {reason}")]
    InvalidTransition {
        /// Status the subscription was in when the request arrived.
        status: String,
        /// Human-readable reason the guard rejected the request.
        reason: String,
    },

    /// Optimistic concurrency retries were exhausted.
    #[error("concurrent modification of subscription: {tenant_id}")]
    Conflict {
        /// The contended tenant.
        tenant_id: String,
    },

    /// The payment gateway rejected or failed the request.
    #[error("payment gateway error: {code} - {message}")]
    Gateway {
        /// Provider error code.
        code: String,
        /// Provider error message.
        message: String,
    },

    /// An idempotency key was already used by a committed request.
    #[error("duplicate request: {key}")]
    DuplicateRequest {
        /// The reused idempotency key.
        key: String,
    },

    /// Money moved at the gateway but the store could not record it.
    #[error("payment {order_id} captured as {gateway_reference} but not recorded; reconciliation required")]
    ReconciliationRequired {
        /// Engine-generated order id of the charge.
        order_id: String,
        /// Provider reference of the captured payment.
        gateway_reference: String,
    },

    /// A billing period is malformed.
    #[error("invalid period: {0}")]
    InvalidPeriod(String),

    /// Invalid amount.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl BillingError {
    /// Shorthand for a guard rejection.
    pub fn invalid_transition(status: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidTransition {
            status: status.to_string(),
            reason: reason.into(),
        }
    }
}
