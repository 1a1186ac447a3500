//! Client error types.

/// Errors that can occur when using the saas-billing client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server returned an error response.
    #[error("API error: {code} - {message}")]
    Api {
        /// Error code.
        code: String,
        /// Error message.
        message: String,
        /// HTTP status code.
        status: u16,
    },

    /// The subscription's current state does not allow the request.
    #[error("invalid transition from {status}: {message}")]
    InvalidTransition {
        /// Status the subscription was in.
        status: String,
        /// Rejection reason.
        message: String,
    },

    /// The gateway declined the charge.
    #[error("payment failed ({code}): {message}")]
    PaymentFailed {
        /// Gateway error code.
        code: String,
        /// Gateway error message.
        message: String,
    },

    /// A payment was captured but the service could not record it.
    #[error("reconciliation required for order {order_id}")]
    ReconciliationRequired {
        /// Order id of the captured payment.
        order_id: String,
    },

    /// Another request holds the subscription or the idempotency key.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Tenant has no subscription, or the resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Credentials missing, wrong, or lacking the required role.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ClientError {
    /// Whether retrying the same request with the same idempotency key may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(err) => err.is_timeout() || err.is_connect(),
            Self::Conflict(_) => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
