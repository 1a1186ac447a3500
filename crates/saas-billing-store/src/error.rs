//! Error types for saas-billing storage.

use saas_billing_core::BillingError;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("not found")]
    NotFound,

    /// A subscription already exists for the tenant.
    #[error("subscription already exists")]
    AlreadyExists,

    /// The stored version differs from the caller's view.
    #[error("version conflict: expected={expected}, actual={actual}")]
    Conflict {
        /// Version the caller read.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// The idempotency key was already used.
    #[error("duplicate idempotency key: {key}")]
    DuplicateIdempotencyKey {
        /// The key that was reused.
        key: String,
    },

    /// Stored data violates an invariant the store relies on.
    #[error("inconsistent store: {0}")]
    Inconsistent(String),
}

impl From<StoreError> for BillingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateIdempotencyKey { key } => Self::DuplicateRequest { key },
            StoreError::Serialization(msg) => Self::Serialization(msg),
            other => Self::Storage(other.to_string()),
        }
    }
}
