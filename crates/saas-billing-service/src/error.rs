//! API error types and responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use saas_billing_core::BillingError;
use serde::Serialize;

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Unauthorized - missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Forbidden - valid credentials but insufficient permissions.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad request - invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Conflict - concurrent modification or request in flight.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The lifecycle rejected the request in the subscription's current state.
    #[error("invalid transition from {status}: {reason}")]
    InvalidTransition {
        /// Status the subscription was in.
        status: String,
        /// Why the request was rejected.
        reason: String,
    },

    /// The payment gateway declined or failed the charge.
    #[error("payment failed: {message}")]
    PaymentFailed {
        /// Gateway error code.
        code: String,
        /// Gateway error message.
        message: String,
    },

    /// Money moved but was not recorded.
    #[error("payment {order_id} was captured but not recorded")]
    ReconciliationRequired {
        /// Order id of the captured payment.
        order_id: String,
        /// Gateway reference of the captured payment.
        gateway_reference: String,
    },

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                self.to_string(),
                None,
            ),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg.clone(), None),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone(), None),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone(), None),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone(), None),
            Self::InvalidTransition { status, reason } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_transition",
                reason.clone(),
                Some(serde_json::json!({ "status": status })),
            ),
            Self::PaymentFailed { code, message } => (
                StatusCode::PAYMENT_REQUIRED,
                "gateway_error",
                message.clone(),
                Some(serde_json::json!({ "code": code })),
            ),
            Self::ReconciliationRequired {
                order_id,
                gateway_reference,
            } => (
                StatusCode::BAD_GATEWAY,
                "reconciliation_required",
                self.to_string(),
                Some(serde_json::json!({
                    "order_id": order_id,
                    "gateway_reference": gateway_reference
                })),
            ),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::NotFound { tenant_id } => {
                Self::NotFound(format!("no subscription for tenant {tenant_id}"))
            }
            BillingError::InvalidTransition { status, reason } => {
                Self::InvalidTransition { status, reason }
            }
            BillingError::Conflict { tenant_id } => Self::Conflict(format!(
                "subscription of tenant {tenant_id} is being modified by another request"
            )),
            BillingError::Gateway { code, message } => Self::PaymentFailed { code, message },
            BillingError::DuplicateRequest { key } => {
                Self::Conflict(format!("idempotency key {key} belongs to another tenant"))
            }
            BillingError::ReconciliationRequired {
                order_id,
                gateway_reference,
            } => Self::ReconciliationRequired {
                order_id,
                gateway_reference,
            },
            err @ (BillingError::InvalidPeriod(_)
            | BillingError::InvalidAmount(_)
            | BillingError::InvalidId(_)) => Self::BadRequest(err.to_string()),
            err @ (BillingError::Storage(_)
            | BillingError::Serialization(_)
            | BillingError::Configuration(_)) => Self::Internal(err.to_string()),
        }
    }
}

impl From<saas_billing_store::StoreError> for ApiError {
    fn from(err: saas_billing_store::StoreError) -> Self {
        BillingError::from(err).into()
    }
}
