//! Payment gateway integration.
//!
//! The gateway handles:
//! - Exchanging a card authorization code for a reusable billing token
//! - Charging a stored billing token
//! - Refunding (fully or partially) a captured payment
//!
//! The engine only sees the [`PaymentGateway`] trait. [`HttpGateway`] talks
//! to the provider's REST API; [`DisabledGateway`] stands in when no secret
//! key is configured.

pub mod client;
pub mod types;

use async_trait::async_trait;
use saas_billing_core::BillingError;

pub use client::HttpGateway;

/// Receipt status of a settled payment.
pub const STATUS_DONE: &str = "DONE";

/// Error returned by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct GatewayError {
    /// Provider or transport error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl GatewayError {
    /// Build an error from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Connection or protocol failure.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new("NETWORK_ERROR", message)
    }

    /// The gateway did not answer in time.
    pub fn timeout() -> Self {
        Self::new("TIMEOUT", "payment gateway did not respond in time")
    }

    /// No gateway credentials are configured.
    pub fn not_configured() -> Self {
        Self::new("NOT_CONFIGURED", "payment gateway is not configured")
    }

    /// The charge can't be attempted because no billing token is on file.
    pub fn no_billing_token() -> Self {
        Self::new("NO_BILLING_TOKEN", "no billing credential on file")
    }

    /// Whether the outcome of the call is unknown.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.code == "TIMEOUT"
    }
}

impl From<GatewayError> for BillingError {
    fn from(err: GatewayError) -> Self {
        Self::Gateway {
            code: err.code,
            message: err.message,
        }
    }
}

/// A billing token issued for a customer's card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    /// Reusable billing token.
    pub token: String,
    /// Masked card description, if the provider returned one.
    pub card_summary: Option<String>,
}

/// One charge against a billing token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    /// Billing token to charge.
    pub token: String,
    /// Provider-side customer key (the tenant id).
    pub customer_key: String,
    /// Amount in minor units.
    pub amount: i64,
    /// Engine-generated order id.
    pub order_id: String,
    /// Description shown on the receipt.
    pub order_name: String,
    /// Receipt email.
    pub customer_email: Option<String>,
}

/// Result of a charge call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeReceipt {
    /// Provider reference of the payment.
    pub gateway_reference: String,
    /// Provider status.
    pub status: String,
}

impl ChargeReceipt {
    /// Whether the payment settled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.status == STATUS_DONE
    }
}

/// Operations the engine needs from a payment provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Exchange a card authorization code for a billing token.
    async fn issue_billing_token(
        &self,
        auth_code: &str,
        customer_key: &str,
    ) -> Result<IssuedToken, GatewayError>;

    /// Charge a billing token.
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError>;

    /// Refund `amount` of a captured payment.
    async fn refund(
        &self,
        gateway_reference: &str,
        reason: &str,
        amount: i64,
    ) -> Result<(), GatewayError>;
}

/// Gateway used when no credentials are configured. Every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledGateway;

#[async_trait]
impl PaymentGateway for DisabledGateway {
    async fn issue_billing_token(&self, _: &str, _: &str) -> Result<IssuedToken, GatewayError> {
        Err(GatewayError::not_configured())
    }

    async fn charge(&self, _: &ChargeRequest) -> Result<ChargeReceipt, GatewayError> {
        Err(GatewayError::not_configured())
    }

    async fn refund(&self, _: &str, _: &str, _: i64) -> Result<(), GatewayError> {
        Err(GatewayError::not_configured())
    }
}
