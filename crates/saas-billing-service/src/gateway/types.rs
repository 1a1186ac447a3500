//! Gateway wire types.

use serde::{Deserialize, Serialize};

/// Body of a billing-key issue request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueBillingKeyRequest<'a> {
    /// Card authorization code from the checkout widget.
    pub auth_key: &'a str,
    /// Customer key the token is bound to.
    pub customer_key: &'a str,
}

/// Issued billing key.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingKey {
    /// Reusable billing key.
    pub billing_key: String,
    /// Card issuer name.
    #[serde(default)]
    pub card_company: Option<String>,
    /// Masked card details.
    #[serde(default)]
    pub card: Option<CardInfo>,
}

impl BillingKey {
    /// Short human-readable card description, e.g. `Shinhan 4330****1234`.
    #[must_use]
    pub fn card_summary(&self) -> Option<String> {
        let number = self.card.as_ref().and_then(|c| c.number.clone());
        match (self.card_company.as_deref(), number) {
            (Some(company), Some(number)) => Some(format!("{company} {number}")),
            (None, Some(number)) => Some(number),
            (Some(company), None) => Some(company.to_string()),
            (None, None) => None,
        }
    }
}

/// Masked card details.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardInfo {
    /// Masked card number.
    #[serde(default)]
    pub number: Option<String>,
    /// Credit, debit or gift.
    #[serde(default)]
    pub card_type: Option<String>,
}

/// Body of a billing charge.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingChargeRequest<'a> {
    /// Customer key the billing key belongs to.
    pub customer_key: &'a str,
    /// Amount in minor units.
    pub amount: i64,
    /// Merchant order id.
    pub order_id: &'a str,
    /// Receipt description.
    pub order_name: &'a str,
    /// Receipt email.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<&'a str>,
}

/// Payment object returned by charge and cancel calls.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    /// Provider payment key.
    pub payment_key: String,
    /// Merchant order id.
    #[serde(default)]
    pub order_id: Option<String>,
    /// Payment status (`DONE`, `CANCELED`, `PARTIAL_CANCELED`, `ABORTED`, ...).
    pub status: String,
    /// Total amount.
    #[serde(default)]
    pub total_amount: Option<i64>,
}

/// Body of a cancel (refund) request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest<'a> {
    /// Reason shown to the customer.
    pub cancel_reason: &'a str,
    /// Amount to refund.
    pub cancel_amount: i64,
}

/// Provider error body.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayErrorResponse {
    /// Provider error code.
    pub code: String,
    /// Provider error message.
    #[serde(default)]
    pub message: String,
}
