//! Request and response types for the saas-billing client.

use chrono::{DateTime, NaiveDate, Utc};
use saas_billing_core::{
    CancelMode, Cancellation, ChangeMode, ChargeIntent, EntryStatus, EntryType, PendingChange,
    Plan, PricePolicy, Proration, SubscriptionStatus,
};
use serde::{Deserialize, Serialize};

// ============================================================================
// Requests
// ============================================================================

/// Plan selector as sent on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSelector {
    /// Plan name (`trial`, `tier1`, `tier2`, `tier3`, `enterprise`, `custom`).
    pub plan: String,
    /// Name of a custom plan.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    /// Price of a custom plan.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_amount: Option<i64>,
}

impl From<&Plan> for PlanSelector {
    fn from(plan: &Plan) -> Self {
        match plan {
            Plan::Custom { name, amount } => Self {
                plan: "custom".to_string(),
                custom_name: Some(name.clone()),
                custom_amount: Some(*amount),
            },
            other => Self {
                plan: other.to_string(),
                custom_name: None,
                custom_amount: None,
            },
        }
    }
}

/// Start subscription request.
#[derive(Debug, Clone, Serialize)]
pub struct StartSubscription {
    /// Plan to start on.
    #[serde(flatten)]
    pub plan: PlanSelector,
    /// Card authorization code from the checkout widget.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_code: Option<String>,
    /// Receipt email.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
    /// First day of the first period. Admin key only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_start: Option<NaiveDate>,
    /// Last day of the first period. Admin key only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_end: Option<NaiveDate>,
    /// Negotiated amount. Admin key only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    /// Renewal pricing rule. Admin key only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_policy: Option<PricePolicy>,
}

impl StartSubscription {
    /// Start on `plan` with no card and no overrides.
    #[must_use]
    pub fn new(plan: &Plan) -> Self {
        Self {
            plan: plan.into(),
            auth_code: None,
            customer_email: None,
            period_start: None,
            period_end: None,
            amount: None,
            price_policy: None,
        }
    }

    /// Attach a card authorization code.
    #[must_use]
    pub fn with_auth_code(mut self, auth_code: impl Into<String>) -> Self {
        self.auth_code = Some(auth_code.into());
        self
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ChangePlanBody {
    #[serde(flatten)]
    pub plan: PlanSelector,
    pub mode: ChangeMode,
}

#[derive(Debug, Serialize)]
pub(crate) struct CancelBody<'a> {
    pub mode: CancelMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'a str>,
    pub refund: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct BillingTokenBody<'a> {
    pub auth_code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub(crate) struct CorrectPeriodBody<'a> {
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ResolveBody {
    pub refund: bool,
}

// ============================================================================
// Responses
// ============================================================================

/// Subscription as returned by the service.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionView {
    /// Owning tenant.
    pub tenant_id: String,
    /// Current plan.
    pub plan: Plan,
    /// Display name of the plan.
    pub plan_name: String,
    /// Lifecycle state.
    pub status: SubscriptionStatus,
    /// Amount charged per period.
    pub amount: i64,
    /// List price of the plan.
    pub base_amount: i64,
    /// First day of the current period.
    pub current_period_start: NaiveDate,
    /// Last day of the current period.
    pub current_period_end: NaiveDate,
    /// Day of the next charge, if one is scheduled.
    pub next_billing_date: Option<NaiveDate>,
    /// Whether the subscription renews.
    pub auto_renew: bool,
    /// Whether the tenant currently has access.
    pub has_access: bool,
    /// Scheduled plan change.
    pub pending: Option<PendingChange>,
    /// Cancellation details.
    pub cancellation: Option<Cancellation>,
    /// Whether a card is on file.
    pub has_billing_token: bool,
    /// Masked card description.
    pub card_summary: Option<String>,
    /// Failed charges since the last success.
    pub retry_count: u32,
    /// Last gateway error.
    pub last_payment_error: Option<String>,
    /// Renewal pricing rule.
    pub price_policy: PricePolicy,
    /// Optimistic concurrency version.
    pub version: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// When the subscription reached a terminal state.
    pub ended_at: Option<DateTime<Utc>>,
}

/// A ledger entry.
#[derive(Debug, Clone, Deserialize)]
pub struct Payment {
    /// Entry id.
    pub id: String,
    /// Order id sent to the gateway.
    pub order_id: String,
    /// Signed amount, negative for refunds.
    pub amount: i64,
    /// Why money moved.
    pub entry_type: EntryType,
    /// Settlement state.
    pub status: EntryStatus,
    /// Gateway payment reference.
    pub gateway_reference: String,
    /// Order id of the refunded charge.
    pub refund_of: Option<String>,
    /// Timestamp.
    pub created_at: DateTime<Utc>,
}

/// Result of a subscription command.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandResponse {
    /// Subscription after the command.
    pub subscription: SubscriptionView,
    /// Money moved by the command.
    pub payment: Option<Payment>,
    /// Upgrade breakdown.
    pub proration: Option<Proration>,
    /// Whether the service replayed an earlier result for the same key.
    pub replayed: bool,
}

/// One page of the payment ledger.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentPage {
    /// Entries, newest first.
    pub payments: Vec<Payment>,
    /// Page size applied by the service.
    pub limit: usize,
    /// Offset applied by the service.
    pub offset: usize,
}

/// A tenant whose sweep step failed.
#[derive(Debug, Clone, Deserialize)]
pub struct SweepFailure {
    /// Affected tenant.
    pub tenant_id: String,
    /// Event that was attempted.
    pub event: String,
    /// Error message.
    pub message: String,
}

/// Summary of a sweep run.
#[derive(Debug, Clone, Deserialize)]
pub struct SweepReport {
    /// When the run began.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Subscriptions looked at.
    pub examined: usize,
    /// Trials converted.
    pub converted: usize,
    /// Subscriptions expired.
    pub expired: usize,
    /// Renewals charged.
    pub renewed: usize,
    /// Charges that failed.
    pub past_due: usize,
    /// Past-due subscriptions recovered.
    pub recovered: usize,
    /// Scheduled cancellations completed.
    pub canceled: usize,
    /// Subscriptions purged.
    pub purged: usize,
    /// Captured payments awaiting reconciliation.
    pub unreconciled: usize,
    /// Per-tenant failures.
    pub errors: Vec<SweepFailure>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReconciliationList {
    pub intents: Vec<ChargeIntent>,
}

/// Health check response.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
    /// Service name.
    pub service: String,
    /// Service version.
    pub version: String,
}

/// Error envelope returned by the service.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    /// Error body.
    pub error: ApiErrorBody,
}

/// Error details.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    /// Machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Extra fields for some codes.
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_plan_selector_carries_name_and_amount() {
        let selector = PlanSelector::from(&Plan::Custom {
            name: "Acme".into(),
            amount: 55_000,
        });
        assert_eq!(selector.plan, "custom");
        assert_eq!(selector.custom_name.as_deref(), Some("Acme"));
        assert_eq!(selector.custom_amount, Some(55_000));
    }

    #[test]
    fn start_body_omits_unset_overrides() {
        let body = StartSubscription::new(&Plan::Tier1).with_auth_code("auth_1");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["plan"], "tier1");
        assert_eq!(json["auth_code"], "auth_1");
        assert!(json.get("amount").is_none());
        assert!(json.get("custom_name").is_none());
    }
}
