//! Tenant subscription handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use saas_billing_core::lifecycle::{ChangeMode, Event, StartRequest};
use saas_billing_core::{
    CancelMode, Cancellation, EntryStatus, EntryType, HistoryRecord, LedgerEntry, PendingChange,
    Plan, PricePolicy, Proration, Subscription, SubscriptionStatus,
};

use super::{idempotency_key, parse_tenant};
use crate::auth::Caller;
use crate::engine::{Command, Outcome};
use crate::error::ApiError;
use crate::state::AppState;

// ============================================================================
// Response types
// ============================================================================

/// Subscription view.
#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    /// Owning tenant.
    pub tenant_id: String,
    /// Current plan.
    pub plan: Plan,
    /// Display name of the plan.
    pub plan_name: String,
    /// Lifecycle state.
    pub status: SubscriptionStatus,
    /// Recurring charge.
    pub amount: i64,
    /// List price of the plan.
    pub base_amount: i64,
    /// First day of the current period.
    pub current_period_start: NaiveDate,
    /// Last day of the current period.
    pub current_period_end: NaiveDate,
    /// Next automatic charge, if any.
    pub next_billing_date: Option<NaiveDate>,
    /// Whether the subscription renews.
    pub auto_renew: bool,
    /// Whether the tenant may use the product.
    pub has_access: bool,
    /// Scheduled plan change.
    pub pending: Option<PendingChange>,
    /// Cancellation details.
    pub cancellation: Option<Cancellation>,
    /// Whether a card is on file.
    pub has_billing_token: bool,
    /// Masked card description.
    pub card_summary: Option<String>,
    /// Failed charges in the current past-due episode.
    pub retry_count: u32,
    /// Last gateway error.
    pub last_payment_error: Option<String>,
    /// Renewal pricing rule.
    pub price_policy: PricePolicy,
    /// Optimistic concurrency version.
    pub version: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
    /// When the subscription became terminal.
    pub ended_at: Option<DateTime<Utc>>,
}

impl From<&Subscription> for SubscriptionResponse {
    fn from(sub: &Subscription) -> Self {
        Self {
            tenant_id: sub.tenant_id.to_string(),
            plan: sub.plan.clone(),
            plan_name: sub.plan.display_name(),
            status: sub.status,
            amount: sub.amount,
            base_amount: sub.base_amount,
            current_period_start: sub.current_period_start,
            current_period_end: sub.current_period_end,
            next_billing_date: sub.next_billing_date(),
            auto_renew: sub.auto_renew,
            has_access: sub.has_access(),
            pending: sub.pending.clone(),
            cancellation: sub.cancellation.clone(),
            has_billing_token: sub.has_billing_token(),
            card_summary: sub.billing.as_ref().and_then(|b| b.card_summary.clone()),
            retry_count: sub.retry_count,
            last_payment_error: sub.last_payment_error.clone(),
            price_policy: sub.price_policy,
            version: sub.version,
            created_at: sub.created_at,
            updated_at: sub.updated_at,
            ended_at: sub.ended_at,
        }
    }
}

/// Ledger entry view.
#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    /// Entry ID.
    pub id: String,
    /// Order id sent to the gateway.
    pub order_id: String,
    /// Signed amount (negative for refunds).
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

impl From<&LedgerEntry> for PaymentResponse {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            id: entry.id.to_string(),
            order_id: entry.order_id.clone(),
            amount: entry.amount,
            entry_type: entry.entry_type,
            status: entry.status,
            gateway_reference: entry.gateway_reference.clone(),
            refund_of: entry.refund_of.clone(),
            created_at: entry.created_at,
        }
    }
}

/// Result of a subscription command.
#[derive(Debug, Serialize)]
pub struct OutcomeResponse {
    /// Subscription after the command.
    pub subscription: SubscriptionResponse,
    /// Money moved by the command.
    pub payment: Option<PaymentResponse>,
    /// Upgrade breakdown.
    pub proration: Option<Proration>,
    /// Whether this repeats the result of an earlier request.
    pub replayed: bool,
}

impl From<Outcome> for OutcomeResponse {
    fn from(outcome: Outcome) -> Self {
        Self {
            subscription: SubscriptionResponse::from(&outcome.subscription),
            payment: outcome.ledger_entry.as_ref().map(PaymentResponse::from),
            proration: outcome.proration,
            replayed: outcome.replayed,
        }
    }
}

// ============================================================================
// Plans
// ============================================================================

/// Resolve a plan name from a request body.
pub(crate) fn plan_from(
    name: &str,
    custom_name: Option<String>,
    custom_amount: Option<i64>,
) -> Result<Plan, ApiError> {
    match name {
        "trial" => Ok(Plan::Trial),
        "tier1" => Ok(Plan::Tier1),
        "tier2" => Ok(Plan::Tier2),
        "tier3" => Ok(Plan::Tier3),
        "enterprise" => Ok(Plan::Enterprise),
        "custom" => match (custom_name, custom_amount) {
            (Some(name), Some(amount)) if !name.trim().is_empty() => Ok(Plan::Custom { name, amount }),
            _ => Err(ApiError::BadRequest(
                "custom plans need custom_name and custom_amount".into(),
            )),
        },
        other => Err(ApiError::BadRequest(format!("unknown plan: {other}"))),
    }
}

/// Custom plans set their own price, so only operators may pick one.
fn check_plan_access(plan: &Plan, caller: &Caller) -> Result<(), ApiError> {
    if matches!(plan, Plan::Custom { .. }) && !caller.is_admin() {
        return Err(ApiError::Forbidden("custom plans require the admin key".into()));
    }
    Ok(())
}

async fn run(state: &AppState, command: Command) -> Result<Json<OutcomeResponse>, ApiError> {
    let outcome = state.engine.execute(command).await?;
    Ok(Json(outcome.into()))
}

// ============================================================================
// Start
// ============================================================================

/// Start subscription request.
#[derive(Debug, Deserialize)]
pub struct StartSubscriptionRequest {
    /// Plan name (`trial`, `tier1`, `tier2`, `tier3`, `enterprise`, `custom`).
    pub plan: String,
    /// Name of a custom plan.
    #[serde(default)]
    pub custom_name: Option<String>,
    /// Price of a custom plan.
    #[serde(default)]
    pub custom_amount: Option<i64>,
    /// First day of the first period (admin only).
    #[serde(default)]
    pub period_start: Option<NaiveDate>,
    /// Last day of the first period (admin only).
    #[serde(default)]
    pub period_end: Option<NaiveDate>,
    /// Negotiated amount (admin only).
    #[serde(default)]
    pub amount: Option<i64>,
    /// Renewal pricing rule (admin only).
    #[serde(default)]
    pub price_policy: Option<PricePolicy>,
    /// Card authorization code to exchange for a billing token.
    #[serde(default)]
    pub auth_code: Option<String>,
    /// Receipt email.
    #[serde(default)]
    pub customer_email: Option<String>,
}

/// Start a subscription.
pub async fn start_subscription(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    caller: Caller,
    headers: HeaderMap,
    Json(body): Json<StartSubscriptionRequest>,
) -> Result<Json<OutcomeResponse>, ApiError> {
    let tenant_id = parse_tenant(&tenant_id)?;
    let key = idempotency_key(&headers)?;
    let plan = plan_from(&body.plan, body.custom_name, body.custom_amount)?;
    check_plan_access(&plan, &caller)?;

    let overrides = body.period_start.is_some()
        || body.period_end.is_some()
        || body.amount.is_some()
        || body.price_policy.is_some();
    if overrides && !caller.is_admin() {
        return Err(ApiError::Forbidden(
            "period, amount and price policy overrides require the admin key".into(),
        ));
    }

    if let Some(key) = &key {
        if let Some(outcome) = state.engine.replay(&tenant_id, key)? {
            return Ok(Json(outcome.into()));
        }
    }

    let mut request = StartRequest::new(plan);
    request.period_start = body.period_start;
    request.period_end = body.period_end;
    request.amount = body.amount;
    request.price_policy = body.price_policy;
    if let Some(auth_code) = body.auth_code.as_deref() {
        request.billing = Some(
            state
                .engine
                .issue_credential(&tenant_id, auth_code, body.customer_email)
                .await?,
        );
    }

    tracing::info!(
        tenant_id = %tenant_id,
        plan = %request.plan,
        caller = %caller.name,
        "Starting subscription"
    );

    run(
        &state,
        Command::new(tenant_id, Event::Start(request), caller.actor).with_idempotency_key(key),
    )
    .await
}

/// Get the tenant's subscription.
pub async fn get_subscription(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    _caller: Caller,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    let tenant_id = parse_tenant(&tenant_id)?;
    let subscription = state
        .store
        .get_subscription(&tenant_id)?
        .ok_or_else(|| ApiError::NotFound(format!("no subscription for tenant {tenant_id}")))?;

    Ok(Json(SubscriptionResponse::from(&subscription)))
}

// ============================================================================
// Plan changes
// ============================================================================

/// Change plan request.
#[derive(Debug, Deserialize)]
pub struct ChangePlanRequest {
    /// Target plan name.
    pub plan: String,
    /// Name of a custom plan.
    #[serde(default)]
    pub custom_name: Option<String>,
    /// Price of a custom plan.
    #[serde(default)]
    pub custom_amount: Option<i64>,
    /// `immediate` or `scheduled`.
    pub mode: ChangeMode,
}

/// Change plan now or at the next billing date.
pub async fn change_plan(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    caller: Caller,
    headers: HeaderMap,
    Json(body): Json<ChangePlanRequest>,
) -> Result<Json<OutcomeResponse>, ApiError> {
    let tenant_id = parse_tenant(&tenant_id)?;
    let key = idempotency_key(&headers)?;
    let plan = plan_from(&body.plan, body.custom_name, body.custom_amount)?;
    check_plan_access(&plan, &caller)?;

    run(
        &state,
        Command::new(
            tenant_id,
            Event::ChangePlan {
                plan,
                mode: body.mode,
            },
            caller.actor,
        )
        .with_idempotency_key(key),
    )
    .await
}

/// Convert trial request.
#[derive(Debug, Default, Deserialize)]
pub struct ConvertTrialRequest {
    /// Plan to convert into. Defaults to the scheduled plan.
    #[serde(default)]
    pub plan: Option<String>,
    /// Name of a custom plan.
    #[serde(default)]
    pub custom_name: Option<String>,
    /// Price of a custom plan.
    #[serde(default)]
    pub custom_amount: Option<i64>,
}

/// Convert a trial into a paid plan now.
pub async fn convert_trial(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    caller: Caller,
    headers: HeaderMap,
    body: Option<Json<ConvertTrialRequest>>,
) -> Result<Json<OutcomeResponse>, ApiError> {
    let tenant_id = parse_tenant(&tenant_id)?;
    let key = idempotency_key(&headers)?;
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let plan = body
        .plan
        .as_deref()
        .map(|name| plan_from(name, body.custom_name.clone(), body.custom_amount))
        .transpose()?;
    if let Some(plan) = &plan {
        check_plan_access(plan, &caller)?;
    }

    run(
        &state,
        Command::new(tenant_id, Event::ConvertTrial { plan }, caller.actor)
            .with_idempotency_key(key),
    )
    .await
}

// ============================================================================
// Cancellation and payment recovery
// ============================================================================

/// Cancel request.
#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    /// `immediate` or `scheduled`.
    pub mode: CancelMode,
    /// Reason given by the tenant.
    #[serde(default)]
    pub reason: Option<String>,
    /// Refund the unused share of the period (immediate only).
    #[serde(default)]
    pub refund: bool,
}

/// Cancel now or at period end.
pub async fn cancel_subscription(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    caller: Caller,
    headers: HeaderMap,
    Json(body): Json<CancelRequest>,
) -> Result<Json<OutcomeResponse>, ApiError> {
    let tenant_id = parse_tenant(&tenant_id)?;
    let key = idempotency_key(&headers)?;

    run(
        &state,
        Command::new(
            tenant_id,
            Event::Cancel {
                mode: body.mode,
                reason: body.reason,
                refund: body.refund,
            },
            caller.actor,
        )
        .with_idempotency_key(key),
    )
    .await
}

/// Withdraw a scheduled cancellation.
pub async fn reactivate_subscription(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    caller: Caller,
    headers: HeaderMap,
) -> Result<Json<OutcomeResponse>, ApiError> {
    let tenant_id = parse_tenant(&tenant_id)?;
    let key = idempotency_key(&headers)?;

    run(
        &state,
        Command::new(tenant_id, Event::Reactivate, caller.actor).with_idempotency_key(key),
    )
    .await
}

/// Charge a past-due subscription again.
pub async fn retry_payment(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    caller: Caller,
    headers: HeaderMap,
) -> Result<Json<OutcomeResponse>, ApiError> {
    let tenant_id = parse_tenant(&tenant_id)?;
    let key = idempotency_key(&headers)?;

    run(
        &state,
        Command::new(tenant_id, Event::RetryPayment, caller.actor).with_idempotency_key(key),
    )
    .await
}

/// Register card request.
#[derive(Debug, Deserialize)]
pub struct RegisterBillingTokenRequest {
    /// Card authorization code from the checkout widget.
    pub auth_code: String,
    /// Receipt email.
    #[serde(default)]
    pub customer_email: Option<String>,
}

/// Exchange an authorization code and store the card.
pub async fn register_billing_token(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    caller: Caller,
    headers: HeaderMap,
    Json(body): Json<RegisterBillingTokenRequest>,
) -> Result<Json<OutcomeResponse>, ApiError> {
    let tenant_id = parse_tenant(&tenant_id)?;
    let key = idempotency_key(&headers)?;
    if body.auth_code.trim().is_empty() {
        return Err(ApiError::BadRequest("auth_code must not be empty".into()));
    }

    let outcome = state
        .engine
        .register_billing_token(tenant_id, &body.auth_code, body.customer_email, caller.actor, key)
        .await?;
    Ok(Json(outcome.into()))
}

// ============================================================================
// History and payments
// ============================================================================

/// A tenant's plan history, oldest first.
pub async fn get_history(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    _caller: Caller,
) -> Result<Json<Vec<HistoryRecord>>, ApiError> {
    let tenant_id = parse_tenant(&tenant_id)?;
    let history = state.store.list_history(&tenant_id)?;
    if history.is_empty() && state.store.get_subscription(&tenant_id)?.is_none() {
        return Err(ApiError::NotFound(format!(
            "no subscription for tenant {tenant_id}"
        )));
    }
    Ok(Json(history))
}

/// Payment list query parameters.
#[derive(Debug, Deserialize)]
pub struct ListPaymentsQuery {
    /// Maximum number of entries to return (default: 50, max: 100).
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Offset for pagination (default: 0).
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

/// Payment list response.
#[derive(Debug, Serialize)]
pub struct PaymentListResponse {
    /// Entries, newest first.
    pub payments: Vec<PaymentResponse>,
    /// Limit applied.
    pub limit: usize,
    /// Offset applied.
    pub offset: usize,
}

/// A tenant's payment ledger, newest first.
pub async fn list_payments(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    _caller: Caller,
    Query(query): Query<ListPaymentsQuery>,
) -> Result<Json<PaymentListResponse>, ApiError> {
    let tenant_id = parse_tenant(&tenant_id)?;
    let limit = query.limit.clamp(1, 100);
    let entries = state
        .store
        .list_ledger_by_tenant(&tenant_id, limit, query.offset)?;

    Ok(Json(PaymentListResponse {
        payments: entries.iter().map(PaymentResponse::from).collect(),
        limit,
        offset: query.offset,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_names_resolve() {
        assert_eq!(plan_from("tier2", None, None).unwrap(), Plan::Tier2);
        assert_eq!(
            plan_from("custom", Some("Acme".into()), Some(150_000)).unwrap(),
            Plan::Custom {
                name: "Acme".into(),
                amount: 150_000
            }
        );
        assert!(plan_from("custom", None, Some(1)).is_err());
        assert!(plan_from("platinum", None, None).is_err());
    }
}
