//! Operator handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use saas_billing_core::lifecycle::Event;
use saas_billing_core::{Actor, ChargeIntent};

use super::subscriptions::OutcomeResponse;
use super::{idempotency_key, parse_tenant};
use crate::auth::AdminAuth;
use crate::engine::{Command, SweepReport};
use crate::error::ApiError;
use crate::state::AppState;

/// Period correction request.
#[derive(Debug, Deserialize)]
pub struct CorrectPeriodRequest {
    /// New first day of the current period.
    pub period_start: NaiveDate,
    /// New last day of the current period.
    pub period_end: NaiveDate,
    /// Reason recorded on the history record.
    #[serde(default)]
    pub note: Option<String>,
}

/// Correct the bounds of the current billing period.
///
/// The next billing date follows from the new period end. The change is
/// audited on the current history record.
pub async fn correct_period(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    admin: AdminAuth,
    headers: HeaderMap,
    Json(body): Json<CorrectPeriodRequest>,
) -> Result<Json<OutcomeResponse>, ApiError> {
    let tenant_id = parse_tenant(&tenant_id)?;
    let key = idempotency_key(&headers)?;

    let note = match body.note {
        Some(note) => format!("{note} (by {})", admin.admin_id),
        None => format!("period corrected by {}", admin.admin_id),
    };

    tracing::info!(
        tenant_id = %tenant_id,
        admin_id = %admin.admin_id,
        period_start = %body.period_start,
        period_end = %body.period_end,
        "Correcting billing period"
    );

    let outcome = state
        .engine
        .execute(
            Command::new(
                tenant_id,
                Event::CorrectPeriod {
                    start: body.period_start,
                    end: body.period_end,
                    note: Some(note),
                },
                Actor::Admin,
            )
            .with_idempotency_key(key),
        )
        .await?;
    Ok(Json(outcome.into()))
}

/// Run the daily sweep now. Safe to repeat within a day.
pub async fn run_sweep(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
) -> Result<Json<SweepReport>, ApiError> {
    tracing::info!(admin_id = %admin.admin_id, "Manual sweep requested");
    let report = state.engine.run_daily_sweep(Utc::now()).await?;
    Ok(Json(report))
}

/// Reconciliation query parameters.
#[derive(Debug, Deserialize)]
pub struct ReconciliationQuery {
    /// Also list intents whose gateway outcome is unknown.
    #[serde(default)]
    pub include_pending: bool,
}

/// Open charge intents.
#[derive(Debug, Serialize)]
pub struct ReconciliationResponse {
    /// Intents, ordered by idempotency key.
    pub intents: Vec<ChargeIntent>,
}

/// List payments that moved without being recorded.
pub async fn list_reconciliation(
    State(state): State<Arc<AppState>>,
    _admin: AdminAuth,
    Query(query): Query<ReconciliationQuery>,
) -> Result<Json<ReconciliationResponse>, ApiError> {
    let intents = if query.include_pending {
        state.store.list_charge_intents()?
    } else {
        state.engine.unreconciled()?
    };
    Ok(Json(ReconciliationResponse { intents }))
}

/// Resolve request.
#[derive(Debug, Default, Deserialize)]
pub struct ResolveRequest {
    /// Refund the captured payment before closing the intent.
    #[serde(default)]
    pub refund: bool,
}

/// Close an open charge intent.
pub async fn resolve_reconciliation(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    admin: AdminAuth,
    body: Option<Json<ResolveRequest>>,
) -> Result<Json<ChargeIntent>, ApiError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();

    tracing::info!(
        key = %key,
        admin_id = %admin.admin_id,
        refund = body.refund,
        "Resolving charge intent"
    );

    let intent = state
        .engine
        .resolve_reconciliation(&key, body.refund)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no open charge intent with key {key}")))?;
    Ok(Json(intent))
}
