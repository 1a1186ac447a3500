//! Daily transition sweep.
//!
//! Walks every subscription, fires the time-driven event that is due for it
//! and purges terminal subscriptions past retention. Idempotency keys are
//! derived from tenant, event and date, so running the sweep twice on the
//! same day charges nobody twice.

use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use saas_billing_core::lifecycle::{self, Event};
use saas_billing_core::{Actor, BillingError, Subscription, TenantId};
use saas_billing_store::StoreError;
use serde::Serialize;
use tracing::{error, info, warn};

use super::{Command, Engine};

/// A tenant the sweep could not process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepFailure {
    /// Affected tenant.
    pub tenant_id: TenantId,
    /// Event that was attempted.
    pub event: String,
    /// Error message.
    pub message: String,
}

/// Summary of one sweep run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// When the run began.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Subscriptions looked at.
    pub examined: usize,
    /// Trials converted to a paid plan.
    pub converted: usize,
    /// Trials and past-due subscriptions that expired.
    pub expired: usize,
    /// Renewals charged.
    pub renewed: usize,
    /// Charges that failed and left the subscription past due.
    pub past_due: usize,
    /// Past-due subscriptions recovered by an automatic retry.
    pub recovered: usize,
    /// Scheduled cancellations completed.
    pub canceled: usize,
    /// Terminal subscriptions purged after retention.
    pub purged: usize,
    /// Captured payments still waiting for reconciliation.
    pub unreconciled: usize,
    /// Tenants that failed.
    pub errors: Vec<SweepFailure>,
}

impl SweepReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            examined: 0,
            converted: 0,
            expired: 0,
            renewed: 0,
            past_due: 0,
            recovered: 0,
            canceled: 0,
            purged: 0,
            unreconciled: 0,
            errors: Vec::new(),
        }
    }

    fn record(&mut self, tenant_id: TenantId, result: TenantResult) {
        match result {
            TenantResult::Idle => {}
            TenantResult::Purged => self.purged += 1,
            TenantResult::Applied(event) => match event {
                "convert_trial" => self.converted += 1,
                "expire_trial" | "exhaust_retries" => self.expired += 1,
                "renew" => self.renewed += 1,
                "retry_payment" => self.recovered += 1,
                "complete_cancellation" => self.canceled += 1,
                _ => {}
            },
            TenantResult::Declined => self.past_due += 1,
            TenantResult::Failed { event, message } => self.errors.push(SweepFailure {
                tenant_id,
                event: event.to_string(),
                message,
            }),
        }
    }
}

enum TenantResult {
    Idle,
    Purged,
    Applied(&'static str),
    Declined,
    Failed { event: &'static str, message: String },
}

/// Idempotency key for a sweep-driven event.
#[must_use]
pub fn sweep_key(tenant_id: &TenantId, event: &Event, today: NaiveDate) -> String {
    format!("sweep:{tenant_id}:{}:{today}", event.name())
}

impl Engine {
    /// Run every time-driven transition that is due at `now`.
    ///
    /// Per-tenant failures are collected in the report, never propagated.
    ///
    /// # Errors
    ///
    /// Returns an error only if the subscription list cannot be read.
    pub async fn run_daily_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, BillingError> {
        let mut report = SweepReport::new(Utc::now());
        let subscriptions = self.store().list_subscriptions()?;
        report.examined = subscriptions.len();

        info!(
            tenants = subscriptions.len(),
            date = %now.date_naive(),
            "Starting daily sweep"
        );

        let results: Vec<(TenantId, TenantResult)> = stream::iter(subscriptions)
            .map(|subscription| async move {
                let tenant_id = subscription.tenant_id;
                (tenant_id, self.sweep_tenant(subscription, now).await)
            })
            .buffer_unordered(self.config.sweep_concurrency.max(1))
            .collect()
            .await;

        for (tenant_id, result) in results {
            report.record(tenant_id, result);
        }

        report.unreconciled = match self.unreconciled() {
            Ok(intents) => intents.len(),
            Err(e) => {
                warn!(error = %e, "Could not count unreconciled charges");
                0
            }
        };
        report.finished_at = Utc::now();

        info!(
            examined = report.examined,
            converted = report.converted,
            expired = report.expired,
            renewed = report.renewed,
            past_due = report.past_due,
            recovered = report.recovered,
            canceled = report.canceled,
            purged = report.purged,
            unreconciled = report.unreconciled,
            errors = report.errors.len(),
            "Daily sweep finished"
        );
        Ok(report)
    }

    async fn sweep_tenant(&self, subscription: Subscription, now: DateTime<Utc>) -> TenantResult {
        let tenant_id = subscription.tenant_id;
        let today = now.date_naive();

        if lifecycle::retention_elapsed(&subscription, today, self.policy()) {
            return match self.store().purge_tenant(&tenant_id, subscription.version) {
                Ok(()) => {
                    info!(tenant_id = %tenant_id, "Purged subscription past retention");
                    TenantResult::Purged
                }
                Err(StoreError::Conflict { expected, actual }) => {
                    info!(
                        tenant_id = %tenant_id,
                        expected,
                        actual,
                        "Subscription changed since listing, skipping purge"
                    );
                    TenantResult::Idle
                }
                Err(e) => {
                    error!(tenant_id = %tenant_id, error = %e, "Sweep purge failed");
                    TenantResult::Failed {
                        event: "purge",
                        message: e.to_string(),
                    }
                }
            };
        }

        let Some(event) = lifecycle::due_event(&subscription, today, self.policy()) else {
            return TenantResult::Idle;
        };
        let name = event.name();
        let key = sweep_key(&tenant_id, &event, today);
        let command = Command::new(tenant_id, event, Actor::System)
            .with_idempotency_key(Some(key))
            .at(now);

        match self.execute(command).await {
            Ok(outcome) if outcome.replayed => TenantResult::Idle,
            Ok(_) => TenantResult::Applied(name),
            Err(BillingError::Gateway { code, message }) => {
                warn!(
                    tenant_id = %tenant_id,
                    event = name,
                    code = %code,
                    message = %message,
                    "Sweep charge declined"
                );
                TenantResult::Declined
            }
            Err(e) => {
                error!(tenant_id = %tenant_id, event = name, error = %e, "Sweep failed for tenant");
                TenantResult::Failed {
                    event: name,
                    message: e.to_string(),
                }
            }
        }
    }
}
