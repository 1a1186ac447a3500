//! Subscription history.
//!
//! Every status or plan transition appends a [`HistoryRecord`]. Edits that
//! leave status and plan alone (a renewal into the next period, a period
//! correction, a new card) amend the newest record instead, so the newest
//! record always mirrors the live subscription.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{HistoryId, TenantId};
use crate::plan::Plan;
use crate::subscription::{Subscription, SubscriptionStatus};

/// Kind of transition recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// Subscription started, or a trial converted into a paid plan.
    New,
    /// Moved to a more expensive plan.
    Upgrade,
    /// Moved to a cheaper plan.
    Downgrade,
    /// Canceled, immediately or at period end.
    Cancel,
    /// A scheduled cancellation was withdrawn.
    Reactivate,
    /// Trial lapsed or retries were exhausted.
    Expire,
    /// A recurring charge failed.
    PaymentFailed,
    /// A past-due subscription was paid.
    Recovered,
}

/// Who caused a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    /// The tenant, through the product.
    Tenant,
    /// An operator, through the admin API.
    Admin,
    /// The scheduled sweep.
    System,
    /// A notification from the payment gateway.
    Gateway,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tenant => "tenant",
            Self::Admin => "admin",
            Self::System => "system",
            Self::Gateway => "gateway",
        })
    }
}

/// What a transition does to history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryAction {
    /// Append a new record of this kind.
    Append(ChangeType),
    /// Refresh the newest record from the subscription.
    Amend,
}

/// Snapshot of a subscription at one transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Record id (time-ordered).
    pub id: HistoryId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Plan after the transition.
    pub plan: Plan,
    /// Status after the transition.
    pub status: SubscriptionStatus,
    /// Recurring amount after the transition.
    pub amount: i64,
    /// Period start after the transition.
    pub period_start: NaiveDate,
    /// Period end after the transition.
    pub period_end: NaiveDate,
    /// Kind of transition.
    pub change_type: ChangeType,
    /// Who caused it.
    pub actor: Actor,
    /// When it happened.
    pub changed_at: DateTime<Utc>,
    /// When the record was last amended in place.
    pub amended_at: Option<DateTime<Utc>>,
    /// Free-form note, e.g. the reason for a correction.
    pub note: Option<String>,
}

impl HistoryRecord {
    /// Record `subscription` as it stands after a `change_type` transition.
    #[must_use]
    pub fn snapshot(
        subscription: &Subscription,
        change_type: ChangeType,
        actor: Actor,
        changed_at: DateTime<Utc>,
        note: Option<String>,
    ) -> Self {
        Self {
            id: HistoryId::generate(),
            tenant_id: subscription.tenant_id,
            plan: subscription.plan.clone(),
            status: subscription.status,
            amount: subscription.amount,
            period_start: subscription.current_period_start,
            period_end: subscription.current_period_end,
            change_type,
            actor,
            changed_at,
            amended_at: None,
            note,
        }
    }

    /// Copy the mirrored fields from `subscription` into this record.
    pub fn amend_from(&mut self, subscription: &Subscription, at: DateTime<Utc>, note: Option<String>) {
        self.plan = subscription.plan.clone();
        self.status = subscription.status;
        self.amount = subscription.amount;
        self.period_start = subscription.current_period_start;
        self.period_end = subscription.current_period_end;
        self.amended_at = Some(at);
        if note.is_some() {
            self.note = note;
        }
    }

    /// Whether this record mirrors the subscription's status, plan and period.
    #[must_use]
    pub fn mirrors(&self, subscription: &Subscription) -> bool {
        self.plan == subscription.plan
            && self.status == subscription.status
            && self.period_start == subscription.current_period_start
            && self.period_end == subscription.current_period_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{self, Context, Event, StartRequest};
    use crate::plan::{BillingPolicy, PlanCatalog};
    use chrono::TimeZone;

    #[test]
    fn amend_keeps_change_type_and_refreshes_period() {
        let catalog = PlanCatalog::default();
        let policy = BillingPolicy::default();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let ctx = Context {
            now,
            catalog: &catalog,
            policy: &policy,
        };
        let mut sub = lifecycle::apply(
            TenantId::generate(),
            None,
            &Event::Start(StartRequest::new(Plan::Trial)),
            &ctx,
        )
        .unwrap()
        .subscription;

        let mut record = HistoryRecord::snapshot(&sub, ChangeType::New, Actor::Tenant, now, None);
        assert!(record.mirrors(&sub));

        sub.current_period_end = sub.current_period_end.succ_opt().unwrap();
        assert!(!record.mirrors(&sub));

        record.amend_from(&sub, now, Some("extended".into()));
        assert!(record.mirrors(&sub));
        assert_eq!(record.change_type, ChangeType::New);
        assert_eq!(record.note.as_deref(), Some("extended"));
        assert_eq!(record.amended_at, Some(now));
    }
}
