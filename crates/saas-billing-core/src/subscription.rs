//! The per-tenant subscription record.
//!
//! A tenant has exactly one [`Subscription`]. It is the only thing consulted to
//! decide whether the tenant may use the product. Fields are only changed by
//! the rules in [`crate::lifecycle`].

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ids::TenantId;
use crate::period;
use crate::plan::{Plan, PlanCatalog};

/// Status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Free trial in progress.
    Trial,
    /// Paid and in good standing.
    Active,
    /// A recurring charge failed and has not been recovered yet.
    PastDue,
    /// Canceled at period end; access continues until then.
    PendingCancel,
    /// Canceled. Terminal.
    Canceled,
    /// Trial lapsed or payment retries exhausted. Terminal.
    Expired,
}

impl SubscriptionStatus {
    /// Whether a tenant in this status may use the product.
    #[must_use]
    pub const fn grants_access(self) -> bool {
        matches!(self, Self::Active | Self::Trial | Self::PendingCancel)
    }

    /// Whether this status ends the subscription instance.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Canceled | Self::Expired)
    }

    /// Snake-case name, as used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::PendingCancel => "pending_cancel",
            Self::Canceled => "canceled",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A plan change accepted now and applied at a later billing boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Plan to switch to.
    pub plan: Plan,
    /// Amount charged once the change applies.
    pub amount: i64,
    /// First day of the period in which the change applies.
    pub effective_at: NaiveDate,
}

/// How a cancellation takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelMode {
    /// End access now.
    Immediate,
    /// End access when the current period ends.
    Scheduled,
}

/// Details of a requested cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    /// When the cancellation was requested.
    pub requested_at: DateTime<Utc>,
    /// Immediate or at period end.
    pub mode: CancelMode,
    /// Free-form reason given by the caller.
    pub reason: Option<String>,
    /// Next billing date before the cancellation cleared it.
    pub previous_next_billing_date: Option<NaiveDate>,
}

/// Tokenized payment credential owned by the payment gateway.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingCredential {
    /// Opaque billing token.
    pub token: String,
    /// Masked card description for display.
    pub card_summary: Option<String>,
    /// Receipt email passed along with charges.
    pub customer_email: Option<String>,
}

impl fmt::Debug for BillingCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BillingCredential")
            .field("token", &"<redacted>")
            .field("card_summary", &self.card_summary)
            .field("customer_email", &self.customer_email)
            .finish()
    }
}

/// How the recurring amount is chosen at renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "until")]
pub enum PricePolicy {
    /// Keep the current amount indefinitely.
    Grandfathered,
    /// Keep the current amount for periods starting on or before the date.
    ProtectedUntil(NaiveDate),
    /// Follow the catalog list price.
    Standard,
}

/// A tenant's subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Current plan.
    pub plan: Plan,
    /// Current status.
    pub status: SubscriptionStatus,
    /// Recurring charge.
    pub amount: i64,
    /// List price of the plan when it was last priced.
    pub base_amount: i64,
    /// First day of the current period.
    pub current_period_start: NaiveDate,
    /// Last day of the current period.
    pub current_period_end: NaiveDate,
    /// Whether the subscription is charged again at the end of the period.
    pub auto_renew: bool,
    /// Deferred plan change, if any.
    pub pending: Option<PendingChange>,
    /// Cancellation details, if one was requested.
    pub cancellation: Option<Cancellation>,
    /// Stored payment credential.
    pub billing: Option<BillingCredential>,
    /// Consecutive failed recurring charges.
    pub retry_count: u32,
    /// Message of the most recent failed charge.
    pub last_payment_error: Option<String>,
    /// When a charge was last attempted.
    pub last_payment_attempt_at: Option<DateTime<Utc>>,
    /// Renewal pricing rule.
    pub price_policy: PricePolicy,
    /// Optimistic concurrency version, bumped by the store on every write.
    pub version: u64,
    /// When this subscription instance was created.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
    /// When the subscription entered a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
}

impl Subscription {
    /// Next charge date. Always the day after the period ends, when present.
    #[must_use]
    pub fn next_billing_date(&self) -> Option<NaiveDate> {
        if self.auto_renew {
            self.current_period_end.succ_opt()
        } else {
            None
        }
    }

    /// Whether the tenant may use the product now.
    #[must_use]
    pub const fn has_access(&self) -> bool {
        self.status.grants_access()
    }

    /// Whether a billing token is on file.
    #[must_use]
    pub fn has_billing_token(&self) -> bool {
        self.billing.is_some()
    }

    /// Amount to charge for the period starting on `period_start`, before any
    /// pending change is considered.
    ///
    /// # Errors
    ///
    /// Propagates catalog pricing errors.
    pub fn renewal_price(
        &self,
        catalog: &PlanCatalog,
        period_start: NaiveDate,
    ) -> Result<(i64, PricePolicy)> {
        match self.price_policy {
            PricePolicy::Grandfathered => Ok((self.amount, PricePolicy::Grandfathered)),
            PricePolicy::ProtectedUntil(until) if period_start <= until => {
                Ok((self.amount, self.price_policy))
            }
            PricePolicy::ProtectedUntil(_) | PricePolicy::Standard => {
                Ok((catalog.price(&self.plan)?, PricePolicy::Standard))
            }
        }
    }

    /// First day of the period after this one.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPeriod` on calendar overflow.
    pub fn following_period_start(&self) -> Result<NaiveDate> {
        period::day_after(self.current_period_end)
    }
}
