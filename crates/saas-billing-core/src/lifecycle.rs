//! Subscription state machine.
//!
//! [`apply`] is a pure function from `(current subscription, event, now)` to a
//! [`Transition`]: the next subscription plus the money movement and history
//! action the caller must carry out. It never talks to the store or the
//! gateway, so HTTP handlers and the scheduled sweep drive exactly the same
//! rules.
//!
//! ```text
//! trial ──convert──▶ active ◀──retry ok── past_due
//!   │                 │  ▲                  ▲   │
//!   │                 │  └──reactivate──┐   │   └─retries exhausted─▶ expired
//!   └─lapse─▶ expired │                 │   │
//!                     ├─cancel(sched.)─▶ pending_cancel ─period end─▶ canceled
//!                     ├─renewal fails──────────────────┘
//!                     └─cancel(now)──────────────────────────────────▶ canceled
//! ```

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, Result};
use crate::history::{ChangeType, HistoryAction};
use crate::ids::TenantId;
use crate::ledger::EntryType;
use crate::period;
use crate::plan::{BillingPolicy, Plan, PlanCatalog};
use crate::proration::{self, Proration};
use crate::subscription::{
    BillingCredential, CancelMode, Cancellation, PendingChange, PricePolicy, Subscription,
    SubscriptionStatus,
};

/// Inputs that are fixed for the duration of one transition.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    /// Wall clock at the time of the request.
    pub now: DateTime<Utc>,
    /// Price snapshot.
    pub catalog: &'a PlanCatalog,
    /// Recurring billing policy.
    pub policy: &'a BillingPolicy,
}

impl Context<'_> {
    /// Calendar date of `now`.
    #[must_use]
    pub fn today(&self) -> NaiveDate {
        self.now.date_naive()
    }
}

/// When a plan change takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeMode {
    /// Now, with a prorated charge for upgrades.
    Immediate,
    /// At the next billing date.
    Scheduled,
}

/// Parameters of a new subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    /// Plan to start on.
    pub plan: Plan,
    /// First day of the first period. Defaults to today.
    pub period_start: Option<NaiveDate>,
    /// Last day of the first period. Defaults to a month (or the trial length).
    pub period_end: Option<NaiveDate>,
    /// Payment credential to bill.
    pub billing: Option<BillingCredential>,
    /// Negotiated amount overriding the list price.
    pub amount: Option<i64>,
    /// Renewal pricing rule. Defaults to [`PricePolicy::Standard`].
    pub price_policy: Option<PricePolicy>,
}

impl StartRequest {
    /// Start `plan` today with default period and pricing.
    #[must_use]
    pub fn new(plan: Plan) -> Self {
        Self {
            plan,
            period_start: None,
            period_end: None,
            billing: None,
            amount: None,
            price_policy: None,
        }
    }
}

/// Something that can happen to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Create a subscription, or replace a terminal one.
    Start(StartRequest),
    /// Turn a trial into a paid plan. Without a plan the pending change is used.
    ConvertTrial {
        /// Plan to convert into.
        plan: Option<Plan>,
    },
    /// End a lapsed trial that cannot convert.
    ExpireTrial,
    /// Change plan now or at the next billing date.
    ChangePlan {
        /// Target plan.
        plan: Plan,
        /// When the change applies.
        mode: ChangeMode,
    },
    /// Cancel now or at period end.
    Cancel {
        /// When the cancellation applies.
        mode: CancelMode,
        /// Caller-supplied reason.
        reason: Option<String>,
        /// Refund the unused share of the current period.
        refund: bool,
    },
    /// Withdraw a scheduled cancellation.
    Reactivate,
    /// Charge the next period.
    Renew,
    /// Charge a past-due subscription again.
    RetryPayment,
    /// Record a failed recurring charge.
    ChargeFailed {
        /// Gateway error message.
        error: String,
    },
    /// Expire a past-due subscription that ran out of retries.
    ExhaustRetries,
    /// Finish a scheduled cancellation after the period ended.
    CompleteCancellation,
    /// The gateway deleted the stored credential.
    RevokeCredential,
    /// Store a new payment credential.
    UpdateCredential(BillingCredential),
    /// Operator correction of the current period bounds.
    CorrectPeriod {
        /// New first day.
        start: NaiveDate,
        /// New last day.
        end: NaiveDate,
        /// Reason recorded on the history record.
        note: Option<String>,
    },
}

impl Event {
    /// Stable name used in logs, sweep reports and derived idempotency keys.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::ConvertTrial { .. } => "convert_trial",
            Self::ExpireTrial => "expire_trial",
            Self::ChangePlan { .. } => "change_plan",
            Self::Cancel { .. } => "cancel",
            Self::Reactivate => "reactivate",
            Self::Renew => "renew",
            Self::RetryPayment => "retry_payment",
            Self::ChargeFailed { .. } => "charge_failed",
            Self::ExhaustRetries => "exhaust_retries",
            Self::CompleteCancellation => "complete_cancellation",
            Self::RevokeCredential => "revoke_credential",
            Self::UpdateCredential(_) => "update_credential",
            Self::CorrectPeriod { .. } => "correct_period",
        }
    }
}

/// A charge the caller must collect before committing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charge {
    /// Amount to charge.
    pub amount: i64,
    /// Ledger classification.
    pub entry_type: EntryType,
    /// Description shown on the receipt.
    pub order_name: String,
}

/// A refund the caller must issue against the latest charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refund {
    /// Amount to return.
    pub amount: i64,
    /// Reason passed to the gateway.
    pub reason: String,
}

/// Result of applying an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Subscription after the event.
    pub subscription: Subscription,
    /// Money to collect, if any.
    pub charge: Option<Charge>,
    /// Money to return, if any.
    pub refund: Option<Refund>,
    /// History effect.
    pub history: HistoryAction,
    /// Breakdown of an immediate upgrade.
    pub proration: Option<Proration>,
    /// Note for the history record.
    pub note: Option<String>,
}

impl Transition {
    fn append(subscription: Subscription, change: ChangeType) -> Self {
        Self {
            subscription,
            charge: None,
            refund: None,
            history: HistoryAction::Append(change),
            proration: None,
            note: None,
        }
    }

    fn amend(subscription: Subscription) -> Self {
        Self {
            history: HistoryAction::Amend,
            ..Self::append(subscription, ChangeType::New)
        }
    }

    fn with_charge(mut self, charge: Option<Charge>) -> Self {
        self.charge = charge;
        self
    }
}

/// Apply `event` to the tenant's current subscription.
///
/// # Errors
///
/// - `NotFound` when a non-start event targets a tenant with no subscription.
/// - `InvalidTransition` when a guard rejects the event; the reason is meant
///   for end users.
/// - `InvalidPeriod` / `InvalidAmount` for malformed inputs.
pub fn apply(
    tenant_id: TenantId,
    current: Option<&Subscription>,
    event: &Event,
    ctx: &Context<'_>,
) -> Result<Transition> {
    let existing = || {
        current.ok_or_else(|| BillingError::NotFound {
            tenant_id: tenant_id.to_string(),
        })
    };

    match event {
        Event::Start(request) => start(tenant_id, current, request, ctx),
        Event::ConvertTrial { plan } => convert_trial(existing()?, plan.as_ref(), ctx),
        Event::ExpireTrial => expire_trial(existing()?, ctx),
        Event::ChangePlan { plan, mode } => change_plan(existing()?, plan, *mode, ctx),
        Event::Cancel { mode, reason, refund } => {
            cancel(existing()?, *mode, reason.as_deref(), *refund, ctx)
        }
        Event::Reactivate => reactivate(existing()?, ctx),
        Event::Renew => renew(existing()?, ctx),
        Event::RetryPayment => retry_payment(existing()?, ctx),
        Event::ChargeFailed { error } => charge_failed(existing()?, error, ctx),
        Event::ExhaustRetries => exhaust_retries(existing()?, ctx),
        Event::CompleteCancellation => complete_cancellation(existing()?, ctx),
        Event::RevokeCredential => Ok(revoke_credential(existing()?, ctx)),
        Event::UpdateCredential(credential) => {
            let sub = existing()?;
            if sub.status.is_terminal() {
                return Err(invalid(
                    sub.status,
                    "start a new subscription to register a billing credential",
                ));
            }
            let mut next = touched(sub, ctx);
            next.billing = Some(credential.clone());
            Ok(Transition::amend(next))
        }
        Event::CorrectPeriod { start, end, note } => {
            correct_period(existing()?, *start, *end, note.clone(), ctx)
        }
    }
}

/// The time-driven event due for `sub` on `today`, if any.
#[must_use]
pub fn due_event(sub: &Subscription, today: NaiveDate, policy: &BillingPolicy) -> Option<Event> {
    match sub.status {
        SubscriptionStatus::Trial if today > sub.current_period_end => {
            if sub.pending.is_some() && sub.has_billing_token() {
                Some(Event::ConvertTrial { plan: None })
            } else {
                Some(Event::ExpireTrial)
            }
        }
        SubscriptionStatus::Active => sub
            .next_billing_date()
            .filter(|due| today >= *due)
            .map(|_| Event::Renew),
        SubscriptionStatus::PendingCancel if today > sub.current_period_end => {
            Some(Event::CompleteCancellation)
        }
        SubscriptionStatus::PastDue if sub.retry_count >= policy.max_payment_retries => {
            Some(Event::ExhaustRetries)
        }
        SubscriptionStatus::PastDue
            if sub
                .last_payment_attempt_at
                .map_or(true, |at| at.date_naive() < today) =>
        {
            Some(Event::RetryPayment)
        }
        _ => None,
    }
}

/// Whether a terminal subscription has outlived its retention window.
#[must_use]
pub fn retention_elapsed(sub: &Subscription, today: NaiveDate, policy: &BillingPolicy) -> bool {
    policy.purge_enabled
        && sub.status.is_terminal()
        && sub
            .ended_at
            .is_some_and(|ended| (today - ended.date_naive()).num_days() > i64::from(policy.retention_days))
}

// ============================================================================
// Helpers
// ============================================================================

fn invalid(status: SubscriptionStatus, reason: impl Into<String>) -> BillingError {
    BillingError::invalid_transition(status, reason)
}

fn touched(sub: &Subscription, ctx: &Context<'_>) -> Subscription {
    let mut next = sub.clone();
    next.updated_at = ctx.now;
    next
}

fn is_upgrade(from: &Plan, from_amount: i64, to: &Plan, to_amount: i64) -> bool {
    to_amount > from_amount || (to_amount == from_amount && to.rank() > from.rank())
}

fn recurring_charge(plan: &Plan, amount: i64, entry_type: EntryType, label: &str) -> Option<Charge> {
    (!plan.is_manually_billed() && amount > 0).then(|| Charge {
        amount,
        entry_type,
        order_name: format!("{} {label}", plan.display_name()),
    })
}

fn end_subscription(next: &mut Subscription, status: SubscriptionStatus, ctx: &Context<'_>) {
    next.status = status;
    next.auto_renew = false;
    next.pending = None;
    next.ended_at = Some(ctx.now);
}

/// Terms of the period starting on `period_start`: a due pending change at
/// full price, or the current plan priced by its price policy.
struct RenewalTerms {
    plan: Plan,
    amount: i64,
    base_amount: i64,
    price_policy: PricePolicy,
    change: Option<ChangeType>,
    entry_type: EntryType,
    keeps_pending: bool,
}

fn renewal_terms(sub: &Subscription, period_start: NaiveDate, ctx: &Context<'_>) -> Result<RenewalTerms> {
    if let Some(pending) = sub.pending.as_ref().filter(|p| p.effective_at <= period_start) {
        let upgrade = is_upgrade(&sub.plan, sub.amount, &pending.plan, pending.amount);
        return Ok(RenewalTerms {
            plan: pending.plan.clone(),
            amount: pending.amount,
            base_amount: ctx.catalog.price(&pending.plan)?,
            price_policy: PricePolicy::Standard,
            change: Some(if upgrade { ChangeType::Upgrade } else { ChangeType::Downgrade }),
            entry_type: if upgrade { EntryType::Upgrade } else { EntryType::Downgrade },
            keeps_pending: false,
        });
    }

    let (amount, price_policy) = sub.renewal_price(ctx.catalog, period_start)?;
    Ok(RenewalTerms {
        plan: sub.plan.clone(),
        amount,
        base_amount: ctx.catalog.price(&sub.plan)?,
        price_policy,
        change: None,
        entry_type: EntryType::Renewal,
        keeps_pending: sub.pending.is_some(),
    })
}

// ============================================================================
// Transitions
// ============================================================================

fn start(
    tenant_id: TenantId,
    current: Option<&Subscription>,
    request: &StartRequest,
    ctx: &Context<'_>,
) -> Result<Transition> {
    if let Some(existing) = current {
        if !existing.status.is_terminal() {
            return Err(invalid(
                existing.status,
                format!("tenant already has a {} subscription", existing.status),
            ));
        }
        if request.plan.is_trial() {
            return Err(invalid(existing.status, "trials are only available to new tenants"));
        }
    }

    let plan = request.plan.clone();
    let period_start = request.period_start.unwrap_or_else(|| ctx.today());
    let (start, end) = match request.period_end {
        Some(end) => {
            period::validate(period_start, end)?;
            (period_start, end)
        }
        None if plan.is_trial() => period::trial_period(period_start, ctx.catalog.trial_days)?,
        None => period::monthly_period(period_start)?,
    };

    let list_price = ctx.catalog.price(&plan)?;
    let amount = match request.amount {
        Some(amount) if amount < 0 => {
            return Err(BillingError::InvalidAmount(format!(
                "subscription amount must not be negative, got {amount}"
            )))
        }
        Some(amount) => amount,
        None => list_price,
    };

    let billing = request
        .billing
        .clone()
        .or_else(|| current.and_then(|s| s.billing.clone()));
    let charge = if plan.is_trial() {
        None
    } else {
        recurring_charge(&plan, amount, EntryType::FirstPayment, "subscription")
    };
    if charge.is_some() && billing.is_none() {
        let status = current.map_or(SubscriptionStatus::Canceled, |s| s.status);
        return Err(invalid(status, "a billing credential is required for paid plans"));
    }

    let status = if plan.is_trial() {
        SubscriptionStatus::Trial
    } else {
        SubscriptionStatus::Active
    };

    let subscription = Subscription {
        tenant_id,
        status,
        amount,
        base_amount: list_price,
        current_period_start: start,
        current_period_end: end,
        auto_renew: !plan.is_trial() && !plan.is_manually_billed(),
        pending: None,
        cancellation: None,
        billing,
        retry_count: 0,
        last_payment_error: None,
        last_payment_attempt_at: charge.as_ref().map(|_| ctx.now),
        price_policy: request.price_policy.unwrap_or(PricePolicy::Standard),
        version: current.map_or(0, |s| s.version),
        created_at: ctx.now,
        updated_at: ctx.now,
        ended_at: None,
        plan,
    };

    Ok(Transition::append(subscription, ChangeType::New).with_charge(charge))
}

fn convert_trial(sub: &Subscription, plan: Option<&Plan>, ctx: &Context<'_>) -> Result<Transition> {
    if sub.status != SubscriptionStatus::Trial {
        return Err(invalid(sub.status, "only trial subscriptions can be converted"));
    }

    let (plan, amount) = match (plan, sub.pending.as_ref()) {
        (Some(plan), Some(pending)) if *plan == pending.plan => (pending.plan.clone(), pending.amount),
        (Some(plan), _) if plan.is_trial() => {
            return Err(invalid(sub.status, "a trial must convert into a paid plan"))
        }
        (Some(plan), _) => (plan.clone(), ctx.catalog.price(plan)?),
        (None, Some(pending)) => (pending.plan.clone(), pending.amount),
        (None, None) => return Err(invalid(sub.status, "no plan selected for conversion")),
    };

    let charge = recurring_charge(&plan, amount, EntryType::TrialConvert, "subscription");
    if charge.is_some() && !sub.has_billing_token() {
        return Err(invalid(sub.status, "no billing credential on file"));
    }

    let (start, end) = period::monthly_period(ctx.today())?;
    let mut next = touched(sub, ctx);
    next.base_amount = ctx.catalog.price(&plan)?;
    next.auto_renew = !plan.is_manually_billed();
    next.plan = plan;
    next.status = SubscriptionStatus::Active;
    next.amount = amount;
    next.current_period_start = start;
    next.current_period_end = end;
    next.pending = None;
    next.retry_count = 0;
    next.last_payment_error = None;
    next.price_policy = PricePolicy::Standard;
    if charge.is_some() {
        next.last_payment_attempt_at = Some(ctx.now);
    }

    Ok(Transition::append(next, ChangeType::New).with_charge(charge))
}

fn expire_trial(sub: &Subscription, ctx: &Context<'_>) -> Result<Transition> {
    if sub.status != SubscriptionStatus::Trial {
        return Err(invalid(sub.status, "only trial subscriptions can lapse"));
    }
    if ctx.today() <= sub.current_period_end {
        return Err(invalid(
            sub.status,
            format!("trial runs until {}", sub.current_period_end),
        ));
    }

    let mut next = touched(sub, ctx);
    end_subscription(&mut next, SubscriptionStatus::Expired, ctx);
    Ok(Transition::append(next, ChangeType::Expire))
}

fn change_plan(sub: &Subscription, plan: &Plan, mode: ChangeMode, ctx: &Context<'_>) -> Result<Transition> {
    match sub.status {
        SubscriptionStatus::Active | SubscriptionStatus::Trial => {}
        SubscriptionStatus::PendingCancel => {
            return Err(invalid(sub.status, "reactivate the subscription before changing plans"))
        }
        SubscriptionStatus::PastDue => {
            return Err(invalid(sub.status, "settle the outstanding payment before changing plans"))
        }
        SubscriptionStatus::Canceled | SubscriptionStatus::Expired => {
            return Err(invalid(sub.status, format!("subscription is {}", sub.status)))
        }
    }
    if plan.is_trial() {
        return Err(invalid(sub.status, "cannot change to the trial plan"));
    }
    if *plan == sub.plan {
        return Err(invalid(sub.status, format!("already on plan {plan}")));
    }
    if sub.plan.is_manually_billed() {
        return Err(invalid(
            sub.status,
            "manually billed subscriptions are changed by starting a new subscription",
        ));
    }
    if mode == ChangeMode::Scheduled {
        if let Some(pending) = sub.pending.as_ref().filter(|p| p.plan == *plan) {
            return Err(invalid(
                sub.status,
                format!("change to {plan} is already scheduled for {}", pending.effective_at),
            ));
        }
    }

    let new_amount = ctx.catalog.price(plan)?;

    if sub.status == SubscriptionStatus::Trial {
        if mode == ChangeMode::Immediate {
            return Err(invalid(
                sub.status,
                "trial subscriptions can only schedule a plan; convert the trial to start billing now",
            ));
        }
        let mut next = touched(sub, ctx);
        next.pending = Some(PendingChange {
            plan: plan.clone(),
            amount: new_amount,
            effective_at: sub.following_period_start()?,
        });
        return Ok(Transition::amend(next));
    }

    let upgrade = is_upgrade(&sub.plan, sub.amount, plan, new_amount);

    match mode {
        ChangeMode::Immediate if !upgrade => Err(invalid(
            sub.status,
            "cannot downgrade immediately, only scheduled",
        )),
        ChangeMode::Immediate => {
            let mut next = touched(sub, ctx);
            next.plan = plan.clone();
            next.amount = new_amount;
            next.base_amount = new_amount;
            next.price_policy = PricePolicy::Standard;
            next.pending = None;

            if plan.is_manually_billed() {
                next.auto_renew = false;
                return Ok(Transition::append(next, ChangeType::Upgrade));
            }

            let breakdown = proration::upgrade_charge(
                sub.amount,
                new_amount,
                sub.current_period_start,
                sub.current_period_end,
                ctx.today(),
            )?;
            let charge = (breakdown.net > 0).then(|| Charge {
                amount: breakdown.net,
                entry_type: EntryType::Upgrade,
                order_name: format!("{} upgrade", plan.display_name()),
            });
            if charge.is_some() {
                next.last_payment_attempt_at = Some(ctx.now);
            }

            let mut transition = Transition::append(next, ChangeType::Upgrade).with_charge(charge);
            transition.proration = Some(breakdown);
            Ok(transition)
        }
        ChangeMode::Scheduled => {
            let effective_at = sub
                .next_billing_date()
                .ok_or_else(|| invalid(sub.status, "subscription does not renew"))?;
            let mut next = touched(sub, ctx);
            next.pending = Some(PendingChange {
                plan: plan.clone(),
                amount: new_amount,
                effective_at,
            });
            Ok(Transition::amend(next))
        }
    }
}

fn cancel(
    sub: &Subscription,
    mode: CancelMode,
    reason: Option<&str>,
    refund: bool,
    ctx: &Context<'_>,
) -> Result<Transition> {
    match (sub.status, mode) {
        (SubscriptionStatus::Canceled, _) => {
            return Err(invalid(sub.status, "subscription is already canceled"))
        }
        (SubscriptionStatus::Expired, _) => return Err(invalid(sub.status, "subscription has expired")),
        (_, CancelMode::Immediate) => {}
        (SubscriptionStatus::Active, CancelMode::Scheduled) if sub.auto_renew => {}
        (SubscriptionStatus::Active, CancelMode::Scheduled) => {
            return Err(invalid(
                sub.status,
                "subscription does not renew; cancel it immediately instead",
            ))
        }
        (SubscriptionStatus::PendingCancel, CancelMode::Scheduled) => {
            return Err(invalid(sub.status, "cancellation is already scheduled"))
        }
        (SubscriptionStatus::Trial | SubscriptionStatus::PastDue, CancelMode::Scheduled) => {
            return Err(invalid(
                sub.status,
                format!("{} subscriptions can only be canceled immediately", sub.status),
            ))
        }
    }
    if refund && mode == CancelMode::Scheduled {
        return Err(invalid(sub.status, "refunds only apply to immediate cancellation"));
    }

    let cancellation = Cancellation {
        requested_at: ctx.now,
        mode,
        reason: reason.map(str::to_string),
        previous_next_billing_date: sub.next_billing_date().or_else(|| {
            sub.cancellation
                .as_ref()
                .and_then(|c| c.previous_next_billing_date)
        }),
    };

    let mut next = touched(sub, ctx);
    next.cancellation = Some(cancellation);

    let refund = match mode {
        CancelMode::Scheduled => {
            next.status = SubscriptionStatus::PendingCancel;
            next.auto_renew = false;
            next.pending = None;
            None
        }
        CancelMode::Immediate => {
            end_subscription(&mut next, SubscriptionStatus::Canceled, ctx);
            let paid_period = matches!(
                sub.status,
                SubscriptionStatus::Active | SubscriptionStatus::PendingCancel
            ) && !sub.plan.is_manually_billed();
            if refund && paid_period && sub.amount > 0 {
                let amount = proration::refund_amount(
                    sub.amount,
                    sub.current_period_start,
                    sub.current_period_end,
                    ctx.today(),
                )?;
                (amount > 0).then(|| Refund {
                    amount,
                    reason: reason.unwrap_or("subscription canceled").to_string(),
                })
            } else {
                None
            }
        }
    };

    let mut transition = Transition::append(next, ChangeType::Cancel);
    transition.refund = refund;
    transition.note = reason.map(str::to_string);
    Ok(transition)
}

fn reactivate(sub: &Subscription, ctx: &Context<'_>) -> Result<Transition> {
    if sub.status != SubscriptionStatus::PendingCancel {
        return Err(invalid(
            sub.status,
            "only subscriptions pending cancellation can be reactivated",
        ));
    }
    if ctx.today() > sub.current_period_end {
        return Err(invalid(
            sub.status,
            format!("the paid period ended on {}", sub.current_period_end),
        ));
    }

    let mut next = touched(sub, ctx);
    next.status = SubscriptionStatus::Active;
    next.auto_renew = !sub.plan.is_manually_billed();
    next.cancellation = None;
    Ok(Transition::append(next, ChangeType::Reactivate))
}

fn renew(sub: &Subscription, ctx: &Context<'_>) -> Result<Transition> {
    let due = match (sub.status, sub.next_billing_date()) {
        (SubscriptionStatus::Active, Some(due)) => due,
        _ => {
            return Err(invalid(
                sub.status,
                "only auto-renewing active subscriptions renew",
            ))
        }
    };
    if ctx.today() < due {
        return Err(invalid(sub.status, format!("renewal is not due until {due}")));
    }

    let (start, end) = period::monthly_period(due)?;
    let terms = renewal_terms(sub, start, ctx)?;

    let mut next = touched(sub, ctx);
    next.current_period_start = start;
    next.current_period_end = end;
    next.auto_renew = !terms.plan.is_manually_billed();
    next.amount = terms.amount;
    next.base_amount = terms.base_amount;
    next.price_policy = terms.price_policy;
    if !terms.keeps_pending {
        next.pending = None;
    }
    next.retry_count = 0;
    next.last_payment_error = None;

    let charge = recurring_charge(&terms.plan, terms.amount, terms.entry_type, "renewal");
    if charge.is_some() {
        next.last_payment_attempt_at = Some(ctx.now);
    }
    next.plan = terms.plan;

    let transition = match terms.change {
        Some(change) => Transition::append(next, change),
        None => Transition::amend(next),
    };
    Ok(transition.with_charge(charge))
}

fn charge_failed(sub: &Subscription, error: &str, ctx: &Context<'_>) -> Result<Transition> {
    let mut next = touched(sub, ctx);
    next.retry_count = sub.retry_count.saturating_add(1);
    next.last_payment_error = Some(error.to_string());
    next.last_payment_attempt_at = Some(ctx.now);

    match sub.status {
        SubscriptionStatus::PastDue => Ok(Transition::amend(next)),
        SubscriptionStatus::Active | SubscriptionStatus::Trial => {
            if sub.status == SubscriptionStatus::Active {
                let terms = renewal_terms(sub, sub.following_period_start()?, ctx)?;
                next.plan = terms.plan;
                next.amount = terms.amount;
                next.base_amount = terms.base_amount;
                next.price_policy = terms.price_policy;
            } else if let Some(pending) = &sub.pending {
                next.plan = pending.plan.clone();
                next.amount = pending.amount;
                next.base_amount = ctx.catalog.price(&pending.plan)?;
            }
            next.status = SubscriptionStatus::PastDue;
            next.auto_renew = false;
            next.pending = None;
            Ok(Transition::append(next, ChangeType::PaymentFailed))
        }
        SubscriptionStatus::PendingCancel
        | SubscriptionStatus::Canceled
        | SubscriptionStatus::Expired => Err(invalid(sub.status, "no recurring charge is outstanding")),
    }
}

fn retry_payment(sub: &Subscription, ctx: &Context<'_>) -> Result<Transition> {
    if sub.status != SubscriptionStatus::PastDue {
        return Err(invalid(sub.status, "only past-due subscriptions can retry payment"));
    }

    let (start, end) = period::monthly_period(ctx.today())?;
    let mut next = touched(sub, ctx);
    next.status = SubscriptionStatus::Active;
    next.current_period_start = start;
    next.current_period_end = end;
    next.auto_renew = !sub.plan.is_manually_billed();
    next.retry_count = 0;
    next.last_payment_error = None;
    next.last_payment_attempt_at = Some(ctx.now);
    next.cancellation = None;

    let charge = recurring_charge(&sub.plan, sub.amount, EntryType::Retry, "payment");
    Ok(Transition::append(next, ChangeType::Recovered).with_charge(charge))
}

fn exhaust_retries(sub: &Subscription, ctx: &Context<'_>) -> Result<Transition> {
    if sub.status != SubscriptionStatus::PastDue {
        return Err(invalid(sub.status, "only past-due subscriptions run out of retries"));
    }
    if sub.retry_count < ctx.policy.max_payment_retries {
        return Err(invalid(
            sub.status,
            format!(
                "{} of {} payment retries used",
                sub.retry_count, ctx.policy.max_payment_retries
            ),
        ));
    }

    let mut next = touched(sub, ctx);
    end_subscription(&mut next, SubscriptionStatus::Expired, ctx);
    Ok(Transition::append(next, ChangeType::Expire))
}

fn complete_cancellation(sub: &Subscription, ctx: &Context<'_>) -> Result<Transition> {
    if sub.status != SubscriptionStatus::PendingCancel {
        return Err(invalid(sub.status, "no cancellation is scheduled"));
    }
    if ctx.today() <= sub.current_period_end {
        return Err(invalid(
            sub.status,
            format!("access continues until {}", sub.current_period_end),
        ));
    }

    let mut next = touched(sub, ctx);
    end_subscription(&mut next, SubscriptionStatus::Canceled, ctx);
    Ok(Transition::append(next, ChangeType::Cancel))
}

fn revoke_credential(sub: &Subscription, ctx: &Context<'_>) -> Transition {
    let mut next = touched(sub, ctx);
    next.billing = None;

    let loses_billing = matches!(
        sub.status,
        SubscriptionStatus::Active | SubscriptionStatus::PendingCancel
    ) && !sub.plan.is_manually_billed();

    if !loses_billing {
        return Transition::amend(next);
    }

    next.status = SubscriptionStatus::PastDue;
    next.auto_renew = false;
    next.pending = None;
    next.last_payment_error = Some("billing credential was deleted at the gateway".into());
    Transition::append(next, ChangeType::PaymentFailed)
}

fn correct_period(
    sub: &Subscription,
    start: NaiveDate,
    end: NaiveDate,
    note: Option<String>,
    ctx: &Context<'_>,
) -> Result<Transition> {
    if sub.status.is_terminal() {
        return Err(invalid(
            sub.status,
            format!("cannot correct the period of a {} subscription", sub.status),
        ));
    }
    period::validate(start, end)?;

    let mut next = touched(sub, ctx);
    next.current_period_start = start;
    next.current_period_end = end;
    if let Some(pending) = next.pending.as_mut() {
        pending.effective_at = period::day_after(end)?;
    }

    let mut transition = Transition::amend(next);
    transition.note = note;
    Ok(transition)
}
