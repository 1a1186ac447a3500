//! Daily sweep integration tests.

mod common;

use common::{at, credential, date, TestHarness};

use saas_billing_core::lifecycle::{ChangeMode, Event, StartRequest};
use saas_billing_core::{
    Actor, CancelMode, EntryType, Plan, PricePolicy, SubscriptionStatus, TenantId,
};
use saas_billing_store::Store;

async fn start_trial(harness: &TestHarness, tenant: TenantId, with_card: bool) {
    let mut request = StartRequest::new(Plan::Trial);
    if with_card {
        request.billing = Some(credential("bk_trial"));
    }
    harness
        .run(tenant, Event::Start(request), Actor::Tenant, at(2024, 1, 1))
        .await
        .unwrap();
}

async fn start_negotiated(
    harness: &TestHarness,
    tenant: TenantId,
    amount: i64,
    policy: PricePolicy,
) {
    let mut request = StartRequest::new(Plan::Tier1);
    request.billing = Some(credential("bk_test"));
    request.amount = Some(amount);
    request.price_policy = Some(policy);
    harness
        .run(tenant, Event::Start(request), Actor::Admin, at(2024, 6, 1))
        .await
        .unwrap();
}

// ============================================================================
// Trials
// ============================================================================

#[tokio::test]
async fn trial_with_scheduled_plan_converts() {
    let harness = TestHarness::new();
    let tenant = TenantId::generate();
    start_trial(&harness, tenant, true).await;
    harness
        .run(
            tenant,
            Event::ChangePlan {
                plan: Plan::Tier2,
                mode: ChangeMode::Scheduled,
            },
            Actor::Tenant,
            at(2024, 1, 5),
        )
        .await
        .unwrap();

    // Still inside the trial.
    let report = harness.engine.run_daily_sweep(at(2024, 1, 14)).await.unwrap();
    assert_eq!(report.converted, 0);
    assert_eq!(harness.gateway.charge_count(), 0);

    let report = harness.engine.run_daily_sweep(at(2024, 1, 15)).await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.converted, 1);
    assert!(report.errors.is_empty());

    let sub = harness.subscription(&tenant);
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.plan, Plan::Tier2);
    assert_eq!(sub.amount, 99_000);
    assert_eq!(sub.current_period_start, date(2024, 1, 15));
    assert_eq!(sub.current_period_end, date(2024, 2, 14));
    assert!(sub.pending.is_none());

    let ledger = harness.ledger(&tenant);
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].entry_type, EntryType::TrialConvert);
    assert_eq!(ledger[0].amount, 99_000);
    let key = format!("sweep:{tenant}:convert_trial:2024-01-15");
    assert_eq!(ledger[0].idempotency_key.as_deref(), Some(key.as_str()));
}

#[tokio::test]
async fn trial_without_card_expires() {
    let harness = TestHarness::new();
    let tenant = TenantId::generate();
    start_trial(&harness, tenant, false).await;

    let report = harness.engine.run_daily_sweep(at(2024, 1, 15)).await.unwrap();

    assert_eq!(report.expired, 1);
    let sub = harness.subscription(&tenant);
    assert_eq!(sub.status, SubscriptionStatus::Expired);
    assert!(!sub.has_access());
    assert!(sub.ended_at.is_some());
    assert_eq!(harness.gateway.charge_count(), 0);
}

#[tokio::test]
async fn declined_trial_conversion_goes_past_due() {
    let harness = TestHarness::new();
    let tenant = TenantId::generate();
    start_trial(&harness, tenant, true).await;
    harness
        .run(
            tenant,
            Event::ChangePlan {
                plan: Plan::Tier1,
                mode: ChangeMode::Scheduled,
            },
            Actor::Tenant,
            at(2024, 1, 3),
        )
        .await
        .unwrap();

    harness.gateway.decline_next("REJECT_CARD_PAYMENT");
    let report = harness.engine.run_daily_sweep(at(2024, 1, 15)).await.unwrap();

    assert_eq!(report.past_due, 1);
    assert!(report.errors.is_empty());
    let sub = harness.subscription(&tenant);
    assert_eq!(sub.status, SubscriptionStatus::PastDue);
    assert_eq!(sub.plan, Plan::Tier1);
    assert_eq!(sub.retry_count, 1);
}

// ============================================================================
// Renewals
// ============================================================================

#[tokio::test]
async fn renewal_runs_once_per_day() {
    let harness = TestHarness::new();
    let tenant = TenantId::generate();
    harness.start_paid(tenant, Plan::Tier1, at(2024, 6, 1)).await;

    let first = harness.engine.run_daily_sweep(at(2024, 7, 1)).await.unwrap();
    let second = harness.engine.run_daily_sweep(at(2024, 7, 1)).await.unwrap();

    assert_eq!(first.renewed, 1);
    assert_eq!(second.renewed, 0);
    assert_eq!(harness.gateway.charge_count(), 2);

    let sub = harness.subscription(&tenant);
    assert_eq!(sub.current_period_start, date(2024, 7, 1));
    assert_eq!(sub.current_period_end, date(2024, 7, 31));
    assert_eq!(sub.next_billing_date(), Some(date(2024, 8, 1)));

    let ledger = harness.ledger(&tenant);
    assert_eq!(ledger.len(), 2);
    assert_eq!(ledger[0].entry_type, EntryType::Renewal);
}

#[tokio::test]
async fn renewal_is_not_early() {
    let harness = TestHarness::new();
    let tenant = TenantId::generate();
    harness.start_paid(tenant, Plan::Tier1, at(2024, 6, 1)).await;

    let report = harness.engine.run_daily_sweep(at(2024, 6, 30)).await.unwrap();

    assert_eq!(report.renewed, 0);
    assert_eq!(harness.gateway.charge_count(), 1);
}

#[tokio::test]
async fn grandfathered_price_survives_renewal() {
    let harness = TestHarness::new();
    let tenant = TenantId::generate();
    start_negotiated(&harness, tenant, 29_000, PricePolicy::Grandfathered).await;

    harness.engine.run_daily_sweep(at(2024, 7, 1)).await.unwrap();

    let sub = harness.subscription(&tenant);
    assert_eq!(sub.amount, 29_000);
    assert_eq!(sub.price_policy, PricePolicy::Grandfathered);
    assert_eq!(harness.gateway.charges()[1].amount, 29_000);
}

#[tokio::test]
async fn protected_price_lapses_after_its_date() {
    let harness = TestHarness::new();
    let tenant = TenantId::generate();
    start_negotiated(
        &harness,
        tenant,
        29_000,
        PricePolicy::ProtectedUntil(date(2024, 6, 30)),
    )
    .await;

    harness.engine.run_daily_sweep(at(2024, 7, 1)).await.unwrap();

    let sub = harness.subscription(&tenant);
    assert_eq!(sub.amount, 39_000);
    assert_eq!(sub.price_policy, PricePolicy::Standard);
    assert_eq!(harness.gateway.charges()[1].amount, 39_000);
}

#[tokio::test]
async fn manually_billed_plans_are_never_charged() {
    let harness = TestHarness::new();
    let tenant = TenantId::generate();
    harness
        .run(
            tenant,
            Event::Start(StartRequest::new(Plan::Enterprise)),
            Actor::Admin,
            at(2024, 6, 1),
        )
        .await
        .unwrap();

    let report = harness.engine.run_daily_sweep(at(2024, 7, 1)).await.unwrap();

    assert_eq!(report.renewed, 0);
    assert_eq!(harness.gateway.charge_count(), 0);
    assert_eq!(harness.subscription(&tenant).status, SubscriptionStatus::Active);
}

// ============================================================================
// Payment failures
// ============================================================================

#[tokio::test]
async fn retries_exhaust_into_expiry() {
    let harness = TestHarness::new();
    let tenant = TenantId::generate();
    harness.start_paid(tenant, Plan::Tier1, at(2024, 6, 1)).await;
    harness.gateway.decline_all(true);

    let report = harness.engine.run_daily_sweep(at(2024, 7, 1)).await.unwrap();
    assert_eq!(report.past_due, 1);
    assert_eq!(harness.subscription(&tenant).retry_count, 1);

    // A second run on the same day does not retry again.
    harness.engine.run_daily_sweep(at(2024, 7, 1)).await.unwrap();
    assert_eq!(harness.gateway.charge_count(), 2);

    harness.engine.run_daily_sweep(at(2024, 7, 2)).await.unwrap();
    harness.engine.run_daily_sweep(at(2024, 7, 3)).await.unwrap();
    let sub = harness.subscription(&tenant);
    assert_eq!(sub.status, SubscriptionStatus::PastDue);
    assert_eq!(sub.retry_count, 3);

    let report = harness.engine.run_daily_sweep(at(2024, 7, 4)).await.unwrap();
    assert_eq!(report.expired, 1);
    let sub = harness.subscription(&tenant);
    assert_eq!(sub.status, SubscriptionStatus::Expired);
    assert_eq!(harness.gateway.charge_count(), 4);
    assert_eq!(harness.ledger(&tenant).len(), 1);
}

#[tokio::test]
async fn automatic_retry_recovers() {
    let harness = TestHarness::new();
    let tenant = TenantId::generate();
    harness.start_paid(tenant, Plan::Tier1, at(2024, 6, 1)).await;

    harness.gateway.decline_next("REJECT_CARD_PAYMENT");
    harness.engine.run_daily_sweep(at(2024, 7, 1)).await.unwrap();

    let report = harness.engine.run_daily_sweep(at(2024, 7, 2)).await.unwrap();
    assert_eq!(report.recovered, 1);

    let sub = harness.subscription(&tenant);
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.retry_count, 0);
    assert_eq!(harness.ledger(&tenant)[0].entry_type, EntryType::Retry);
}

#[tokio::test]
async fn decline_is_recorded_despite_a_concurrent_write() {
    let harness = TestHarness::new();
    let tenant = TenantId::generate();
    harness.start_paid(tenant, Plan::Tier1, at(2024, 6, 1)).await;

    harness.gateway.decline_next("REJECT_CARD_PAYMENT");
    harness.store.inject_conflicts(1);
    let report = harness.engine.run_daily_sweep(at(2024, 7, 1)).await.unwrap();

    assert_eq!(report.past_due, 1);
    assert!(report.errors.is_empty());
    let sub = harness.subscription(&tenant);
    assert_eq!(sub.status, SubscriptionStatus::PastDue);
    assert_eq!(sub.retry_count, 1);
}

#[tokio::test]
async fn unrecorded_decline_is_an_error_not_past_due() {
    let harness = TestHarness::new();
    let tenant = TenantId::generate();
    harness.start_paid(tenant, Plan::Tier1, at(2024, 6, 1)).await;

    harness.gateway.decline_next("REJECT_CARD_PAYMENT");
    harness.store.inject_conflicts(10);
    let report = harness.engine.run_daily_sweep(at(2024, 7, 1)).await.unwrap();

    assert_eq!(report.past_due, 0);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].tenant_id, tenant);
    assert_eq!(report.errors[0].event, "renew");
    let sub = harness.subscription(&tenant);
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.retry_count, 0);
}

#[tokio::test]
async fn one_failing_tenant_does_not_stop_the_sweep() {
    let harness = TestHarness::new();
    let healthy = TenantId::generate();
    let broken = TenantId::generate();
    harness.start_paid(healthy, Plan::Tier1, at(2024, 6, 1)).await;
    harness.start_paid(broken, Plan::Tier2, at(2024, 6, 1)).await;

    harness.store.fail_ledger_commits_for(broken);
    let report = harness.engine.run_daily_sweep(at(2024, 7, 1)).await.unwrap();

    assert_eq!(report.examined, 2);
    assert_eq!(report.renewed, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].tenant_id, broken);
    assert_eq!(report.errors[0].event, "renew");
    assert_eq!(report.unreconciled, 1);

    assert_eq!(
        harness.subscription(&healthy).current_period_end,
        date(2024, 7, 31)
    );
    assert_eq!(
        harness.subscription(&broken).current_period_end,
        date(2024, 6, 30)
    );
}

// ============================================================================
// Cancellation and retention
// ============================================================================

#[tokio::test]
async fn scheduled_cancellation_completes_after_period() {
    let harness = TestHarness::new();
    let tenant = TenantId::generate();
    harness.start_paid(tenant, Plan::Tier1, at(2024, 6, 1)).await;
    harness
        .run(
            tenant,
            Event::Cancel {
                mode: CancelMode::Scheduled,
                reason: None,
                refund: false,
            },
            Actor::Tenant,
            at(2024, 6, 15),
        )
        .await
        .unwrap();

    let report = harness.engine.run_daily_sweep(at(2024, 6, 30)).await.unwrap();
    assert_eq!(report.canceled, 0);
    assert!(harness.subscription(&tenant).has_access());

    let report = harness.engine.run_daily_sweep(at(2024, 7, 1)).await.unwrap();
    assert_eq!(report.canceled, 1);
    assert_eq!(harness.subscription(&tenant).status, SubscriptionStatus::Canceled);
    assert_eq!(harness.gateway.charge_count(), 1);
}

#[tokio::test]
async fn retention_purge_keeps_the_ledger() {
    let harness = TestHarness::with_config(|config| {
        config.retention_purge = true;
        config.retention_days = 30;
    });
    let tenant = TenantId::generate();
    harness.start_paid(tenant, Plan::Tier1, at(2024, 6, 1)).await;
    harness
        .run(
            tenant,
            Event::Cancel {
                mode: CancelMode::Immediate,
                reason: None,
                refund: false,
            },
            Actor::Tenant,
            at(2024, 6, 2),
        )
        .await
        .unwrap();

    let report = harness.engine.run_daily_sweep(at(2024, 7, 1)).await.unwrap();
    assert_eq!(report.purged, 0);

    let report = harness.engine.run_daily_sweep(at(2024, 7, 5)).await.unwrap();
    assert_eq!(report.purged, 1);
    assert!(harness.store.get_subscription(&tenant).unwrap().is_none());
    assert!(harness.history(&tenant).is_empty());
    assert_eq!(harness.ledger(&tenant).len(), 1);
}

#[tokio::test]
async fn purge_spares_a_tenant_that_restarted() {
    let harness = TestHarness::with_config(|config| {
        config.retention_purge = true;
        config.retention_days = 30;
    });
    let tenant = TenantId::generate();
    harness.start_paid(tenant, Plan::Tier1, at(2024, 6, 1)).await;
    harness
        .run(
            tenant,
            Event::Cancel {
                mode: CancelMode::Immediate,
                reason: None,
                refund: false,
            },
            Actor::Tenant,
            at(2024, 6, 2),
        )
        .await
        .unwrap();

    // The sweep lists the canceled record, then the tenant comes back.
    harness.store.freeze_listing();
    harness.start_paid(tenant, Plan::Tier2, at(2024, 7, 5)).await;

    let report = harness.engine.run_daily_sweep(at(2024, 7, 5)).await.unwrap();

    assert_eq!(report.purged, 0);
    assert!(report.errors.is_empty());
    let sub = harness.subscription(&tenant);
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.plan, Plan::Tier2);
    assert_eq!(harness.ledger(&tenant).len(), 2);
    assert_eq!(harness.gateway.charge_count(), 2);
}

#[tokio::test]
async fn purge_is_off_by_default() {
    let harness = TestHarness::new();
    let tenant = TenantId::generate();
    start_trial(&harness, tenant, false).await;
    harness.engine.run_daily_sweep(at(2024, 1, 15)).await.unwrap();

    let report = harness.engine.run_daily_sweep(at(2026, 1, 15)).await.unwrap();

    assert_eq!(report.purged, 0);
    assert_eq!(harness.subscription(&tenant).status, SubscriptionStatus::Expired);
}
