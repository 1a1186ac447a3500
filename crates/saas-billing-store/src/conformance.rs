//! Behaviour every `Store` backend must share, run against each backend.

use chrono::{Duration, Utc};
use saas_billing_core::lifecycle::{self, Context, Event, StartRequest};
use saas_billing_core::{
    Actor, BillingCredential, BillingPolicy, ChangeType, ChargeIntent, EntryType, HistoryRecord,
    IdempotencyRecord, IntentState, LedgerEntry, Plan, PlanCatalog, Subscription,
    SubscriptionStatus, TenantId,
};

use crate::{Commit, HistoryWrite, Store, StoreError};

fn started(tenant_id: TenantId) -> Subscription {
    let catalog = PlanCatalog::default();
    let policy = BillingPolicy::default();
    let ctx = Context {
        now: Utc::now(),
        catalog: &catalog,
        policy: &policy,
    };
    let mut request = StartRequest::new(Plan::Tier1);
    request.billing = Some(BillingCredential {
        token: "bk_test".into(),
        card_summary: None,
        customer_email: None,
    });
    lifecycle::apply(tenant_id, None, &Event::Start(request), &ctx)
        .unwrap()
        .subscription
}

fn append(subscription: &Subscription, change: ChangeType) -> Commit {
    Commit::new(
        subscription.clone(),
        HistoryWrite::Append(HistoryRecord::snapshot(
            subscription,
            change,
            Actor::Tenant,
            Utc::now(),
            None,
        )),
    )
}

/// Cancels `subscription` in place and returns the stored result.
fn end(store: &dyn Store, subscription: &Subscription) -> Subscription {
    let mut ended = subscription.clone();
    ended.status = SubscriptionStatus::Canceled;
    ended.ended_at = Some(Utc::now());
    store
        .compare_and_update(
            &subscription.tenant_id,
            subscription.version,
            &append(&ended, ChangeType::Cancel),
        )
        .unwrap()
}

fn charge(tenant_id: TenantId, order_id: &str, amount: i64, key: &str) -> LedgerEntry {
    LedgerEntry::charge(
        tenant_id,
        order_id.into(),
        amount,
        EntryType::FirstPayment,
        format!("pay_{order_id}"),
        Some(key.into()),
    )
}

fn marker(tenant_id: TenantId, key: &str, entry: Option<&LedgerEntry>) -> IdempotencyRecord {
    IdempotencyRecord {
        key: key.into(),
        tenant_id,
        ledger_entry_id: entry.map(|e| e.id),
        recorded_at: Utc::now(),
    }
}

/// Returns the tenant it created.
pub fn create_then_update(store: &dyn Store) -> TenantId {
    let tenant_id = TenantId::generate();
    let subscription = started(tenant_id);

    let created = store.create(&append(&subscription, ChangeType::New)).unwrap();
    assert_eq!(created.version, 1);
    assert!(matches!(
        store.create(&append(&subscription, ChangeType::New)),
        Err(StoreError::AlreadyExists)
    ));

    let mut next = created.clone();
    next.current_period_end += Duration::days(3);
    let commit = Commit::new(
        next,
        HistoryWrite::Amend {
            at: Utc::now(),
            note: Some("support extension".into()),
        },
    );
    let updated = store.compare_and_update(&tenant_id, 1, &commit).unwrap();
    assert_eq!(updated.version, 2);
    assert_eq!(store.get_subscription(&tenant_id).unwrap(), Some(updated));
    assert_eq!(store.list_subscriptions().unwrap().len(), 1);

    tenant_id
}

pub fn stale_version_conflicts(store: &dyn Store) {
    let tenant_id = TenantId::generate();
    let created = store.create(&append(&started(tenant_id), ChangeType::New)).unwrap();

    let commit = Commit::new(
        created.clone(),
        HistoryWrite::Amend {
            at: Utc::now(),
            note: None,
        },
    );
    store.compare_and_update(&tenant_id, 1, &commit).unwrap();

    let result = store.compare_and_update(&tenant_id, 1, &commit);
    assert!(matches!(
        result,
        Err(StoreError::Conflict {
            expected: 1,
            actual: 2
        })
    ));

    let missing = TenantId::generate();
    let mut other = created;
    other.tenant_id = missing;
    let commit = Commit::new(
        other,
        HistoryWrite::Amend {
            at: Utc::now(),
            note: None,
        },
    );
    assert!(matches!(
        store.compare_and_update(&missing, 1, &commit),
        Err(StoreError::NotFound)
    ));
}

pub fn idempotency_key_is_unique(store: &dyn Store) {
    let tenant_id = TenantId::generate();
    let subscription = started(tenant_id);

    let entry = charge(tenant_id, "ord-1", 39_000, "key-1");
    let mut commit = append(&subscription, ChangeType::New);
    commit.idempotency = Some(marker(tenant_id, "key-1", Some(&entry)));
    commit.ledger = Some(entry);
    let created = store.create(&commit).unwrap();

    assert!(store.find_idempotency("key-1").unwrap().is_some());

    // Same key on a later commit is rejected as a whole.
    let mut retry = append(&created, ChangeType::Upgrade);
    let second = charge(tenant_id, "ord-2", 20_000, "key-1");
    retry.idempotency = Some(marker(tenant_id, "key-1", Some(&second)));
    retry.ledger = Some(second);
    assert!(matches!(
        store.compare_and_update(&tenant_id, 1, &retry),
        Err(StoreError::DuplicateIdempotencyKey { .. })
    ));

    assert_eq!(store.get_subscription(&tenant_id).unwrap().unwrap().version, 1);
    assert_eq!(store.list_ledger_by_tenant(&tenant_id, 10, 0).unwrap().len(), 1);
    assert_eq!(store.list_history(&tenant_id).unwrap().len(), 1);
}

pub fn history_append_and_amend(store: &dyn Store) {
    let tenant_id = TenantId::generate();
    let created = store.create(&append(&started(tenant_id), ChangeType::New)).unwrap();

    let mut upgraded = created.clone();
    upgraded.plan = Plan::Tier2;
    upgraded.amount = 99_000;
    let upgraded = store
        .compare_and_update(&tenant_id, 1, &append(&upgraded, ChangeType::Upgrade))
        .unwrap();

    let mut renewed = upgraded.clone();
    renewed.current_period_start = renewed.current_period_end.succ_opt().unwrap();
    renewed.current_period_end = renewed.current_period_start + Duration::days(29);
    let renewed = store
        .compare_and_update(
            &tenant_id,
            2,
            &Commit::new(
                renewed,
                HistoryWrite::Amend {
                    at: Utc::now(),
                    note: None,
                },
            ),
        )
        .unwrap();

    let history = store.list_history(&tenant_id).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].change_type, ChangeType::New);
    assert_eq!(history[1].change_type, ChangeType::Upgrade);
    assert!(history[1].amended_at.is_some());

    let current = store.current_history(&tenant_id).unwrap().unwrap();
    assert!(current.mirrors(&renewed));
}

pub fn ledger_newest_first_with_pagination(store: &dyn Store) {
    let tenant_id = TenantId::generate();
    let subscription = started(tenant_id);

    let first = charge(tenant_id, "ord-1", 39_000, "k1");
    let mut commit = append(&subscription, ChangeType::New);
    commit.ledger = Some(first.clone());
    let mut current = store.create(&commit).unwrap();

    let second = charge(tenant_id, "ord-2", 20_000, "k2");
    let mut commit = append(&current, ChangeType::Upgrade);
    commit.ledger = Some(second.clone());
    current = store.compare_and_update(&tenant_id, 1, &commit).unwrap();

    let refund = LedgerEntry::refund(&second, 5_000, "pay_ord-2".into(), None);
    let mut commit = append(&current, ChangeType::Cancel);
    commit.ledger = Some(refund.clone());
    store.compare_and_update(&tenant_id, 2, &commit).unwrap();

    let all = store.list_ledger_by_tenant(&tenant_id, 10, 0).unwrap();
    let orders: Vec<_> = all.iter().map(|e| e.order_id.as_str()).collect();
    assert_eq!(orders, ["ord-2-refund", "ord-2", "ord-1"]);

    let page = store.list_ledger_by_tenant(&tenant_id, 1, 1).unwrap();
    assert_eq!(page[0].order_id, "ord-2");

    assert_eq!(store.latest_charge(&tenant_id).unwrap().unwrap().id, second.id);
    assert_eq!(store.get_ledger_entry(&first.id).unwrap(), Some(first));
    assert!(store
        .list_ledger_by_tenant(&TenantId::generate(), 10, 0)
        .unwrap()
        .is_empty());
}

pub fn charge_intent_lifecycle(store: &dyn Store) {
    let tenant_id = TenantId::generate();
    let intent = ChargeIntent::pending(
        "key-1".into(),
        "ord-1".into(),
        tenant_id,
        39_000,
        EntryType::FirstPayment,
    );

    store.begin_charge(&intent).unwrap();
    assert!(matches!(
        store.begin_charge(&intent),
        Err(StoreError::DuplicateIdempotencyKey { .. })
    ));

    store.mark_captured("key-1", "pay_1").unwrap();
    let captured = store.get_charge_intent("key-1").unwrap().unwrap();
    assert_eq!(
        captured.state,
        IntentState::Captured {
            gateway_reference: "pay_1".into()
        }
    );
    assert_eq!(store.list_charge_intents().unwrap().len(), 1);

    // The commit that records the payment resolves the intent.
    let mut commit = append(&started(tenant_id), ChangeType::New);
    commit.resolve_intent = Some("key-1".into());
    store.create(&commit).unwrap();
    assert!(store.list_charge_intents().unwrap().is_empty());

    store.begin_charge(&ChargeIntent::pending(
        "key-2".into(),
        "ord-2".into(),
        tenant_id,
        1,
        EntryType::Retry,
    ))
    .unwrap();
    store.abandon_charge("key-2").unwrap();
    assert!(store.get_charge_intent("key-2").unwrap().is_none());
    assert!(matches!(store.mark_captured("key-2", "pay"), Err(StoreError::NotFound)));
}

pub fn purge_keeps_ledger(store: &dyn Store) {
    let tenant_id = TenantId::generate();
    let entry = charge(tenant_id, "ord-1", 39_000, "key-1");
    let mut commit = append(&started(tenant_id), ChangeType::New);
    commit.idempotency = Some(marker(tenant_id, "key-1", Some(&entry)));
    commit.ledger = Some(entry.clone());
    let created = store.create(&commit).unwrap();
    let ended = end(store, &created);

    store.purge_tenant(&tenant_id, ended.version).unwrap();

    assert!(store.get_subscription(&tenant_id).unwrap().is_none());
    assert!(store.list_history(&tenant_id).unwrap().is_empty());
    assert!(store.find_idempotency("key-1").unwrap().is_none());
    assert_eq!(store.get_ledger_entry(&entry.id).unwrap(), Some(entry));
    assert!(matches!(
        store.purge_tenant(&tenant_id, ended.version),
        Err(StoreError::NotFound)
    ));
}

pub fn purge_leaves_live_or_moved_subscription(store: &dyn Store) {
    let tenant_id = TenantId::generate();
    let created = store.create(&append(&started(tenant_id), ChangeType::New)).unwrap();

    // Active at the expected version is still live.
    assert!(matches!(
        store.purge_tenant(&tenant_id, created.version),
        Err(StoreError::Conflict { .. })
    ));

    // Ended, then restarted before the purge ran.
    let ended = end(store, &created);
    let mut restarted = ended.clone();
    restarted.status = SubscriptionStatus::Active;
    restarted.plan = Plan::Tier2;
    restarted.ended_at = None;
    let restarted = store
        .compare_and_update(&tenant_id, ended.version, &append(&restarted, ChangeType::New))
        .unwrap();

    assert!(matches!(
        store.purge_tenant(&tenant_id, ended.version),
        Err(StoreError::Conflict { expected, actual })
            if expected == ended.version && actual == restarted.version
    ));
    assert_eq!(store.get_subscription(&tenant_id).unwrap(), Some(restarted));
    assert_eq!(store.list_history(&tenant_id).unwrap().len(), 3);
}

fn claim_key(store: &dyn Store, tenant_id: TenantId, key: &str) -> bool {
    let current = store.get_subscription(&tenant_id).unwrap().unwrap();
    let entry = charge(tenant_id, &format!("ord-{tenant_id}"), 1_000, key);
    let mut commit = append(&current, ChangeType::Upgrade);
    commit.idempotency = Some(marker(tenant_id, key, Some(&entry)));
    commit.ledger = Some(entry);
    match store.compare_and_update(&tenant_id, current.version, &commit) {
        Ok(_) => true,
        Err(StoreError::DuplicateIdempotencyKey { .. }) => false,
        Err(e) => panic!("unexpected store error: {e}"),
    }
}

/// Tenants racing for one idempotency key: exactly one commit wins.
pub fn shared_key_is_claimed_once_across_tenants(store: &dyn Store) {
    let tenants: Vec<_> = (0..8).map(|_| TenantId::generate()).collect();
    for tenant_id in &tenants {
        store.create(&append(&started(*tenant_id), ChangeType::New)).unwrap();
    }

    let claimed: Vec<bool> = std::thread::scope(|scope| {
        let handles: Vec<_> = tenants
            .iter()
            .map(|tenant_id| scope.spawn(move || claim_key(store, *tenant_id, "shared")))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(claimed.iter().filter(|won| **won).count(), 1);
    let marker = store.find_idempotency("shared").unwrap().unwrap();
    assert!(tenants.contains(&marker.tenant_id));
    assert_eq!(store.list_ledger_by_tenant(&marker.tenant_id, 10, 0).unwrap().len(), 1);
}
