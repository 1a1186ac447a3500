//! Common test utilities for saas-billing integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue};
use axum::Router;
use axum_test::{TestRequest, TestServer};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use saas_billing_core::lifecycle::{Event, StartRequest};
use saas_billing_core::{
    Actor, BillingCredential, ChargeIntent, HistoryRecord, IdempotencyRecord, LedgerEntry,
    LedgerEntryId, Plan, Subscription, TenantId,
};
use saas_billing_service::gateway::{ChargeReceipt, ChargeRequest, IssuedToken};
use saas_billing_service::{
    create_router, AppState, Command, Engine, GatewayError, Outcome, PaymentGateway, ServiceConfig,
};
use saas_billing_store::{Commit, MemoryStore, Store, StoreError};

pub const SERVICE_API_KEY: &str = "test-service-key";
pub const ADMIN_API_KEY: &str = "test-admin-key";
pub const WEBHOOK_SECRET: &str = "whsec_test";

// ============================================================================
// Clock helpers
// ============================================================================

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// 09:00 UTC on the given day.
pub fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap()
}

pub fn credential(token: &str) -> BillingCredential {
    BillingCredential {
        token: token.to_string(),
        card_summary: Some("Test 4330****1234".into()),
        customer_email: Some("billing@tenant.test".into()),
    }
}

// ============================================================================
// Fake payment gateway
// ============================================================================

/// Scripted gateway: charges succeed unless a result was queued.
#[derive(Default)]
pub struct FakeGateway {
    charges: Mutex<Vec<ChargeRequest>>,
    refunds: Mutex<Vec<(String, i64)>>,
    scripted: Mutex<VecDeque<Result<ChargeReceipt, GatewayError>>>,
    decline_all: AtomicBool,
    hang: AtomicBool,
    issued: AtomicUsize,
}

impl FakeGateway {
    /// Decline the next charge with `code`.
    pub fn decline_next(&self, code: &str) {
        self.scripted
            .lock()
            .unwrap()
            .push_back(Err(GatewayError::new(code, "card declined")));
    }

    /// Decline every charge until reset.
    pub fn decline_all(&self, decline: bool) {
        self.decline_all.store(decline, Ordering::SeqCst);
    }

    /// Never answer charge calls.
    pub fn hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    /// Charge calls received, including declined ones.
    pub fn charge_count(&self) -> usize {
        self.charges.lock().unwrap().len()
    }

    pub fn charges(&self) -> Vec<ChargeRequest> {
        self.charges.lock().unwrap().clone()
    }

    /// `(gateway_reference, amount)` of every refund.
    pub fn refunds(&self) -> Vec<(String, i64)> {
        self.refunds.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn issue_billing_token(
        &self,
        auth_code: &str,
        _customer_key: &str,
    ) -> Result<IssuedToken, GatewayError> {
        if auth_code == "invalid" {
            return Err(GatewayError::new("INVALID_AUTH_CODE", "authorization code expired"));
        }
        self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(IssuedToken {
            token: format!("bk_{auth_code}"),
            card_summary: Some("Test 4330****1234".into()),
        })
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError> {
        let n = {
            let mut charges = self.charges.lock().unwrap();
            charges.push(request.clone());
            charges.len()
        };

        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if self.decline_all.load(Ordering::SeqCst) {
            return Err(GatewayError::new("REJECT_CARD_PAYMENT", "card declined"));
        }
        if let Some(result) = self.scripted.lock().unwrap().pop_front() {
            return result;
        }

        Ok(ChargeReceipt {
            gateway_reference: format!("pay_{n}"),
            status: "DONE".into(),
        })
    }

    async fn refund(
        &self,
        gateway_reference: &str,
        _reason: &str,
        amount: i64,
    ) -> Result<(), GatewayError> {
        self.refunds
            .lock()
            .unwrap()
            .push((gateway_reference.to_string(), amount));
        Ok(())
    }
}

// ============================================================================
// Fault-injecting store
// ============================================================================

/// `MemoryStore` that can fail commits after money moved, or report
/// version conflicts, on demand.
#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    fail_ledger_commits: AtomicBool,
    failing_tenants: Mutex<HashSet<TenantId>>,
    conflicts: AtomicUsize,
    frozen_listing: Mutex<Option<Vec<Subscription>>>,
    recorded_keys: Mutex<Vec<String>>,
}

impl FaultyStore {
    /// Fail every commit that carries a ledger entry.
    pub fn fail_ledger_commits(&self, fail: bool) {
        self.fail_ledger_commits.store(fail, Ordering::SeqCst);
    }

    /// Fail ledger commits for one tenant only.
    pub fn fail_ledger_commits_for(&self, tenant_id: TenantId) {
        self.failing_tenants.lock().unwrap().insert(tenant_id);
    }

    /// Report a version conflict on the next `n` updates.
    pub fn inject_conflicts(&self, n: usize) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    /// Keep answering `list_subscriptions` with what is stored now, so a
    /// sweep sees snapshots older than the records it acts on.
    pub fn freeze_listing(&self) {
        let snapshot = self.inner.list_subscriptions().unwrap();
        *self.frozen_listing.lock().unwrap() = Some(snapshot);
    }

    /// Idempotency keys written by successful commits, oldest first.
    pub fn recorded_keys(&self) -> Vec<String> {
        self.recorded_keys.lock().unwrap().clone()
    }

    fn written(&self, commit: &Commit, stored: Subscription) -> Subscription {
        if let Some(marker) = &commit.idempotency {
            self.recorded_keys.lock().unwrap().push(marker.key.clone());
        }
        stored
    }

    fn check(&self, commit: &Commit) -> saas_billing_store::Result<()> {
        if commit.ledger.is_none() {
            return Ok(());
        }
        let tenant_id = commit.subscription.tenant_id;
        if self.fail_ledger_commits.load(Ordering::SeqCst)
            || self.failing_tenants.lock().unwrap().contains(&tenant_id)
        {
            return Err(StoreError::Database("injected write failure".into()));
        }
        Ok(())
    }
}

impl Store for FaultyStore {
    fn get_subscription(&self, tenant_id: &TenantId) -> saas_billing_store::Result<Option<Subscription>> {
        self.inner.get_subscription(tenant_id)
    }

    fn list_subscriptions(&self) -> saas_billing_store::Result<Vec<Subscription>> {
        if let Some(frozen) = self.frozen_listing.lock().unwrap().clone() {
            return Ok(frozen);
        }
        self.inner.list_subscriptions()
    }

    fn create(&self, commit: &Commit) -> saas_billing_store::Result<Subscription> {
        self.check(commit)?;
        let stored = self.inner.create(commit)?;
        Ok(self.written(commit, stored))
    }

    fn compare_and_update(
        &self,
        tenant_id: &TenantId,
        expected_version: u64,
        commit: &Commit,
    ) -> saas_billing_store::Result<Subscription> {
        let injected = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Conflict {
                expected: expected_version,
                actual: expected_version + 1,
            });
        }
        self.check(commit)?;
        let stored = self.inner.compare_and_update(tenant_id, expected_version, commit)?;
        Ok(self.written(commit, stored))
    }

    fn find_idempotency(&self, key: &str) -> saas_billing_store::Result<Option<IdempotencyRecord>> {
        self.inner.find_idempotency(key)
    }

    fn get_ledger_entry(&self, entry_id: &LedgerEntryId) -> saas_billing_store::Result<Option<LedgerEntry>> {
        self.inner.get_ledger_entry(entry_id)
    }

    fn list_ledger_by_tenant(
        &self,
        tenant_id: &TenantId,
        limit: usize,
        offset: usize,
    ) -> saas_billing_store::Result<Vec<LedgerEntry>> {
        self.inner.list_ledger_by_tenant(tenant_id, limit, offset)
    }

    fn latest_charge(&self, tenant_id: &TenantId) -> saas_billing_store::Result<Option<LedgerEntry>> {
        self.inner.latest_charge(tenant_id)
    }

    fn list_history(&self, tenant_id: &TenantId) -> saas_billing_store::Result<Vec<HistoryRecord>> {
        self.inner.list_history(tenant_id)
    }

    fn current_history(&self, tenant_id: &TenantId) -> saas_billing_store::Result<Option<HistoryRecord>> {
        self.inner.current_history(tenant_id)
    }

    fn begin_charge(&self, intent: &ChargeIntent) -> saas_billing_store::Result<()> {
        self.inner.begin_charge(intent)
    }

    fn mark_captured(&self, key: &str, gateway_reference: &str) -> saas_billing_store::Result<()> {
        self.inner.mark_captured(key, gateway_reference)
    }

    fn abandon_charge(&self, key: &str) -> saas_billing_store::Result<()> {
        self.inner.abandon_charge(key)
    }

    fn get_charge_intent(&self, key: &str) -> saas_billing_store::Result<Option<ChargeIntent>> {
        self.inner.get_charge_intent(key)
    }

    fn list_charge_intents(&self) -> saas_billing_store::Result<Vec<ChargeIntent>> {
        self.inner.list_charge_intents()
    }

    fn purge_tenant(
        &self,
        tenant_id: &TenantId,
        expected_version: u64,
    ) -> saas_billing_store::Result<()> {
        self.inner.purge_tenant(tenant_id, expected_version)
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The test server for making HTTP requests.
    pub server: TestServer,
    /// The engine behind the server.
    pub engine: Arc<Engine>,
    /// The store behind the engine.
    pub store: Arc<FaultyStore>,
    /// The scripted gateway.
    pub gateway: Arc<FakeGateway>,
}

impl TestHarness {
    /// Create a new test harness with a fresh store.
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Create a harness after adjusting the default test configuration.
    pub fn with_config(adjust: impl FnOnce(&mut ServiceConfig)) -> Self {
        let mut config = ServiceConfig {
            listen_addr: "127.0.0.1:0".into(),
            service_api_key: Some(SERVICE_API_KEY.into()),
            admin_api_key: Some(ADMIN_API_KEY.into()),
            gateway_webhook_secret: Some(WEBHOOK_SECRET.into()),
            sweep_interval_seconds: 0,
            ..ServiceConfig::default()
        };
        adjust(&mut config);

        let store = Arc::new(FaultyStore::default());
        let gateway = Arc::new(FakeGateway::default());
        let state = AppState::with_gateway(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&gateway) as Arc<dyn PaymentGateway>,
            config,
        )
        .expect("Failed to build app state");
        let engine = Arc::clone(&state.engine);

        let router: Router = create_router(state);
        let server = TestServer::new(router).expect("Failed to create test server");

        Self {
            server,
            engine,
            store,
            gateway,
        }
    }

    /// Run an event at `now` as `actor`.
    pub async fn run(
        &self,
        tenant_id: TenantId,
        event: Event,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> saas_billing_core::Result<Outcome> {
        self.engine
            .execute(Command::new(tenant_id, event, actor).at(now))
            .await
    }

    /// Start a paid plan with a card on file.
    pub async fn start_paid(&self, tenant_id: TenantId, plan: Plan, now: DateTime<Utc>) -> Outcome {
        let mut request = StartRequest::new(plan);
        request.billing = Some(credential("bk_test"));
        self.run(tenant_id, Event::Start(request), Actor::Tenant, now)
            .await
            .expect("Failed to start subscription")
    }

    pub fn subscription(&self, tenant_id: &TenantId) -> Subscription {
        self.store
            .get_subscription(tenant_id)
            .unwrap()
            .expect("subscription exists")
    }

    pub fn ledger(&self, tenant_id: &TenantId) -> Vec<LedgerEntry> {
        self.store.list_ledger_by_tenant(tenant_id, 100, 0).unwrap()
    }

    pub fn history(&self, tenant_id: &TenantId) -> Vec<HistoryRecord> {
        self.store.list_history(tenant_id).unwrap()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Header helpers for test requests.
pub trait RequestExt {
    /// Authenticate with the service key.
    fn service_auth(self) -> Self;
    /// Authenticate with the admin key.
    fn admin_auth(self) -> Self;
    /// Set the `Idempotency-Key` header.
    fn idempotency_key(self, key: &str) -> Self;
}

impl RequestExt for TestRequest {
    fn service_auth(self) -> Self {
        self.add_header(
            HeaderName::from_static("x-api-key"),
            HeaderValue::from_static(SERVICE_API_KEY),
        )
    }

    fn admin_auth(self) -> Self {
        self.add_header(
            HeaderName::from_static("x-admin-key"),
            HeaderValue::from_static(ADMIN_API_KEY),
        )
    }

    fn idempotency_key(self, key: &str) -> Self {
        self.add_header(
            HeaderName::from_static("idempotency-key"),
            HeaderValue::from_str(key).unwrap(),
        )
    }
}
