//! In-memory storage implementation.
//!
//! Holds everything behind one `RwLock`, so every commit is trivially atomic.
//! Used by the service in development and by tests.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use saas_billing_core::{
    ChargeIntent, HistoryRecord, IdempotencyRecord, IntentState, LedgerEntry, LedgerEntryId,
    Subscription, TenantId,
};

use crate::commit::{check_purgeable, next_version, Commit, HistoryWrite};
use crate::error::{Result, StoreError};
use crate::Store;

#[derive(Default)]
struct Inner {
    subscriptions: HashMap<TenantId, Subscription>,
    ledger: HashMap<LedgerEntryId, LedgerEntry>,
    ledger_by_tenant: HashMap<TenantId, Vec<LedgerEntryId>>,
    idempotency: HashMap<String, IdempotencyRecord>,
    history: HashMap<TenantId, Vec<HistoryRecord>>,
    intents: BTreeMap<String, ChargeIntent>,
}

/// In-memory storage implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn write_commit(&self, expected: Option<u64>, commit: &Commit) -> Result<Subscription> {
        let tenant_id = commit.subscription.tenant_id;
        let mut inner = self.inner.write();

        let version = next_version(
            expected,
            inner.subscriptions.get(&tenant_id).map(|s| s.version),
        )?;

        if let Some(key) = commit
            .claimed_keys()
            .into_iter()
            .find(|key| inner.idempotency.contains_key(*key))
        {
            return Err(StoreError::DuplicateIdempotencyKey { key: key.to_string() });
        }

        let subscription = commit.stamped(version);
        let history = inner.history.entry(tenant_id).or_default();
        let current = history.last().cloned();
        let record = commit.history_record(&subscription, current)?;
        match commit.history {
            HistoryWrite::Append(_) => history.push(record),
            HistoryWrite::Amend { .. } => {
                if let Some(last) = history.last_mut() {
                    *last = record;
                }
            }
        }

        if let Some(entry) = &commit.ledger {
            inner.ledger_by_tenant.entry(tenant_id).or_default().push(entry.id);
            inner.ledger.insert(entry.id, entry.clone());
        }
        if let Some(marker) = &commit.idempotency {
            inner.idempotency.insert(marker.key.clone(), marker.clone());
        }
        if let Some(key) = &commit.resolve_intent {
            inner.intents.remove(key);
        }
        inner.subscriptions.insert(tenant_id, subscription.clone());

        Ok(subscription)
    }
}

impl Store for MemoryStore {
    fn get_subscription(&self, tenant_id: &TenantId) -> Result<Option<Subscription>> {
        Ok(self.inner.read().subscriptions.get(tenant_id).cloned())
    }

    fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        let mut subscriptions: Vec<_> = self.inner.read().subscriptions.values().cloned().collect();
        subscriptions.sort_by_key(|s| s.tenant_id);
        Ok(subscriptions)
    }

    fn create(&self, commit: &Commit) -> Result<Subscription> {
        self.write_commit(None, commit)
    }

    fn compare_and_update(
        &self,
        tenant_id: &TenantId,
        expected_version: u64,
        commit: &Commit,
    ) -> Result<Subscription> {
        if commit.subscription.tenant_id != *tenant_id {
            return Err(StoreError::Inconsistent(format!(
                "commit for tenant {} applied to {tenant_id}",
                commit.subscription.tenant_id
            )));
        }
        self.write_commit(Some(expected_version), commit)
    }

    fn find_idempotency(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        Ok(self.inner.read().idempotency.get(key).cloned())
    }

    fn get_ledger_entry(&self, entry_id: &LedgerEntryId) -> Result<Option<LedgerEntry>> {
        Ok(self.inner.read().ledger.get(entry_id).cloned())
    }

    fn list_ledger_by_tenant(
        &self,
        tenant_id: &TenantId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let inner = self.inner.read();
        let Some(ids) = inner.ledger_by_tenant.get(tenant_id) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .filter_map(|id| inner.ledger.get(id).cloned())
            .collect())
    }

    fn latest_charge(&self, tenant_id: &TenantId) -> Result<Option<LedgerEntry>> {
        let inner = self.inner.read();
        Ok(inner.ledger_by_tenant.get(tenant_id).and_then(|ids| {
            ids.iter()
                .rev()
                .filter_map(|id| inner.ledger.get(id))
                .find(|entry| entry.is_charge())
                .cloned()
        }))
    }

    fn list_history(&self, tenant_id: &TenantId) -> Result<Vec<HistoryRecord>> {
        Ok(self
            .inner
            .read()
            .history
            .get(tenant_id)
            .cloned()
            .unwrap_or_default())
    }

    fn current_history(&self, tenant_id: &TenantId) -> Result<Option<HistoryRecord>> {
        Ok(self
            .inner
            .read()
            .history
            .get(tenant_id)
            .and_then(|records| records.last().cloned()))
    }

    fn begin_charge(&self, intent: &ChargeIntent) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.intents.contains_key(&intent.idempotency_key) {
            return Err(StoreError::DuplicateIdempotencyKey {
                key: intent.idempotency_key.clone(),
            });
        }
        inner
            .intents
            .insert(intent.idempotency_key.clone(), intent.clone());
        Ok(())
    }

    fn mark_captured(&self, key: &str, gateway_reference: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let intent = inner.intents.get_mut(key).ok_or(StoreError::NotFound)?;
        intent.state = IntentState::Captured {
            gateway_reference: gateway_reference.to_string(),
        };
        intent.updated_at = chrono::Utc::now();
        Ok(())
    }

    fn abandon_charge(&self, key: &str) -> Result<()> {
        self.inner.write().intents.remove(key);
        Ok(())
    }

    fn get_charge_intent(&self, key: &str) -> Result<Option<ChargeIntent>> {
        Ok(self.inner.read().intents.get(key).cloned())
    }

    fn list_charge_intents(&self) -> Result<Vec<ChargeIntent>> {
        Ok(self.inner.read().intents.values().cloned().collect())
    }

    fn purge_tenant(&self, tenant_id: &TenantId, expected_version: u64) -> Result<()> {
        let mut inner = self.inner.write();
        check_purgeable(expected_version, inner.subscriptions.get(tenant_id))?;
        inner.subscriptions.remove(tenant_id);
        inner.history.remove(tenant_id);
        inner
            .idempotency
            .retain(|_, marker| marker.tenant_id != *tenant_id);
        Ok(())
    }
}
