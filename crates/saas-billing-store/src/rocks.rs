//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.
//! Commits are applied as a single `WriteBatch`. The read-check-write around
//! each batch holds striped locks: one stripe for the tenant and one for each
//! idempotency key the batch claims, so commits for unrelated tenants and
//! keys run in parallel.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use tracing::{debug, info};

use saas_billing_core::{
    ChargeIntent, HistoryRecord, IdempotencyRecord, IntentState, LedgerEntry, LedgerEntryId,
    Subscription, TenantId,
};

use crate::commit::{check_purgeable, next_version, Commit, HistoryWrite};
use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::Store;

const LOCK_STRIPES: usize = 64;

fn stripe_of<T: Hash + ?Sized>(value: &T) -> usize {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    usize::try_from(hasher.finish() % LOCK_STRIPES as u64).unwrap_or_default()
}

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    commit_locks: [Mutex<()>; LOCK_STRIPES],
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path.as_ref(), cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        info!(path = %path.as_ref().display(), "Opened RocksDB store");

        Ok(Self {
            db: Arc::new(db),
            commit_locks: std::array::from_fn(|_| Mutex::new(())),
        })
    }

    /// Lock the stripes guarding `tenant_id` and `claimed`.
    ///
    /// Stripes are taken in index order, so overlapping callers cannot
    /// deadlock.
    fn lock_stripes(
        &self,
        tenant_id: Option<&TenantId>,
        claimed: &[&str],
    ) -> Vec<MutexGuard<'_, ()>> {
        let stripes: BTreeSet<usize> = tenant_id
            .map(|t| stripe_of(&("tenant", t)))
            .into_iter()
            .chain(claimed.iter().map(|key| stripe_of(&("key", *key))))
            .collect();
        stripes
            .into_iter()
            .map(|index| self.commit_locks[index].lock())
            .collect()
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn get_value<T: serde::de::DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    /// All `(key, value)` pairs under a tenant prefix, in key order.
    fn scan_prefix(&self, cf_name: &str, tenant_id: &TenantId) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let cf = self.cf(cf_name)?;
        let prefix = keys::tenant_prefix(tenant_id);

        let mut items = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            items.push((key, value));
        }
        Ok(items)
    }

    /// The last `(key, value)` under a tenant prefix.
    fn last_in_prefix(&self, cf_name: &str, tenant_id: &TenantId) -> Result<Option<(Box<[u8]>, Box<[u8]>)>> {
        let cf = self.cf(cf_name)?;
        let prefix = keys::tenant_prefix(tenant_id);
        let end = keys::tenant_prefix_end(tenant_id);

        let mut iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&end, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
                Ok(key.starts_with(&prefix).then_some((key, value)))
            }
            None => Ok(None),
        }
    }

    fn next_sequence(&self, cf_name: &str, tenant_id: &TenantId) -> Result<u64> {
        match self.last_in_prefix(cf_name, tenant_id)? {
            Some((key, _)) => Ok(keys::sequence_of(&key)? + 1),
            None => Ok(0),
        }
    }

    fn current_history_entry(&self, tenant_id: &TenantId) -> Result<Option<(u64, HistoryRecord)>> {
        self.last_in_prefix(cf::HISTORY, tenant_id)?
            .map(|(key, value)| Ok((keys::sequence_of(&key)?, Self::deserialize(&value)?)))
            .transpose()
    }

    /// Validate and apply a commit. `expected = None` means create.
    fn write_commit(&self, expected: Option<u64>, commit: &Commit) -> Result<Subscription> {
        let tenant_id = commit.subscription.tenant_id;
        let mut claimed = commit.claimed_keys();
        claimed.extend(commit.resolve_intent.as_deref());
        let _guards = self.lock_stripes(Some(&tenant_id), &claimed);

        let stored = self.get_subscription(&tenant_id)?;
        let version = next_version(expected, stored.map(|s| s.version))?;

        for key in commit.claimed_keys() {
            if self.find_idempotency(key)?.is_some() {
                return Err(StoreError::DuplicateIdempotencyKey { key: key.to_string() });
            }
        }

        let subscription = commit.stamped(version);

        let cf_subs = self.cf(cf::SUBSCRIPTIONS)?;
        let cf_history = self.cf(cf::HISTORY)?;
        let mut batch = WriteBatch::default();

        batch.put_cf(&cf_subs, keys::tenant_key(&tenant_id), Self::serialize(&subscription)?);

        let current = self.current_history_entry(&tenant_id)?;
        let sequence = match (&commit.history, &current) {
            (HistoryWrite::Amend { .. }, Some((sequence, _))) => *sequence,
            (_, Some((sequence, _))) => sequence + 1,
            (_, None) => 0,
        };
        let record = commit.history_record(&subscription, current.map(|(_, record)| record))?;
        batch.put_cf(
            &cf_history,
            keys::sequenced_key(&tenant_id, sequence),
            Self::serialize(&record)?,
        );

        if let Some(entry) = &commit.ledger {
            let cf_ledger = self.cf(cf::LEDGER)?;
            let cf_by_tenant = self.cf(cf::LEDGER_BY_TENANT)?;
            let sequence = self.next_sequence(cf::LEDGER_BY_TENANT, &tenant_id)?;
            batch.put_cf(&cf_ledger, keys::ledger_key(&entry.id), Self::serialize(entry)?);
            batch.put_cf(
                &cf_by_tenant,
                keys::sequenced_key(&tenant_id, sequence),
                entry.id.to_bytes(),
            );
        }

        if let Some(marker) = &commit.idempotency {
            let cf_idem = self.cf(cf::IDEMPOTENCY)?;
            batch.put_cf(&cf_idem, keys::idempotency_key(&marker.key), Self::serialize(marker)?);
        }

        if let Some(key) = &commit.resolve_intent {
            let cf_intents = self.cf(cf::CHARGE_INTENTS)?;
            batch.delete_cf(&cf_intents, keys::intent_key(key));
        }

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(tenant_id = %tenant_id, version, "Committed subscription");
        Ok(subscription)
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Subscription Operations
    // =========================================================================

    fn get_subscription(&self, tenant_id: &TenantId) -> Result<Option<Subscription>> {
        self.get_value(cf::SUBSCRIPTIONS, &keys::tenant_key(tenant_id))
    }

    fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        let cf = self.cf(cf::SUBSCRIPTIONS)?;
        let mut subscriptions = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            subscriptions.push(Self::deserialize(&value)?);
        }
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

    // =========================================================================
    // Ledger Operations
    // =========================================================================

    fn find_idempotency(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        self.get_value(cf::IDEMPOTENCY, &keys::idempotency_key(key))
    }

    fn get_ledger_entry(&self, entry_id: &LedgerEntryId) -> Result<Option<LedgerEntry>> {
        self.get_value(cf::LEDGER, &keys::ledger_key(entry_id))
    }

    fn list_ledger_by_tenant(
        &self,
        tenant_id: &TenantId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let mut index = self.scan_prefix(cf::LEDGER_BY_TENANT, tenant_id)?;
        index.reverse();

        let mut entries = Vec::new();
        for (_, value) in index.into_iter().skip(offset).take(limit) {
            let entry_id = keys::ledger_id_from_value(&value)?;
            if let Some(entry) = self.get_ledger_entry(&entry_id)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    fn latest_charge(&self, tenant_id: &TenantId) -> Result<Option<LedgerEntry>> {
        let index = self.scan_prefix(cf::LEDGER_BY_TENANT, tenant_id)?;
        for (_, value) in index.into_iter().rev() {
            let entry_id = keys::ledger_id_from_value(&value)?;
            if let Some(entry) = self.get_ledger_entry(&entry_id)? {
                if entry.is_charge() {
                    return Ok(Some(entry));
                }
            }
        }
        Ok(None)
    }

    // =========================================================================
    // History Operations
    // =========================================================================

    fn list_history(&self, tenant_id: &TenantId) -> Result<Vec<HistoryRecord>> {
        self.scan_prefix(cf::HISTORY, tenant_id)?
            .into_iter()
            .map(|(_, value)| Self::deserialize(&value))
            .collect()
    }

    fn current_history(&self, tenant_id: &TenantId) -> Result<Option<HistoryRecord>> {
        Ok(self.current_history_entry(tenant_id)?.map(|(_, record)| record))
    }

    // =========================================================================
    // Charge Intents
    // =========================================================================

    fn begin_charge(&self, intent: &ChargeIntent) -> Result<()> {
        let _guards = self.lock_stripes(None, &[intent.idempotency_key.as_str()]);
        let key = keys::intent_key(&intent.idempotency_key);

        if self.get_value::<ChargeIntent>(cf::CHARGE_INTENTS, &key)?.is_some() {
            return Err(StoreError::DuplicateIdempotencyKey {
                key: intent.idempotency_key.clone(),
            });
        }

        let cf = self.cf(cf::CHARGE_INTENTS)?;
        self.db
            .put_cf(&cf, key, Self::serialize(intent)?)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn mark_captured(&self, key: &str, gateway_reference: &str) -> Result<()> {
        let _guards = self.lock_stripes(None, &[key]);
        let intent_key = keys::intent_key(key);

        let mut intent: ChargeIntent = self
            .get_value(cf::CHARGE_INTENTS, &intent_key)?
            .ok_or(StoreError::NotFound)?;
        intent.state = IntentState::Captured {
            gateway_reference: gateway_reference.to_string(),
        };
        intent.updated_at = chrono::Utc::now();

        let cf = self.cf(cf::CHARGE_INTENTS)?;
        self.db
            .put_cf(&cf, intent_key, Self::serialize(&intent)?)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn abandon_charge(&self, key: &str) -> Result<()> {
        let cf = self.cf(cf::CHARGE_INTENTS)?;
        self.db
            .delete_cf(&cf, keys::intent_key(key))
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn get_charge_intent(&self, key: &str) -> Result<Option<ChargeIntent>> {
        self.get_value(cf::CHARGE_INTENTS, &keys::intent_key(key))
    }

    fn list_charge_intents(&self) -> Result<Vec<ChargeIntent>> {
        let cf = self.cf(cf::CHARGE_INTENTS)?;
        let mut intents = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            intents.push(Self::deserialize(&value)?);
        }
        Ok(intents)
    }

    // =========================================================================
    // Retention
    // =========================================================================

    fn purge_tenant(&self, tenant_id: &TenantId, expected_version: u64) -> Result<()> {
        let _guards = self.lock_stripes(Some(tenant_id), &[]);

        check_purgeable(expected_version, self.get_subscription(tenant_id)?.as_ref())?;

        let cf_subs = self.cf(cf::SUBSCRIPTIONS)?;
        let cf_history = self.cf(cf::HISTORY)?;
        let cf_idem = self.cf(cf::IDEMPOTENCY)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_subs, keys::tenant_key(tenant_id));

        let history = self.scan_prefix(cf::HISTORY, tenant_id)?;
        let history_count = history.len();
        for (key, _) in history {
            batch.delete_cf(&cf_history, key);
        }

        for item in self.db.iterator_cf(&cf_idem, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            let marker: IdempotencyRecord = Self::deserialize(&value)?;
            if marker.tenant_id == *tenant_id {
                batch.delete_cf(&cf_idem, key);
            }
        }

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        info!(tenant_id = %tenant_id, history_records = history_count, "Purged tenant");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn create_then_update() {
        let (store, _dir) = create_test_store();
        conformance::create_then_update(&store);
    }

    #[test]
    fn stale_version_conflicts() {
        let (store, _dir) = create_test_store();
        conformance::stale_version_conflicts(&store);
    }

    #[test]
    fn idempotency_key_is_unique() {
        let (store, _dir) = create_test_store();
        conformance::idempotency_key_is_unique(&store);
    }

    #[test]
    fn history_append_and_amend() {
        let (store, _dir) = create_test_store();
        conformance::history_append_and_amend(&store);
    }

    #[test]
    fn ledger_newest_first_with_pagination() {
        let (store, _dir) = create_test_store();
        conformance::ledger_newest_first_with_pagination(&store);
    }

    #[test]
    fn charge_intent_lifecycle() {
        let (store, _dir) = create_test_store();
        conformance::charge_intent_lifecycle(&store);
    }

    #[test]
    fn purge_keeps_ledger() {
        let (store, _dir) = create_test_store();
        conformance::purge_keeps_ledger(&store);
    }

    #[test]
    fn purge_leaves_live_or_moved_subscription() {
        let (store, _dir) = create_test_store();
        conformance::purge_leaves_live_or_moved_subscription(&store);
    }

    #[test]
    fn shared_key_is_claimed_once_across_tenants() {
        let (store, _dir) = create_test_store();
        conformance::shared_key_is_claimed_once_across_tenants(&store);
    }

    #[test]
    fn data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let tenant_id = {
            let store = RocksStore::open(dir.path()).unwrap();
            conformance::create_then_update(&store)
        };

        let store = RocksStore::open(dir.path()).unwrap();
        let subscription = store.get_subscription(&tenant_id).unwrap().unwrap();
        assert_eq!(subscription.version, 2);
        assert_eq!(store.list_history(&tenant_id).unwrap().len(), 1);
    }
}
