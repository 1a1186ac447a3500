//! Storage layer for saas-billing.
//!
//! This crate persists subscriptions, the payment ledger, history records,
//! idempotency markers and charge intents. All writes that belong to one
//! lifecycle transition go through a single atomic [`Commit`].
//!
//! # Architecture
//!
//! The `RocksDB` backend uses the following column families:
//!
//! - `subscriptions`: one record per tenant, keyed by `tenant_id`
//! - `ledger`: ledger entries, keyed by entry id (ULID)
//! - `ledger_by_tenant`: index for listing a tenant's ledger newest first
//! - `idempotency`: committed idempotency keys
//! - `history`: per-tenant history, keyed by `tenant_id || sequence`
//! - `charge_intents`: open gateway charges awaiting their commit
//!
//! [`MemoryStore`] implements the same contract behind a single lock and is
//! used for development and tests.
//!
//! # Example
//!
//! ```no_run
//! use saas_billing_store::{RocksStore, Store};
//! use saas_billing_core::TenantId;
//!
//! let store = RocksStore::open("/tmp/saas-billing-db").unwrap();
//!
//! let tenant_id = TenantId::generate();
//! let subscription = store.get_subscription(&tenant_id).unwrap();
//! assert!(subscription.is_none());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod commit;
pub mod error;
#[cfg(feature = "rocksdb-backend")]
pub mod keys;
pub mod memory;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
pub mod schema;

#[cfg(test)]
mod conformance;

pub use commit::{Commit, HistoryWrite};
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

use saas_billing_core::{
    ChargeIntent, HistoryRecord, IdempotencyRecord, LedgerEntry, LedgerEntryId, Subscription,
    TenantId,
};

/// The storage trait defining all database operations.
///
/// There is deliberately no way to write a subscription or a history record
/// outside [`Store::create`] and [`Store::compare_and_update`].
pub trait Store: Send + Sync {
    // =========================================================================
    // Subscription Operations
    // =========================================================================

    /// Get a tenant's subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_subscription(&self, tenant_id: &TenantId) -> Result<Option<Subscription>>;

    /// List every stored subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_subscriptions(&self) -> Result<Vec<Subscription>>;

    /// Store the first subscription of a tenant. The stored version is 1.
    ///
    /// # Errors
    ///
    /// - `StoreError::AlreadyExists` if the tenant has a subscription.
    /// - `StoreError::DuplicateIdempotencyKey` if a claimed key was used.
    fn create(&self, commit: &Commit) -> Result<Subscription>;

    /// Replace a subscription if its stored version is `expected_version`.
    /// The stored version becomes `expected_version + 1`.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the tenant has no subscription.
    /// - `StoreError::Conflict` if the version moved.
    /// - `StoreError::DuplicateIdempotencyKey` if a claimed key was used.
    fn compare_and_update(
        &self,
        tenant_id: &TenantId,
        expected_version: u64,
        commit: &Commit,
    ) -> Result<Subscription>;

    // =========================================================================
    // Ledger Operations
    // =========================================================================

    /// Look up a committed idempotency key.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_idempotency(&self, key: &str) -> Result<Option<IdempotencyRecord>>;

    /// Get a ledger entry by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_ledger_entry(&self, entry_id: &LedgerEntryId) -> Result<Option<LedgerEntry>>;

    /// List a tenant's ledger entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_ledger_by_tenant(
        &self,
        tenant_id: &TenantId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>>;

    /// The tenant's most recent charge (positive entry).
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn latest_charge(&self, tenant_id: &TenantId) -> Result<Option<LedgerEntry>>;

    // =========================================================================
    // History Operations
    // =========================================================================

    /// A tenant's history, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_history(&self, tenant_id: &TenantId) -> Result<Vec<HistoryRecord>>;

    /// The tenant's current (newest) history record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn current_history(&self, tenant_id: &TenantId) -> Result<Option<HistoryRecord>>;

    // =========================================================================
    // Charge Intents
    // =========================================================================

    /// Record that a gateway charge is about to be made.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::DuplicateIdempotencyKey` if an intent with the
    /// same key is open.
    fn begin_charge(&self, intent: &ChargeIntent) -> Result<()>;

    /// Mark an intent as captured by the gateway but not committed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if no intent has the key.
    fn mark_captured(&self, key: &str, gateway_reference: &str) -> Result<()>;

    /// Delete an intent whose charge did not happen, or was resolved by hand.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn abandon_charge(&self, key: &str) -> Result<()>;

    /// Get an open intent.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_charge_intent(&self, key: &str) -> Result<Option<ChargeIntent>>;

    /// List every open intent.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_charge_intents(&self) -> Result<Vec<ChargeIntent>>;

    // =========================================================================
    // Retention
    // =========================================================================

    /// Delete a tenant's ended subscription, its history and idempotency
    /// markers. Ledger entries are kept.
    ///
    /// The subscription must be canceled or expired and still at
    /// `expected_version`, so a tenant that restarted after the caller read
    /// it is left alone.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the tenant has no subscription, and
    /// `StoreError::Conflict` if it is live or its version moved.
    fn purge_tenant(&self, tenant_id: &TenantId, expected_version: u64) -> Result<()>;
}
