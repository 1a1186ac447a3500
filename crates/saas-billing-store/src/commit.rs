//! Atomic write unit.
//!
//! A [`Commit`] carries everything one lifecycle transition writes. Both
//! backends apply it all-or-nothing after the same checks: version match,
//! unused idempotency keys, and a current history record to amend.

use chrono::{DateTime, Utc};
use saas_billing_core::{HistoryRecord, IdempotencyRecord, LedgerEntry, Subscription};

use crate::error::{Result, StoreError};

/// What a commit does to the tenant's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryWrite {
    /// Append a new current record.
    Append(HistoryRecord),
    /// Refresh the current record from the committed subscription.
    Amend {
        /// Time of the edit.
        at: DateTime<Utc>,
        /// Note to attach, if any.
        note: Option<String>,
    },
}

/// Everything written by one transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Subscription after the transition. Its `version` is assigned by the store.
    pub subscription: Subscription,
    /// History effect.
    pub history: HistoryWrite,
    /// Ledger entry for money moved, if any.
    pub ledger: Option<LedgerEntry>,
    /// Marker for the request's idempotency key.
    pub idempotency: Option<IdempotencyRecord>,
    /// Charge intent to delete.
    pub resolve_intent: Option<String>,
}

impl Commit {
    /// Commit that only changes the subscription and its history.
    #[must_use]
    pub fn new(subscription: Subscription, history: HistoryWrite) -> Self {
        Self {
            subscription,
            history,
            ledger: None,
            idempotency: None,
            resolve_intent: None,
        }
    }

    /// Idempotency keys this commit claims.
    pub(crate) fn claimed_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .idempotency
            .iter()
            .map(|r| r.key.as_str())
            .chain(self.ledger.iter().filter_map(|e| e.idempotency_key.as_deref()))
            .collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }

    /// The subscription as it will be stored.
    pub(crate) fn stamped(&self, version: u64) -> Subscription {
        let mut subscription = self.subscription.clone();
        subscription.version = version;
        subscription
    }

    /// The history record to write given the tenant's current record.
    pub(crate) fn history_record(
        &self,
        stored: &Subscription,
        current: Option<HistoryRecord>,
    ) -> Result<HistoryRecord> {
        match &self.history {
            HistoryWrite::Append(record) => Ok(record.clone()),
            HistoryWrite::Amend { at, note } => {
                let mut record = current.ok_or_else(|| {
                    StoreError::Inconsistent(format!(
                        "no history record to amend for tenant {}",
                        stored.tenant_id
                    ))
                })?;
                record.amend_from(stored, *at, note.clone());
                Ok(record)
            }
        }
    }
}

/// Version to store, given the caller's expectation and the stored version.
///
/// `expected = None` means create.
pub(crate) fn next_version(expected: Option<u64>, stored: Option<u64>) -> Result<u64> {
    match (expected, stored) {
        (None, None) => Ok(1),
        (None, Some(_)) => Err(StoreError::AlreadyExists),
        (Some(_), None) => Err(StoreError::NotFound),
        (Some(expected), Some(actual)) if expected != actual => {
            Err(StoreError::Conflict { expected, actual })
        }
        (Some(expected), Some(_)) => Ok(expected + 1),
    }
}

/// Checks that a stored subscription may be purged by a caller that read
/// `expected` as its version.
///
/// Only an ended subscription the caller has seen at its current version
/// qualifies; anything else reports a conflict.
pub(crate) fn check_purgeable(expected: u64, stored: Option<&Subscription>) -> Result<()> {
    let stored = stored.ok_or(StoreError::NotFound)?;
    if stored.version != expected || !stored.status.is_terminal() {
        return Err(StoreError::Conflict {
            expected,
            actual: stored.version,
        });
    }
    Ok(())
}
