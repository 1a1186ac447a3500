//! Key encoding utilities for `RocksDB`.
//!
//! Per-tenant lists (ledger index, history) are keyed by
//! `tenant_id (16 bytes) || sequence (8 bytes, big-endian)` so a prefix scan
//! returns them in insertion order and the last key is the newest.

use saas_billing_core::{LedgerEntryId, TenantId};

use crate::error::{Result, StoreError};

/// Length of a sequenced key.
pub const SEQUENCED_KEY_LEN: usize = 24;

/// Create a subscription key from a tenant ID.
#[must_use]
pub fn tenant_key(tenant_id: &TenantId) -> Vec<u8> {
    tenant_id.as_bytes().to_vec()
}

/// Create a ledger entry key from an entry ID.
#[must_use]
pub fn ledger_key(entry_id: &LedgerEntryId) -> Vec<u8> {
    entry_id.to_bytes().to_vec()
}

/// Create a per-tenant sequenced key.
///
/// Format: `tenant_id (16 bytes) || sequence (8 bytes, big-endian)`
#[must_use]
pub fn sequenced_key(tenant_id: &TenantId, sequence: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(SEQUENCED_KEY_LEN);
    key.extend_from_slice(tenant_id.as_bytes());
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

/// Create a prefix for iterating all sequenced keys of a tenant.
#[must_use]
pub fn tenant_prefix(tenant_id: &TenantId) -> Vec<u8> {
    tenant_id.as_bytes().to_vec()
}

/// Largest possible sequenced key of a tenant, for reverse seeks.
#[must_use]
pub fn tenant_prefix_end(tenant_id: &TenantId) -> Vec<u8> {
    sequenced_key(tenant_id, u64::MAX)
}

/// Extract the sequence number from a sequenced key.
///
/// # Errors
///
/// Returns `StoreError::Inconsistent` if the key has the wrong length.
pub fn sequence_of(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .get(16..SEQUENCED_KEY_LEN)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| StoreError::Inconsistent(format!("malformed sequenced key of {} bytes", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

/// Decode a ledger entry ID stored as an index value.
///
/// # Errors
///
/// Returns `StoreError::Inconsistent` if the value is not 16 bytes.
pub fn ledger_id_from_value(value: &[u8]) -> Result<LedgerEntryId> {
    let bytes: [u8; 16] = value
        .try_into()
        .map_err(|_| StoreError::Inconsistent(format!("malformed ledger index value of {} bytes", value.len())))?;
    Ok(LedgerEntryId::from_bytes(bytes))
}

/// Create an idempotency key.
#[must_use]
pub fn idempotency_key(key: &str) -> Vec<u8> {
    key.as_bytes().to_vec()
}

/// Create a charge intent key.
#[must_use]
pub fn intent_key(key: &str) -> Vec<u8> {
    key.as_bytes().to_vec()
}
