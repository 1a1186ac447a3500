//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Subscriptions, keyed by `tenant_id`.
    pub const SUBSCRIPTIONS: &str = "subscriptions";

    /// Ledger entries, keyed by entry id (ULID).
    pub const LEDGER: &str = "ledger";

    /// Index: ledger entries by tenant, keyed by `tenant_id || sequence`.
    /// Value is the ledger entry id.
    pub const LEDGER_BY_TENANT: &str = "ledger_by_tenant";

    /// Committed idempotency keys, keyed by the key itself.
    pub const IDEMPOTENCY: &str = "idempotency";

    /// History records, keyed by `tenant_id || sequence`. The last key under
    /// a tenant prefix is the current record.
    pub const HISTORY: &str = "history";

    /// Open charge intents, keyed by idempotency key.
    pub const CHARGE_INTENTS: &str = "charge_intents";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::SUBSCRIPTIONS,
        cf::LEDGER,
        cf::LEDGER_BY_TENANT,
        cf::IDEMPOTENCY,
        cf::HISTORY,
        cf::CHARGE_INTENTS,
    ]
}
