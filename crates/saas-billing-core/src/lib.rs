//! Core types and subscription rules for saas-billing.
//!
//! This crate holds everything that does not touch storage or the network:
//!
//! - **Identifiers**: `TenantId`, `LedgerEntryId`, `HistoryId`
//! - **Plans**: `Plan`, `PlanCatalog`, `BillingPolicy`
//! - **Subscriptions**: `Subscription`, `SubscriptionStatus`, `PendingChange`
//! - **Ledger**: `LedgerEntry`, `IdempotencyRecord`, `ChargeIntent`
//! - **History**: `HistoryRecord`, `ChangeType`, `Actor`
//! - **Lifecycle**: `lifecycle::apply`, the state machine every caller goes through
//! - **Proration**: day-based upgrade and refund arithmetic
//!
//! # Amounts
//!
//! Amounts are `i64` in the currency's minor unit. Proration rounds half up
//! to the nearest unit; nothing in the crate uses floating point.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod history;
pub mod ids;
pub mod ledger;
pub mod lifecycle;
pub mod period;
pub mod plan;
pub mod proration;
pub mod subscription;

pub use error::{BillingError, Result};
pub use history::{Actor, ChangeType, HistoryAction, HistoryRecord};
pub use ids::{HistoryId, IdError, LedgerEntryId, TenantId};
pub use ledger::{ChargeIntent, EntryStatus, EntryType, IdempotencyRecord, IntentState, LedgerEntry};
pub use lifecycle::{ChangeMode, Charge, Context, Event, Refund, StartRequest, Transition};
pub use plan::{
    BillingPolicy, Plan, PlanCatalog, DEFAULT_MAX_PAYMENT_RETRIES, DEFAULT_RETENTION_DAYS,
    DEFAULT_TIER1_PRICE, DEFAULT_TIER2_PRICE, DEFAULT_TIER3_PRICE, DEFAULT_TRIAL_DAYS,
};
pub use proration::Proration;
pub use subscription::{
    BillingCredential, CancelMode, Cancellation, PendingChange, PricePolicy, Subscription,
    SubscriptionStatus,
};
