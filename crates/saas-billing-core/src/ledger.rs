//! Payment ledger types.
//!
//! The ledger is append-only. Charges carry positive amounts and refunds
//! negative ones. A non-null idempotency key appears on at most one entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{LedgerEntryId, TenantId};

/// Why money moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// First charge of a new subscription.
    FirstPayment,
    /// Recovery of a past-due subscription.
    Retry,
    /// Prorated upgrade, or a renewal applying a scheduled upgrade.
    Upgrade,
    /// Renewal applying a scheduled downgrade.
    Downgrade,
    /// Conversion of a trial into a paid plan.
    TrialConvert,
    /// Ordinary recurring charge.
    Renewal,
    /// Money returned to the tenant.
    Refund,
}

impl EntryType {
    /// Snake-case name, as used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FirstPayment => "first_payment",
            Self::Retry => "retry",
            Self::Upgrade => "upgrade",
            Self::Downgrade => "downgrade",
            Self::TrialConvert => "trial_convert",
            Self::Renewal => "renewal",
            Self::Refund => "refund",
        }
    }

    /// Charges made by the scheduler rather than on request.
    #[must_use]
    pub const fn is_recurring(self) -> bool {
        matches!(
            self,
            Self::Renewal | Self::TrialConvert | Self::Retry | Self::Upgrade | Self::Downgrade
        )
    }
}

/// Settlement state of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Settled charge.
    Done,
    /// Money returned against an earlier charge.
    Refunded,
}

/// One immutable ledger line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Entry id (time-ordered).
    pub id: LedgerEntryId,
    /// Order id sent to the gateway.
    pub order_id: String,
    /// Tenant charged or refunded.
    pub tenant_id: TenantId,
    /// Signed amount: positive for charges, negative for refunds.
    pub amount: i64,
    /// Why money moved.
    pub entry_type: EntryType,
    /// Key of the request that produced this entry.
    pub idempotency_key: Option<String>,
    /// Gateway reference of the payment.
    pub gateway_reference: String,
    /// Settlement state at the time the entry was written.
    pub status: EntryStatus,
    /// Order id of the charge a refund returns money for.
    pub refund_of: Option<String>,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Build a charge entry.
    #[must_use]
    pub fn charge(
        tenant_id: TenantId,
        order_id: String,
        amount: i64,
        entry_type: EntryType,
        gateway_reference: String,
        idempotency_key: Option<String>,
    ) -> Self {
        Self {
            id: LedgerEntryId::generate(),
            order_id,
            tenant_id,
            amount,
            entry_type,
            idempotency_key,
            gateway_reference,
            status: EntryStatus::Done,
            refund_of: None,
            created_at: Utc::now(),
        }
    }

    /// Build a refund entry for the charge `original`.
    #[must_use]
    pub fn refund(
        original: &Self,
        amount: i64,
        gateway_reference: String,
        idempotency_key: Option<String>,
    ) -> Self {
        Self {
            id: LedgerEntryId::generate(),
            order_id: format!("{}-refund", original.order_id),
            tenant_id: original.tenant_id,
            amount: -amount.abs(),
            entry_type: EntryType::Refund,
            idempotency_key,
            gateway_reference,
            status: EntryStatus::Refunded,
            refund_of: Some(original.order_id.clone()),
            created_at: Utc::now(),
        }
    }

    /// Whether this entry took money from the tenant.
    #[must_use]
    pub fn is_charge(&self) -> bool {
        self.amount > 0 && self.entry_type != EntryType::Refund
    }
}

/// Marker that a request with a given idempotency key was committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// The request key.
    pub key: String,
    /// Tenant the request targeted.
    pub tenant_id: TenantId,
    /// Ledger entry written by the request, if it moved money.
    pub ledger_entry_id: Option<LedgerEntryId>,
    /// When the request was committed.
    pub recorded_at: DateTime<Utc>,
}

/// Progress of a charge between the gateway call and the store commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum IntentState {
    /// Written before calling the gateway.
    Pending,
    /// Gateway captured the payment but the commit did not land.
    Captured {
        /// Gateway reference of the captured payment.
        gateway_reference: String,
    },
}

/// Journal entry guarding one gateway charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeIntent {
    /// Idempotency key of the request.
    pub idempotency_key: String,
    /// Order id sent to the gateway.
    pub order_id: String,
    /// Tenant being charged.
    pub tenant_id: TenantId,
    /// Amount being charged.
    pub amount: i64,
    /// Why money is moving.
    pub entry_type: EntryType,
    /// Progress.
    pub state: IntentState,
    /// When the intent was opened.
    pub created_at: DateTime<Utc>,
    /// When the intent last changed.
    pub updated_at: DateTime<Utc>,
}

impl ChargeIntent {
    /// Open a pending intent.
    #[must_use]
    pub fn pending(
        idempotency_key: String,
        order_id: String,
        tenant_id: TenantId,
        amount: i64,
        entry_type: EntryType,
    ) -> Self {
        let now = Utc::now();
        Self {
            idempotency_key,
            order_id,
            tenant_id,
            amount,
            entry_type,
            state: IntentState::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether money is known to have moved without being recorded.
    #[must_use]
    pub fn needs_reconciliation(&self) -> bool {
        matches!(self.state, IntentState::Captured { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refund_entry_is_negative_and_linked() {
        let tenant = TenantId::generate();
        let charge = LedgerEntry::charge(
            tenant,
            "ord-1".into(),
            39_000,
            EntryType::FirstPayment,
            "pay_1".into(),
            Some("key-1".into()),
        );
        let refund = LedgerEntry::refund(&charge, 13_000, "pay_1".into(), None);

        assert!(charge.is_charge());
        assert!(!refund.is_charge());
        assert_eq!(refund.amount, -13_000);
        assert_eq!(refund.refund_of.as_deref(), Some("ord-1"));
        assert_eq!(refund.entry_type, EntryType::Refund);
        assert_eq!(refund.status, EntryStatus::Refunded);
    }

    #[test]
    fn entry_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&EntryType::TrialConvert).unwrap(),
            "\"trial_convert\""
        );
        assert_eq!(EntryType::FirstPayment.as_str(), "first_payment");
    }

    #[test]
    fn captured_intent_needs_reconciliation() {
        let mut intent = ChargeIntent::pending(
            "k".into(),
            "o".into(),
            TenantId::generate(),
            100,
            EntryType::Renewal,
        );
        assert!(!intent.needs_reconciliation());
        intent.state = IntentState::Captured {
            gateway_reference: "pay".into(),
        };
        assert!(intent.needs_reconciliation());
    }
}
