//! Plans and the price catalog.
//!
//! Prices live in a [`PlanCatalog`] snapshot that is loaded once and handed to
//! the lifecycle rules, so a price update never races an in-flight proration.
//! All amounts are integer minor currency units.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BillingError, Result};

// ============================================================================
// Defaults
// ============================================================================

/// Default monthly price of tier 1.
pub const DEFAULT_TIER1_PRICE: i64 = 39_000;

/// Default monthly price of tier 2.
pub const DEFAULT_TIER2_PRICE: i64 = 99_000;

/// Default monthly price of tier 3.
pub const DEFAULT_TIER3_PRICE: i64 = 199_000;

/// Default length of a trial in days.
pub const DEFAULT_TRIAL_DAYS: u32 = 14;

/// Default number of failed charges after which a past-due subscription expires.
pub const DEFAULT_MAX_PAYMENT_RETRIES: u32 = 3;

/// Default number of days a terminal subscription is retained before purge.
pub const DEFAULT_RETENTION_DAYS: u32 = 365;

/// A subscription plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    /// Free trial. Never charged.
    Trial,
    /// Entry tier.
    Tier1,
    /// Middle tier.
    Tier2,
    /// Top self-serve tier.
    Tier3,
    /// Enterprise contract, invoiced manually. Never auto-charged.
    Enterprise,
    /// Negotiated plan carrying its own monthly price.
    Custom {
        /// Display name of the negotiated plan.
        name: String,
        /// Monthly price.
        amount: i64,
    },
}

impl Plan {
    /// Whether this is the trial plan.
    #[must_use]
    pub const fn is_trial(&self) -> bool {
        matches!(self, Self::Trial)
    }

    /// Whether the plan is billed outside of the recurring charge cycle.
    #[must_use]
    pub const fn is_manually_billed(&self) -> bool {
        matches!(self, Self::Enterprise)
    }

    /// Ordering used to break ties between plans with the same price.
    #[must_use]
    pub const fn rank(&self) -> u8 {
        match self {
            Self::Trial => 0,
            Self::Tier1 => 1,
            Self::Tier2 => 2,
            Self::Tier3 => 3,
            Self::Custom { .. } => 4,
            Self::Enterprise => 5,
        }
    }

    /// Name shown on gateway receipts.
    #[must_use]
    pub fn display_name(&self) -> String {
        match self {
            Self::Trial => "Trial".to_string(),
            Self::Tier1 => "Tier 1".to_string(),
            Self::Tier2 => "Tier 2".to_string(),
            Self::Tier3 => "Tier 3".to_string(),
            Self::Enterprise => "Enterprise".to_string(),
            Self::Custom { name, .. } => name.clone(),
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trial => f.write_str("trial"),
            Self::Tier1 => f.write_str("tier1"),
            Self::Tier2 => f.write_str("tier2"),
            Self::Tier3 => f.write_str("tier3"),
            Self::Enterprise => f.write_str("enterprise"),
            Self::Custom { name, .. } => write!(f, "custom:{name}"),
        }
    }
}

/// Snapshot of list prices and trial length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanCatalog {
    /// Monthly price of tier 1.
    pub tier1: i64,
    /// Monthly price of tier 2.
    pub tier2: i64,
    /// Monthly price of tier 3.
    pub tier3: i64,
    /// Nominal monthly value of enterprise contracts (reporting only).
    pub enterprise: i64,
    /// Trial length in days.
    pub trial_days: u32,
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self {
            tier1: DEFAULT_TIER1_PRICE,
            tier2: DEFAULT_TIER2_PRICE,
            tier3: DEFAULT_TIER3_PRICE,
            enterprise: 0,
            trial_days: DEFAULT_TRIAL_DAYS,
        }
    }
}

impl PlanCatalog {
    /// List price of a plan.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAmount` for a custom plan with a non-positive price.
    pub fn price(&self, plan: &Plan) -> Result<i64> {
        match plan {
            Plan::Trial => Ok(0),
            Plan::Tier1 => Ok(self.tier1),
            Plan::Tier2 => Ok(self.tier2),
            Plan::Tier3 => Ok(self.tier3),
            Plan::Enterprise => Ok(self.enterprise),
            Plan::Custom { name, amount } => {
                if *amount <= 0 {
                    return Err(BillingError::InvalidAmount(format!(
                        "custom plan {name} must have a positive price, got {amount}"
                    )));
                }
                Ok(*amount)
            }
        }
    }

    /// Check that every configured tier price is usable.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if a tier is not positive or the trial is empty.
    pub fn validate(&self) -> Result<()> {
        for (name, price) in [("tier1", self.tier1), ("tier2", self.tier2), ("tier3", self.tier3)] {
            if price <= 0 {
                return Err(BillingError::Configuration(format!(
                    "{name} price must be positive, got {price}"
                )));
            }
        }
        if self.trial_days == 0 {
            return Err(BillingError::Configuration("trial_days must be at least 1".into()));
        }
        Ok(())
    }
}

/// Operator policy for recurring billing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingPolicy {
    /// Failed charges tolerated before a past-due subscription expires.
    pub max_payment_retries: u32,
    /// Days a terminal subscription is kept before it may be purged.
    pub retention_days: u32,
    /// Whether the sweep purges terminal subscriptions past retention.
    pub purge_enabled: bool,
}

impl Default for BillingPolicy {
    fn default() -> Self {
        Self {
            max_payment_retries: DEFAULT_MAX_PAYMENT_RETRIES,
            retention_days: DEFAULT_RETENTION_DAYS,
            purge_enabled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_prices() {
        let catalog = PlanCatalog::default();
        assert_eq!(catalog.price(&Plan::Tier1).unwrap(), 39_000);
        assert_eq!(catalog.price(&Plan::Tier2).unwrap(), 99_000);
        assert_eq!(catalog.price(&Plan::Trial).unwrap(), 0);
        catalog.validate().unwrap();
    }

    #[test]
    fn custom_plan_carries_its_own_price() {
        let plan = Plan::Custom {
            name: "Acme".into(),
            amount: 150_000,
        };
        assert_eq!(PlanCatalog::default().price(&plan).unwrap(), 150_000);
    }

    #[test]
    fn custom_plan_rejects_zero_price() {
        let plan = Plan::Custom {
            name: "Broken".into(),
            amount: 0,
        };
        assert!(matches!(
            PlanCatalog::default().price(&plan),
            Err(BillingError::InvalidAmount(_))
        ));
    }

    #[test]
    fn plan_serializes_as_snake_case() {
        assert_eq!(serde_json::to_string(&Plan::Tier2).unwrap(), "\"tier2\"");
        let parsed: Plan = serde_json::from_str("\"enterprise\"").unwrap();
        assert_eq!(parsed, Plan::Enterprise);
    }

    #[test]
    fn unknown_plan_is_rejected_at_the_boundary() {
        assert!(serde_json::from_str::<Plan>("\"platinum\"").is_err());
    }

    #[test]
    fn catalog_loads_partial_json() {
        let catalog: PlanCatalog = serde_json::from_str(r#"{"tier1": 10000}"#).unwrap();
        assert_eq!(catalog.tier1, 10_000);
        assert_eq!(catalog.tier2, DEFAULT_TIER2_PRICE);
    }

    #[test]
    fn validate_rejects_empty_trial() {
        let catalog = PlanCatalog {
            trial_days: 0,
            ..PlanCatalog::default()
        };
        assert!(catalog.validate().is_err());
    }
}
