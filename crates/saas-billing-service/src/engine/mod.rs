//! Lifecycle engine.
//!
//! Every mutating operation, whether it comes from an HTTP handler, the
//! gateway webhook or the daily sweep, goes through [`Engine::execute`]:
//!
//! 1. Replay the committed result if the idempotency key was already used.
//! 2. Read the subscription and compute the [`Transition`] with
//!    [`lifecycle::apply`].
//! 3. Move money if the transition asks for it, guarded by a charge intent.
//! 4. Write subscription, ledger entry, history and idempotency marker in one
//!    store commit conditioned on the version read in step 2.
//!
//! A version conflict re-runs steps 2-4, at most [`MAX_ATTEMPTS`] times.
//! Once money has moved, a failed commit leaves a captured intent behind and
//! the operation fails with `ReconciliationRequired`.

pub mod sweep;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use saas_billing_core::lifecycle::{self, Charge, Context, Event, Refund, Transition};
use saas_billing_core::{
    Actor, BillingCredential, BillingError, BillingPolicy, ChargeIntent, EntryType,
    HistoryAction, HistoryRecord, IdempotencyRecord, IntentState, LedgerEntry, PlanCatalog,
    Proration, Result, Subscription, TenantId,
};
use saas_billing_store::{Commit, HistoryWrite, Store, StoreError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::gateway::{ChargeRequest, GatewayError, PaymentGateway};

pub use sweep::{SweepFailure, SweepReport};

/// Read-apply-commit attempts before an operation fails with `Conflict`.
pub const MAX_ATTEMPTS: u32 = 3;

/// Default bound on a single gateway call.
pub const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(20);

/// Default number of tenants the sweep processes at once.
pub const DEFAULT_SWEEP_CONCURRENCY: usize = 8;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retry and retention policy.
    pub policy: BillingPolicy,
    /// Upper bound on each gateway call.
    pub gateway_timeout: Duration,
    /// Tenants processed concurrently by the sweep.
    pub sweep_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: BillingPolicy::default(),
            gateway_timeout: DEFAULT_GATEWAY_TIMEOUT,
            sweep_concurrency: DEFAULT_SWEEP_CONCURRENCY,
        }
    }
}

/// One request to change a subscription.
#[derive(Debug, Clone)]
pub struct Command {
    /// Target tenant.
    pub tenant_id: TenantId,
    /// What to do.
    pub event: Event,
    /// Who asked.
    pub actor: Actor,
    /// Client-supplied key. One is generated when absent.
    pub idempotency_key: Option<String>,
    /// Clock reading the transition is computed against.
    pub now: DateTime<Utc>,
}

impl Command {
    /// A command evaluated at the current time.
    #[must_use]
    pub fn new(tenant_id: TenantId, event: Event, actor: Actor) -> Self {
        Self {
            tenant_id,
            event,
            actor,
            idempotency_key: None,
            now: Utc::now(),
        }
    }

    /// Set the idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    /// Evaluate the command at `now`.
    #[must_use]
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }
}

/// Result of a committed (or replayed) command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Subscription as stored.
    pub subscription: Subscription,
    /// Ledger entry written by the command, if it moved money.
    pub ledger_entry: Option<LedgerEntry>,
    /// Breakdown of an immediate upgrade. Not kept for replays.
    pub proration: Option<Proration>,
    /// Whether this is the stored result of an earlier request.
    pub replayed: bool,
}

/// Money that moved at the gateway within one `execute` call.
struct Settlement {
    /// Signed amount the transition asked for, before any cap.
    requested: i64,
    entry: LedgerEntry,
}

/// Subscription lifecycle engine.
pub struct Engine {
    store: Arc<dyn Store>,
    gateway: Arc<dyn PaymentGateway>,
    catalog: Arc<PlanCatalog>,
    config: EngineConfig,
}

impl Engine {
    /// Create a new engine.
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        catalog: Arc<PlanCatalog>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            catalog,
            config,
        }
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The price catalog snapshot.
    #[must_use]
    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// The billing policy.
    #[must_use]
    pub fn policy(&self) -> &BillingPolicy {
        &self.config.policy
    }

    fn context(&self, now: DateTime<Utc>) -> Context<'_> {
        Context {
            now,
            catalog: &self.catalog,
            policy: &self.config.policy,
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Apply `command` and persist the result.
    ///
    /// # Errors
    ///
    /// - `NotFound` / `InvalidTransition` when the lifecycle rejects the event.
    /// - `Gateway` when the charge or refund was declined.
    /// - `Conflict` when the subscription kept changing underneath, or a
    ///   request with the same key is in flight.
    /// - `ReconciliationRequired` when money moved but could not be recorded.
    pub async fn execute(&self, command: Command) -> Result<Outcome> {
        let tenant_id = command.tenant_id;
        // Unkeyed commands still need a key for the charge intent, but
        // leave no idempotency record behind.
        let key = match &command.idempotency_key {
            Some(key) => {
                if let Some(outcome) = self.replay(&tenant_id, key)? {
                    return Ok(outcome);
                }
                key.clone()
            }
            None => format!("auto:{}", Uuid::new_v4().simple()),
        };

        let mut settled: Option<Settlement> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let current = match self.store.get_subscription(&tenant_id) {
                Ok(current) => current,
                Err(e) => return Err(self.unwind(&key, settled.as_ref(), e.into())),
            };

            let transition = match lifecycle::apply(
                tenant_id,
                current.as_ref(),
                &command.event,
                &self.context(command.now),
            ) {
                Ok(transition) => transition,
                Err(e) => return Err(self.unwind(&key, settled.as_ref(), e)),
            };

            let entry = match (&settled, requested_amount(&transition)) {
                (None, None) => None,
                (Some(settlement), Some(amount)) if settlement.requested == amount => {
                    debug!(
                        tenant_id = %tenant_id,
                        attempt,
                        "Reusing captured payment for recomputed transition"
                    );
                    Some(settlement.entry.clone())
                }
                (Some(_), _) => {
                    let err = BillingError::Conflict {
                        tenant_id: tenant_id.to_string(),
                    };
                    return Err(self.unwind(&key, settled.as_ref(), err));
                }
                (None, Some(_)) => {
                    let moved = if let Some(charge) = &transition.charge {
                        match self.collect(&command, &transition, charge, &key).await {
                            Ok(settlement) => Some(settlement),
                            Err(err) => {
                                return Err(self.charge_failed(
                                    &command,
                                    current.as_ref(),
                                    charge,
                                    err,
                                ));
                            }
                        }
                    } else if let Some(refund) = &transition.refund {
                        self.pay_back(&command, refund, &key).await?
                    } else {
                        None
                    };
                    let entry = moved.as_ref().map(|s| s.entry.clone());
                    settled = moved;
                    entry
                }
            };

            let commit = build_commit(
                &command,
                &transition,
                entry.clone(),
                settled.is_some().then_some(key.as_str()),
            );
            let result = match &current {
                Some(current) => self
                    .store
                    .compare_and_update(&tenant_id, current.version, &commit),
                None => self.store.create(&commit),
            };

            match result {
                Ok(subscription) => {
                    info!(
                        tenant_id = %tenant_id,
                        event = command.event.name(),
                        actor = %command.actor,
                        status = %subscription.status,
                        version = subscription.version,
                        amount = entry.as_ref().map_or(0, |e| e.amount),
                        "Subscription transition committed"
                    );
                    return Ok(Outcome {
                        subscription,
                        ledger_entry: entry,
                        proration: transition.proration,
                        replayed: false,
                    });
                }
                Err(
                    StoreError::Conflict { .. } | StoreError::AlreadyExists | StoreError::NotFound,
                ) => {
                    warn!(
                        tenant_id = %tenant_id,
                        event = command.event.name(),
                        attempt,
                        "Subscription changed concurrently, retrying"
                    );
                }
                Err(StoreError::DuplicateIdempotencyKey { .. }) if settled.is_none() => {
                    // A concurrent request with the same key committed first.
                    return match self.replay(&tenant_id, &key)? {
                        Some(outcome) => Ok(outcome),
                        None => Err(BillingError::Conflict {
                            tenant_id: tenant_id.to_string(),
                        }),
                    };
                }
                Err(e) => return Err(self.unwind(&key, settled.as_ref(), e.into())),
            }
        }

        let err = BillingError::Conflict {
            tenant_id: tenant_id.to_string(),
        };
        Err(self.unwind(&key, settled.as_ref(), err))
    }

    /// The stored result for `key`, if a request with it was committed.
    ///
    /// # Errors
    ///
    /// `DuplicateRequest` if the key was used for another tenant.
    pub fn replay(&self, tenant_id: &TenantId, key: &str) -> Result<Option<Outcome>> {
        let Some(record) = self.store.find_idempotency(key)? else {
            return Ok(None);
        };
        if record.tenant_id != *tenant_id {
            return Err(BillingError::DuplicateRequest {
                key: key.to_string(),
            });
        }

        let subscription = self
            .store
            .get_subscription(tenant_id)?
            .ok_or_else(|| BillingError::NotFound {
                tenant_id: tenant_id.to_string(),
            })?;
        let ledger_entry = match record.ledger_entry_id {
            Some(id) => self.store.get_ledger_entry(&id)?,
            None => None,
        };

        debug!(tenant_id = %tenant_id, key = %key, "Replaying committed request");
        Ok(Some(Outcome {
            subscription,
            ledger_entry,
            proration: None,
            replayed: true,
        }))
    }

    /// Exchange a card authorization code for a billing credential.
    ///
    /// # Errors
    ///
    /// `Gateway` if the provider rejects the code.
    pub async fn issue_credential(
        &self,
        tenant_id: &TenantId,
        auth_code: &str,
        customer_email: Option<String>,
    ) -> Result<BillingCredential> {
        let customer_key = tenant_id.to_string();
        let issued = self
            .bounded(self.gateway.issue_billing_token(auth_code, &customer_key))
            .await?;

        info!(tenant_id = %tenant_id, "Billing token issued");
        Ok(BillingCredential {
            token: issued.token,
            card_summary: issued.card_summary,
            customer_email,
        })
    }

    /// Register a new card on an existing subscription.
    ///
    /// # Errors
    ///
    /// `NotFound` if the tenant has no subscription, otherwise as
    /// [`Engine::issue_credential`] and [`Engine::execute`].
    pub async fn register_billing_token(
        &self,
        tenant_id: TenantId,
        auth_code: &str,
        customer_email: Option<String>,
        actor: Actor,
        idempotency_key: Option<String>,
    ) -> Result<Outcome> {
        if let Some(key) = &idempotency_key {
            if let Some(outcome) = self.replay(&tenant_id, key)? {
                return Ok(outcome);
            }
        }
        if self.store.get_subscription(&tenant_id)?.is_none() {
            return Err(BillingError::NotFound {
                tenant_id: tenant_id.to_string(),
            });
        }

        let credential = self
            .issue_credential(&tenant_id, auth_code, customer_email)
            .await?;
        let command = Command::new(tenant_id, Event::UpdateCredential(credential), actor)
            .with_idempotency_key(idempotency_key);
        self.execute(command).await
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Charge intents whose payment moved without being recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub fn unreconciled(&self) -> Result<Vec<ChargeIntent>> {
        Ok(self
            .store
            .list_charge_intents()?
            .into_iter()
            .filter(ChargeIntent::needs_reconciliation)
            .collect())
    }

    /// Close an open intent, optionally returning the captured money.
    ///
    /// Returns the intent as it was before it was closed, or `None` if no
    /// intent has the key.
    ///
    /// # Errors
    ///
    /// `Gateway` if the refund fails; the intent then stays open.
    pub async fn resolve_reconciliation(
        &self,
        key: &str,
        refund: bool,
    ) -> Result<Option<ChargeIntent>> {
        let Some(intent) = self.store.get_charge_intent(key)? else {
            return Ok(None);
        };

        if let (true, IntentState::Captured { gateway_reference }) = (refund, &intent.state) {
            if intent.amount > 0 {
                self.bounded(self.gateway.refund(
                    gateway_reference,
                    "unrecorded payment returned by operator",
                    intent.amount,
                ))
                .await?;
                info!(
                    tenant_id = %intent.tenant_id,
                    order_id = %intent.order_id,
                    amount = intent.amount,
                    "Unrecorded payment refunded"
                );
            }
        }

        self.store.abandon_charge(key)?;
        info!(key = %key, tenant_id = %intent.tenant_id, refund, "Charge intent resolved");
        Ok(Some(intent))
    }

    // =========================================================================
    // Money movement
    // =========================================================================

    async fn bounded<T>(
        &self,
        call: impl Future<Output = std::result::Result<T, GatewayError>>,
    ) -> std::result::Result<T, GatewayError> {
        tokio::time::timeout(self.config.gateway_timeout, call)
            .await
            .unwrap_or_else(|_| Err(GatewayError::timeout()))
    }

    fn open_intent(&self, intent: &ChargeIntent) -> Result<()> {
        self.store.begin_charge(intent).map_err(|e| match e {
            StoreError::DuplicateIdempotencyKey { .. } => BillingError::Conflict {
                tenant_id: intent.tenant_id.to_string(),
            },
            other => other.into(),
        })
    }

    /// Drop the intent after a call that certainly moved no money.
    fn release(&self, key: &str, err: &GatewayError) {
        if err.is_timeout() {
            warn!(key = %key, "Gateway outcome unknown, leaving charge intent pending");
            return;
        }
        if let Err(e) = self.store.abandon_charge(key) {
            warn!(key = %key, error = %e, "Failed to drop charge intent");
        }
    }

    async fn collect(
        &self,
        command: &Command,
        transition: &Transition,
        charge: &Charge,
        key: &str,
    ) -> Result<Settlement> {
        let tenant_id = command.tenant_id;
        let billing = transition
            .subscription
            .billing
            .as_ref()
            .ok_or_else(GatewayError::no_billing_token)?;

        let order_id = format!("ord_{}", Uuid::new_v4().simple());
        self.open_intent(&ChargeIntent::pending(
            key.to_string(),
            order_id.clone(),
            tenant_id,
            charge.amount,
            charge.entry_type,
        ))?;

        let request = ChargeRequest {
            token: billing.token.clone(),
            customer_key: tenant_id.to_string(),
            amount: charge.amount,
            order_id: order_id.clone(),
            order_name: charge.order_name.clone(),
            customer_email: billing.customer_email.clone(),
        };

        info!(
            tenant_id = %tenant_id,
            order_id = %order_id,
            amount = charge.amount,
            entry_type = charge.entry_type.as_str(),
            "Charging billing token"
        );

        let receipt = match self.bounded(self.gateway.charge(&request)).await {
            Ok(receipt) if receipt.is_done() => receipt,
            Ok(receipt) => {
                let err = GatewayError::new(
                    "PAYMENT_NOT_DONE",
                    format!(
                        "payment {} ended in status {}",
                        receipt.gateway_reference, receipt.status
                    ),
                );
                self.release(key, &err);
                return Err(err.into());
            }
            Err(err) => {
                self.release(key, &err);
                return Err(err.into());
            }
        };

        Ok(Settlement {
            requested: charge.amount,
            entry: LedgerEntry::charge(
                tenant_id,
                order_id,
                charge.amount,
                charge.entry_type,
                receipt.gateway_reference,
                command.idempotency_key.clone(),
            ),
        })
    }

    async fn pay_back(
        &self,
        command: &Command,
        refund: &Refund,
        key: &str,
    ) -> Result<Option<Settlement>> {
        let tenant_id = command.tenant_id;
        let Some(original) = self.store.latest_charge(&tenant_id)? else {
            warn!(tenant_id = %tenant_id, "No recorded charge to refund");
            return Ok(None);
        };
        let amount = refund.amount.min(original.amount);
        if amount <= 0 {
            return Ok(None);
        }

        let entry = LedgerEntry::refund(
            &original,
            amount,
            original.gateway_reference.clone(),
            command.idempotency_key.clone(),
        );
        self.open_intent(&ChargeIntent::pending(
            key.to_string(),
            entry.order_id.clone(),
            tenant_id,
            entry.amount,
            EntryType::Refund,
        ))?;

        info!(
            tenant_id = %tenant_id,
            order_id = %original.order_id,
            amount,
            "Refunding payment"
        );

        if let Err(err) = self
            .bounded(
                self.gateway
                    .refund(&original.gateway_reference, &refund.reason, amount),
            )
            .await
        {
            self.release(key, &err);
            return Err(err.into());
        }

        Ok(Some(Settlement {
            requested: -refund.amount,
            entry,
        }))
    }

    /// Turn a failed charge into the caller's error, recording the failure
    /// on the subscription when the scheduler made the charge.
    ///
    /// A decline that could not be recorded surfaces as the storage error,
    /// not as the decline.
    fn charge_failed(
        &self,
        command: &Command,
        current: Option<&Subscription>,
        charge: &Charge,
        err: BillingError,
    ) -> BillingError {
        let BillingError::Gateway { code, message } = err else {
            return err;
        };

        warn!(
            tenant_id = %command.tenant_id,
            event = command.event.name(),
            code = %code,
            message = %message,
            "Charge declined"
        );

        if command.actor == Actor::System && charge.entry_type.is_recurring() {
            if let Some(current) = current {
                if let Err(e) = self.record_failure(current, &message, command.now) {
                    error!(
                        tenant_id = %command.tenant_id,
                        code = %code,
                        error = %e,
                        "Could not record charge failure"
                    );
                    return e;
                }
            }
        }

        BillingError::Gateway { code, message }
    }

    /// Apply `ChargeFailed` to the subscription, re-reading it on a version
    /// conflict.
    fn record_failure(
        &self,
        current: &Subscription,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        let tenant_id = current.tenant_id;
        let event = Event::ChargeFailed {
            error: message.to_string(),
        };
        let command = Command::new(tenant_id, event, Actor::System).at(now);
        let mut current = current.clone();

        for attempt in 1..=MAX_ATTEMPTS {
            let transition =
                lifecycle::apply(tenant_id, Some(&current), &command.event, &self.context(now))?;
            let commit = build_commit(&command, &transition, None, None);

            match self
                .store
                .compare_and_update(&tenant_id, current.version, &commit)
            {
                Ok(stored) => {
                    info!(
                        tenant_id = %stored.tenant_id,
                        status = %stored.status,
                        retry_count = stored.retry_count,
                        "Payment failure recorded"
                    );
                    return Ok(stored);
                }
                Err(StoreError::Conflict { .. }) => {
                    warn!(
                        tenant_id = %tenant_id,
                        attempt,
                        "Subscription changed while recording charge failure, retrying"
                    );
                    current = self.store.get_subscription(&tenant_id)?.ok_or_else(|| {
                        BillingError::NotFound {
                            tenant_id: tenant_id.to_string(),
                        }
                    })?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(BillingError::Conflict {
            tenant_id: tenant_id.to_string(),
        })
    }

    /// Convert `err` into `ReconciliationRequired` if money already moved.
    fn unwind(&self, key: &str, settled: Option<&Settlement>, err: BillingError) -> BillingError {
        let Some(settlement) = settled else {
            return err;
        };
        let entry = &settlement.entry;

        if let Err(e) = self.store.mark_captured(key, &entry.gateway_reference) {
            error!(key = %key, error = %e, "Failed to mark charge intent as captured");
        }
        error!(
            tenant_id = %entry.tenant_id,
            order_id = %entry.order_id,
            gateway_reference = %entry.gateway_reference,
            amount = entry.amount,
            error = %err,
            "Payment moved but was not recorded; reconciliation required"
        );

        BillingError::ReconciliationRequired {
            order_id: entry.order_id.clone(),
            gateway_reference: entry.gateway_reference.clone(),
        }
    }
}

/// Signed money movement a transition asks for.
fn requested_amount(transition: &Transition) -> Option<i64> {
    transition
        .charge
        .as_ref()
        .map(|c| c.amount)
        .or_else(|| transition.refund.as_ref().map(|r| -r.amount))
}

fn build_commit(
    command: &Command,
    transition: &Transition,
    entry: Option<LedgerEntry>,
    intent_key: Option<&str>,
) -> Commit {
    let history = match transition.history {
        HistoryAction::Append(change) => HistoryWrite::Append(HistoryRecord::snapshot(
            &transition.subscription,
            change,
            command.actor,
            command.now,
            transition.note.clone(),
        )),
        HistoryAction::Amend => HistoryWrite::Amend {
            at: command.now,
            note: transition.note.clone(),
        },
    };

    let mut commit = Commit::new(transition.subscription.clone(), history);
    if let Some(key) = &command.idempotency_key {
        commit.idempotency = Some(IdempotencyRecord {
            key: key.clone(),
            tenant_id: command.tenant_id,
            ledger_entry_id: entry.as_ref().map(|e| e.id),
            recorded_at: command.now,
        });
    }
    commit.resolve_intent = intent_key.map(str::to_string);
    commit.ledger = entry;
    commit
}
