//! Subscription lifecycle engine
//!
//! Owns every mutating transition on a [`Subscription`]. The scheduler and the
//! webhook pipeline both call into this module, so a renewal success or
//! failure has exactly one implementation regardless of which path observed
//! it.
//!
//! Writes go through [`LedgerStore::put_subscription_if_version`]; a
//! transition that loses a version race is re-run against the fresh row.
//! Charges are claimed per billing period before the gateway is called, which
//! keeps at most one successful charge per period even when a scheduled
//! renewal and a webhook interleave.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::access::Actor;
use crate::clock::Clock;
use crate::cycle;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{ChargeReceipt, ChargeRequest, IssueBillingKeyRequest, PaymentGateway};
use crate::models::{
    BillingKey, BillingKeyStatus, CardMetadata, PaymentClaim, PaymentKind, PaymentRecord,
    PaymentStatus, Plan, Subscription, SubscriptionStatus, UsageRecord,
};
use crate::policy::{RetryDecision, RetryPolicy, PAYMENT_FAILURE_LIMIT_REACHED};
use crate::store::LedgerStore;

/// Cancellation reason when the setup fee cannot be collected
pub const SETUP_PAYMENT_FAILED: &str = "setup_payment_failed";

/// Cancellation reason when the referenced billing key is deleted
pub const BILLING_KEY_DELETED: &str = "billing_key_deleted";

/// Reason recorded by the expiry sweep when none was given at cancel time
pub const PERIOD_ENDED: &str = "period_ended";

const MAX_TRANSITION_ATTEMPTS: usize = 5;

const DEFAULT_RENEWAL_TIMEOUT: StdDuration = StdDuration::from_secs(30);

/// Input for [`LifecycleEngine::create`]
#[derive(Debug, Clone)]
pub struct CreateSubscription {
    pub customer_id: String,
    pub plan_id: Uuid,
    pub billing_key_id: Uuid,
    /// Overrides the plan's trial length when set
    pub trial_days: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedSubscription {
    pub subscription: Subscription,
    pub billing_key: BillingKey,
}

/// What a single renewal attempt did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// Gateway accepted the charge and the period advanced
    Charged { subscription: Subscription, amount: i64 },
    /// Nothing owed; period advanced without a charge
    ZeroAmount(Subscription),
    /// The period was already paid (e.g. reported by webhook); success applied
    AlreadyPaid(Subscription),
    /// Another unit of work holds the charge claim for this period
    InFlight,
    /// Not billable right now (paused, terminal, flagged to end, not yet due)
    NotDue,
    /// Charge failed or timed out; the retry policy decided the next step
    Failed {
        subscription: Subscription,
        decision: RetryDecision,
        reason: String,
    },
}

/// Result of applying a failure report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureApplied {
    pub subscription: Subscription,
    /// `None` when nothing was counted: terminal subscription or repeat attempt
    pub decision: Option<RetryDecision>,
}

/// A renewal result reported from outside the scheduler (webhook)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenewalReport {
    pub order_id: Option<String>,
    pub payment_key: Option<String>,
    pub subscription_id: Option<Uuid>,
    pub amount: Option<i64>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub cancelled: usize,
    pub errors: usize,
}

/// Outcome of revoking a billing key
#[derive(Debug, Clone, Serialize)]
pub struct RevokedBillingKey {
    pub billing_key: BillingKey,
    pub cancelled_subscriptions: Vec<Uuid>,
}

pub struct LifecycleEngine {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    renewal_timeout: StdDuration,
}

/// Mark `sub` cancelled as of `now`, truncating the current period
fn cancel_now(sub: &mut Subscription, reason: &str, now: OffsetDateTime) {
    sub.status = SubscriptionStatus::Cancelled;
    sub.cancelled_at = Some(now);
    sub.cancellation_reason = Some(reason.to_string());
    if sub.current_period_end > now {
        sub.current_period_end = now;
    }
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            gateway,
            clock,
            policy: RetryPolicy::default(),
            renewal_timeout: DEFAULT_RENEWAL_TIMEOUT,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_renewal_timeout(mut self, timeout: StdDuration) -> Self {
        self.renewal_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<dyn PaymentGateway> {
        &self.gateway
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn renewal_timeout(&self) -> StdDuration {
        self.renewal_timeout
    }

    async fn load(&self, id: Uuid) -> BillingResult<Subscription> {
        self.store
            .get_subscription(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", id)))
    }

    async fn load_plan(&self, id: Uuid) -> BillingResult<Plan> {
        self.store
            .get_plan(id)
            .await?
            .ok_or_else(|| BillingError::Internal(format!("plan {} missing", id)))
    }

    /// Load, mutate and conditionally write a subscription, re-running on
    /// version conflicts. `mutate` returns `false` to leave the row untouched.
    async fn transition<F>(&self, id: Uuid, mut mutate: F) -> BillingResult<Subscription>
    where
        F: FnMut(&mut Subscription, OffsetDateTime) -> BillingResult<bool> + Send,
    {
        for attempt in 1..=MAX_TRANSITION_ATTEMPTS {
            let mut sub = self.load(id).await?;
            let now = self.clock.now();
            if !mutate(&mut sub, now)? {
                return Ok(sub);
            }
            sub.updated_at = now;

            match self.store.put_subscription_if_version(&sub).await {
                Ok(saved) => return Ok(saved),
                Err(BillingError::ConcurrentModification(_)) => {
                    tracing::debug!(
                        subscription_id = %id,
                        attempt = attempt,
                        "Version conflict, retrying transition"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(BillingError::ConcurrentModification(format!(
            "subscription {}",
            id
        )))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get_subscription(&self, actor: &Actor, id: Uuid) -> BillingResult<Subscription> {
        let sub = self.load(id).await?;
        actor.ensure_can_access(&sub.customer_id)?;
        Ok(sub)
    }

    pub async fn list_customer_subscriptions(
        &self,
        actor: &Actor,
    ) -> BillingResult<Vec<Subscription>> {
        self.store
            .list_customer_subscriptions(&actor.customer_id)
            .await
    }

    pub async fn get_billing_key(&self, actor: &Actor, id: Uuid) -> BillingResult<BillingKey> {
        let key = self
            .store
            .get_billing_key(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("billing key {}", id)))?;
        actor.ensure_can_access(&key.customer_id)?;
        Ok(key)
    }

    // =========================================================================
    // Billing keys
    // =========================================================================

    /// Store a gateway-issued billing key. Re-registering the same token for
    /// the same customer returns the stored key.
    pub async fn register_billing_key(
        &self,
        customer_id: &str,
        token: &str,
        card: CardMetadata,
    ) -> BillingResult<BillingKey> {
        if customer_id.trim().is_empty() || token.trim().is_empty() {
            return Err(BillingError::Validation(
                "customer id and billing key are required".to_string(),
            ));
        }

        if let Some(existing) = self.store.find_billing_key(token).await? {
            if existing.customer_id != customer_id {
                return Err(BillingError::Conflict(
                    "billing key is registered to another customer".to_string(),
                ));
            }
            return Ok(existing);
        }

        let key = BillingKey {
            id: Uuid::new_v4(),
            customer_id: customer_id.to_string(),
            billing_key: token.to_string(),
            card,
            issued_at: self.clock.now(),
            status: BillingKeyStatus::Active,
            revoked_at: None,
        };
        self.store.put_billing_key(&key).await?;

        tracing::info!(
            billing_key_id = %key.id,
            customer_id = %customer_id,
            "Registered billing key"
        );
        Ok(key)
    }

    /// Exchange a card authorization for a billing key at the gateway
    pub async fn issue_billing_key(
        &self,
        customer_id: &str,
        auth_key: &str,
    ) -> BillingResult<BillingKey> {
        if auth_key.trim().is_empty() {
            return Err(BillingError::Validation("authKey is required".to_string()));
        }

        let issued = self
            .gateway
            .issue_billing_key(&IssueBillingKeyRequest {
                auth_key: auth_key.to_string(),
                customer_key: customer_id.to_string(),
            })
            .await?;

        self.register_billing_key(customer_id, &issued.billing_key, issued.card)
            .await
    }

    /// Revoke a key and cancel every live subscription charged through it
    pub async fn revoke_billing_key(&self, key_id: Uuid) -> BillingResult<RevokedBillingKey> {
        let mut key = self
            .store
            .get_billing_key(key_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("billing key {}", key_id)))?;

        if key.status != BillingKeyStatus::Revoked {
            key.status = BillingKeyStatus::Revoked;
            key.revoked_at = Some(self.clock.now());
            self.store.put_billing_key(&key).await?;
        }

        let mut cancelled_subscriptions = Vec::new();
        for sub in self.store.list_by_billing_key(key_id).await? {
            if sub.status.is_terminal() {
                continue;
            }
            match self.cancel(sub.id, BILLING_KEY_DELETED, true).await {
                Ok(_) => cancelled_subscriptions.push(sub.id),
                // Lost a race with another terminal transition
                Err(BillingError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            billing_key_id = %key_id,
            cancelled = cancelled_subscriptions.len(),
            "Revoked billing key"
        );

        Ok(RevokedBillingKey {
            billing_key: key,
            cancelled_subscriptions,
        })
    }

    /// Revoke by gateway token; `None` if the token is unknown
    pub async fn revoke_billing_key_by_token(
        &self,
        token: &str,
    ) -> BillingResult<Option<RevokedBillingKey>> {
        match self.store.find_billing_key(token).await? {
            Some(key) => Ok(Some(self.revoke_billing_key(key.id).await?)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Create
    // =========================================================================

    pub async fn create(&self, request: CreateSubscription) -> BillingResult<CreatedSubscription> {
        let plan = self
            .store
            .get_plan(request.plan_id)
            .await?
            .ok_or_else(|| BillingError::Validation(format!("unknown plan {}", request.plan_id)))?;
        if !plan.active {
            return Err(BillingError::Validation(format!(
                "plan {} is not active",
                plan.id
            )));
        }

        let billing_key = self
            .store
            .get_billing_key(request.billing_key_id)
            .await?
            .ok_or_else(|| {
                BillingError::Validation(format!("unknown billing key {}", request.billing_key_id))
            })?;
        if billing_key.customer_id != request.customer_id {
            return Err(BillingError::Validation(
                "billing key belongs to another customer".to_string(),
            ));
        }
        if billing_key.status != BillingKeyStatus::Active {
            return Err(BillingError::Validation(
                "billing key has been revoked".to_string(),
            ));
        }

        let existing = self
            .store
            .list_customer_subscriptions(&request.customer_id)
            .await?;
        if existing.iter().any(|s| s.status.is_live()) {
            return Err(BillingError::Validation(
                "customer already has a live subscription".to_string(),
            ));
        }

        let now = self.clock.now();
        let trial_days = request.trial_days.unwrap_or(plan.trial_days);

        let (status, period_end, trial_start, trial_end) = if trial_days > 0 {
            let trial_end = now
                .checked_add(Duration::days(i64::from(trial_days)))
                .ok_or_else(|| BillingError::Validation("trial is too long".to_string()))?;
            (SubscriptionStatus::Trial, trial_end, Some(now), Some(trial_end))
        } else {
            let end = cycle::next_boundary(now, plan.interval_unit, plan.interval_count)?;
            (SubscriptionStatus::Active, end, None, None)
        };

        let subscription = Subscription {
            id: Uuid::new_v4(),
            customer_id: request.customer_id.clone(),
            plan_id: plan.id,
            billing_key_id: billing_key.id,
            status,
            current_period_start: now,
            current_period_end: period_end,
            next_billing_date: period_end,
            trial_start,
            trial_end,
            cancel_at_period_end: false,
            cancelled_at: None,
            cancellation_reason: None,
            paused_at: None,
            resumed_at: None,
            total_payments: 0,
            total_amount: 0,
            failed_payment_count: 0,
            last_failure_reason: None,
            last_failed_attempt: None,
            last_payment_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        // The store enforces one live subscription per customer too; losing
        // that race reads the same as the pre-check above.
        self.store
            .insert_subscription(&subscription)
            .await
            .map_err(|e| match e {
                BillingError::Conflict(msg) => BillingError::Validation(msg),
                other => other,
            })?;

        tracing::info!(
            subscription_id = %subscription.id,
            customer_id = %subscription.customer_id,
            plan_id = %plan.id,
            status = %subscription.status,
            next_billing_date = %subscription.next_billing_date,
            "Created subscription"
        );

        let subscription = match plan.setup_fee {
            Some(fee) if fee > 0 => {
                self.collect_setup_fee(subscription, &plan, &billing_key, fee)
                    .await?
            }
            _ => subscription,
        };

        Ok(CreatedSubscription {
            subscription,
            billing_key,
        })
    }

    /// Charge the one-time setup fee. A failure cancels the new subscription
    /// before the error is returned.
    async fn collect_setup_fee(
        &self,
        subscription: Subscription,
        plan: &Plan,
        billing_key: &BillingKey,
        fee: i64,
    ) -> BillingResult<Subscription> {
        let now = self.clock.now();
        let candidate = PaymentRecord::new_pending(
            subscription.setup_order_id(),
            subscription.customer_id.clone(),
            Some(subscription.id),
            PaymentKind::SetupFee,
            fee,
            plan.currency.clone(),
            None,
            now,
        );

        let mut record = match self.store.claim_payment(&candidate, now).await? {
            PaymentClaim::Claimed(record) => record,
            PaymentClaim::AlreadySucceeded(_) | PaymentClaim::InFlight => {
                return Err(BillingError::Internal(format!(
                    "setup fee for subscription {} already claimed",
                    subscription.id
                )));
            }
        };

        let order_name = format!("{} setup fee", plan.name);
        match self.charge(&record, billing_key, &order_name).await {
            Ok(receipt) => {
                record.status = PaymentStatus::Succeeded;
                record.payment_key = Some(receipt.payment_key);
                record.updated_at = self.clock.now();
                if !self.mark_succeeded(&record).await? {
                    return Err(BillingError::Conflict(format!(
                        "setup fee {} was superseded",
                        record.order_id
                    )));
                }

                let amount = record.amount;
                self.transition(subscription.id, |sub, now| {
                    sub.total_payments += 1;
                    sub.total_amount = sub.total_amount.checked_add(amount).ok_or_else(|| {
                        BillingError::Internal("total amount overflows".to_string())
                    })?;
                    sub.last_payment_at = Some(now);
                    Ok(true)
                })
                .await
            }
            Err(e) => {
                record.status = PaymentStatus::Failed;
                record.failure_reason = Some(e.to_string());
                record.updated_at = self.clock.now();
                if let Err(store_err) = self
                    .store
                    .settle_payment(&record, PaymentStatus::Pending)
                    .await
                {
                    tracing::error!(
                        order_id = %record.order_id,
                        error = %store_err,
                        "Failed to record setup fee failure"
                    );
                }

                self.cancel(subscription.id, SETUP_PAYMENT_FAILED, true)
                    .await?;

                tracing::warn!(
                    subscription_id = %subscription.id,
                    error = %e,
                    "Setup fee failed, subscription cancelled"
                );
                Err(e)
            }
        }
    }

    /// One gateway charge under the renewal timeout. Timing out is a failure.
    async fn charge(
        &self,
        record: &PaymentRecord,
        billing_key: &BillingKey,
        order_name: &str,
    ) -> BillingResult<ChargeReceipt> {
        let request = ChargeRequest {
            billing_key: billing_key.billing_key.clone(),
            customer_key: record.customer_id.clone(),
            amount: record.amount,
            order_id: record.order_id.clone(),
            order_name: order_name.to_string(),
            idempotency_key: record.attempt_key(),
        };

        match tokio::time::timeout(self.renewal_timeout, self.gateway.charge_billing_key(&request))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(BillingError::Timeout),
        }
    }

    // =========================================================================
    // Renew
    // =========================================================================

    /// Attempt the renewal charge for a subscription due today.
    ///
    /// Gateway failures are folded into the retry policy and reported in the
    /// outcome, not returned as errors. Store failures are returned.
    pub async fn renew(&self, id: Uuid) -> BillingResult<RenewalOutcome> {
        let sub = self.load(id).await?;
        let now = self.clock.now();

        if !sub.status.is_billable()
            || sub.cancel_at_period_end
            || sub.next_billing_date >= cycle::start_of_next_day(now)
        {
            return Ok(RenewalOutcome::NotDue);
        }

        let plan = self.load_plan(sub.plan_id).await?;

        let key = self.store.get_billing_key(sub.billing_key_id).await?;
        let key = match key {
            Some(k) if k.status == BillingKeyStatus::Active => k,
            _ => {
                let reason = "billing key is not active".to_string();
                let applied = self.apply_renewal_failure(id, &reason, None).await?;
                return Ok(RenewalOutcome::Failed {
                    decision: self.decision_after(&applied),
                    subscription: applied.subscription,
                    reason,
                });
            }
        };

        let usage = self
            .store
            .usage_total(id, sub.current_period_start, sub.current_period_end)
            .await?;
        let amount = cycle::amount_due(plan.amount, usage)?;

        if amount == 0 {
            let billing_date = sub.next_billing_date;
            let subscription = self
                .transition(id, |s, _now| {
                    if s.next_billing_date != billing_date || s.status.is_terminal() {
                        return Ok(false);
                    }
                    advance_period(s, &plan)?;
                    Ok(true)
                })
                .await?;

            tracing::info!(
                subscription_id = %id,
                next_billing_date = %subscription.next_billing_date,
                "Nothing owed, advanced period without charging"
            );
            return Ok(RenewalOutcome::ZeroAmount(subscription));
        }

        let candidate = PaymentRecord::new_pending(
            sub.renewal_order_id(),
            sub.customer_id.clone(),
            Some(sub.id),
            PaymentKind::Renewal,
            amount,
            plan.currency.clone(),
            Some(sub.next_billing_date),
            now,
        );

        let mut record = match self.store.claim_payment(&candidate, now).await? {
            PaymentClaim::Claimed(record) => record,
            PaymentClaim::AlreadySucceeded(record) => {
                let subscription = self.apply_renewal_success(&record).await?;
                return Ok(RenewalOutcome::AlreadyPaid(subscription));
            }
            PaymentClaim::InFlight => {
                tracing::debug!(subscription_id = %id, "Renewal already in flight");
                return Ok(RenewalOutcome::InFlight);
            }
        };

        let result = self.charge(&record, &key, &plan.name).await;

        // A webhook may settle this attempt while the call is out; every write
        // below is conditional on the status this unit claimed.
        match result {
            Ok(receipt) => {
                record.status = PaymentStatus::Succeeded;
                record.payment_key = Some(receipt.payment_key);
                record.failure_reason = None;
                record.updated_at = self.clock.now();
                if !self
                    .store
                    .settle_payment(&record, PaymentStatus::Pending)
                    .await?
                {
                    if !self.mark_succeeded(&record).await? {
                        tracing::error!(
                            subscription_id = %id,
                            order_id = %record.order_id,
                            retry_count = record.retry_count,
                            "Charge succeeded for a superseded attempt; needs refund review"
                        );
                        return Ok(RenewalOutcome::AlreadyPaid(self.load(id).await?));
                    }
                    tracing::info!(
                        subscription_id = %id,
                        order_id = %record.order_id,
                        "Attempt settled by another writer during charge"
                    );
                    let subscription = self.apply_renewal_success(&record).await?;
                    return Ok(RenewalOutcome::AlreadyPaid(subscription));
                }

                let subscription = self.apply_renewal_success(&record).await?;
                tracing::info!(
                    subscription_id = %id,
                    order_id = %record.order_id,
                    amount = amount,
                    next_billing_date = %subscription.next_billing_date,
                    "Renewal charged"
                );
                Ok(RenewalOutcome::Charged {
                    subscription,
                    amount,
                })
            }
            Err(e) => {
                let reason = e.to_string();
                record.status = PaymentStatus::Failed;
                record.failure_reason = Some(reason.clone());
                record.updated_at = self.clock.now();
                if !self
                    .store
                    .settle_payment(&record, PaymentStatus::Pending)
                    .await?
                {
                    return self.settled_elsewhere(id, &record).await;
                }

                let applied = self
                    .apply_renewal_failure(id, &reason, Some(&record.attempt_key()))
                    .await?;
                tracing::warn!(
                    subscription_id = %id,
                    order_id = %record.order_id,
                    error = %e,
                    failed_payment_count = applied.subscription.failed_payment_count,
                    "Renewal charge failed"
                );
                Ok(RenewalOutcome::Failed {
                    decision: self.decision_after(&applied),
                    subscription: applied.subscription,
                    reason,
                })
            }
        }
    }

    /// Outcome for a failed charge whose attempt another writer settled first
    async fn settled_elsewhere(
        &self,
        id: Uuid,
        record: &PaymentRecord,
    ) -> BillingResult<RenewalOutcome> {
        let current = self.store.get_payment_by_order(&record.order_id).await?;
        let subscription = self.load(id).await?;

        tracing::info!(
            subscription_id = %id,
            order_id = %record.order_id,
            status = ?current.as_ref().map(|c| c.status),
            "Attempt settled by another writer during charge"
        );

        Ok(match current {
            Some(c) if c.status == PaymentStatus::Succeeded => {
                RenewalOutcome::AlreadyPaid(subscription)
            }
            current => RenewalOutcome::Failed {
                decision: self.policy.decide(subscription.failed_payment_count),
                reason: current
                    .and_then(|c| c.failure_reason)
                    .or_else(|| record.failure_reason.clone())
                    .unwrap_or_default(),
                subscription,
            },
        })
    }

    /// Record `record`'s attempt as succeeded, from pending or from a failed
    /// state a local timeout left behind. False when a newer attempt has
    /// superseded it or the payment has since been cancelled.
    async fn mark_succeeded(&self, record: &PaymentRecord) -> BillingResult<bool> {
        let mut expected = PaymentStatus::Pending;

        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            if self.store.settle_payment(record, expected).await? {
                return Ok(true);
            }
            let current = self
                .store
                .get_payment_by_order(&record.order_id)
                .await?
                .ok_or_else(|| {
                    BillingError::Internal(format!("payment {} vanished", record.order_id))
                })?;
            if current.retry_count != record.retry_count {
                return Ok(false);
            }
            match current.status {
                PaymentStatus::Succeeded => return Ok(true),
                PaymentStatus::Pending | PaymentStatus::Failed => expected = current.status,
                _ => return Ok(false),
            }
        }

        Err(BillingError::ConcurrentModification(format!(
            "payment {}",
            record.order_id
        )))
    }

    /// Retry decision for a failure, also when the failure had already been
    /// counted and `apply_renewal_failure` changed nothing
    fn decision_after(&self, applied: &FailureApplied) -> RetryDecision {
        applied
            .decision
            .unwrap_or_else(|| self.policy.decide(applied.subscription.failed_payment_count))
    }

    /// Apply a succeeded renewal payment to its subscription.
    ///
    /// Only advances while the subscription is still on the period the
    /// payment covers, so replays and late reports are no-ops.
    pub async fn apply_renewal_success(
        &self,
        record: &PaymentRecord,
    ) -> BillingResult<Subscription> {
        let sub_id = record.subscription_id.ok_or_else(|| {
            BillingError::Internal(format!("payment {} has no subscription", record.order_id))
        })?;
        let billing_date = record.billing_date.ok_or_else(|| {
            BillingError::Internal(format!("payment {} has no billing date", record.order_id))
        })?;
        let sub = self.load(sub_id).await?;
        let plan = self.load_plan(sub.plan_id).await?;
        let amount = record.amount;

        self.transition(sub_id, |s, now| {
            if s.status.is_terminal() {
                tracing::error!(
                    subscription_id = %s.id,
                    order_id = %record.order_id,
                    "Renewal payment succeeded for a terminal subscription; needs refund review"
                );
                return Ok(false);
            }
            if s.next_billing_date != billing_date {
                return Ok(false);
            }

            advance_period(s, &plan)?;
            s.total_payments += 1;
            s.total_amount = s
                .total_amount
                .checked_add(amount)
                .ok_or_else(|| BillingError::Internal("total amount overflows".to_string()))?;
            s.failed_payment_count = 0;
            s.last_failure_reason = None;
            s.last_payment_at = Some(now);
            if s.status == SubscriptionStatus::PastDue {
                s.status = SubscriptionStatus::Active;
            }
            Ok(true)
        })
        .await
    }

    /// Count one renewal failure and apply the retry policy: stay `past_due`
    /// for the next pass, or cancel immediately once the budget is spent.
    ///
    /// With an `attempt` key the count is applied at most once per attempt;
    /// a repeat returns `decision: None` and leaves the subscription alone.
    pub async fn apply_renewal_failure(
        &self,
        id: Uuid,
        reason: &str,
        attempt: Option<&str>,
    ) -> BillingResult<FailureApplied> {
        let policy = self.policy;
        let mut decision = None;

        let subscription = self
            .transition(id, |s, now| {
                decision = None;
                if s.status.is_terminal() {
                    return Ok(false);
                }
                if attempt.is_some() && s.last_failed_attempt.as_deref() == attempt {
                    return Ok(false);
                }

                s.failed_payment_count = s.failed_payment_count.saturating_add(1);
                s.last_failure_reason = Some(reason.to_string());
                s.last_failed_attempt = attempt.map(str::to_string);

                match policy.decide(s.failed_payment_count) {
                    RetryDecision::Retry => {
                        if matches!(
                            s.status,
                            SubscriptionStatus::Trial | SubscriptionStatus::Active
                        ) {
                            s.status = SubscriptionStatus::PastDue;
                        }
                        decision = Some(RetryDecision::Retry);
                    }
                    RetryDecision::Escalate => {
                        cancel_now(s, PAYMENT_FAILURE_LIMIT_REACHED, now);
                        decision = Some(RetryDecision::Escalate);
                    }
                }
                Ok(true)
            })
            .await?;

        if decision == Some(RetryDecision::Escalate) {
            tracing::warn!(
                subscription_id = %id,
                failed_payment_count = subscription.failed_payment_count,
                "Retry budget exhausted, subscription cancelled"
            );
        }

        Ok(FailureApplied {
            subscription,
            decision,
        })
    }

    /// Resolve the payment record a webhook report refers to, creating it for
    /// the subscription's current period when the charge started elsewhere.
    async fn resolve_report(&self, report: &RenewalReport) -> BillingResult<PaymentRecord> {
        if let Some(order_id) = &report.order_id {
            if let Some(record) = self.store.get_payment_by_order(order_id).await? {
                return Ok(record);
            }
        }
        if let Some(payment_key) = &report.payment_key {
            if let Some(record) = self.store.get_payment_by_key(payment_key).await? {
                return Ok(record);
            }
        }

        let sub_id = report.subscription_id.ok_or_else(|| {
            BillingError::NotFound("no payment record matches the report".to_string())
        })?;
        let sub = self.load(sub_id).await?;
        let plan = self.load_plan(sub.plan_id).await?;
        let now = self.clock.now();

        let candidate = PaymentRecord::new_pending(
            report
                .order_id
                .clone()
                .unwrap_or_else(|| sub.renewal_order_id()),
            sub.customer_id.clone(),
            Some(sub.id),
            PaymentKind::Renewal,
            report.amount.unwrap_or(plan.amount),
            plan.currency.clone(),
            Some(sub.next_billing_date),
            now,
        );

        match self.store.claim_payment(&candidate, now).await? {
            PaymentClaim::Claimed(record) | PaymentClaim::AlreadySucceeded(record) => Ok(record),
            PaymentClaim::InFlight => self
                .store
                .get_payment_by_order(&candidate.order_id)
                .await?
                .ok_or_else(|| BillingError::Internal("claimed payment vanished".to_string())),
        }
    }

    /// Count a renewal whose unit of work was abandoned on timeout. The
    /// pending claim is marked failed so a later failure report for the same
    /// attempt is not counted again.
    ///
    /// The count is keyed by attempt, so running this again after an
    /// interruption between the two writes finishes the job without counting
    /// twice.
    pub async fn record_renewal_timeout(&self, id: Uuid) -> BillingResult<FailureApplied> {
        let sub = self.load(id).await?;
        let reason = BillingError::Timeout.to_string();

        let Some(mut record) = self
            .store
            .get_payment_by_order(&sub.renewal_order_id())
            .await?
        else {
            return self.apply_renewal_failure(id, &reason, None).await;
        };

        if record.status == PaymentStatus::Pending {
            let mut failed = record.clone();
            failed.status = PaymentStatus::Failed;
            failed.failure_reason = Some(reason.clone());
            failed.updated_at = self.clock.now();
            record = if self
                .store
                .settle_payment(&failed, PaymentStatus::Pending)
                .await?
            {
                failed
            } else {
                self.store
                    .get_payment_by_order(&record.order_id)
                    .await?
                    .ok_or_else(|| {
                        BillingError::Internal(format!("payment {} vanished", record.order_id))
                    })?
            };
        }

        if record.status != PaymentStatus::Failed {
            return Ok(FailureApplied {
                subscription: sub,
                decision: None,
            });
        }

        let reason = record.failure_reason.clone().unwrap_or(reason);
        self.apply_renewal_failure(id, &reason, Some(&record.attempt_key()))
            .await
    }

    /// Webhook-reported renewal success. Accepted even after a local timeout
    /// already recorded the attempt as failed.
    pub async fn settle_renewal_success(
        &self,
        report: &RenewalReport,
    ) -> BillingResult<Subscription> {
        let mut record = self.resolve_report(report).await?;

        if record.status != PaymentStatus::Succeeded {
            record.status = PaymentStatus::Succeeded;
            record.failure_reason = None;
            if report.payment_key.is_some() {
                record.payment_key = report.payment_key.clone();
            }
            record.updated_at = self.clock.now();
            if !self.mark_succeeded(&record).await? {
                tracing::warn!(
                    order_id = %record.order_id,
                    retry_count = record.retry_count,
                    "Success report for a superseded attempt, not applied"
                );
                let sub_id = record.subscription_id.ok_or_else(|| {
                    BillingError::Internal(format!(
                        "payment {} has no subscription",
                        record.order_id
                    ))
                })?;
                return self.load(sub_id).await;
            }
        }

        self.apply_renewal_success(&record).await
    }

    /// Webhook-reported renewal failure. An attempt already recorded as
    /// failed (or settled) locally is not counted twice.
    pub async fn settle_renewal_failure(
        &self,
        report: &RenewalReport,
    ) -> BillingResult<FailureApplied> {
        let mut record = self.resolve_report(report).await?;
        let sub_id = record.subscription_id.ok_or_else(|| {
            BillingError::Internal(format!("payment {} has no subscription", record.order_id))
        })?;

        if record.status != PaymentStatus::Pending {
            tracing::info!(
                order_id = %record.order_id,
                status = %record.status,
                "Failure report for an already settled attempt, not counted"
            );
            return Ok(FailureApplied {
                subscription: self.load(sub_id).await?,
                decision: None,
            });
        }

        let reason = report
            .failure_reason
            .clone()
            .unwrap_or_else(|| "payment failed".to_string());
        record.status = PaymentStatus::Failed;
        record.failure_reason = Some(reason.clone());
        if report.payment_key.is_some() {
            record.payment_key = report.payment_key.clone();
        }
        record.updated_at = self.clock.now();
        if !self
            .store
            .settle_payment(&record, PaymentStatus::Pending)
            .await?
        {
            tracing::info!(
                order_id = %record.order_id,
                "Attempt settled concurrently, failure report not counted"
            );
            return Ok(FailureApplied {
                subscription: self.load(sub_id).await?,
                decision: None,
            });
        }

        self.apply_renewal_failure(sub_id, &reason, Some(&record.attempt_key()))
            .await
    }

    // =========================================================================
    // Cancel / pause / resume
    // =========================================================================

    /// Cancel now, or flag the subscription to end with its current period.
    pub async fn cancel(
        &self,
        id: Uuid,
        reason: &str,
        immediate: bool,
    ) -> BillingResult<Subscription> {
        let subscription = self
            .transition(id, |s, now| {
                if s.status.is_terminal() {
                    return Err(BillingError::Conflict(format!(
                        "subscription {} is already {}",
                        s.id, s.status
                    )));
                }
                if immediate {
                    cancel_now(s, reason, now);
                } else {
                    if s.cancel_at_period_end {
                        return Err(BillingError::Conflict(format!(
                            "subscription {} is already set to cancel",
                            s.id
                        )));
                    }
                    s.cancel_at_period_end = true;
                    s.cancellation_reason = Some(reason.to_string());
                }
                Ok(true)
            })
            .await?;

        tracing::info!(
            subscription_id = %id,
            reason = %reason,
            immediate = immediate,
            "Cancelled subscription"
        );
        Ok(subscription)
    }

    pub async fn pause(&self, id: Uuid) -> BillingResult<Subscription> {
        let subscription = self
            .transition(id, |s, now| {
                if s.status != SubscriptionStatus::Active {
                    return Err(BillingError::Conflict(format!(
                        "only active subscriptions can be paused (status: {})",
                        s.status
                    )));
                }
                s.status = SubscriptionStatus::Paused;
                s.paused_at = Some(now);
                Ok(true)
            })
            .await?;

        tracing::info!(subscription_id = %id, "Paused subscription");
        Ok(subscription)
    }

    /// Shift the billing date and period end by exactly the paused time
    pub async fn resume(&self, id: Uuid) -> BillingResult<Subscription> {
        let subscription = self
            .transition(id, |s, now| {
                if s.status != SubscriptionStatus::Paused {
                    return Err(BillingError::Conflict(format!(
                        "only paused subscriptions can be resumed (status: {})",
                        s.status
                    )));
                }
                let paused_at = s.paused_at.ok_or_else(|| {
                    BillingError::Internal(format!("subscription {} paused without timestamp", s.id))
                })?;
                let paused_for = (now - paused_at).max(Duration::ZERO);

                s.next_billing_date += paused_for;
                s.current_period_end += paused_for;
                s.status = SubscriptionStatus::Active;
                s.resumed_at = Some(now);
                Ok(true)
            })
            .await?;

        tracing::info!(
            subscription_id = %id,
            next_billing_date = %subscription.next_billing_date,
            "Resumed subscription"
        );
        Ok(subscription)
    }

    /// End every flagged subscription whose period is over. Safe to re-run.
    pub async fn sweep_expired(&self) -> BillingResult<SweepReport> {
        let now = self.clock.now();
        let candidates = self.store.list_expiring(now).await?;
        let mut report = SweepReport {
            examined: candidates.len(),
            ..Default::default()
        };

        for candidate in candidates {
            let mut ended = false;
            let result = self
                .transition(candidate.id, |s, now| {
                    ended = false;
                    if s.status.is_terminal()
                        || !s.cancel_at_period_end
                        || s.current_period_end > now
                    {
                        return Ok(false);
                    }
                    s.status = SubscriptionStatus::Cancelled;
                    s.cancelled_at = Some(now);
                    if s.cancellation_reason.is_none() {
                        s.cancellation_reason = Some(PERIOD_ENDED.to_string());
                    }
                    ended = true;
                    Ok(true)
                })
                .await;

            match result {
                Ok(_) if ended => report.cancelled += 1,
                Ok(_) => {}
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(
                        subscription_id = %candidate.id,
                        error = %e,
                        "Failed to end subscription at period end"
                    );
                }
            }
        }

        if report.cancelled > 0 {
            tracing::info!(
                examined = report.examined,
                cancelled = report.cancelled,
                "Expiry sweep complete"
            );
        }
        Ok(report)
    }

    // =========================================================================
    // Metered usage
    // =========================================================================

    pub async fn record_usage(
        &self,
        actor: &Actor,
        subscription_id: Uuid,
        feature: &str,
        quantity: i64,
        unit_amount: i64,
    ) -> BillingResult<UsageRecord> {
        if feature.trim().is_empty() {
            return Err(BillingError::Validation("feature is required".to_string()));
        }
        if quantity < 0 || unit_amount < 0 {
            return Err(BillingError::Validation(
                "quantity and unit amount must not be negative".to_string(),
            ));
        }
        quantity
            .checked_mul(unit_amount)
            .ok_or_else(|| BillingError::Validation("usage amount overflows".to_string()))?;

        let sub = self.get_subscription(actor, subscription_id).await?;
        if sub.status.is_terminal() {
            return Err(BillingError::Conflict(format!(
                "subscription {} is {}",
                sub.id, sub.status
            )));
        }

        let usage = UsageRecord {
            id: Uuid::new_v4(),
            subscription_id,
            feature: feature.to_string(),
            quantity,
            unit_amount,
            recorded_at: self.clock.now(),
        };
        self.store.insert_usage(&usage).await?;
        Ok(usage)
    }
}

/// Roll the period forward from the billing date just paid
fn advance_period(sub: &mut Subscription, plan: &Plan) -> BillingResult<()> {
    let start = sub.next_billing_date;
    let end = cycle::next_boundary(start, plan.interval_unit, plan.interval_count)?;
    sub.current_period_start = start;
    sub.current_period_end = end;
    sub.next_billing_date = end;
    if sub.status == SubscriptionStatus::Trial && sub.trial_end.is_none_or(|t| t <= start) {
        sub.status = SubscriptionStatus::Active;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::gateway::FakeGateway;
    use crate::models::IntervalUnit;
    use crate::store::InMemoryLedger;
    use time::macros::datetime;

    struct Harness {
        engine: LifecycleEngine,
        store: Arc<InMemoryLedger>,
        gateway: Arc<FakeGateway>,
        clock: Arc<ManualClock>,
        plan: Plan,
        key: BillingKey,
    }

    async fn harness_with(trial_days: u32, setup_fee: Option<i64>) -> Harness {
        let store = Arc::new(InMemoryLedger::new());
        let gateway = Arc::new(FakeGateway::new());
        let clock = Arc::new(ManualClock::new(datetime!(2026-01-15 10:00 UTC)));
        let engine = LifecycleEngine::new(store.clone(), gateway.clone(), clock.clone());

        let plan = Plan {
            id: Uuid::new_v4(),
            name: "Pro monthly".to_string(),
            amount: 10_000,
            currency: "KRW".to_string(),
            interval_unit: IntervalUnit::Month,
            interval_count: 1,
            trial_days,
            setup_fee,
            active: true,
            created_at: datetime!(2026-01-01 0:00 UTC),
        };
        store.put_plan(&plan).await.unwrap();
        let key = engine
            .register_billing_key("cust_1", "bk_1", CardMetadata::default())
            .await
            .unwrap();

        Harness {
            engine,
            store,
            gateway,
            clock,
            plan,
            key,
        }
    }

    async fn create(h: &Harness) -> Subscription {
        h.engine
            .create(CreateSubscription {
                customer_id: "cust_1".to_string(),
                plan_id: h.plan.id,
                billing_key_id: h.key.id,
                trial_days: None,
            })
            .await
            .unwrap()
            .subscription
    }

    #[tokio::test]
    async fn test_create_without_trial_is_active_for_one_month() {
        let h = harness_with(0, None).await;
        let sub = create(&h).await;

        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.current_period_start, datetime!(2026-01-15 10:00 UTC));
        assert_eq!(sub.next_billing_date, datetime!(2026-02-15 10:00 UTC));
        assert_eq!(sub.current_period_end, sub.next_billing_date);
        assert_eq!(h.gateway.charge_count(), 0);
    }

    #[tokio::test]
    async fn test_create_with_trial() {
        let h = harness_with(14, None).await;
        let sub = create(&h).await;

        assert_eq!(sub.status, SubscriptionStatus::Trial);
        assert_eq!(sub.trial_end, Some(datetime!(2026-01-29 10:00 UTC)));
        assert_eq!(sub.next_billing_date, datetime!(2026-01-29 10:00 UTC));
    }

    #[tokio::test]
    async fn test_explicit_trial_days_override_plan() {
        let h = harness_with(14, None).await;
        let sub = h
            .engine
            .create(CreateSubscription {
                customer_id: "cust_1".to_string(),
                plan_id: h.plan.id,
                billing_key_id: h.key.id,
                trial_days: Some(0),
            })
            .await
            .unwrap()
            .subscription;
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_second_live_subscription_rejected() {
        let h = harness_with(0, None).await;
        create(&h).await;
        let err = h
            .engine
            .create(CreateSubscription {
                customer_id: "cust_1".to_string(),
                plan_id: h.plan.id,
                billing_key_id: h.key.id,
                trial_days: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn test_inactive_plan_rejected() {
        let h = harness_with(0, None).await;
        let mut plan = h.plan.clone();
        plan.active = false;
        h.store.put_plan(&plan).await.unwrap();

        let err = h
            .engine
            .create(CreateSubscription {
                customer_id: "cust_1".to_string(),
                plan_id: plan.id,
                billing_key_id: h.key.id,
                trial_days: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn test_setup_fee_charged_on_create() {
        let h = harness_with(0, Some(5_000)).await;
        let sub = create(&h).await;

        assert_eq!(h.gateway.charge_count(), 1);
        assert_eq!(sub.total_amount, 5_000);
        let record = h
            .store
            .get_payment_by_order(&sub.setup_order_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, PaymentStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_setup_fee_failure_cancels_subscription() {
        let h = harness_with(0, Some(5_000)).await;
        h.gateway.fail_next_charges(1, "REJECT_CARD_PAYMENT");

        let err = h
            .engine
            .create(CreateSubscription {
                customer_id: "cust_1".to_string(),
                plan_id: h.plan.id,
                billing_key_id: h.key.id,
                trial_days: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Gateway { .. }));

        let subs = h.store.list_customer_subscriptions("cust_1").await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].status, SubscriptionStatus::Cancelled);
        assert_eq!(
            subs[0].cancellation_reason.as_deref(),
            Some(SETUP_PAYMENT_FAILED)
        );
    }

    #[tokio::test]
    async fn test_renew_before_due_is_noop() {
        let h = harness_with(0, None).await;
        let sub = create(&h).await;

        let outcome = h.engine.renew(sub.id).await.unwrap();
        assert_eq!(outcome, RenewalOutcome::NotDue);
        assert_eq!(h.gateway.charge_count(), 0);
    }

    #[tokio::test]
    async fn test_renew_charges_plan_plus_usage() {
        let h = harness_with(0, None).await;
        let sub = create(&h).await;
        let actor = Actor::customer("cust_1");
        h.engine
            .record_usage(&actor, sub.id, "api_calls", 30, 100)
            .await
            .unwrap();

        h.clock.set(datetime!(2026-02-15 10:00 UTC));
        let outcome = h.engine.renew(sub.id).await.unwrap();

        match outcome {
            RenewalOutcome::Charged {
                subscription,
                amount,
            } => {
                assert_eq!(amount, 13_000);
                assert_eq!(subscription.total_amount, 13_000);
                assert_eq!(subscription.next_billing_date, datetime!(2026-03-15 10:00 UTC));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(h.gateway.charges()[0].idempotency_key.ends_with(":0"));
    }

    #[tokio::test]
    async fn test_zero_amount_advances_without_charge() {
        let h = harness_with(0, None).await;
        let mut plan = h.plan.clone();
        plan.amount = 0;
        h.store.put_plan(&plan).await.unwrap();
        let sub = create(&h).await;

        h.clock.set(datetime!(2026-02-15 10:00 UTC));
        let outcome = h.engine.renew(sub.id).await.unwrap();

        match outcome {
            RenewalOutcome::ZeroAmount(s) => {
                assert_eq!(s.next_billing_date, datetime!(2026-03-15 10:00 UTC));
                assert_eq!(s.total_payments, 0);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(h.gateway.charge_count(), 0);
    }

    #[tokio::test]
    async fn test_renewal_failure_marks_past_due_then_recovers() {
        let h = harness_with(0, None).await;
        let sub = create(&h).await;
        h.clock.set(datetime!(2026-02-15 10:00 UTC));
        h.gateway.fail_next_charges(1, "REJECT_CARD_PAYMENT");

        let outcome = h.engine.renew(sub.id).await.unwrap();
        match outcome {
            RenewalOutcome::Failed {
                subscription,
                decision,
                ..
            } => {
                assert_eq!(decision, RetryDecision::Retry);
                assert_eq!(subscription.status, SubscriptionStatus::PastDue);
                assert_eq!(subscription.failed_payment_count, 1);
                assert_eq!(subscription.next_billing_date, sub.next_billing_date);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        h.clock.advance(Duration::hours(1));
        let outcome = h.engine.renew(sub.id).await.unwrap();
        let RenewalOutcome::Charged { subscription, .. } = outcome else {
            panic!("expected a charge");
        };
        assert_eq!(subscription.status, SubscriptionStatus::Active);
        assert_eq!(subscription.failed_payment_count, 0);
        assert_eq!(subscription.last_failure_reason, None);

        let keys: Vec<String> = h
            .gateway
            .charges()
            .into_iter()
            .map(|c| c.idempotency_key)
            .collect();
        assert!(keys[0].ends_with(":0"));
        assert!(keys[1].ends_with(":1"));
    }

    #[tokio::test]
    async fn test_renewal_timeout_counts_as_failure() {
        let h = harness_with(0, None).await;
        let engine = LifecycleEngine::new(h.store.clone(), h.gateway.clone(), h.clock.clone())
            .with_renewal_timeout(StdDuration::from_millis(20));
        let sub = create(&h).await;
        h.clock.set(datetime!(2026-02-15 10:00 UTC));
        h.gateway.set_charge_delay(Some(StdDuration::from_millis(500)));

        let outcome = engine.renew(sub.id).await.unwrap();
        let RenewalOutcome::Failed { subscription, .. } = outcome else {
            panic!("expected a failure");
        };
        assert_eq!(subscription.failed_payment_count, 1);
        let record = h
            .store
            .get_payment_by_order(&sub.renewal_order_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_immediate_truncates_period() {
        let h = harness_with(0, None).await;
        let sub = create(&h).await;
        h.clock.advance(Duration::days(3));

        let cancelled = h.engine.cancel(sub.id, "too_expensive", true).await.unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
        assert_eq!(cancelled.current_period_end, datetime!(2026-01-18 10:00 UTC));
        assert_eq!(cancelled.cancelled_at, Some(datetime!(2026-01-18 10:00 UTC)));

        let err = h.engine.cancel(sub.id, "again", true).await.unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_cancel_at_period_end_then_sweep() {
        let h = harness_with(0, None).await;
        let sub = create(&h).await;

        let flagged = h.engine.cancel(sub.id, "moving", false).await.unwrap();
        assert_eq!(flagged.status, SubscriptionStatus::Active);
        assert!(flagged.cancel_at_period_end);

        let err = h.engine.cancel(sub.id, "moving", false).await.unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));

        assert_eq!(h.engine.sweep_expired().await.unwrap().cancelled, 0);

        h.clock.set(datetime!(2026-02-15 10:00 UTC));
        let report = h.engine.sweep_expired().await.unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(h.engine.sweep_expired().await.unwrap().cancelled, 0);

        let ended = h.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(ended.status, SubscriptionStatus::Cancelled);
        assert_eq!(ended.cancellation_reason.as_deref(), Some("moving"));
    }

    #[tokio::test]
    async fn test_pause_requires_active_and_resume_requires_paused() {
        let h = harness_with(0, None).await;
        let sub = create(&h).await;

        let err = h.engine.resume(sub.id).await.unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));

        h.engine.pause(sub.id).await.unwrap();
        let err = h.engine.pause(sub.id).await.unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_unknown_subscription_not_found() {
        let h = harness_with(0, None).await;
        let err = h.engine.cancel(Uuid::new_v4(), "x", true).await.unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_get_subscription_enforces_owner() {
        let h = harness_with(0, None).await;
        let sub = create(&h).await;

        assert!(h
            .engine
            .get_subscription(&Actor::customer("cust_1"), sub.id)
            .await
            .is_ok());
        assert!(h
            .engine
            .get_subscription(&Actor::admin("ops"), sub.id)
            .await
            .is_ok());
        let err = h
            .engine
            .get_subscription(&Actor::customer("cust_2"), sub.id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_register_billing_key_is_idempotent_per_customer() {
        let h = harness_with(0, None).await;
        let again = h
            .engine
            .register_billing_key("cust_1", "bk_1", CardMetadata::default())
            .await
            .unwrap();
        assert_eq!(again.id, h.key.id);

        let err = h
            .engine
            .register_billing_key("cust_2", "bk_1", CardMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_negative_usage_rejected() {
        let h = harness_with(0, None).await;
        let sub = create(&h).await;
        let err = h
            .engine
            .record_usage(&Actor::customer("cust_1"), sub.id, "api_calls", -1, 100)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }
}
