//! In-memory ledger
//!
//! One `RwLock` guards every table so each trait call is atomic, which is all
//! the claim and version-check semantics need.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{LedgerStore, PAYMENT_CLAIM_TIMEOUT, WEBHOOK_CLAIM_TIMEOUT};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    BillingKey, CancelRecord, CashReceipt, CompensationStatus, CompensationTask,
    EscrowConfirmation, InventoryRestoration, PaymentClaim, PaymentRecord, PaymentStatus, Plan,
    SettlementRecord, Subscription, SubscriptionStatus, UsageRecord, WebhookClaim, WebhookEvent,
    WebhookStatus,
};

#[derive(Default)]
struct Tables {
    plans: HashMap<Uuid, Plan>,
    billing_keys: HashMap<Uuid, BillingKey>,
    subscriptions: HashMap<Uuid, Subscription>,
    usage: Vec<UsageRecord>,
    payments: HashMap<String, PaymentRecord>,
    webhook_events: Vec<WebhookEvent>,
    cancel_records: Vec<CancelRecord>,
    escrow_confirmations: Vec<EscrowConfirmation>,
    cash_receipts: Vec<CashReceipt>,
    settlements: Vec<SettlementRecord>,
    inventory_restorations: Vec<InventoryRestoration>,
    compensations: HashMap<Uuid, CompensationTask>,
}

#[derive(Default)]
pub struct InMemoryLedger {
    tables: RwLock<Tables>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inventory restorations written so far
    pub async fn inventory_restorations(&self) -> Vec<InventoryRestoration> {
        self.tables.read().await.inventory_restorations.clone()
    }

    /// Insert a row as-is, skipping the one-live-subscription rule. Used to
    /// reproduce rows that predate the rule.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn seed_subscription(&self, subscription: Subscription) {
        self.tables
            .write()
            .await
            .subscriptions
            .insert(subscription.id, subscription);
    }
}

fn sorted_by_created(mut subs: Vec<Subscription>) -> Vec<Subscription> {
    subs.sort_by_key(|s| (s.created_at, s.id));
    subs
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn get_plan(&self, id: Uuid) -> BillingResult<Option<Plan>> {
        Ok(self.tables.read().await.plans.get(&id).cloned())
    }

    async fn put_plan(&self, plan: &Plan) -> BillingResult<()> {
        self.tables.write().await.plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn get_billing_key(&self, id: Uuid) -> BillingResult<Option<BillingKey>> {
        Ok(self.tables.read().await.billing_keys.get(&id).cloned())
    }

    async fn find_billing_key(&self, token: &str) -> BillingResult<Option<BillingKey>> {
        Ok(self
            .tables
            .read()
            .await
            .billing_keys
            .values()
            .find(|k| k.billing_key == token)
            .cloned())
    }

    async fn put_billing_key(&self, key: &BillingKey) -> BillingResult<()> {
        let mut tables = self.tables.write().await;
        let duplicate_token = tables
            .billing_keys
            .values()
            .any(|k| k.billing_key == key.billing_key && k.id != key.id);
        if duplicate_token {
            return Err(BillingError::Conflict(
                "billing key token already registered".to_string(),
            ));
        }
        tables.billing_keys.insert(key.id, key.clone());
        Ok(())
    }

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.tables.read().await.subscriptions.get(&id).cloned())
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        let mut tables = self.tables.write().await;
        let has_live = tables
            .subscriptions
            .values()
            .any(|s| s.customer_id == subscription.customer_id && s.status.is_live());
        if has_live {
            return Err(BillingError::Conflict(format!(
                "customer {} already has a live subscription",
                subscription.customer_id
            )));
        }
        if tables.subscriptions.contains_key(&subscription.id) {
            return Err(BillingError::Conflict(format!(
                "subscription {} already exists",
                subscription.id
            )));
        }
        tables
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn put_subscription_if_version(
        &self,
        subscription: &Subscription,
    ) -> BillingResult<Subscription> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .subscriptions
            .get_mut(&subscription.id)
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", subscription.id)))?;
        if stored.version != subscription.version {
            return Err(BillingError::ConcurrentModification(format!(
                "subscription {}",
                subscription.id
            )));
        }
        let mut next = subscription.clone();
        next.version += 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn list_due(
        &self,
        before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let tables = self.tables.read().await;
        let mut due: Vec<Subscription> = tables
            .subscriptions
            .values()
            .filter(|s| {
                s.status.is_billable() && !s.cancel_at_period_end && s.next_billing_date < before
            })
            .cloned()
            .collect();
        due.sort_by_key(|s| (s.next_billing_date, s.id));
        due.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(due)
    }

    async fn list_expiring(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>> {
        let tables = self.tables.read().await;
        Ok(sorted_by_created(
            tables
                .subscriptions
                .values()
                .filter(|s| {
                    s.cancel_at_period_end
                        && s.current_period_end <= now
                        && !s.status.is_terminal()
                })
                .cloned()
                .collect(),
        ))
    }

    async fn list_by_billing_key(&self, billing_key_id: Uuid) -> BillingResult<Vec<Subscription>> {
        let tables = self.tables.read().await;
        Ok(sorted_by_created(
            tables
                .subscriptions
                .values()
                .filter(|s| s.billing_key_id == billing_key_id)
                .cloned()
                .collect(),
        ))
    }

    async fn list_customer_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<Subscription>> {
        let tables = self.tables.read().await;
        let mut subs = sorted_by_created(
            tables
                .subscriptions
                .values()
                .filter(|s| s.customer_id == customer_id)
                .cloned()
                .collect(),
        );
        subs.reverse();
        Ok(subs)
    }

    async fn list_subscriptions_by_status(
        &self,
        statuses: &[SubscriptionStatus],
    ) -> BillingResult<Vec<Subscription>> {
        let tables = self.tables.read().await;
        Ok(sorted_by_created(
            tables
                .subscriptions
                .values()
                .filter(|s| statuses.contains(&s.status))
                .cloned()
                .collect(),
        ))
    }

    async fn insert_usage(&self, usage: &UsageRecord) -> BillingResult<()> {
        self.tables.write().await.usage.push(usage.clone());
        Ok(())
    }

    async fn usage_total(
        &self,
        subscription_id: Uuid,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> BillingResult<i64> {
        let tables = self.tables.read().await;
        tables
            .usage
            .iter()
            .filter(|u| {
                u.subscription_id == subscription_id && u.recorded_at >= from && u.recorded_at < to
            })
            .try_fold(0i64, |acc, u| {
                u.quantity
                    .checked_mul(u.unit_amount)
                    .and_then(|line| acc.checked_add(line))
            })
            .ok_or_else(|| BillingError::Validation("metered usage overflows".to_string()))
    }

    async fn claim_payment(
        &self,
        candidate: &PaymentRecord,
        now: OffsetDateTime,
    ) -> BillingResult<PaymentClaim> {
        let mut tables = self.tables.write().await;
        let Some(existing) = tables.payments.get_mut(&candidate.order_id) else {
            tables
                .payments
                .insert(candidate.order_id.clone(), candidate.clone());
            return Ok(PaymentClaim::Claimed(candidate.clone()));
        };

        match existing.status {
            PaymentStatus::Succeeded
            | PaymentStatus::Cancelled
            | PaymentStatus::PartiallyCancelled => Ok(PaymentClaim::AlreadySucceeded(existing.clone())),
            PaymentStatus::Failed => {
                existing.status = PaymentStatus::Pending;
                existing.retry_count += 1;
                existing.amount = candidate.amount;
                existing.failure_reason = None;
                existing.updated_at = now;
                Ok(PaymentClaim::Claimed(existing.clone()))
            }
            PaymentStatus::Pending if existing.updated_at < now - PAYMENT_CLAIM_TIMEOUT => {
                existing.retry_count += 1;
                existing.amount = candidate.amount;
                existing.updated_at = now;
                Ok(PaymentClaim::Claimed(existing.clone()))
            }
            PaymentStatus::Pending => Ok(PaymentClaim::InFlight),
        }
    }

    async fn get_payment_by_order(&self, order_id: &str) -> BillingResult<Option<PaymentRecord>> {
        Ok(self.tables.read().await.payments.get(order_id).cloned())
    }

    async fn get_payment_by_key(
        &self,
        payment_key: &str,
    ) -> BillingResult<Option<PaymentRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .payments
            .values()
            .find(|p| p.payment_key.as_deref() == Some(payment_key))
            .cloned())
    }

    async fn put_payment(&self, payment: &PaymentRecord) -> BillingResult<()> {
        self.tables
            .write()
            .await
            .payments
            .insert(payment.order_id.clone(), payment.clone());
        Ok(())
    }

    async fn settle_payment(
        &self,
        payment: &PaymentRecord,
        expected: PaymentStatus,
    ) -> BillingResult<bool> {
        let mut tables = self.tables.write().await;
        let Some(stored) = tables.payments.get_mut(&payment.order_id) else {
            return Ok(false);
        };
        if stored.retry_count != payment.retry_count || stored.status != expected {
            return Ok(false);
        }
        stored.status = payment.status;
        if payment.payment_key.is_some() {
            stored.payment_key = payment.payment_key.clone();
        }
        stored.failure_reason = payment.failure_reason.clone();
        stored.updated_at = payment.updated_at;
        Ok(true)
    }

    async fn claim_webhook_event(
        &self,
        event: &WebhookEvent,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookClaim> {
        let key = event.idempotency_key.clone().ok_or_else(|| {
            BillingError::Internal("cannot claim a webhook event without a key".to_string())
        })?;
        let mut tables = self.tables.write().await;
        let existing = tables
            .webhook_events
            .iter_mut()
            .find(|e| e.idempotency_key.as_deref() == Some(key.as_str()));

        match existing {
            None => {
                let mut claimed = event.clone();
                claimed.status = WebhookStatus::Processing;
                claimed.processing_started_at = Some(now);
                tables.webhook_events.push(claimed.clone());
                Ok(WebhookClaim::Claimed(claimed))
            }
            Some(existing) => match existing.status {
                WebhookStatus::Success => Ok(WebhookClaim::AlreadyProcessed(existing.clone())),
                WebhookStatus::Processing
                    if existing
                        .processing_started_at
                        .is_some_and(|started| started >= now - WEBHOOK_CLAIM_TIMEOUT) =>
                {
                    Ok(WebhookClaim::InProgress)
                }
                WebhookStatus::Processing | WebhookStatus::Failed => {
                    // Redelivery after a failure (or a stuck claim) is a retry of the same row
                    existing.status = WebhookStatus::Processing;
                    existing.processing_started_at = Some(now);
                    existing.retry_count += 1;
                    existing.payload = event.payload.clone();
                    existing.signature = event.signature.clone();
                    Ok(WebhookClaim::Claimed(existing.clone()))
                }
            },
        }
    }

    async fn insert_webhook_event(&self, event: &WebhookEvent) -> BillingResult<()> {
        self.tables.write().await.webhook_events.push(event.clone());
        Ok(())
    }

    async fn finish_webhook_event(
        &self,
        id: Uuid,
        status: WebhookStatus,
        error_message: Option<String>,
        retry_count: u32,
    ) -> BillingResult<()> {
        let mut tables = self.tables.write().await;
        let event = tables
            .webhook_events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| BillingError::NotFound(format!("webhook event {}", id)))?;
        event.status = status;
        event.error_message = error_message;
        event.retry_count = retry_count;
        Ok(())
    }

    async fn get_webhook_event(&self, id: Uuid) -> BillingResult<Option<WebhookEvent>> {
        Ok(self
            .tables
            .read()
            .await
            .webhook_events
            .iter()
            .find(|e| e.id == id)
            .cloned())
    }

    async fn list_webhook_events(
        &self,
        status: Option<WebhookStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEvent>> {
        let tables = self.tables.read().await;
        let mut events: Vec<WebhookEvent> = tables
            .webhook_events
            .iter()
            .filter(|e| status.is_none_or(|s| e.status == s))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        Ok(events
            .into_iter()
            .skip(usize::try_from(offset.max(0)).unwrap_or(0))
            .take(usize::try_from(limit.max(0)).unwrap_or(0))
            .collect())
    }

    async fn insert_cancel_record(&self, record: &CancelRecord) -> BillingResult<()> {
        let mut tables = self.tables.write().await;
        if tables
            .cancel_records
            .iter()
            .any(|r| r.payment_id == record.payment_id && r.sequence == record.sequence)
        {
            return Err(BillingError::Conflict(format!(
                "cancellation {} of payment {} already recorded",
                record.sequence, record.payment_id
            )));
        }
        tables.cancel_records.push(record.clone());
        Ok(())
    }

    async fn list_cancel_records(&self, payment_id: Uuid) -> BillingResult<Vec<CancelRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .cancel_records
            .iter()
            .filter(|r| r.payment_id == payment_id)
            .cloned()
            .collect())
    }

    async fn get_cancel_record(&self, id: Uuid) -> BillingResult<Option<CancelRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .cancel_records
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn insert_escrow_confirmation(&self, record: &EscrowConfirmation) -> BillingResult<()> {
        let mut tables = self.tables.write().await;
        if tables
            .escrow_confirmations
            .iter()
            .any(|r| r.payment_id == record.payment_id)
        {
            return Err(BillingError::Conflict(format!(
                "escrow for payment {} already confirmed",
                record.payment_id
            )));
        }
        tables.escrow_confirmations.push(record.clone());
        Ok(())
    }

    async fn get_escrow_confirmation(
        &self,
        id: Uuid,
    ) -> BillingResult<Option<EscrowConfirmation>> {
        Ok(self
            .tables
            .read()
            .await
            .escrow_confirmations
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn find_escrow_confirmation(
        &self,
        payment_id: Uuid,
    ) -> BillingResult<Option<EscrowConfirmation>> {
        Ok(self
            .tables
            .read()
            .await
            .escrow_confirmations
            .iter()
            .find(|r| r.payment_id == payment_id)
            .cloned())
    }

    async fn insert_cash_receipt(&self, receipt: &CashReceipt) -> BillingResult<()> {
        let mut tables = self.tables.write().await;
        if tables
            .cash_receipts
            .iter()
            .any(|r| r.payment_id == receipt.payment_id)
        {
            return Err(BillingError::Conflict(format!(
                "cash receipt for payment {} already issued",
                receipt.payment_id
            )));
        }
        tables.cash_receipts.push(receipt.clone());
        Ok(())
    }

    async fn find_cash_receipt(&self, payment_id: Uuid) -> BillingResult<Option<CashReceipt>> {
        Ok(self
            .tables
            .read()
            .await
            .cash_receipts
            .iter()
            .find(|r| r.payment_id == payment_id)
            .cloned())
    }

    async fn insert_settlement(&self, record: &SettlementRecord) -> BillingResult<()> {
        let mut tables = self.tables.write().await;
        if !tables
            .settlements
            .iter()
            .any(|r| r.escrow_confirmation_id == record.escrow_confirmation_id)
        {
            tables.settlements.push(record.clone());
        }
        Ok(())
    }

    async fn list_settlements(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> BillingResult<Vec<SettlementRecord>> {
        let tables = self.tables.read().await;
        let mut settlements: Vec<SettlementRecord> = tables
            .settlements
            .iter()
            .filter(|r| r.settled_at >= from && r.settled_at < to)
            .cloned()
            .collect();
        settlements.sort_by_key(|r| r.settled_at);
        Ok(settlements)
    }

    async fn insert_inventory_restoration(
        &self,
        record: &InventoryRestoration,
    ) -> BillingResult<()> {
        let mut tables = self.tables.write().await;
        if !tables
            .inventory_restorations
            .iter()
            .any(|r| r.cancel_record_id == record.cancel_record_id)
        {
            tables.inventory_restorations.push(record.clone());
        }
        Ok(())
    }

    async fn put_compensation(&self, task: &CompensationTask) -> BillingResult<()> {
        self.tables
            .write()
            .await
            .compensations
            .insert(task.id, task.clone());
        Ok(())
    }

    async fn list_pending_compensations(
        &self,
        limit: i64,
    ) -> BillingResult<Vec<CompensationTask>> {
        let tables = self.tables.read().await;
        let mut pending: Vec<CompensationTask> = tables
            .compensations
            .values()
            .filter(|t| t.status == CompensationStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|t| t.created_at);
        pending.truncate(usize::try_from(limit.max(0)).unwrap_or(0));
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PaymentKind, WebhookSource};
    use time::macros::datetime;

    fn pending(order_id: &str, now: OffsetDateTime) -> PaymentRecord {
        PaymentRecord::new_pending(
            order_id.to_string(),
            "cust_1".to_string(),
            None,
            PaymentKind::Renewal,
            10_000,
            "KRW".to_string(),
            None,
            now,
        )
    }

    #[tokio::test]
    async fn test_payment_claim_states() {
        let store = InMemoryLedger::new();
        let now = datetime!(2026-01-01 0:00 UTC);

        let first = store.claim_payment(&pending("o1", now), now).await.unwrap();
        assert!(matches!(first, PaymentClaim::Claimed(ref p) if p.retry_count == 0));

        // Live pending claim blocks a second unit of work
        let second = store.claim_payment(&pending("o1", now), now).await.unwrap();
        assert_eq!(second, PaymentClaim::InFlight);

        // Failed attempt can be retried with a bumped retry count
        let PaymentClaim::Claimed(mut record) = first else {
            unreachable!()
        };
        record.status = PaymentStatus::Failed;
        store.put_payment(&record).await.unwrap();
        let retry = store.claim_payment(&pending("o1", now), now).await.unwrap();
        assert!(matches!(retry, PaymentClaim::Claimed(ref p) if p.retry_count == 1));

        // Succeeded orders are never charged again
        let PaymentClaim::Claimed(mut record) = retry else {
            unreachable!()
        };
        record.status = PaymentStatus::Succeeded;
        store.put_payment(&record).await.unwrap();
        let after = store.claim_payment(&pending("o1", now), now).await.unwrap();
        assert!(matches!(after, PaymentClaim::AlreadySucceeded(_)));
    }

    #[tokio::test]
    async fn test_stale_pending_claim_is_reclaimed() {
        let store = InMemoryLedger::new();
        let start = datetime!(2026-01-01 0:00 UTC);
        store.claim_payment(&pending("o1", start), start).await.unwrap();

        let later = start + time::Duration::minutes(11);
        let claim = store.claim_payment(&pending("o1", later), later).await.unwrap();
        assert!(matches!(claim, PaymentClaim::Claimed(ref p) if p.retry_count == 1));
    }

    #[tokio::test]
    async fn test_settle_payment_only_moves_expected_state() {
        let store = InMemoryLedger::new();
        let now = datetime!(2026-01-01 0:00 UTC);
        let PaymentClaim::Claimed(claimed) =
            store.claim_payment(&pending("o1", now), now).await.unwrap()
        else {
            panic!("first claim should win");
        };

        let mut succeeded = claimed.clone();
        succeeded.status = PaymentStatus::Succeeded;
        succeeded.payment_key = Some("pay_1".to_string());
        assert!(store
            .settle_payment(&succeeded, PaymentStatus::Pending)
            .await
            .unwrap());

        // A writer that read Pending before the success landed loses
        let mut failed = claimed.clone();
        failed.status = PaymentStatus::Failed;
        failed.failure_reason = Some("declined".to_string());
        assert!(!store
            .settle_payment(&failed, PaymentStatus::Pending)
            .await
            .unwrap());

        let stored = store.get_payment_by_order("o1").await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Succeeded);
        assert_eq!(stored.payment_key.as_deref(), Some("pay_1"));
        assert_eq!(stored.failure_reason, None);
    }

    #[tokio::test]
    async fn test_settle_payment_rejects_superseded_attempt() {
        let store = InMemoryLedger::new();
        let start = datetime!(2026-01-01 0:00 UTC);
        let PaymentClaim::Claimed(first) =
            store.claim_payment(&pending("o1", start), start).await.unwrap()
        else {
            panic!("first claim should win");
        };

        // Stale claim taken over by a newer attempt
        let later = start + time::Duration::minutes(11);
        store.claim_payment(&pending("o1", later), later).await.unwrap();

        let mut late = first;
        late.status = PaymentStatus::Failed;
        assert!(!store.settle_payment(&late, PaymentStatus::Pending).await.unwrap());
        let stored = store.get_payment_by_order("o1").await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancel_sequence_is_unique_per_payment() {
        let store = InMemoryLedger::new();
        let now = datetime!(2026-01-01 0:00 UTC);
        let payment_id = Uuid::new_v4();
        let record = |sequence: u32, amount: i64| CancelRecord {
            id: Uuid::new_v4(),
            payment_id,
            payment_key: "pay_1".to_string(),
            sequence,
            cancel_amount: amount,
            reason: "customer request".to_string(),
            gateway_transaction_key: None,
            cancelled_at: now,
        };

        store.insert_cancel_record(&record(0, 3_000)).await.unwrap();
        let err = store
            .insert_cancel_record(&record(0, 5_000))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));
        store.insert_cancel_record(&record(1, 5_000)).await.unwrap();

        let stored = store.list_cancel_records(payment_id).await.unwrap();
        assert_eq!(
            stored.iter().map(|r| r.cancel_amount).sum::<i64>(),
            8_000
        );
    }

    #[tokio::test]
    async fn test_webhook_claim_dedup() {
        let store = InMemoryLedger::new();
        let now = datetime!(2026-01-01 0:00 UTC);
        let event = WebhookEvent {
            id: Uuid::new_v4(),
            source: WebhookSource::Subscription,
            event_type: "SUBSCRIPTION_CANCELLED".to_string(),
            idempotency_key: Some("k1".to_string()),
            payload: "{}".to_string(),
            signature: None,
            received_at: now,
            status: WebhookStatus::Processing,
            error_message: None,
            retry_count: 0,
            processing_started_at: None,
        };

        let WebhookClaim::Claimed(claimed) = store.claim_webhook_event(&event, now).await.unwrap()
        else {
            panic!("first delivery should claim");
        };
        assert_eq!(
            store.claim_webhook_event(&event, now).await.unwrap(),
            WebhookClaim::InProgress
        );

        store
            .finish_webhook_event(claimed.id, WebhookStatus::Success, None, 0)
            .await
            .unwrap();
        assert!(matches!(
            store.claim_webhook_event(&event, now).await.unwrap(),
            WebhookClaim::AlreadyProcessed(_)
        ));
    }
}
