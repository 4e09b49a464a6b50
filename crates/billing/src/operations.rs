//! One-shot payment operations: partial cancel, escrow confirmation and cash
//! receipt issuance.
//!
//! Each call authorizes the caller against the payment's customer, goes to
//! the gateway with a deterministic idempotency key, then persists an
//! immutable side record. Compensating side effects (inventory restore,
//! vendor settlement) are written to a durable outbox first and attempted
//! right away; a failed attempt never fails the financial operation and is
//! picked up again by [`PaymentOperations::reconcile_compensations`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::access::Actor;
use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{CancelPaymentRequest, CashReceiptRequest, PaymentGateway};
use crate::models::{
    CancelRecord, CashReceipt, CashReceiptType, CompensationKind, CompensationStatus,
    CompensationTask, EscrowConfirmation, InventoryRestoration, PaymentRecord, PaymentStatus,
    SettlementRecord,
};
use crate::store::LedgerStore;

/// Applies one compensating side effect. Must be idempotent per task source.
#[async_trait]
pub trait Compensator: Send + Sync {
    async fn apply(&self, task: &CompensationTask) -> BillingResult<()>;
}

/// Writes compensations as ledger entries keyed by their source record
pub struct LedgerCompensator {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl LedgerCompensator {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    async fn payment(&self, payment_key: &str) -> BillingResult<PaymentRecord> {
        self.store
            .get_payment_by_key(payment_key)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("payment {}", payment_key)))
    }
}

#[async_trait]
impl Compensator for LedgerCompensator {
    async fn apply(&self, task: &CompensationTask) -> BillingResult<()> {
        match task.kind {
            CompensationKind::InventoryRestore => {
                let cancel = self
                    .store
                    .get_cancel_record(task.source_id)
                    .await?
                    .ok_or_else(|| {
                        BillingError::NotFound(format!("cancel record {}", task.source_id))
                    })?;
                let payment = self.payment(&cancel.payment_key).await?;
                self.store
                    .insert_inventory_restoration(&InventoryRestoration {
                        id: Uuid::new_v4(),
                        cancel_record_id: cancel.id,
                        order_id: payment.order_id,
                        amount: cancel.cancel_amount,
                        created_at: self.clock.now(),
                    })
                    .await
            }
            CompensationKind::VendorSettlement => {
                let escrow = self
                    .store
                    .get_escrow_confirmation(task.source_id)
                    .await?
                    .ok_or_else(|| {
                        BillingError::NotFound(format!("escrow confirmation {}", task.source_id))
                    })?;
                let payment = self.payment(&escrow.payment_key).await?;
                self.store
                    .insert_settlement(&SettlementRecord {
                        id: Uuid::new_v4(),
                        payment_id: payment.id,
                        escrow_confirmation_id: escrow.id,
                        amount: payment.amount,
                        currency: payment.currency,
                        settled_at: self.clock.now(),
                    })
                    .await
            }
        }
    }
}

/// Result of a partial cancel
#[derive(Debug, Clone, Serialize)]
pub struct PartialCancelResult {
    pub cancel_record: CancelRecord,
    pub payment_status: PaymentStatus,
    /// Amount still cancellable after this call
    pub remaining_amount: i64,
}

/// Summary of one outbox reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompensationReport {
    pub examined: usize,
    pub completed: usize,
    pub failed: usize,
}

pub struct PaymentOperations {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    compensator: Arc<dyn Compensator>,
}

impl PaymentOperations {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let compensator = Arc::new(LedgerCompensator::new(store.clone(), clock.clone()));
        Self {
            store,
            gateway,
            clock,
            compensator,
        }
    }

    pub fn with_compensator(mut self, compensator: Arc<dyn Compensator>) -> Self {
        self.compensator = compensator;
        self
    }

    async fn load_payment(&self, actor: &Actor, payment_key: &str) -> BillingResult<PaymentRecord> {
        if payment_key.trim().is_empty() {
            return Err(BillingError::Validation("paymentKey is required".to_string()));
        }
        let payment = self
            .store
            .get_payment_by_key(payment_key)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("payment {}", payment_key)))?;
        actor.ensure_can_access(&payment.customer_id)?;
        Ok(payment)
    }

    /// Total cancelled so far and the sequence the next cancellation takes
    async fn cancelled_so_far(&self, payment: &PaymentRecord) -> BillingResult<(i64, u32)> {
        let prior = self.store.list_cancel_records(payment.id).await?;
        let total = prior
            .iter()
            .try_fold(0i64, |acc, r| acc.checked_add(r.cancel_amount))
            .ok_or_else(|| BillingError::Internal("cancelled total overflows".to_string()))?;
        let next = u32::try_from(prior.len())
            .map_err(|_| BillingError::Internal("too many cancellations".to_string()))?;
        Ok((total, next))
    }

    // =========================================================================
    // Partial cancel
    // =========================================================================

    pub async fn partial_cancel(
        &self,
        actor: &Actor,
        payment_key: &str,
        cancel_amount: i64,
        reason: &str,
    ) -> BillingResult<PartialCancelResult> {
        if reason.trim().is_empty() {
            return Err(BillingError::Validation("cancelReason is required".to_string()));
        }
        if cancel_amount <= 0 {
            return Err(BillingError::Validation(
                "cancelAmount must be positive".to_string(),
            ));
        }

        let mut payment = self.load_payment(actor, payment_key).await?;
        if !matches!(
            payment.status,
            PaymentStatus::Succeeded | PaymentStatus::PartiallyCancelled
        ) {
            return Err(BillingError::Validation(format!(
                "payment is {} and cannot be cancelled",
                payment.status
            )));
        }

        let (cancelled, sequence) = self.cancelled_so_far(&payment).await?;
        let remaining = payment.amount - cancelled;
        if cancel_amount > remaining {
            return Err(BillingError::Validation(format!(
                "cancelAmount {} exceeds remaining {}",
                cancel_amount, remaining
            )));
        }

        let receipt = self
            .gateway
            .cancel_payment(&CancelPaymentRequest {
                payment_key: payment_key.to_string(),
                cancel_reason: reason.to_string(),
                cancel_amount: Some(cancel_amount),
                idempotency_key: format!("cancel:{}:{}", payment.id, sequence),
            })
            .await?;

        // Callers that raced on one sequence shared an idempotency key, so the
        // gateway executed one of their amounts; the receipt says which.
        let executed = if receipt.cancel_amount > 0 {
            receipt.cancel_amount
        } else {
            cancel_amount
        };

        let now = self.clock.now();
        let record = CancelRecord {
            id: Uuid::new_v4(),
            payment_id: payment.id,
            payment_key: payment_key.to_string(),
            sequence,
            cancel_amount: executed,
            reason: reason.to_string(),
            gateway_transaction_key: receipt.transaction_key,
            cancelled_at: now,
        };
        match self.store.insert_cancel_record(&record).await {
            Ok(()) => {}
            Err(BillingError::Conflict(_)) => {
                return self.recorded_cancellation(&payment, &record).await;
            }
            Err(e) => return Err(e),
        }

        let remaining_amount = remaining - executed;
        payment.status = if remaining_amount == 0 {
            PaymentStatus::Cancelled
        } else {
            PaymentStatus::PartiallyCancelled
        };
        payment.updated_at = now;
        self.store.put_payment(&payment).await?;

        tracing::info!(
            payment_key = %payment_key,
            order_id = %payment.order_id,
            requested_amount = cancel_amount,
            cancel_amount = executed,
            sequence = sequence,
            remaining_amount = remaining_amount,
            "Payment partially cancelled"
        );

        self.enqueue_compensation(CompensationKind::InventoryRestore, record.id)
            .await?;

        Ok(PartialCancelResult {
            cancel_record: record,
            payment_status: payment.status,
            remaining_amount,
        })
    }

    /// Another caller recorded this sequence first. When the gateway answered
    /// both with the same transaction, that record is this call's result too;
    /// anything else must be retried against the new balance.
    async fn recorded_cancellation(
        &self,
        payment: &PaymentRecord,
        attempted: &CancelRecord,
    ) -> BillingResult<PartialCancelResult> {
        let recorded = self.store.list_cancel_records(payment.id).await?;
        let winner = recorded
            .iter()
            .find(|r| r.sequence == attempted.sequence)
            .filter(|r| {
                r.gateway_transaction_key.is_some()
                    && r.gateway_transaction_key == attempted.gateway_transaction_key
            })
            .cloned();

        let Some(cancel_record) = winner else {
            tracing::warn!(
                order_id = %payment.order_id,
                sequence = attempted.sequence,
                "Concurrent cancellation recorded first"
            );
            return Err(BillingError::Conflict(format!(
                "payment {} was cancelled concurrently; retry against the new balance",
                attempted.payment_key
            )));
        };

        let cancelled = recorded
            .iter()
            .try_fold(0i64, |acc, r| acc.checked_add(r.cancel_amount))
            .ok_or_else(|| BillingError::Internal("cancelled total overflows".to_string()))?;
        let payment_status = self
            .store
            .get_payment_by_order(&payment.order_id)
            .await?
            .map(|p| p.status)
            .unwrap_or(payment.status);

        tracing::info!(
            order_id = %payment.order_id,
            sequence = cancel_record.sequence,
            cancel_amount = cancel_record.cancel_amount,
            "Cancellation shared with a concurrent request"
        );

        Ok(PartialCancelResult {
            cancel_record,
            payment_status,
            remaining_amount: payment.amount - cancelled,
        })
    }

    // =========================================================================
    // Escrow
    // =========================================================================

    /// Release escrowed funds. A repeat call returns the stored confirmation.
    pub async fn confirm_escrow(
        &self,
        actor: &Actor,
        payment_key: &str,
    ) -> BillingResult<EscrowConfirmation> {
        let payment = self.load_payment(actor, payment_key).await?;
        if payment.status != PaymentStatus::Succeeded {
            return Err(BillingError::Validation(format!(
                "payment is {} and cannot be confirmed",
                payment.status
            )));
        }

        if let Some(existing) = self.store.find_escrow_confirmation(payment.id).await? {
            return Ok(existing);
        }

        self.gateway
            .confirm_escrow(payment_key, &format!("escrow:{}", payment.id))
            .await?;

        let confirmation = EscrowConfirmation {
            id: Uuid::new_v4(),
            payment_id: payment.id,
            payment_key: payment_key.to_string(),
            confirmed_by: actor.customer_id.clone(),
            confirmed_at: self.clock.now(),
        };

        match self.store.insert_escrow_confirmation(&confirmation).await {
            Ok(()) => {}
            Err(BillingError::Conflict(_)) => {
                return self
                    .store
                    .find_escrow_confirmation(payment.id)
                    .await?
                    .ok_or_else(|| BillingError::Internal("escrow row vanished".to_string()));
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            payment_key = %payment_key,
            confirmed_by = %confirmation.confirmed_by,
            "Escrow confirmed"
        );

        self.enqueue_compensation(CompensationKind::VendorSettlement, confirmation.id)
            .await?;
        Ok(confirmation)
    }

    // =========================================================================
    // Cash receipt
    // =========================================================================

    /// Issue the cash receipt for a payment. One per payment; a repeat call
    /// returns the stored receipt.
    pub async fn issue_cash_receipt(
        &self,
        actor: &Actor,
        payment_key: &str,
        receipt_type: CashReceiptType,
        identity_number: &str,
    ) -> BillingResult<CashReceipt> {
        if identity_number.trim().is_empty() {
            return Err(BillingError::Validation(
                "identityNumber is required".to_string(),
            ));
        }

        let payment = self.load_payment(actor, payment_key).await?;
        if !matches!(
            payment.status,
            PaymentStatus::Succeeded | PaymentStatus::PartiallyCancelled
        ) {
            return Err(BillingError::Validation(format!(
                "payment is {} and cannot take a receipt",
                payment.status
            )));
        }

        if let Some(existing) = self.store.find_cash_receipt(payment.id).await? {
            return Ok(existing);
        }

        let (cancelled, _) = self.cancelled_so_far(&payment).await?;
        let amount = payment.amount - cancelled;

        let issued = self
            .gateway
            .issue_cash_receipt(&CashReceiptRequest {
                payment_key: payment_key.to_string(),
                order_id: payment.order_id.clone(),
                order_name: format!("Order {}", payment.order_id),
                amount,
                receipt_type,
                identity_number: identity_number.trim().to_string(),
                idempotency_key: format!("receipt:{}", payment.id),
            })
            .await?;

        let receipt = CashReceipt {
            id: Uuid::new_v4(),
            payment_id: payment.id,
            payment_key: payment_key.to_string(),
            receipt_key: issued.receipt_key,
            receipt_type,
            amount,
            receipt_url: issued.receipt_url,
            issued_at: self.clock.now(),
        };

        match self.store.insert_cash_receipt(&receipt).await {
            Ok(()) => {}
            Err(BillingError::Conflict(_)) => {
                return self
                    .store
                    .find_cash_receipt(payment.id)
                    .await?
                    .ok_or_else(|| BillingError::Internal("receipt row vanished".to_string()));
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            payment_key = %payment_key,
            receipt_type = %receipt_type,
            amount = amount,
            "Cash receipt issued"
        );
        Ok(receipt)
    }

    // =========================================================================
    // Settlements and the compensation outbox
    // =========================================================================

    pub async fn settlements_between(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> BillingResult<Vec<SettlementRecord>> {
        if from >= to {
            return Err(BillingError::Validation(
                "settlement window is empty".to_string(),
            ));
        }
        self.store.list_settlements(from, to).await
    }

    async fn enqueue_compensation(
        &self,
        kind: CompensationKind,
        source_id: Uuid,
    ) -> BillingResult<()> {
        let now = self.clock.now();
        let task = CompensationTask {
            id: Uuid::new_v4(),
            kind,
            source_id,
            status: CompensationStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.put_compensation(&task).await?;
        self.attempt_compensation(task).await;
        Ok(())
    }

    /// Returns whether the task completed. Failures stay pending.
    async fn attempt_compensation(&self, mut task: CompensationTask) -> bool {
        let result = self.compensator.apply(&task).await;
        task.attempts = task.attempts.saturating_add(1);
        task.updated_at = self.clock.now();

        let done = match result {
            Ok(()) => {
                task.status = CompensationStatus::Done;
                task.last_error = None;
                true
            }
            Err(e) => {
                tracing::warn!(
                    task_id = %task.id,
                    kind = %task.kind,
                    source_id = %task.source_id,
                    attempts = task.attempts,
                    error = %e,
                    "Compensation failed, left pending"
                );
                task.last_error = Some(e.to_string());
                false
            }
        };

        if let Err(e) = self.store.put_compensation(&task).await {
            tracing::error!(
                task_id = %task.id,
                error = %e,
                "Failed to record compensation attempt"
            );
        }
        done
    }

    /// Re-run up to `limit` pending compensations
    pub async fn reconcile_compensations(&self, limit: i64) -> BillingResult<CompensationReport> {
        let pending = self.store.list_pending_compensations(limit).await?;
        let mut report = CompensationReport {
            examined: pending.len(),
            ..Default::default()
        };

        for task in pending {
            if self.attempt_compensation(task).await {
                report.completed += 1;
            } else {
                report.failed += 1;
            }
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                completed = report.completed,
                failed = report.failed,
                "Compensation reconciliation complete"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::gateway::{FakeGateway, GatewayCall};
    use crate::models::PaymentKind;
    use crate::store::InMemoryLedger;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;
    use time::macros::datetime;

    struct Setup {
        ops: PaymentOperations,
        store: Arc<InMemoryLedger>,
        gateway: Arc<FakeGateway>,
        clock: Arc<ManualClock>,
    }

    fn setup() -> Setup {
        let store = Arc::new(InMemoryLedger::new());
        let gateway = Arc::new(FakeGateway::new());
        let clock = Arc::new(ManualClock::new(datetime!(2026-03-02 09:00 UTC)));
        let ops = PaymentOperations::new(store.clone(), gateway.clone(), clock.clone());
        Setup {
            ops,
            store,
            gateway,
            clock,
        }
    }

    async fn settled_payment(store: &InMemoryLedger, key: &str, amount: i64) -> PaymentRecord {
        let mut record = PaymentRecord::new_pending(
            format!("order_{}", key),
            "cust_1".to_string(),
            None,
            PaymentKind::Order,
            amount,
            "KRW".to_string(),
            None,
            datetime!(2026-03-01 12:00 UTC),
        );
        record.status = PaymentStatus::Succeeded;
        record.payment_key = Some(key.to_string());
        store.put_payment(&record).await.unwrap();
        record
    }

    /// Fails the first `failures` attempts, then delegates to the ledger
    struct FlakyCompensator {
        failures: AtomicUsize,
        inner: LedgerCompensator,
    }

    #[async_trait]
    impl Compensator for FlakyCompensator {
        async fn apply(&self, task: &CompensationTask) -> BillingResult<()> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(BillingError::Internal("inventory service down".to_string()));
            }
            self.inner.apply(task).await
        }
    }

    #[tokio::test]
    async fn test_partial_cancel_twice_then_over_limit() {
        let s = setup();
        settled_payment(&s.store, "pay_1", 30_000).await;
        let actor = Actor::customer("cust_1");

        let first = s
            .ops
            .partial_cancel(&actor, "pay_1", 10_000, "one item returned")
            .await
            .unwrap();
        assert_eq!(first.remaining_amount, 20_000);
        assert_eq!(first.payment_status, PaymentStatus::PartiallyCancelled);

        let second = s
            .ops
            .partial_cancel(&actor, "pay_1", 20_000, "rest returned")
            .await
            .unwrap();
        assert_eq!(second.remaining_amount, 0);
        assert_eq!(second.payment_status, PaymentStatus::Cancelled);

        let err = s
            .ops
            .partial_cancel(&actor, "pay_1", 1, "again")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        // Distinct idempotency keys per cancel slot
        let keys: Vec<String> = s
            .gateway
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                GatewayCall::Cancel(req) => Some(req.idempotency_key),
                _ => None,
            })
            .collect();
        assert_eq!(keys.len(), 2);
        assert_ne!(keys[0], keys[1]);

        assert_eq!(s.store.inventory_restorations().await.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_partial_cancels_record_what_gateway_executed() {
        let s = setup();
        let payment = settled_payment(&s.store, "pay_1", 10_000).await;
        let actor = Actor::customer("cust_1");
        s.gateway.set_cancel_delay(Some(StdDuration::from_millis(100)));

        let (a, b) = tokio::join!(
            s.ops.partial_cancel(&actor, "pay_1", 3_000, "first item"),
            async {
                tokio::time::sleep(StdDuration::from_millis(20)).await;
                s.ops
                    .partial_cancel(&actor, "pay_1", 5_000, "second item")
                    .await
            }
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        // Both requests read the same balance and shared one idempotency key;
        // the gateway executed the first amount once.
        assert_eq!(s.gateway.executed_cancels().len(), 1);
        assert_eq!(a.cancel_record, b.cancel_record);
        assert_eq!(a.cancel_record.cancel_amount, 3_000);
        assert_eq!(b.remaining_amount, 7_000);

        let recorded = s.store.list_cancel_records(payment.id).await.unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(
            recorded.iter().map(|r| r.cancel_amount).sum::<i64>(),
            s.gateway
                .executed_cancels()
                .iter()
                .map(|r| r.cancel_amount)
                .sum::<i64>()
        );
        assert_eq!(s.store.inventory_restorations().await.len(), 1);

        // The next cancel takes a fresh sequence against the real balance
        let next = s
            .ops
            .partial_cancel(&actor, "pay_1", 5_000, "second item")
            .await
            .unwrap();
        assert_eq!(next.cancel_record.sequence, 1);
        assert_eq!(next.remaining_amount, 2_000);
    }

    #[tokio::test]
    async fn test_partial_cancel_losing_sequence_to_other_transaction_conflicts() {
        let s = setup();
        let payment = settled_payment(&s.store, "pay_1", 10_000).await;
        let actor = Actor::customer("cust_1");
        s.gateway.set_cancel_delay(Some(StdDuration::from_millis(100)));

        let other = CancelRecord {
            id: Uuid::new_v4(),
            payment_id: payment.id,
            payment_key: "pay_1".to_string(),
            sequence: 0,
            cancel_amount: 4_000,
            reason: "cancelled elsewhere".to_string(),
            gateway_transaction_key: Some("tx_elsewhere".to_string()),
            cancelled_at: s.clock.now(),
        };
        let (result, _) = tokio::join!(
            s.ops.partial_cancel(&actor, "pay_1", 3_000, "item returned"),
            async {
                tokio::time::sleep(StdDuration::from_millis(20)).await;
                s.store.insert_cancel_record(&other).await.unwrap();
            }
        );

        assert!(matches!(result.unwrap_err(), BillingError::Conflict(_)));
        let recorded = s.store.list_cancel_records(payment.id).await.unwrap();
        assert_eq!(recorded, vec![other]);
        assert!(s.store.inventory_restorations().await.is_empty());
    }

    #[tokio::test]
    async fn test_partial_cancel_validation_and_access() {
        let s = setup();
        settled_payment(&s.store, "pay_1", 30_000).await;

        let stranger = Actor::customer("cust_2");
        let err = s
            .ops
            .partial_cancel(&stranger, "pay_1", 1_000, "reason")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Forbidden(_)));

        let owner = Actor::customer("cust_1");
        for (amount, reason) in [(0, "reason"), (-5, "reason"), (1_000, "  ")] {
            let err = s
                .ops
                .partial_cancel(&owner, "pay_1", amount, reason)
                .await
                .unwrap_err();
            assert!(matches!(err, BillingError::Validation(_)));
        }

        let err = s
            .ops
            .partial_cancel(&owner, "pay_missing", 1_000, "reason")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
        assert!(s.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_gateway_rejection_leaves_no_record() {
        let s = setup();
        let payment = settled_payment(&s.store, "pay_1", 30_000).await;
        s.gateway.fail_next_cancel("NOT_CANCELABLE_AMOUNT");

        let err = s
            .ops
            .partial_cancel(&Actor::admin("ops"), "pay_1", 5_000, "reason")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Gateway { .. }));
        assert!(s
            .store
            .list_cancel_records(payment.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_escrow_confirm_once_and_settles() {
        let s = setup();
        settled_payment(&s.store, "pay_1", 45_000).await;
        let actor = Actor::customer("cust_1");

        let first = s.ops.confirm_escrow(&actor, "pay_1").await.unwrap();
        let second = s.ops.confirm_escrow(&actor, "pay_1").await.unwrap();
        assert_eq!(first.id, second.id);

        let escrow_calls = s
            .gateway
            .calls()
            .into_iter()
            .filter(|c| matches!(c, GatewayCall::ConfirmEscrow(_)))
            .count();
        assert_eq!(escrow_calls, 1);

        let settlements = s
            .ops
            .settlements_between(datetime!(2026-03-02 0:00 UTC), datetime!(2026-03-03 0:00 UTC))
            .await
            .unwrap();
        assert_eq!(settlements.len(), 1);
        assert_eq!(settlements[0].amount, 45_000);
        assert_eq!(settlements[0].escrow_confirmation_id, first.id);
    }

    #[tokio::test]
    async fn test_cash_receipt_once_per_payment() {
        let s = setup();
        settled_payment(&s.store, "pay_1", 12_000).await;
        let actor = Actor::customer("cust_1");

        let err = s
            .ops
            .issue_cash_receipt(&actor, "pay_1", CashReceiptType::IncomeDeduction, "")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        let first = s
            .ops
            .issue_cash_receipt(&actor, "pay_1", CashReceiptType::IncomeDeduction, "01012345678")
            .await
            .unwrap();
        let second = s
            .ops
            .issue_cash_receipt(&actor, "pay_1", CashReceiptType::ExpenseProof, "01012345678")
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.amount, 12_000);
        assert_eq!(second.receipt_type, CashReceiptType::IncomeDeduction);
    }

    #[tokio::test]
    async fn test_failed_compensation_reconciled_later() {
        let s = setup();
        let ops = PaymentOperations::new(s.store.clone(), s.gateway.clone(), s.clock.clone())
            .with_compensator(Arc::new(FlakyCompensator {
                failures: AtomicUsize::new(1),
                inner: LedgerCompensator::new(s.store.clone(), s.clock.clone()),
            }));
        settled_payment(&s.store, "pay_1", 30_000).await;

        // Financial operation succeeds even though the side effect failed
        let result = ops
            .partial_cancel(&Actor::customer("cust_1"), "pay_1", 3_000, "damaged")
            .await
            .unwrap();
        assert_eq!(result.remaining_amount, 27_000);
        assert!(s.store.inventory_restorations().await.is_empty());

        let pending = s.store.list_pending_compensations(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].last_error.is_some());

        let report = ops.reconcile_compensations(10).await.unwrap();
        assert_eq!(report.completed, 1);
        assert!(s.store.list_pending_compensations(10).await.unwrap().is_empty());

        let restored = s.store.inventory_restorations().await;
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].amount, 3_000);
        assert_eq!(restored[0].order_id, "order_pay_1");
    }

    #[tokio::test]
    async fn test_empty_settlement_window_rejected() {
        let s = setup();
        let at = datetime!(2026-03-02 0:00 UTC);
        assert!(s.ops.settlements_between(at, at).await.is_err());
    }
}
