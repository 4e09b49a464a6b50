//! Ledger store
//!
//! The only shared mutable resource. Subscriptions are written with an
//! optimistic version check; payment and webhook rows are claimed atomically
//! so concurrent units of work cannot both charge or both dispatch.

mod memory;
mod postgres;

pub use memory::InMemoryLedger;
pub use postgres::PgLedger;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{
    BillingKey, CancelRecord, CashReceipt, CompensationTask, EscrowConfirmation,
    InventoryRestoration, PaymentClaim, PaymentRecord, PaymentStatus, Plan, SettlementRecord,
    Subscription, SubscriptionStatus, UsageRecord, WebhookClaim, WebhookEvent, WebhookStatus,
};

/// A pending payment claim older than this may be taken over
pub const PAYMENT_CLAIM_TIMEOUT: Duration = Duration::minutes(10);

/// A `processing` webhook claim older than this may be taken over
pub const WEBHOOK_CLAIM_TIMEOUT: Duration = Duration::minutes(30);

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ---- plans ----
    async fn get_plan(&self, id: Uuid) -> BillingResult<Option<Plan>>;
    async fn put_plan(&self, plan: &Plan) -> BillingResult<()>;

    // ---- billing keys ----
    async fn get_billing_key(&self, id: Uuid) -> BillingResult<Option<BillingKey>>;
    async fn find_billing_key(&self, token: &str) -> BillingResult<Option<BillingKey>>;
    async fn put_billing_key(&self, key: &BillingKey) -> BillingResult<()>;

    // ---- subscriptions ----
    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>>;

    /// Insert a new subscription. Fails with `Conflict` when the customer
    /// already holds a live (non-terminal) subscription.
    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()>;

    /// Write `subscription` only if the stored version equals
    /// `subscription.version`; returns the stored row with the bumped version.
    /// Fails with `ConcurrentModification` on mismatch.
    async fn put_subscription_if_version(
        &self,
        subscription: &Subscription,
    ) -> BillingResult<Subscription>;

    /// Billable subscriptions whose next billing date is before `before`
    async fn list_due(&self, before: OffsetDateTime, limit: i64)
        -> BillingResult<Vec<Subscription>>;

    /// Non-terminal subscriptions flagged to end whose period is over
    async fn list_expiring(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>>;

    async fn list_by_billing_key(&self, billing_key_id: Uuid) -> BillingResult<Vec<Subscription>>;
    async fn list_customer_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<Subscription>>;
    async fn list_subscriptions_by_status(
        &self,
        statuses: &[SubscriptionStatus],
    ) -> BillingResult<Vec<Subscription>>;

    // ---- metered usage ----
    async fn insert_usage(&self, usage: &UsageRecord) -> BillingResult<()>;

    /// Sum of quantity x unit amount recorded in `[from, to)`
    async fn usage_total(
        &self,
        subscription_id: Uuid,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> BillingResult<i64>;

    // ---- payments ----
    /// Atomically claim the charge for `candidate.order_id`.
    async fn claim_payment(
        &self,
        candidate: &PaymentRecord,
        now: OffsetDateTime,
    ) -> BillingResult<PaymentClaim>;
    async fn get_payment_by_order(&self, order_id: &str) -> BillingResult<Option<PaymentRecord>>;
    async fn get_payment_by_key(&self, payment_key: &str)
        -> BillingResult<Option<PaymentRecord>>;
    async fn put_payment(&self, payment: &PaymentRecord) -> BillingResult<()>;
    /// Move the attempt `(order_id, retry_count)` out of `expected` into
    /// `payment.status`. Returns false when another writer got there first.
    async fn settle_payment(
        &self,
        payment: &PaymentRecord,
        expected: PaymentStatus,
    ) -> BillingResult<bool>;

    // ---- webhook audit ----
    /// Atomically claim `event.idempotency_key` for processing.
    async fn claim_webhook_event(
        &self,
        event: &WebhookEvent,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookClaim>;
    /// Append an event that is not eligible for processing (e.g. bad signature)
    async fn insert_webhook_event(&self, event: &WebhookEvent) -> BillingResult<()>;
    async fn finish_webhook_event(
        &self,
        id: Uuid,
        status: WebhookStatus,
        error_message: Option<String>,
        retry_count: u32,
    ) -> BillingResult<()>;
    async fn get_webhook_event(&self, id: Uuid) -> BillingResult<Option<WebhookEvent>>;
    async fn list_webhook_events(
        &self,
        status: Option<WebhookStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEvent>>;

    // ---- one-shot side records ----
    /// Conflict when `(payment_id, sequence)` is already recorded
    async fn insert_cancel_record(&self, record: &CancelRecord) -> BillingResult<()>;
    async fn list_cancel_records(&self, payment_id: Uuid) -> BillingResult<Vec<CancelRecord>>;
    async fn get_cancel_record(&self, id: Uuid) -> BillingResult<Option<CancelRecord>>;
    async fn insert_escrow_confirmation(&self, record: &EscrowConfirmation) -> BillingResult<()>;
    async fn get_escrow_confirmation(&self, id: Uuid)
        -> BillingResult<Option<EscrowConfirmation>>;
    async fn find_escrow_confirmation(
        &self,
        payment_id: Uuid,
    ) -> BillingResult<Option<EscrowConfirmation>>;
    async fn insert_cash_receipt(&self, receipt: &CashReceipt) -> BillingResult<()>;
    async fn find_cash_receipt(&self, payment_id: Uuid) -> BillingResult<Option<CashReceipt>>;
    async fn insert_settlement(&self, record: &SettlementRecord) -> BillingResult<()>;
    async fn list_settlements(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> BillingResult<Vec<SettlementRecord>>;
    async fn insert_inventory_restoration(
        &self,
        record: &InventoryRestoration,
    ) -> BillingResult<()>;

    // ---- compensation outbox ----
    async fn put_compensation(&self, task: &CompensationTask) -> BillingResult<()>;
    async fn list_pending_compensations(&self, limit: i64)
        -> BillingResult<Vec<CompensationTask>>;
}
