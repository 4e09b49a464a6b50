//! Postgres ledger
//!
//! Runtime-checked `sqlx` queries against the schema in
//! `crates/shared/migrations`. Claims use `INSERT ... ON CONFLICT ... DO UPDATE
//! ... WHERE ... RETURNING` so exactly one caller wins.

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{LedgerStore, PAYMENT_CLAIM_TIMEOUT, WEBHOOK_CLAIM_TIMEOUT};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    BillingKey, CancelRecord, CardMetadata, CashReceipt, CompensationTask, EscrowConfirmation,
    InventoryRestoration, PaymentClaim, PaymentRecord, PaymentStatus, Plan, SettlementRecord,
    Subscription, SubscriptionStatus, UsageRecord, WebhookClaim, WebhookEvent, WebhookStatus,
};

pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_u32(value: i32, column: &str) -> BillingResult<u32> {
    u32::try_from(value)
        .map_err(|_| BillingError::Internal(format!("negative value in column {}", column)))
}

fn to_i32(value: u32, column: &str) -> BillingResult<i32> {
    i32::try_from(value)
        .map_err(|_| BillingError::Validation(format!("{} is out of range", column)))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

// =============================================================================
// Row types
// =============================================================================

#[derive(Debug, FromRow)]
struct PlanRow {
    id: Uuid,
    name: String,
    amount: i64,
    currency: String,
    interval_unit: String,
    interval_count: i32,
    trial_days: i32,
    setup_fee: Option<i64>,
    active: bool,
    created_at: OffsetDateTime,
}

impl TryFrom<PlanRow> for Plan {
    type Error = BillingError;

    fn try_from(row: PlanRow) -> BillingResult<Self> {
        Ok(Plan {
            id: row.id,
            name: row.name,
            amount: row.amount,
            currency: row.currency,
            interval_unit: row.interval_unit.parse()?,
            interval_count: to_u32(row.interval_count, "interval_count")?,
            trial_days: to_u32(row.trial_days, "trial_days")?,
            setup_fee: row.setup_fee,
            active: row.active,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct BillingKeyRow {
    id: Uuid,
    customer_id: String,
    billing_key: String,
    card_issuer: Option<String>,
    card_number_masked: Option<String>,
    card_type: Option<String>,
    issued_at: OffsetDateTime,
    status: String,
    revoked_at: Option<OffsetDateTime>,
}

impl TryFrom<BillingKeyRow> for BillingKey {
    type Error = BillingError;

    fn try_from(row: BillingKeyRow) -> BillingResult<Self> {
        Ok(BillingKey {
            id: row.id,
            customer_id: row.customer_id,
            billing_key: row.billing_key,
            card: CardMetadata {
                issuer: row.card_issuer,
                number_masked: row.card_number_masked,
                card_type: row.card_type,
            },
            issued_at: row.issued_at,
            status: row.status.parse()?,
            revoked_at: row.revoked_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: Uuid,
    customer_id: String,
    plan_id: Uuid,
    billing_key_id: Uuid,
    status: String,
    current_period_start: OffsetDateTime,
    current_period_end: OffsetDateTime,
    next_billing_date: OffsetDateTime,
    trial_start: Option<OffsetDateTime>,
    trial_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    cancelled_at: Option<OffsetDateTime>,
    cancellation_reason: Option<String>,
    paused_at: Option<OffsetDateTime>,
    resumed_at: Option<OffsetDateTime>,
    total_payments: i64,
    total_amount: i64,
    failed_payment_count: i32,
    last_failure_reason: Option<String>,
    last_failed_attempt: Option<String>,
    last_payment_at: Option<OffsetDateTime>,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> BillingResult<Self> {
        Ok(Subscription {
            id: row.id,
            customer_id: row.customer_id,
            plan_id: row.plan_id,
            billing_key_id: row.billing_key_id,
            status: row.status.parse()?,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            next_billing_date: row.next_billing_date,
            trial_start: row.trial_start,
            trial_end: row.trial_end,
            cancel_at_period_end: row.cancel_at_period_end,
            cancelled_at: row.cancelled_at,
            cancellation_reason: row.cancellation_reason,
            paused_at: row.paused_at,
            resumed_at: row.resumed_at,
            total_payments: row.total_payments,
            total_amount: row.total_amount,
            failed_payment_count: to_u32(row.failed_payment_count, "failed_payment_count")?,
            last_failure_reason: row.last_failure_reason,
            last_failed_attempt: row.last_failed_attempt,
            last_payment_at: row.last_payment_at,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn collect_subscriptions(rows: Vec<SubscriptionRow>) -> BillingResult<Vec<Subscription>> {
    rows.into_iter().map(Subscription::try_from).collect()
}

#[derive(Debug, FromRow)]
struct PaymentRow {
    id: Uuid,
    order_id: String,
    payment_key: Option<String>,
    customer_id: String,
    subscription_id: Option<Uuid>,
    kind: String,
    amount: i64,
    currency: String,
    status: String,
    billing_date: Option<OffsetDateTime>,
    retry_count: i32,
    failure_reason: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<PaymentRow> for PaymentRecord {
    type Error = BillingError;

    fn try_from(row: PaymentRow) -> BillingResult<Self> {
        Ok(PaymentRecord {
            id: row.id,
            order_id: row.order_id,
            payment_key: row.payment_key,
            customer_id: row.customer_id,
            subscription_id: row.subscription_id,
            kind: row.kind.parse()?,
            amount: row.amount,
            currency: row.currency,
            status: row.status.parse()?,
            billing_date: row.billing_date,
            retry_count: to_u32(row.retry_count, "retry_count")?,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct WebhookEventRow {
    id: Uuid,
    source: String,
    event_type: String,
    idempotency_key: Option<String>,
    payload: String,
    signature: Option<String>,
    received_at: OffsetDateTime,
    status: String,
    error_message: Option<String>,
    retry_count: i32,
    processing_started_at: Option<OffsetDateTime>,
}

impl TryFrom<WebhookEventRow> for WebhookEvent {
    type Error = BillingError;

    fn try_from(row: WebhookEventRow) -> BillingResult<Self> {
        Ok(WebhookEvent {
            id: row.id,
            source: row.source.parse()?,
            event_type: row.event_type,
            idempotency_key: row.idempotency_key,
            payload: row.payload,
            signature: row.signature,
            received_at: row.received_at,
            status: row.status.parse()?,
            error_message: row.error_message,
            retry_count: to_u32(row.retry_count, "retry_count")?,
            processing_started_at: row.processing_started_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct CashReceiptRow {
    id: Uuid,
    payment_id: Uuid,
    payment_key: String,
    receipt_key: String,
    receipt_type: String,
    amount: i64,
    receipt_url: Option<String>,
    issued_at: OffsetDateTime,
}

impl TryFrom<CashReceiptRow> for CashReceipt {
    type Error = BillingError;

    fn try_from(row: CashReceiptRow) -> BillingResult<Self> {
        Ok(CashReceipt {
            id: row.id,
            payment_id: row.payment_id,
            payment_key: row.payment_key,
            receipt_key: row.receipt_key,
            receipt_type: row.receipt_type.parse()?,
            amount: row.amount,
            receipt_url: row.receipt_url,
            issued_at: row.issued_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct CompensationRow {
    id: Uuid,
    kind: String,
    source_id: Uuid,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<CompensationRow> for CompensationTask {
    type Error = BillingError;

    fn try_from(row: CompensationRow) -> BillingResult<Self> {
        Ok(CompensationTask {
            id: row.id,
            kind: row.kind.parse()?,
            source_id: row.source_id,
            status: row.status.parse()?,
            attempts: to_u32(row.attempts, "attempts")?,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct CancelRow {
    id: Uuid,
    payment_id: Uuid,
    payment_key: String,
    sequence: i32,
    cancel_amount: i64,
    reason: String,
    gateway_transaction_key: Option<String>,
    cancelled_at: OffsetDateTime,
}

impl TryFrom<CancelRow> for CancelRecord {
    type Error = BillingError;

    fn try_from(row: CancelRow) -> BillingResult<Self> {
        Ok(CancelRecord {
            id: row.id,
            payment_id: row.payment_id,
            payment_key: row.payment_key,
            sequence: to_u32(row.sequence, "sequence")?,
            cancel_amount: row.cancel_amount,
            reason: row.reason,
            gateway_transaction_key: row.gateway_transaction_key,
            cancelled_at: row.cancelled_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct EscrowRow {
    id: Uuid,
    payment_id: Uuid,
    payment_key: String,
    confirmed_by: String,
    confirmed_at: OffsetDateTime,
}

impl From<EscrowRow> for EscrowConfirmation {
    fn from(row: EscrowRow) -> Self {
        EscrowConfirmation {
            id: row.id,
            payment_id: row.payment_id,
            payment_key: row.payment_key,
            confirmed_by: row.confirmed_by,
            confirmed_at: row.confirmed_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct SettlementRow {
    id: Uuid,
    payment_id: Uuid,
    escrow_confirmation_id: Uuid,
    amount: i64,
    currency: String,
    settled_at: OffsetDateTime,
}

impl From<SettlementRow> for SettlementRecord {
    fn from(row: SettlementRow) -> Self {
        SettlementRecord {
            id: row.id,
            payment_id: row.payment_id,
            escrow_confirmation_id: row.escrow_confirmation_id,
            amount: row.amount,
            currency: row.currency,
            settled_at: row.settled_at,
        }
    }
}

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, customer_id, plan_id, billing_key_id, status,
    current_period_start, current_period_end, next_billing_date,
    trial_start, trial_end, cancel_at_period_end, cancelled_at, cancellation_reason,
    paused_at, resumed_at, total_payments, total_amount, failed_payment_count,
    last_failure_reason, last_failed_attempt, last_payment_at, version,
    created_at, updated_at
"#;

#[async_trait]
impl LedgerStore for PgLedger {
    async fn get_plan(&self, id: Uuid) -> BillingResult<Option<Plan>> {
        let row: Option<PlanRow> = sqlx::query_as("SELECT * FROM plans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Plan::try_from).transpose()
    }

    async fn put_plan(&self, plan: &Plan) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO plans
                (id, name, amount, currency, interval_unit, interval_count,
                 trial_days, setup_fee, active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                amount = EXCLUDED.amount,
                currency = EXCLUDED.currency,
                interval_unit = EXCLUDED.interval_unit,
                interval_count = EXCLUDED.interval_count,
                trial_days = EXCLUDED.trial_days,
                setup_fee = EXCLUDED.setup_fee,
                active = EXCLUDED.active
            "#,
        )
        .bind(plan.id)
        .bind(&plan.name)
        .bind(plan.amount)
        .bind(&plan.currency)
        .bind(plan.interval_unit.as_str())
        .bind(to_i32(plan.interval_count, "interval_count")?)
        .bind(to_i32(plan.trial_days, "trial_days")?)
        .bind(plan.setup_fee)
        .bind(plan.active)
        .bind(plan.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_billing_key(&self, id: Uuid) -> BillingResult<Option<BillingKey>> {
        let row: Option<BillingKeyRow> =
            sqlx::query_as("SELECT * FROM billing_keys WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(BillingKey::try_from).transpose()
    }

    async fn find_billing_key(&self, token: &str) -> BillingResult<Option<BillingKey>> {
        let row: Option<BillingKeyRow> =
            sqlx::query_as("SELECT * FROM billing_keys WHERE billing_key = $1")
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;
        row.map(BillingKey::try_from).transpose()
    }

    async fn put_billing_key(&self, key: &BillingKey) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_keys
                (id, customer_id, billing_key, card_issuer, card_number_masked,
                 card_type, issued_at, status, revoked_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                revoked_at = EXCLUDED.revoked_at,
                card_issuer = EXCLUDED.card_issuer,
                card_number_masked = EXCLUDED.card_number_masked,
                card_type = EXCLUDED.card_type
            "#,
        )
        .bind(key.id)
        .bind(&key.customer_id)
        .bind(&key.billing_key)
        .bind(&key.card.issuer)
        .bind(&key.card.number_masked)
        .bind(&key.card.card_type)
        .bind(key.issued_at)
        .bind(key.status.as_str())
        .bind(key.revoked_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                BillingError::Conflict("billing key token already registered".to_string())
            } else {
                BillingError::from(e)
            }
        })?;
        Ok(())
    }

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn insert_subscription(&self, s: &Subscription) -> BillingResult<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO subscriptions ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(s.id)
        .bind(&s.customer_id)
        .bind(s.plan_id)
        .bind(s.billing_key_id)
        .bind(s.status.as_str())
        .bind(s.current_period_start)
        .bind(s.current_period_end)
        .bind(s.next_billing_date)
        .bind(s.trial_start)
        .bind(s.trial_end)
        .bind(s.cancel_at_period_end)
        .bind(s.cancelled_at)
        .bind(&s.cancellation_reason)
        .bind(s.paused_at)
        .bind(s.resumed_at)
        .bind(s.total_payments)
        .bind(s.total_amount)
        .bind(to_i32(s.failed_payment_count, "failed_payment_count")?)
        .bind(&s.last_failure_reason)
        .bind(&s.last_failed_attempt)
        .bind(s.last_payment_at)
        .bind(s.version)
        .bind(s.created_at)
        .bind(s.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            // one_live_subscription_per_customer partial unique index
            if is_unique_violation(&e) {
                BillingError::Conflict(format!(
                    "customer {} already has a live subscription",
                    s.customer_id
                ))
            } else {
                BillingError::from(e)
            }
        })?;
        Ok(())
    }

    async fn put_subscription_if_version(&self, s: &Subscription) -> BillingResult<Subscription> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions SET
                status = $3,
                current_period_start = $4,
                current_period_end = $5,
                next_billing_date = $6,
                trial_start = $7,
                trial_end = $8,
                cancel_at_period_end = $9,
                cancelled_at = $10,
                cancellation_reason = $11,
                paused_at = $12,
                resumed_at = $13,
                total_payments = $14,
                total_amount = $15,
                failed_payment_count = $16,
                last_failure_reason = $17,
                last_failed_attempt = $18,
                last_payment_at = $19,
                updated_at = $20,
                version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(s.id)
        .bind(s.version)
        .bind(s.status.as_str())
        .bind(s.current_period_start)
        .bind(s.current_period_end)
        .bind(s.next_billing_date)
        .bind(s.trial_start)
        .bind(s.trial_end)
        .bind(s.cancel_at_period_end)
        .bind(s.cancelled_at)
        .bind(&s.cancellation_reason)
        .bind(s.paused_at)
        .bind(s.resumed_at)
        .bind(s.total_payments)
        .bind(s.total_amount)
        .bind(to_i32(s.failed_payment_count, "failed_payment_count")?)
        .bind(&s.last_failure_reason)
        .bind(&s.last_failed_attempt)
        .bind(s.last_payment_at)
        .bind(s.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Subscription::try_from(row),
            None => {
                let exists: Option<(Uuid,)> =
                    sqlx::query_as("SELECT id FROM subscriptions WHERE id = $1")
                        .bind(s.id)
                        .fetch_optional(&self.pool)
                        .await?;
                Err(match exists {
                    Some(_) => BillingError::ConcurrentModification(format!("subscription {}", s.id)),
                    None => BillingError::NotFound(format!("subscription {}", s.id)),
                })
            }
        }
    }

    async fn list_due(
        &self,
        before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE status IN ('trial', 'active', 'past_due')
              AND cancel_at_period_end = false
              AND next_billing_date < $1
            ORDER BY next_billing_date ASC, id ASC
            LIMIT $2
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        collect_subscriptions(rows)
    }

    async fn list_expiring(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE cancel_at_period_end = true
              AND current_period_end <= $1
              AND status NOT IN ('cancelled', 'expired')
            ORDER BY created_at ASC
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        collect_subscriptions(rows)
    }

    async fn list_by_billing_key(&self, billing_key_id: Uuid) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE billing_key_id = $1 ORDER BY created_at ASC",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(billing_key_id)
        .fetch_all(&self.pool)
        .await?;
        collect_subscriptions(rows)
    }

    async fn list_customer_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE customer_id = $1 ORDER BY created_at DESC",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;
        collect_subscriptions(rows)
    }

    async fn list_subscriptions_by_status(
        &self,
        statuses: &[SubscriptionStatus],
    ) -> BillingResult<Vec<Subscription>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE status = ANY($1) ORDER BY created_at ASC",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await?;
        collect_subscriptions(rows)
    }

    async fn insert_usage(&self, usage: &UsageRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_records
                (id, subscription_id, feature, quantity, unit_amount, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(usage.id)
        .bind(usage.subscription_id)
        .bind(&usage.feature)
        .bind(usage.quantity)
        .bind(usage.unit_amount)
        .bind(usage.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn usage_total(
        &self,
        subscription_id: Uuid,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> BillingResult<i64> {
        // NUMERIC sum so overflow surfaces as an error instead of wrapping
        let total: (Option<String>,) = sqlx::query_as(
            r#"
            SELECT SUM(quantity::NUMERIC * unit_amount::NUMERIC)::TEXT
            FROM usage_records
            WHERE subscription_id = $1 AND recorded_at >= $2 AND recorded_at < $3
            "#,
        )
        .bind(subscription_id)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;

        match total.0 {
            None => Ok(0),
            Some(text) => text
                .parse::<i64>()
                .map_err(|_| BillingError::Validation("metered usage overflows".to_string())),
        }
    }

    async fn claim_payment(
        &self,
        candidate: &PaymentRecord,
        now: OffsetDateTime,
    ) -> BillingResult<PaymentClaim> {
        let claimed: Option<PaymentRow> = sqlx::query_as(
            r#"
            INSERT INTO payment_records
                (id, order_id, payment_key, customer_id, subscription_id, kind, amount,
                 currency, status, billing_date, retry_count, failure_reason,
                 created_at, updated_at)
            VALUES ($1, $2, NULL, $3, $4, $5, $6, $7, 'pending', $8, 0, NULL, $9, $9)
            ON CONFLICT (order_id) DO UPDATE SET
                status = 'pending',
                retry_count = payment_records.retry_count + 1,
                amount = EXCLUDED.amount,
                failure_reason = NULL,
                updated_at = EXCLUDED.updated_at
            WHERE payment_records.status = 'failed'
               OR (payment_records.status = 'pending' AND payment_records.updated_at < $10)
            RETURNING *
            "#,
        )
        .bind(candidate.id)
        .bind(&candidate.order_id)
        .bind(&candidate.customer_id)
        .bind(candidate.subscription_id)
        .bind(candidate.kind.as_str())
        .bind(candidate.amount)
        .bind(&candidate.currency)
        .bind(candidate.billing_date)
        .bind(now)
        .bind(now - PAYMENT_CLAIM_TIMEOUT)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = claimed {
            return Ok(PaymentClaim::Claimed(PaymentRecord::try_from(row)?));
        }

        let existing = self
            .get_payment_by_order(&candidate.order_id)
            .await?
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "payment {} vanished during claim",
                    candidate.order_id
                ))
            })?;

        Ok(match existing.status {
            PaymentStatus::Pending | PaymentStatus::Failed => PaymentClaim::InFlight,
            _ => PaymentClaim::AlreadySucceeded(existing),
        })
    }

    async fn get_payment_by_order(&self, order_id: &str) -> BillingResult<Option<PaymentRecord>> {
        let row: Option<PaymentRow> =
            sqlx::query_as("SELECT * FROM payment_records WHERE order_id = $1")
                .bind(order_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(PaymentRecord::try_from).transpose()
    }

    async fn get_payment_by_key(
        &self,
        payment_key: &str,
    ) -> BillingResult<Option<PaymentRecord>> {
        let row: Option<PaymentRow> =
            sqlx::query_as("SELECT * FROM payment_records WHERE payment_key = $1")
                .bind(payment_key)
                .fetch_optional(&self.pool)
                .await?;
        row.map(PaymentRecord::try_from).transpose()
    }

    async fn put_payment(&self, p: &PaymentRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_records
                (id, order_id, payment_key, customer_id, subscription_id, kind, amount,
                 currency, status, billing_date, retry_count, failure_reason,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (order_id) DO UPDATE SET
                payment_key = EXCLUDED.payment_key,
                status = EXCLUDED.status,
                amount = EXCLUDED.amount,
                retry_count = EXCLUDED.retry_count,
                failure_reason = EXCLUDED.failure_reason,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(p.id)
        .bind(&p.order_id)
        .bind(&p.payment_key)
        .bind(&p.customer_id)
        .bind(p.subscription_id)
        .bind(p.kind.as_str())
        .bind(p.amount)
        .bind(&p.currency)
        .bind(p.status.as_str())
        .bind(p.billing_date)
        .bind(to_i32(p.retry_count, "retry_count")?)
        .bind(&p.failure_reason)
        .bind(p.created_at)
        .bind(p.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn settle_payment(
        &self,
        p: &PaymentRecord,
        expected: PaymentStatus,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payment_records SET
                status = $4,
                payment_key = COALESCE($5, payment_key),
                failure_reason = $6,
                updated_at = $7
            WHERE order_id = $1 AND retry_count = $2 AND status = $3
            "#,
        )
        .bind(&p.order_id)
        .bind(to_i32(p.retry_count, "retry_count")?)
        .bind(expected.as_str())
        .bind(p.status.as_str())
        .bind(&p.payment_key)
        .bind(&p.failure_reason)
        .bind(p.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_webhook_event(
        &self,
        event: &WebhookEvent,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookClaim> {
        let key = event.idempotency_key.as_deref().ok_or_else(|| {
            BillingError::Internal("cannot claim a webhook event without a key".to_string())
        })?;

        // Same shape as the payment claim: a failed or stuck row is re-claimed
        // as a retry of the same audit entry.
        let claimed: Option<WebhookEventRow> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (id, source, event_type, idempotency_key, payload, signature,
                 received_at, status, error_message, retry_count, processing_started_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'processing', NULL, 0, $8)
            ON CONFLICT (idempotency_key) DO UPDATE SET
                status = 'processing',
                processing_started_at = EXCLUDED.processing_started_at,
                retry_count = webhook_events.retry_count + 1,
                payload = EXCLUDED.payload,
                signature = EXCLUDED.signature
            WHERE webhook_events.status = 'failed'
               OR (webhook_events.status = 'processing'
                   AND webhook_events.processing_started_at < $9)
            RETURNING *
            "#,
        )
        .bind(event.id)
        .bind(event.source.as_str())
        .bind(&event.event_type)
        .bind(key)
        .bind(&event.payload)
        .bind(&event.signature)
        .bind(event.received_at)
        .bind(now)
        .bind(now - WEBHOOK_CLAIM_TIMEOUT)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = claimed {
            return Ok(WebhookClaim::Claimed(WebhookEvent::try_from(row)?));
        }

        let existing: Option<WebhookEventRow> =
            sqlx::query_as("SELECT * FROM webhook_events WHERE idempotency_key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        match existing {
            Some(row) if row.status == WebhookStatus::Success.as_str() => {
                Ok(WebhookClaim::AlreadyProcessed(WebhookEvent::try_from(row)?))
            }
            _ => Ok(WebhookClaim::InProgress),
        }
    }

    async fn insert_webhook_event(&self, event: &WebhookEvent) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_events
                (id, source, event_type, idempotency_key, payload, signature,
                 received_at, status, error_message, retry_count, processing_started_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(event.id)
        .bind(event.source.as_str())
        .bind(&event.event_type)
        .bind(&event.idempotency_key)
        .bind(&event.payload)
        .bind(&event.signature)
        .bind(event.received_at)
        .bind(event.status.as_str())
        .bind(&event.error_message)
        .bind(to_i32(event.retry_count, "retry_count")?)
        .bind(event.processing_started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_webhook_event(
        &self,
        id: Uuid,
        status: WebhookStatus,
        error_message: Option<String>,
        retry_count: u32,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = $2, error_message = $3, retry_count = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(&error_message)
        .bind(to_i32(retry_count, "retry_count")?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("webhook event {}", id)));
        }
        Ok(())
    }

    async fn get_webhook_event(&self, id: Uuid) -> BillingResult<Option<WebhookEvent>> {
        let row: Option<WebhookEventRow> =
            sqlx::query_as("SELECT * FROM webhook_events WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(WebhookEvent::try_from).transpose()
    }

    async fn list_webhook_events(
        &self,
        status: Option<WebhookStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEvent>> {
        let rows: Vec<WebhookEventRow> = sqlx::query_as(
            r#"
            SELECT * FROM webhook_events
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY received_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(WebhookEvent::try_from).collect()
    }

    async fn insert_cancel_record(&self, r: &CancelRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cancel_records
                (id, payment_id, payment_key, sequence, cancel_amount, reason,
                 gateway_transaction_key, cancelled_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(r.id)
        .bind(r.payment_id)
        .bind(&r.payment_key)
        .bind(to_i32(r.sequence, "sequence")?)
        .bind(r.cancel_amount)
        .bind(&r.reason)
        .bind(&r.gateway_transaction_key)
        .bind(r.cancelled_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            // cancel_records_payment_sequence unique constraint
            if is_unique_violation(&e) {
                BillingError::Conflict(format!(
                    "cancellation {} of payment {} already recorded",
                    r.sequence, r.payment_id
                ))
            } else {
                BillingError::from(e)
            }
        })?;
        Ok(())
    }

    async fn list_cancel_records(&self, payment_id: Uuid) -> BillingResult<Vec<CancelRecord>> {
        let rows: Vec<CancelRow> = sqlx::query_as(
            "SELECT * FROM cancel_records WHERE payment_id = $1 ORDER BY sequence ASC",
        )
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CancelRecord::try_from).collect()
    }

    async fn get_cancel_record(&self, id: Uuid) -> BillingResult<Option<CancelRecord>> {
        let row: Option<CancelRow> = sqlx::query_as("SELECT * FROM cancel_records WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(CancelRecord::try_from).transpose()
    }

    async fn insert_escrow_confirmation(&self, r: &EscrowConfirmation) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO escrow_confirmations
                (id, payment_id, payment_key, confirmed_by, confirmed_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(r.id)
        .bind(r.payment_id)
        .bind(&r.payment_key)
        .bind(&r.confirmed_by)
        .bind(r.confirmed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                BillingError::Conflict(format!(
                    "escrow for payment {} already confirmed",
                    r.payment_id
                ))
            } else {
                BillingError::from(e)
            }
        })?;
        Ok(())
    }

    async fn get_escrow_confirmation(
        &self,
        id: Uuid,
    ) -> BillingResult<Option<EscrowConfirmation>> {
        let row: Option<EscrowRow> =
            sqlx::query_as("SELECT * FROM escrow_confirmations WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(EscrowConfirmation::from))
    }

    async fn find_escrow_confirmation(
        &self,
        payment_id: Uuid,
    ) -> BillingResult<Option<EscrowConfirmation>> {
        let row: Option<EscrowRow> =
            sqlx::query_as("SELECT * FROM escrow_confirmations WHERE payment_id = $1")
                .bind(payment_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(EscrowConfirmation::from))
    }

    async fn insert_cash_receipt(&self, r: &CashReceipt) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cash_receipts
                (id, payment_id, payment_key, receipt_key, receipt_type, amount,
                 receipt_url, issued_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(r.id)
        .bind(r.payment_id)
        .bind(&r.payment_key)
        .bind(&r.receipt_key)
        .bind(r.receipt_type.as_str())
        .bind(r.amount)
        .bind(&r.receipt_url)
        .bind(r.issued_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                BillingError::Conflict(format!(
                    "cash receipt for payment {} already issued",
                    r.payment_id
                ))
            } else {
                BillingError::from(e)
            }
        })?;
        Ok(())
    }

    async fn find_cash_receipt(&self, payment_id: Uuid) -> BillingResult<Option<CashReceipt>> {
        let row: Option<CashReceiptRow> =
            sqlx::query_as("SELECT * FROM cash_receipts WHERE payment_id = $1")
                .bind(payment_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(CashReceipt::try_from).transpose()
    }

    async fn insert_settlement(&self, r: &SettlementRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO settlement_records
                (id, payment_id, escrow_confirmation_id, amount, currency, settled_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (escrow_confirmation_id) DO NOTHING
            "#,
        )
        .bind(r.id)
        .bind(r.payment_id)
        .bind(r.escrow_confirmation_id)
        .bind(r.amount)
        .bind(&r.currency)
        .bind(r.settled_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_settlements(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> BillingResult<Vec<SettlementRecord>> {
        let rows: Vec<SettlementRow> = sqlx::query_as(
            r#"
            SELECT * FROM settlement_records
            WHERE settled_at >= $1 AND settled_at < $2
            ORDER BY settled_at ASC
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(SettlementRecord::from).collect())
    }

    async fn insert_inventory_restoration(&self, r: &InventoryRestoration) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO inventory_restorations
                (id, cancel_record_id, order_id, amount, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (cancel_record_id) DO NOTHING
            "#,
        )
        .bind(r.id)
        .bind(r.cancel_record_id)
        .bind(&r.order_id)
        .bind(r.amount)
        .bind(r.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn put_compensation(&self, t: &CompensationTask) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO compensation_tasks
                (id, kind, source_id, status, attempts, last_error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                attempts = EXCLUDED.attempts,
                last_error = EXCLUDED.last_error,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(t.id)
        .bind(t.kind.as_str())
        .bind(t.source_id)
        .bind(t.status.as_str())
        .bind(to_i32(t.attempts, "attempts")?)
        .bind(&t.last_error)
        .bind(t.created_at)
        .bind(t.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_pending_compensations(
        &self,
        limit: i64,
    ) -> BillingResult<Vec<CompensationTask>> {
        let rows: Vec<CompensationRow> = sqlx::query_as(
            r#"
            SELECT * FROM compensation_tasks
            WHERE status = 'pending'
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CompensationTask::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_counters_rejected() {
        assert!(to_u32(-1, "retry_count").is_err());
        assert_eq!(to_u32(3, "retry_count").unwrap(), 3);
        assert!(to_i32(u32::MAX, "attempts").is_err());
    }
}
