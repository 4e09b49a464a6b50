//! Ledger data model
//!
//! Plans, subscriptions, billing keys, payment records, webhook audit rows and
//! the one-shot financial side records. Enums are stored as lowercase text;
//! `as_str` / `FromStr` are the canonical mapping used by every store.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingError;

/// Implements `as_str`, `Display` and `FromStr` for a text-stored enum.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = BillingError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(BillingError::Internal(format!(
                        "unknown {} value: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

// =============================================================================
// Plan
// =============================================================================

/// Unit of a billing interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Day,
    Week,
    Month,
    Year,
}

text_enum!(IntervalUnit {
    Day => "day",
    Week => "week",
    Month => "month",
    Year => "year",
});

/// Catalog entry referenced by subscriptions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    /// Amount per period in minor currency units
    pub amount: i64,
    pub currency: String,
    pub interval_unit: IntervalUnit,
    pub interval_count: u32,
    pub trial_days: u32,
    pub setup_fee: Option<i64>,
    pub active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Subscription
// =============================================================================

/// Subscription lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    Paused,
    Cancelled,
    Expired,
}

text_enum!(SubscriptionStatus {
    Trial => "trial",
    Active => "active",
    PastDue => "past_due",
    Paused => "paused",
    Cancelled => "cancelled",
    Expired => "expired",
});

impl SubscriptionStatus {
    /// Statuses that never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Cancelled | SubscriptionStatus::Expired)
    }

    /// Statuses counted by the one-live-subscription-per-customer rule
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    /// Statuses the scheduler will try to renew
    pub fn is_billable(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trial | SubscriptionStatus::Active | SubscriptionStatus::PastDue
        )
    }

    pub const LIVE: [SubscriptionStatus; 4] = [
        SubscriptionStatus::Trial,
        SubscriptionStatus::Active,
        SubscriptionStatus::PastDue,
        SubscriptionStatus::Paused,
    ];
}

/// The central aggregate. Mutated only by the lifecycle engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub customer_id: String,
    pub plan_id: Uuid,
    pub billing_key_id: Uuid,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub next_billing_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancelled_at: Option<OffsetDateTime>,
    pub cancellation_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paused_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resumed_at: Option<OffsetDateTime>,
    pub total_payments: i64,
    pub total_amount: i64,
    pub failed_payment_count: u32,
    pub last_failure_reason: Option<String>,
    /// Attempt key of the last failure counted in `failed_payment_count`
    pub last_failed_attempt: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_payment_at: Option<OffsetDateTime>,
    /// Optimistic concurrency token, bumped by every successful write
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// Deterministic order id for the charge covering the current billing date
    pub fn renewal_order_id(&self) -> String {
        format!(
            "sub_{}_{}",
            self.id.simple(),
            self.next_billing_date.unix_timestamp()
        )
    }

    pub fn setup_order_id(&self) -> String {
        format!("setup_{}", self.id.simple())
    }
}

// =============================================================================
// Billing key
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingKeyStatus {
    Active,
    Revoked,
}

text_enum!(BillingKeyStatus {
    Active => "active",
    Revoked => "revoked",
});

/// Card metadata returned by the gateway when a billing key is issued
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardMetadata {
    pub issuer: Option<String>,
    pub number_masked: Option<String>,
    pub card_type: Option<String>,
}

/// Stored tokenized payment credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingKey {
    pub id: Uuid,
    pub customer_id: String,
    /// Gateway-issued token; never exposed in API responses
    #[serde(skip_serializing)]
    pub billing_key: String,
    pub card: CardMetadata,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    pub status: BillingKeyStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub revoked_at: Option<OffsetDateTime>,
}

// =============================================================================
// Payments
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
    PartiallyCancelled,
}

text_enum!(PaymentStatus {
    Pending => "pending",
    Succeeded => "succeeded",
    Failed => "failed",
    Cancelled => "cancelled",
    PartiallyCancelled => "partially_cancelled",
});

/// What a payment record pays for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    Renewal,
    SetupFee,
    Order,
}

text_enum!(PaymentKind {
    Renewal => "renewal",
    SetupFee => "setup_fee",
    Order => "order",
});

/// One row per attempted charge, keyed by order id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub order_id: String,
    /// Gateway payment key, known once the gateway accepted the charge
    pub payment_key: Option<String>,
    pub customer_id: String,
    pub subscription_id: Option<Uuid>,
    pub kind: PaymentKind,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    /// The `next_billing_date` this charge covers (renewals only)
    #[serde(with = "time::serde::rfc3339::option")]
    pub billing_date: Option<OffsetDateTime>,
    pub retry_count: u32,
    pub failure_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl PaymentRecord {
    pub fn new_pending(
        order_id: String,
        customer_id: String,
        subscription_id: Option<Uuid>,
        kind: PaymentKind,
        amount: i64,
        currency: String,
        billing_date: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            payment_key: None,
            customer_id,
            subscription_id,
            kind,
            amount,
            currency,
            status: PaymentStatus::Pending,
            billing_date,
            retry_count: 0,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Idempotency key sent to the gateway for the current attempt
    pub fn attempt_key(&self) -> String {
        format!("{}:{}", self.order_id, self.retry_count)
    }
}

/// Outcome of trying to claim the charge for an order id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentClaim {
    /// Caller owns this attempt and must charge
    Claimed(PaymentRecord),
    /// The order was already paid; apply the success, never charge again
    AlreadySucceeded(PaymentRecord),
    /// Another unit of work holds a live claim
    InFlight,
}

// =============================================================================
// Usage
// =============================================================================

/// Metered usage appended during a billing period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub feature: String,
    pub quantity: i64,
    pub unit_amount: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

// =============================================================================
// Webhook audit
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Processing,
    Success,
    Failed,
}

text_enum!(WebhookStatus {
    Processing => "processing",
    Success => "success",
    Failed => "failed",
});

/// Which inbound endpoint delivered an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookSource {
    Payment,
    Subscription,
}

text_enum!(WebhookSource {
    Payment => "payment",
    Subscription => "subscription",
});

/// Append-only audit of every inbound notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub source: WebhookSource,
    pub event_type: String,
    /// Absent when the payload could not be trusted or parsed
    pub idempotency_key: Option<String>,
    pub payload: String,
    pub signature: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    pub status: WebhookStatus,
    pub error_message: Option<String>,
    pub retry_count: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processing_started_at: Option<OffsetDateTime>,
}

/// Outcome of claiming an idempotency key for processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookClaim {
    Claimed(WebhookEvent),
    AlreadyProcessed(WebhookEvent),
    InProgress,
}

// =============================================================================
// One-shot side records
// =============================================================================

/// Partial (or full) cancellation of a settled payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRecord {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub payment_key: String,
    /// Position among the payment's cancellations; keys the gateway request
    pub sequence: u32,
    pub cancel_amount: i64,
    pub reason: String,
    pub gateway_transaction_key: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub cancelled_at: OffsetDateTime,
}

/// Buyer-triggered release of escrowed funds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowConfirmation {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub payment_key: String,
    pub confirmed_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub confirmed_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CashReceiptType {
    IncomeDeduction,
    ExpenseProof,
}

text_enum!(CashReceiptType {
    IncomeDeduction => "income_deduction",
    ExpenseProof => "expense_proof",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashReceipt {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub payment_key: String,
    pub receipt_key: String,
    pub receipt_type: CashReceiptType,
    pub amount: i64,
    pub receipt_url: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
}

/// Vendor payout entry produced by an escrow confirmation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub escrow_confirmation_id: Uuid,
    pub amount: i64,
    pub currency: String,
    #[serde(with = "time::serde::rfc3339")]
    pub settled_at: OffsetDateTime,
}

/// Stock to be put back after a partial cancel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRestoration {
    pub id: Uuid,
    pub cancel_record_id: Uuid,
    pub order_id: String,
    pub amount: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Compensation outbox
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationKind {
    InventoryRestore,
    VendorSettlement,
}

text_enum!(CompensationKind {
    InventoryRestore => "inventory_restore",
    VendorSettlement => "vendor_settlement",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStatus {
    Pending,
    Done,
}

text_enum!(CompensationStatus {
    Pending => "pending",
    Done => "done",
});

/// Durable record of a compensating side effect still owed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationTask {
    pub id: Uuid,
    pub kind: CompensationKind,
    /// Id of the cancel record or escrow confirmation that owes the effect
    pub source_id: Uuid,
    pub status: CompensationStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}
