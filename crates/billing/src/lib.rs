// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError::Gateway carries the gateway code and message
#![allow(clippy::too_many_arguments)] // PaymentRecord::new_pending mirrors the row layout
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Subledger Billing Module
//!
//! Recurring billing against a card payment gateway, reconciled with the
//! gateway's asynchronous notifications.
//!
//! ## Features
//!
//! - **Lifecycle**: Create, renew, pause, resume, cancel subscriptions
//! - **Scheduler**: Daily renewal pass with bounded concurrency and timeouts
//! - **Retry Policy**: Past-due retries, cancellation once the budget is spent
//! - **Webhooks**: Signed, deduplicated, replayable gateway notifications
//! - **Payment Operations**: Partial cancel, escrow confirmation, cash receipts
//! - **Invariants**: Read-only ledger consistency checks

pub mod access;
pub mod clock;
pub mod config;
pub mod cycle;
pub mod error;
pub mod gateway;
pub mod invariants;
pub mod lifecycle;
pub mod models;
pub mod operations;
pub mod policy;
pub mod scheduler;
pub mod store;
pub mod webhook;


// Access
pub use access::{Actor, Role};

// Clock
#[cfg(any(test, feature = "test-util"))]
pub use clock::ManualClock;
pub use clock::{Clock, SystemClock};

// Config
pub use config::BillingConfig;

// Error
pub use error::{BillingError, BillingResult, ErrorKind};

// Gateway
#[cfg(any(test, feature = "test-util"))]
pub use gateway::{FakeGateway, GatewayCall};
pub use gateway::{GatewayConfig, HttpGateway, PaymentGateway};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Lifecycle
pub use lifecycle::{
    CreateSubscription, CreatedSubscription, FailureApplied, LifecycleEngine, RenewalOutcome,
    RenewalReport, RevokedBillingKey, SweepReport,
};

// Models
pub use models::{
    BillingKey, BillingKeyStatus, CancelRecord, CardMetadata, CashReceipt, CashReceiptType,
    EscrowConfirmation, IntervalUnit, PaymentKind, PaymentRecord, PaymentStatus, Plan,
    SettlementRecord, Subscription, SubscriptionStatus, UsageRecord, WebhookEvent, WebhookSource,
    WebhookStatus,
};

// Payment operations
pub use operations::{
    CompensationReport, Compensator, LedgerCompensator, PartialCancelResult, PaymentOperations,
};

// Policy
pub use policy::{RetryDecision, RetryPolicy};

// Scheduler
pub use scheduler::{Scheduler, SchedulerReport};

// Store
pub use store::{InMemoryLedger, LedgerStore, PgLedger};

// Webhooks
pub use webhook::{WebhookOutcome, WebhookPipeline, WebhookReplayResult, SIGNATURE_HEADER};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that wires every component to one ledger, gateway
/// and clock
#[derive(Clone)]
pub struct BillingService {
    pub engine: Arc<LifecycleEngine>,
    pub scheduler: Arc<Scheduler>,
    pub webhooks: Arc<WebhookPipeline>,
    pub operations: Arc<PaymentOperations>,
    pub invariants: Arc<InvariantChecker>,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        let gateway = HttpGateway::new(config.gateway.clone())?;

        Ok(Self::new(
            Arc::new(PgLedger::new(pool)),
            Arc::new(gateway),
            Arc::new(SystemClock),
            &config,
        ))
    }

    /// Create a new billing service with explicit components
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        config: &BillingConfig,
    ) -> Self {
        let policy = RetryPolicy::new(config.max_retries);
        let engine = Arc::new(
            LifecycleEngine::new(store.clone(), gateway.clone(), clock.clone())
                .with_policy(policy)
                .with_renewal_timeout(config.renewal_timeout),
        );

        Self {
            scheduler: Arc::new(
                Scheduler::new(engine.clone()).with_concurrency(config.scheduler_concurrency),
            ),
            webhooks: Arc::new(WebhookPipeline::new(
                engine.clone(),
                config.webhook_secret.clone(),
            )),
            operations: Arc::new(PaymentOperations::new(store.clone(), gateway, clock.clone())),
            invariants: Arc::new(InvariantChecker::new(store, clock, policy)),
            engine,
        }
    }
}
