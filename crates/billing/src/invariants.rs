//! Ledger invariant checks
//!
//! Runnable consistency checks over subscription state. They only read, so
//! they can be run after any mutation or webhook replay, and daily by the
//! worker.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::BillingResult;
use crate::models::{Subscription, SubscriptionStatus};
use crate::policy::RetryPolicy;
use crate::store::LedgerStore;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Customer affected
    pub customer_id: String,
    /// Subscription(s) affected
    pub subscription_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// A customer may be charged twice or not at all
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

const CHECKS: [&str; 5] = [
    "single_live_subscription",
    "billing_date_within_period",
    "terminal_has_cancelled_at",
    "failures_within_budget",
    "paused_has_timestamp",
];

/// Service for running ledger invariant checks
pub struct InvariantChecker {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, policy: RetryPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = self.clock.now();
        let live = self.live_subscriptions().await?;
        let terminal = self.terminal_subscriptions().await?;

        let mut violations = Vec::new();
        violations.extend(check_single_live_subscription(&live));
        violations.extend(check_billing_date_within_period(&live));
        violations.extend(check_terminal_has_cancelled_at(&terminal));
        violations.extend(check_failures_within_budget(&live, self.policy));
        violations.extend(check_paused_has_timestamp(&live));

        let checks_run = CHECKS.len();
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        Ok(match name {
            "single_live_subscription" => {
                check_single_live_subscription(&self.live_subscriptions().await?)
            }
            "billing_date_within_period" => {
                check_billing_date_within_period(&self.live_subscriptions().await?)
            }
            "terminal_has_cancelled_at" => {
                check_terminal_has_cancelled_at(&self.terminal_subscriptions().await?)
            }
            "failures_within_budget" => {
                check_failures_within_budget(&self.live_subscriptions().await?, self.policy)
            }
            "paused_has_timestamp" => check_paused_has_timestamp(&self.live_subscriptions().await?),
            _ => vec![],
        })
    }

    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }

    async fn live_subscriptions(&self) -> BillingResult<Vec<Subscription>> {
        self.store
            .list_subscriptions_by_status(&SubscriptionStatus::LIVE)
            .await
    }

    async fn terminal_subscriptions(&self) -> BillingResult<Vec<Subscription>> {
        self.store
            .list_subscriptions_by_status(&[SubscriptionStatus::Cancelled, SubscriptionStatus::Expired])
            .await
    }
}

fn violation(
    invariant: &str,
    sub: &Subscription,
    description: String,
    context: serde_json::Value,
    severity: ViolationSeverity,
) -> InvariantViolation {
    InvariantViolation {
        invariant: invariant.to_string(),
        customer_id: sub.customer_id.clone(),
        subscription_ids: vec![sub.id],
        description,
        context,
        severity,
    }
}

/// Two live subscriptions for one customer means two charges per period
fn check_single_live_subscription(live: &[Subscription]) -> Vec<InvariantViolation> {
    let mut by_customer: HashMap<&str, Vec<Uuid>> = HashMap::new();
    for sub in live {
        by_customer
            .entry(sub.customer_id.as_str())
            .or_default()
            .push(sub.id);
    }

    by_customer
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(customer_id, ids)| InvariantViolation {
            invariant: "single_live_subscription".to_string(),
            customer_id: customer_id.to_string(),
            description: format!("Customer has {} live subscriptions (expected 1)", ids.len()),
            context: serde_json::json!({ "subscription_count": ids.len() }),
            subscription_ids: ids,
            severity: ViolationSeverity::Critical,
        })
        .collect()
}

fn check_billing_date_within_period(live: &[Subscription]) -> Vec<InvariantViolation> {
    live.iter()
        .filter(|s| s.next_billing_date < s.current_period_start)
        .map(|s| {
            violation(
                "billing_date_within_period",
                s,
                "Next billing date precedes the current period start".to_string(),
                serde_json::json!({
                    "next_billing_date": s.next_billing_date.to_string(),
                    "current_period_start": s.current_period_start.to_string(),
                }),
                ViolationSeverity::High,
            )
        })
        .collect()
}

fn check_terminal_has_cancelled_at(terminal: &[Subscription]) -> Vec<InvariantViolation> {
    terminal
        .iter()
        .filter(|s| s.cancelled_at.is_none())
        .map(|s| {
            violation(
                "terminal_has_cancelled_at",
                s,
                format!("Subscription is {} but has no cancellation time", s.status),
                serde_json::json!({ "status": s.status }),
                ViolationSeverity::High,
            )
        })
        .collect()
}

/// A live subscription at or past the failure limit should have been cancelled
fn check_failures_within_budget(
    live: &[Subscription],
    policy: RetryPolicy,
) -> Vec<InvariantViolation> {
    live.iter()
        .filter(|s| s.failed_payment_count >= policy.max_retries)
        .map(|s| {
            violation(
                "failures_within_budget",
                s,
                format!(
                    "{} consecutive failures on a {} subscription (limit {})",
                    s.failed_payment_count, s.status, policy.max_retries
                ),
                serde_json::json!({
                    "failed_payment_count": s.failed_payment_count,
                    "max_retries": policy.max_retries,
                    "last_failure_reason": s.last_failure_reason,
                }),
                ViolationSeverity::Medium,
            )
        })
        .collect()
}

fn check_paused_has_timestamp(live: &[Subscription]) -> Vec<InvariantViolation> {
    live.iter()
        .filter(|s| s.status == SubscriptionStatus::Paused && s.paused_at.is_none())
        .map(|s| {
            violation(
                "paused_has_timestamp",
                s,
                "Paused subscription has no pause time; resume cannot shift its dates"
                    .to_string(),
                serde_json::json!({}),
                ViolationSeverity::Low,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryLedger;
    use time::macros::datetime;

    fn subscription(customer: &str, status: SubscriptionStatus) -> Subscription {
        let start = datetime!(2026-01-15 10:00 UTC);
        let end = datetime!(2026-02-15 10:00 UTC);
        Subscription {
            id: Uuid::new_v4(),
            customer_id: customer.to_string(),
            plan_id: Uuid::new_v4(),
            billing_key_id: Uuid::new_v4(),
            status,
            current_period_start: start,
            current_period_end: end,
            next_billing_date: end,
            trial_start: None,
            trial_end: None,
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
            created_at: start,
            updated_at: start,
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"single_live_subscription"));
    }

    #[test]
    fn test_detects_duplicate_live_subscriptions() {
        let subs = vec![
            subscription("cust_1", SubscriptionStatus::Active),
            subscription("cust_1", SubscriptionStatus::PastDue),
            subscription("cust_2", SubscriptionStatus::Active),
        ];
        let violations = check_single_live_subscription(&subs);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].customer_id, "cust_1");
        assert_eq!(violations[0].subscription_ids.len(), 2);
    }

    #[test]
    fn test_detects_field_level_violations() {
        let mut backwards = subscription("cust_1", SubscriptionStatus::Active);
        backwards.next_billing_date = datetime!(2026-01-01 0:00 UTC);
        assert_eq!(check_billing_date_within_period(&[backwards]).len(), 1);

        let cancelled = subscription("cust_1", SubscriptionStatus::Cancelled);
        assert_eq!(check_terminal_has_cancelled_at(&[cancelled]).len(), 1);

        let mut over = subscription("cust_1", SubscriptionStatus::PastDue);
        over.failed_payment_count = 3;
        assert_eq!(check_failures_within_budget(&[over], RetryPolicy::new(3)).len(), 1);

        let paused = subscription("cust_1", SubscriptionStatus::Paused);
        assert_eq!(check_paused_has_timestamp(&[paused]).len(), 1);
    }

    #[tokio::test]
    async fn test_clean_ledger_is_healthy() {
        let store = Arc::new(InMemoryLedger::new());
        store
            .insert_subscription(&subscription("cust_1", SubscriptionStatus::Active))
            .await
            .unwrap();
        let clock = Arc::new(ManualClock::new(datetime!(2026-01-20 4:00 UTC)));

        let summary = InvariantChecker::new(store, clock, RetryPolicy::default())
            .run_all_checks()
            .await
            .unwrap();
        assert!(summary.healthy);
        assert_eq!(summary.checks_run, 5);
        assert_eq!(summary.checks_passed, 5);
    }
}
