//! Billing-cycle scheduler
//!
//! One pass selects every billable subscription due before the end of the
//! current UTC day and renews each on its own task, bounded by a semaphore
//! and a per-unit timeout. A slow gateway stalls only the units waiting on
//! it. The pass ends with the expiry sweep.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::cycle;
use crate::error::{BillingError, BillingResult};
use crate::lifecycle::{LifecycleEngine, RenewalOutcome, SweepReport};
use crate::policy::RetryDecision;

const DEFAULT_CONCURRENCY: usize = 8;
const DEFAULT_BATCH_LIMIT: i64 = 10_000;

/// Headroom on top of the gateway timeout for ledger reads and writes
const UNIT_TIMEOUT_HEADROOM: StdDuration = StdDuration::from_secs(10);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerReport {
    pub due: usize,
    pub charged: usize,
    pub zero_amount: usize,
    pub already_paid: usize,
    pub skipped: usize,
    pub retry_scheduled: usize,
    pub escalated: usize,
    pub timed_out: usize,
    pub errors: usize,
    pub sweep: SweepReport,
}

pub struct Scheduler {
    engine: Arc<LifecycleEngine>,
    concurrency: usize,
    batch_limit: i64,
    unit_timeout: StdDuration,
}

impl Scheduler {
    pub fn new(engine: Arc<LifecycleEngine>) -> Self {
        let unit_timeout = engine.renewal_timeout() + UNIT_TIMEOUT_HEADROOM;
        Self {
            engine,
            concurrency: DEFAULT_CONCURRENCY,
            batch_limit: DEFAULT_BATCH_LIMIT,
            unit_timeout,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_unit_timeout(mut self, timeout: StdDuration) -> Self {
        self.unit_timeout = timeout;
        self
    }

    /// Run one renewal pass followed by the expiry sweep
    pub async fn run_once(&self) -> BillingResult<SchedulerReport> {
        let now = self.engine.clock().now();
        let due = self
            .engine
            .store()
            .list_due(cycle::start_of_next_day(now), self.batch_limit)
            .await?;

        let mut report = SchedulerReport {
            due: due.len(),
            ..Default::default()
        };

        tracing::info!(due = report.due, "Starting renewal pass");

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut units: JoinSet<(Uuid, UnitResult)> = JoinSet::new();

        for sub in due {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| BillingError::Internal(format!("scheduler semaphore closed: {}", e)))?;
            let engine = self.engine.clone();
            let unit_timeout = self.unit_timeout;

            units.spawn(async move {
                let _permit = permit;
                let result = match tokio::time::timeout(unit_timeout, engine.renew(sub.id)).await {
                    Ok(Ok(outcome)) => UnitResult::Done(outcome),
                    Ok(Err(e)) => UnitResult::Error(e),
                    Err(_) => match engine.record_renewal_timeout(sub.id).await {
                        Ok(_) => UnitResult::TimedOut,
                        Err(e) => UnitResult::Error(e),
                    },
                };
                (sub.id, result)
            });
        }

        while let Some(joined) = units.join_next().await {
            match joined {
                Ok((id, result)) => report.tally(id, result),
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(error = %e, "Renewal task panicked");
                }
            }
        }

        match self.engine.sweep_expired().await {
            Ok(sweep) => report.sweep = sweep,
            Err(e) => {
                report.errors += 1;
                tracing::error!(error = %e, "Expiry sweep failed");
            }
        }

        tracing::info!(
            due = report.due,
            charged = report.charged,
            retry_scheduled = report.retry_scheduled,
            escalated = report.escalated,
            timed_out = report.timed_out,
            errors = report.errors,
            expired = report.sweep.cancelled,
            "Renewal pass complete"
        );

        Ok(report)
    }
}

enum UnitResult {
    Done(RenewalOutcome),
    TimedOut,
    Error(BillingError),
}

impl SchedulerReport {
    fn tally(&mut self, id: Uuid, result: UnitResult) {
        match result {
            UnitResult::Done(RenewalOutcome::Charged { .. }) => self.charged += 1,
            UnitResult::Done(RenewalOutcome::ZeroAmount(_)) => self.zero_amount += 1,
            UnitResult::Done(RenewalOutcome::AlreadyPaid(_)) => self.already_paid += 1,
            UnitResult::Done(RenewalOutcome::InFlight | RenewalOutcome::NotDue) => {
                self.skipped += 1
            }
            UnitResult::Done(RenewalOutcome::Failed { decision, .. }) => match decision {
                RetryDecision::Retry => self.retry_scheduled += 1,
                RetryDecision::Escalate => self.escalated += 1,
            },
            UnitResult::TimedOut => {
                self.timed_out += 1;
                tracing::warn!(subscription_id = %id, "Renewal unit timed out");
            }
            UnitResult::Error(e) => {
                self.errors += 1;
                tracing::error!(subscription_id = %id, error = %e, "Renewal unit failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::gateway::FakeGateway;
    use crate::lifecycle::CreateSubscription;
    use crate::models::{CardMetadata, IntervalUnit, Plan, SubscriptionStatus};
    use crate::store::{InMemoryLedger, LedgerStore};
    use time::macros::datetime;

    struct Setup {
        engine: Arc<LifecycleEngine>,
        store: Arc<InMemoryLedger>,
        gateway: Arc<FakeGateway>,
        clock: Arc<ManualClock>,
        plan: Plan,
    }

    async fn setup(renewal_timeout: StdDuration) -> Setup {
        let store = Arc::new(InMemoryLedger::new());
        let gateway = Arc::new(FakeGateway::new());
        let clock = Arc::new(ManualClock::new(datetime!(2026-01-15 10:00 UTC)));
        let engine = Arc::new(
            LifecycleEngine::new(store.clone(), gateway.clone(), clock.clone())
                .with_renewal_timeout(renewal_timeout),
        );
        let plan = Plan {
            id: Uuid::new_v4(),
            name: "Basic monthly".to_string(),
            amount: 10_000,
            currency: "KRW".to_string(),
            interval_unit: IntervalUnit::Month,
            interval_count: 1,
            trial_days: 0,
            setup_fee: None,
            active: true,
            created_at: datetime!(2026-01-01 0:00 UTC),
        };
        store.put_plan(&plan).await.unwrap();
        Setup {
            engine,
            store,
            gateway,
            clock,
            plan,
        }
    }

    async fn subscribe(s: &Setup, customer: &str) -> Uuid {
        let key = s
            .engine
            .register_billing_key(customer, &format!("bk_{}", customer), CardMetadata::default())
            .await
            .unwrap();
        s.engine
            .create(CreateSubscription {
                customer_id: customer.to_string(),
                plan_id: s.plan.id,
                billing_key_id: key.id,
                trial_days: None,
            })
            .await
            .unwrap()
            .subscription
            .id
    }

    #[tokio::test]
    async fn test_nothing_due_before_billing_day() {
        let s = setup(StdDuration::from_secs(5)).await;
        subscribe(&s, "cust_a").await;

        let report = Scheduler::new(s.engine.clone()).run_once().await.unwrap();
        assert_eq!(report.due, 0);
        assert_eq!(s.gateway.charge_count(), 0);
    }

    #[tokio::test]
    async fn test_due_today_includes_later_hours() {
        let s = setup(StdDuration::from_secs(5)).await;
        subscribe(&s, "cust_a").await;

        // Billing date is 10:00; the pass runs just after midnight
        s.clock.set(datetime!(2026-02-15 0:05 UTC));
        let report = Scheduler::new(s.engine.clone()).run_once().await.unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.charged, 1);
    }

    #[tokio::test]
    async fn test_failures_do_not_block_other_units() {
        let s = setup(StdDuration::from_secs(5)).await;
        let a = subscribe(&s, "cust_a").await;
        let b = subscribe(&s, "cust_b").await;
        let c = subscribe(&s, "cust_c").await;

        s.clock.set(datetime!(2026-02-15 10:00 UTC));
        s.gateway.fail_next_charges(1, "REJECT_CARD_PAYMENT");

        let report = Scheduler::new(s.engine.clone())
            .with_concurrency(2)
            .run_once()
            .await
            .unwrap();

        assert_eq!(report.due, 3);
        assert_eq!(report.charged, 2);
        assert_eq!(report.retry_scheduled, 1);

        let mut past_due = 0;
        for id in [a, b, c] {
            let sub = s.store.get_subscription(id).await.unwrap().unwrap();
            if sub.status == SubscriptionStatus::PastDue {
                past_due += 1;
            }
        }
        assert_eq!(past_due, 1);
    }

    #[tokio::test]
    async fn test_second_pass_same_day_does_not_recharge() {
        let s = setup(StdDuration::from_secs(5)).await;
        subscribe(&s, "cust_a").await;
        s.clock.set(datetime!(2026-02-15 10:00 UTC));

        let scheduler = Scheduler::new(s.engine.clone());
        scheduler.run_once().await.unwrap();
        let second = scheduler.run_once().await.unwrap();

        assert_eq!(second.due, 0);
        assert_eq!(s.gateway.charge_count(), 1);
    }

    #[tokio::test]
    async fn test_unit_timeout_counts_as_failure() {
        let s = setup(StdDuration::from_secs(5)).await;
        let id = subscribe(&s, "cust_a").await;
        s.clock.set(datetime!(2026-02-15 10:00 UTC));
        s.gateway.set_charge_delay(Some(StdDuration::from_millis(500)));

        let report = Scheduler::new(s.engine.clone())
            .with_unit_timeout(StdDuration::from_millis(20))
            .run_once()
            .await
            .unwrap();

        assert_eq!(report.timed_out, 1);
        let sub = s.store.get_subscription(id).await.unwrap().unwrap();
        assert_eq!(sub.failed_payment_count, 1);
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
    }
}
