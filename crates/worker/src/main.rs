//! Subledger Background Worker
//!
//! Handles scheduled jobs including:
//! - Subscription renewal run (daily, `RENEWAL_CRON`)
//! - Expiry sweep for subscriptions flagged to cancel (hourly)
//! - Compensation outbox reconciliation (every 15 minutes)
//! - Ledger invariant checks (daily at 4:00 AM UTC)
//! - Heartbeat (every 5 minutes)

use anyhow::Context;
use subledger_billing::{BillingService, InvariantCheckSummary, ViolationSeverity};
use subledger_shared::{create_pool, init_tracing, run_migrations};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_RENEWAL_CRON: &str = "0 5 0 * * *";
const COMPENSATION_BATCH: i64 = 100;

/// Log invariant results, one line per violation at a level matching its severity
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    info!(
        checks_run = summary.checks_run,
        checks_passed = summary.checks_passed,
        checks_failed = summary.checks_failed,
        healthy = summary.healthy,
        "Invariant checks complete"
    );

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                customer_id = %violation.customer_id,
                subscription_ids = ?violation.subscription_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                customer_id = %violation.customer_id,
                subscription_ids = ?violation.subscription_ids,
                "{}",
                violation.description
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    init_tracing("info,subledger_billing=debug");

    info!("Starting Subledger Worker");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
    let renewal_cron =
        std::env::var("RENEWAL_CRON").unwrap_or_else(|_| DEFAULT_RENEWAL_CRON.to_string());

    let pool = create_pool(&database_url).await?;
    run_migrations(&pool).await?;

    let billing = BillingService::from_env(pool)?;

    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Renewal run. The scheduler pass ends with an expiry sweep.
    let renewal = billing.scheduler.clone();
    scheduler
        .add(Job::new_async(renewal_cron.as_str(), move |_uuid, _l| {
            let scheduler = renewal.clone();
            Box::pin(async move {
                info!("Running scheduled renewal pass");
                match scheduler.run_once().await {
                    Ok(report) => info!(
                        due = report.due,
                        charged = report.charged,
                        zero_amount = report.zero_amount,
                        already_paid = report.already_paid,
                        skipped = report.skipped,
                        retry_scheduled = report.retry_scheduled,
                        escalated = report.escalated,
                        timed_out = report.timed_out,
                        errors = report.errors,
                        swept = report.sweep.cancelled,
                        "Renewal pass complete"
                    ),
                    Err(e) => error!(error = %e, "Renewal pass failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %renewal_cron, "Scheduled: Renewal pass");

    // Job 2: Expiry sweep (hourly)
    let sweep_engine = billing.engine.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let engine = sweep_engine.clone();
            Box::pin(async move {
                match engine.sweep_expired().await {
                    Ok(report) => info!(
                        examined = report.examined,
                        cancelled = report.cancelled,
                        errors = report.errors,
                        "Expiry sweep complete"
                    ),
                    Err(e) => error!(error = %e, "Expiry sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Expiry sweep (hourly)");

    // Job 3: Compensation outbox (every 15 minutes)
    let operations = billing.operations.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let operations = operations.clone();
            Box::pin(async move {
                match operations.reconcile_compensations(COMPENSATION_BATCH).await {
                    Ok(report) if report.examined > 0 => info!(
                        examined = report.examined,
                        completed = report.completed,
                        failed = report.failed,
                        "Compensation reconciliation complete"
                    ),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Compensation reconciliation failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Compensation reconciliation (every 15 minutes)");

    // Job 4: Invariant checks (daily at 4:00 AM UTC)
    let invariants = billing.invariants.clone();
    scheduler
        .add(Job::new_async("0 0 4 * * *", move |_uuid, _l| {
            let checker = invariants.clone();
            Box::pin(async move {
                info!("Running ledger invariant checks");
                match checker.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Invariant checks failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Invariant checks (daily at 4:00 AM UTC)");

    // Job 5: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Subledger Worker started successfully with {} scheduled jobs", 5);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping scheduler");
    scheduler.shutdown().await?;

    Ok(())
}
