//! AdPilot Background Worker
//!
//! Handles scheduled jobs:
//! - Grace period expiry sweep (hourly)
//! - Trial expiry sweep (hourly)
//! - Billing invariant checks (daily at 3:00 AM UTC)
//! - Health check heartbeat (every 5 minutes)

use std::time::Duration;

use adpilot_billing::{InvariantChecker, SubscriptionService};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting AdPilot Worker");

    let pool = create_db_pool().await?;

    // The sweeps and invariant checks need no provider credentials, so the
    // worker builds the services it uses directly instead of the full
    // billing facade.
    let subscriptions = SubscriptionService::new(pool.clone());

    let scheduler = JobScheduler::new().await?;

    // Job 1: Grace period expiry sweep (hourly at :05)
    // Expires grace subscriptions past their deadline and turns AI
    // optimization off for the affected users. Safe to re-run: the second
    // pass matches zero rows.
    let grace_subs = subscriptions.clone();
    scheduler
        .add(Job::new_async("0 5 * * * *", move |_uuid, _l| {
            let subscriptions = grace_subs.clone();
            Box::pin(async move {
                info!("Running grace expiry sweep");
                match subscriptions
                    .expire_grace_sweep(OffsetDateTime::now_utc())
                    .await
                {
                    Ok(outcome) => info!(
                        expired = outcome.subscriptions_expired,
                        campaigns_deactivated = outcome.campaigns_deactivated,
                        "Grace expiry sweep finished"
                    ),
                    Err(e) => error!(error = %e, "Grace expiry sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Grace expiry sweep (hourly)");

    // Job 2: Trial expiry sweep (hourly at :10)
    let trial_subs = subscriptions.clone();
    scheduler
        .add(Job::new_async("0 10 * * * *", move |_uuid, _l| {
            let subscriptions = trial_subs.clone();
            Box::pin(async move {
                info!("Running trial expiry sweep");
                match subscriptions
                    .expire_trials_sweep(OffsetDateTime::now_utc())
                    .await
                {
                    Ok(outcome) => info!(
                        expired = outcome.subscriptions_expired,
                        campaigns_deactivated = outcome.campaigns_deactivated,
                        "Trial expiry sweep finished"
                    ),
                    Err(e) => error!(error = %e, "Trial expiry sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Trial expiry sweep (hourly)");

    // Job 3: Billing invariant checks (daily at 3:00 AM UTC)
    let invariant_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let pool = invariant_pool.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match InvariantChecker::new(pool).run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(checks = summary.checks_run, "All billing invariants hold")
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            warn!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                description = %violation.description,
                                "Billing invariant violated"
                            );
                        }
                        warn!(
                            failed = summary.checks_failed,
                            violations = summary.violations.len(),
                            "Billing invariant check found violations"
                        );
                    }
                    Err(e) => error!(error = %e, "Invariant check failed to run"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (daily at 3:00 AM UTC)");

    // Job 4: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("AdPilot Worker started successfully with 4 scheduled jobs");

    // Keep the main task running; the scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
