//! Carmarket Background Worker
//!
//! Scheduled payment jobs:
//! - Status poll of stale payment intents (every PAYMENT_POLL_INTERVAL_SECS)
//! - Replay of unprocessed webhook deliveries (every 10 minutes)
//! - Payment invariant checks (hourly)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;

use carmarket_payments::{InvariantChecker, PaymentsService, WebhookReplayResult};
use carmarket_shared::{create_pool_with, init_tracing};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Deliveries replayed per replay run
const REPLAY_BATCH_SIZE: i64 = 100;

fn log_replay_results(results: &[WebhookReplayResult]) {
    let succeeded = results.iter().filter(|r| r.success).count();
    let failed = results.len() - succeeded;

    info!(
        replayed = results.len(),
        succeeded = succeeded,
        failed = failed,
        "Webhook replay cycle complete"
    );

    for result in results.iter().filter(|r| !r.success) {
        warn!(
            webhook_event_id = %result.event_id,
            event_type = %result.event_type,
            error = ?result.new_error,
            "Webhook still failing after replay"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    init_tracing("info,carmarket_worker=debug,carmarket_payments=debug");

    info!("Starting Carmarket Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool_with(&database_url, 5).await?;

    let payments = match PaymentsService::from_env(pool.clone()) {
        Ok(p) => Some(Arc::new(p)),
        Err(e) => {
            // Without gateway credentials only the read-only jobs can run
            warn!(error = %e, "Failed to create payments service - running in minimal mode");
            None
        }
    };

    let mut scheduler = JobScheduler::new().await?;
    let mut job_count = 0;

    if let Some(payments) = &payments {
        // Job 1: Status poll for intents whose webhook never arrived
        let poller = payments.poller.clone();
        let interval = poller.config().interval;
        scheduler
            .add(Job::new_repeated_async(interval, move |_uuid, _l| {
                let poller = poller.clone();
                Box::pin(async move {
                    if let Err(e) = poller.run_once().await {
                        error!(error = %e, "Status poll cycle failed");
                    }
                })
            })?)
            .await?;
        job_count += 1;
        info!(
            interval_secs = interval.as_secs(),
            "Scheduled: Payment status poll"
        );

        // Job 2: Replay deliveries that failed transiently
        let ingest = payments.ingest.clone();
        scheduler
            .add(Job::new_async("0 */10 * * * *", move |_uuid, _l| {
                let ingest = ingest.clone();
                Box::pin(async move {
                    match ingest.replay_unprocessed(REPLAY_BATCH_SIZE).await {
                        Ok(results) if results.is_empty() => {}
                        Ok(results) => log_replay_results(&results),
                        Err(e) => error!(error = %e, "Failed to list replayable webhooks"),
                    }
                })
            })?)
            .await?;
        job_count += 1;
        info!("Scheduled: Webhook replay (every 10 minutes)");
    }

    // Job 3: Payment invariants (hourly)
    let ceiling = payments
        .as_ref()
        .map(|p| p.engine.config().max_confirmation_attempts)
        .unwrap_or(carmarket_payments::DEFAULT_MAX_CONFIRMATION_ATTEMPTS);
    let checker = Arc::new(InvariantChecker::new(pool.clone()).with_max_confirmation_attempts(ceiling));
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let checker = checker.clone();
            Box::pin(async move {
                info!("Running payment invariant checks");
                match checker.run_all_checks().await {
                    Ok(summary) => info!(
                        checks_run = summary.checks_run,
                        checks_failed = summary.checks_failed,
                        healthy = summary.healthy,
                        "Payment invariant checks complete"
                    ),
                    Err(e) => error!(error = %e, "Payment invariant checks failed to run"),
                }
            })
        })?)
        .await?;
    job_count += 1;
    info!("Scheduled: Payment invariant checks (hourly)");

    // Job 4: Heartbeat (every 5 minutes)
    let minimal = payments.is_none();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            Box::pin(async move {
                if minimal {
                    info!("Worker heartbeat (minimal mode)");
                } else {
                    info!("Worker heartbeat - all systems operational");
                }
            })
        })?)
        .await?;
    job_count += 1;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!(
        "Carmarket Worker started successfully with {} scheduled jobs",
        job_count
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping scheduler");
    scheduler.shutdown().await?;

    Ok(())
}
