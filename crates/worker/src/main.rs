// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Billsync worker
//!
//! Runs the periodic outbox sweep and the lapsed-subscription expiry
//! sweep on a cron schedule. The request-handling side (engine + webhook
//! ingress) runs elsewhere; this binary only owns the background jobs.

mod sweeps;

use std::sync::Arc;

use anyhow::Context;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use billsync_billing::{BillingService, PgEntitlementNotifier};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    let pool = billsync_shared::db::create_pool(&database_url)
        .await
        .context("Failed to create database pool")?;

    {
        let migration_pool = billsync_shared::db::create_migration_pool(&database_url)
            .await
            .context("Failed to create migration pool")?;
        billsync_shared::db::run_migrations(&migration_pool)
            .await
            .context("Failed to run migrations")?;
        info!("Database migrations applied");
    }

    let service = Arc::new(
        BillingService::from_env(pool.clone()).context("Failed to build billing service")?,
    );
    let entitlements = Arc::new(PgEntitlementNotifier::new(pool.clone()));

    let mut scheduler = JobScheduler::new()
        .await
        .context("Failed to create job scheduler")?;

    // Hourly outbox sweep
    {
        let service = service.clone();
        scheduler
            .add(Job::new_async("0 11 * * * *", move |_id, _lock| {
                let service = service.clone();
                Box::pin(async move {
                    sweeps::run_outbox_sweep(&service.outbox).await;
                })
            })?)
            .await
            .context("Failed to schedule outbox sweep")?;
    }

    // Hourly expiry sweep, offset from the outbox sweep
    {
        let pool = pool.clone();
        let entitlements = entitlements.clone();
        scheduler
            .add(Job::new_async("0 41 * * * *", move |_id, _lock| {
                let pool = pool.clone();
                let entitlements = entitlements.clone();
                Box::pin(async move {
                    sweeps::expire_lapsed_subscriptions(&pool, entitlements.as_ref()).await;
                })
            })?)
            .await
            .context("Failed to schedule expiry sweep")?;
    }

    scheduler.start().await.context("Failed to start scheduler")?;
    info!("Worker started; sweeps scheduled");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received; stopping worker");

    if let Err(e) = scheduler.shutdown().await {
        error!(error = %e, "Scheduler shutdown failed");
    }

    Ok(())
}
