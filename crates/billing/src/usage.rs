//! Usage metrics recording
//!
//! Fire-and-forget from the engine's perspective: a synchronous failure
//! lands the payload in the outbox for the next sweep.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::BillingResult;

#[async_trait]
pub trait UsageRecorder: Send + Sync {
    async fn record_usage_event(&self, payload: serde_json::Value) -> BillingResult<()>;
}

/// Appends usage events to the `usage_events` table.
pub struct PgUsageRecorder {
    pool: PgPool,
}

impl PgUsageRecorder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageRecorder for PgUsageRecorder {
    async fn record_usage_event(&self, payload: serde_json::Value) -> BillingResult<()> {
        sqlx::query("INSERT INTO usage_events (payload, created_at) VALUES ($1, NOW())")
            .bind(&payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
