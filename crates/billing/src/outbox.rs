//! Outbox / retry service
//!
//! Durable best-effort delivery for side-effects whose failure must not
//! abort the primary state transition (usage metrics, notifications).
//! Entries that fail synchronous delivery are appended here and retried
//! by a periodic sweep; the queue is trimmed to the most recent entries.
//! One failing entry never blocks the others, and no ordering is
//! guaranteed across entries.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::notify::{NotificationKind, NotificationSender};
use crate::usage::UsageRecorder;

/// Maximum retained entries; older ones are trimmed on append.
pub const OUTBOX_CAP: i64 = 100;

/// What kind of side-effect an entry re-attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxKind {
    UsageMetric,
    Notification,
}

impl OutboxKind {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "usage_metric" => Some(Self::UsageMetric),
            "notification" => Some(Self::Notification),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UsageMetric => "usage_metric",
            Self::Notification => "notification",
        }
    }
}

/// A queued side-effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub kind: OutboxKind,
    pub payload: serde_json::Value,
    pub queued_at: OffsetDateTime,
    pub failure_reason: Option<String>,
}

/// Serialized form of a queued notification payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedNotification {
    pub kind: NotificationKind,
    pub recipient: String,
    pub data: serde_json::Value,
}

/// Storage contract for the queue. Only `append` is called from the
/// request path; the sweep runs on its own schedule.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Append an entry and trim the queue to the most recent `OUTBOX_CAP`.
    async fn append(&self, entry: OutboxEntry) -> BillingResult<()>;

    async fn list(&self) -> BillingResult<Vec<OutboxEntry>>;

    async fn remove(&self, id: Uuid) -> BillingResult<()>;

    async fn record_failure(&self, id: Uuid, reason: &str) -> BillingResult<()>;
}

/// Postgres-backed outbox.
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn append(&self, entry: OutboxEntry) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_entries (id, kind, payload, queued_at, failure_reason)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.id)
        .bind(entry.kind.as_str())
        .bind(&entry.payload)
        .bind(entry.queued_at)
        .bind(&entry.failure_reason)
        .execute(&self.pool)
        .await?;

        // Keep only the most recent entries
        sqlx::query(
            r#"
            DELETE FROM outbox_entries
            WHERE id NOT IN (
                SELECT id FROM outbox_entries ORDER BY queued_at DESC LIMIT $1
            )
            "#,
        )
        .bind(OUTBOX_CAP)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list(&self) -> BillingResult<Vec<OutboxEntry>> {
        let rows: Vec<(Uuid, String, serde_json::Value, OffsetDateTime, Option<String>)> =
            sqlx::query_as(
                "SELECT id, kind, payload, queued_at, failure_reason FROM outbox_entries ORDER BY queued_at ASC",
            )
            .fetch_all(&self.pool)
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for (id, kind, payload, queued_at, failure_reason) in rows {
            let Some(kind) = OutboxKind::from_str(&kind) else {
                tracing::warn!(id = %id, kind = %kind, "Dropping outbox entry with unknown kind");
                continue;
            };
            entries.push(OutboxEntry {
                id,
                kind,
                payload,
                queued_at,
                failure_reason,
            });
        }
        Ok(entries)
    }

    async fn remove(&self, id: Uuid) -> BillingResult<()> {
        sqlx::query("DELETE FROM outbox_entries WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, reason: &str) -> BillingResult<()> {
        sqlx::query("UPDATE outbox_entries SET failure_reason = $1 WHERE id = $2")
            .bind(reason)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Result of one sweep cycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepStats {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Dispatches side-effects, falling back to the queue on failure.
pub struct OutboxService {
    store: Arc<dyn OutboxStore>,
    usage: Arc<dyn UsageRecorder>,
    notifications: Arc<dyn NotificationSender>,
}

impl OutboxService {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        usage: Arc<dyn UsageRecorder>,
        notifications: Arc<dyn NotificationSender>,
    ) -> Self {
        Self {
            store,
            usage,
            notifications,
        }
    }

    /// Record a usage metric; queue it when delivery fails. Never errors;
    /// the primary transition must not be blocked.
    pub async fn record_usage(&self, payload: serde_json::Value) {
        if let Err(err) = self.usage.record_usage_event(payload.clone()).await {
            tracing::warn!(error = %err, "Usage metric delivery failed; queueing for retry");
            self.enqueue(OutboxKind::UsageMetric, payload, &err.to_string())
                .await;
        }
    }

    /// Send a notification; queue it when delivery fails. Never errors.
    pub async fn send_notification(
        &self,
        kind: NotificationKind,
        recipient: &str,
        data: serde_json::Value,
    ) {
        match self.notifications.send(kind, recipient, &data).await {
            Ok(()) => {}
            Err(err) => {
                tracing::warn!(
                    kind = %kind,
                    recipient = %recipient,
                    error = %err,
                    "Notification delivery failed; queueing for retry"
                );
                let payload = match serde_json::to_value(QueuedNotification {
                    kind,
                    recipient: recipient.to_string(),
                    data,
                }) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialize queued notification");
                        return;
                    }
                };
                self.enqueue(OutboxKind::Notification, payload, &err.to_string())
                    .await;
            }
        }
    }

    async fn enqueue(&self, kind: OutboxKind, payload: serde_json::Value, reason: &str) {
        let entry = OutboxEntry {
            id: Uuid::new_v4(),
            kind,
            payload: payload.clone(),
            queued_at: OffsetDateTime::now_utc(),
            failure_reason: Some(reason.to_string()),
        };
        if let Err(err) = self.store.append(entry).await {
            // The side-effect is lost for automated retry; keep the full
            // payload in the log for manual replay.
            tracing::error!(
                kind = %kind.as_str(),
                payload = %payload,
                error = %err,
                "Failed to queue side-effect; manual replay required"
            );
        }
    }

    /// Re-attempt every queued entry. Successes are removed, failures are
    /// retained verbatim for the next cycle; one failing entry does not
    /// block the others.
    pub async fn sweep(&self) -> SweepStats {
        let entries = match self.store.list().await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(error = %err, "Failed to list outbox entries for sweep");
                return SweepStats::default();
            }
        };

        let mut stats = SweepStats {
            attempted: entries.len(),
            ..Default::default()
        };

        for entry in entries {
            let delivery = self.deliver(&entry).await;
            match delivery {
                Ok(()) => {
                    stats.delivered += 1;
                    if let Err(err) = self.store.remove(entry.id).await {
                        tracing::error!(
                            id = %entry.id,
                            error = %err,
                            "Delivered outbox entry could not be removed; it may retry again"
                        );
                    }
                }
                Err(err) => {
                    stats.failed += 1;
                    tracing::warn!(
                        id = %entry.id,
                        kind = %entry.kind.as_str(),
                        error = %err,
                        "Outbox entry delivery failed; retaining for next sweep"
                    );
                    if let Err(store_err) = self.store.record_failure(entry.id, &err.to_string()).await
                    {
                        tracing::error!(
                            id = %entry.id,
                            error = %store_err,
                            "Failed to record outbox delivery failure"
                        );
                    }
                }
            }
        }

        stats
    }

    async fn deliver(&self, entry: &OutboxEntry) -> BillingResult<()> {
        match entry.kind {
            OutboxKind::UsageMetric => self.usage.record_usage_event(entry.payload.clone()).await,
            OutboxKind::Notification => {
                let queued: QueuedNotification = serde_json::from_value(entry.payload.clone())
                    .map_err(|e| {
                        BillingError::Internal(format!("Malformed queued notification: {e}"))
                    })?;
                self.notifications
                    .send(queued.kind, &queued.recipient, &queued.data)
                    .await
            }
        }
    }
}
