//! Billing audit events
//!
//! Append-only event log for billing operations. Events answer "why is
//! this user on this plan?" questions and support manual replay after
//! webhook processing failures. Logging is best-effort: a failed insert
//! is logged and never aborts the transition that produced it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Types of billing events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingEventType {
    CheckoutSessionCreated,
    CheckoutCompleted,
    SubscriptionUpdated,
    CancellationScheduled,
    SubscriptionReactivated,
    PlanChanged,
    SubscriptionCanceled,
    InvoicePaid,
    InvoiceFailed,
    RefundIssued,
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingEventType::CheckoutSessionCreated => "CHECKOUT_SESSION_CREATED",
            BillingEventType::CheckoutCompleted => "CHECKOUT_COMPLETED",
            BillingEventType::SubscriptionUpdated => "SUBSCRIPTION_UPDATED",
            BillingEventType::CancellationScheduled => "CANCELLATION_SCHEDULED",
            BillingEventType::SubscriptionReactivated => "SUBSCRIPTION_REACTIVATED",
            BillingEventType::PlanChanged => "PLAN_CHANGED",
            BillingEventType::SubscriptionCanceled => "SUBSCRIPTION_CANCELED",
            BillingEventType::InvoicePaid => "INVOICE_PAID",
            BillingEventType::InvoiceFailed => "INVOICE_FAILED",
            BillingEventType::RefundIssued => "REFUND_ISSUED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// End user through a command
    User,
    /// Admin action
    Admin,
    /// System automation (sweeps)
    System,
    /// Payment provider webhook
    Provider,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::Admin => write!(f, "admin"),
            ActorType::System => write!(f, "system"),
            ActorType::Provider => write!(f, "provider"),
        }
    }
}

/// A billing event record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub event_type: String,
    pub event_subtype: Option<String>,
    pub event_data: serde_json::Value,
    pub provider_event_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub provider_customer_id: Option<String>,
    pub actor_type: String,
    pub created_at: OffsetDateTime,
}

/// Builder for creating billing events
pub struct BillingEventBuilder {
    user_id: Uuid,
    event_type: BillingEventType,
    event_subtype: Option<String>,
    event_data: serde_json::Value,
    provider_event_id: Option<String>,
    provider_subscription_id: Option<String>,
    provider_customer_id: Option<String>,
    actor_type: ActorType,
}

impl BillingEventBuilder {
    pub fn new(user_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            user_id,
            event_type,
            event_subtype: None,
            event_data: serde_json::json!({}),
            provider_event_id: None,
            provider_subscription_id: None,
            provider_customer_id: None,
            actor_type: ActorType::System,
        }
    }

    pub fn subtype(mut self, subtype: impl Into<String>) -> Self {
        self.event_subtype = Some(subtype.into());
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    pub fn provider_event(mut self, event_id: impl Into<String>) -> Self {
        self.provider_event_id = Some(event_id.into());
        self
    }

    pub fn provider_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.provider_subscription_id = Some(subscription_id.into());
        self
    }

    pub fn provider_customer(mut self, customer_id: impl Into<String>) -> Self {
        self.provider_customer_id = Some(customer_id.into());
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    pub fn event_type(&self) -> BillingEventType {
        self.event_type
    }

    pub fn event_user_id(&self) -> Uuid {
        self.user_id
    }
}

/// Sink for billing audit events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn log(&self, builder: BillingEventBuilder) -> BillingResult<Uuid>;
}

/// Postgres-backed event log.
pub struct PgEventSink {
    pool: PgPool,
}

impl PgEventSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get recent events for a user, newest first.
    pub async fn events_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        let events: Vec<BillingEvent> = sqlx::query_as(
            r#"
            SELECT
                id, user_id, event_type, event_subtype, event_data,
                provider_event_id, provider_subscription_id, provider_customer_id,
                actor_type, created_at
            FROM billing_events
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}

#[async_trait]
impl EventSink for PgEventSink {
    async fn log(&self, builder: BillingEventBuilder) -> BillingResult<Uuid> {
        let event_id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO billing_events (
                user_id,
                event_type,
                event_subtype,
                event_data,
                provider_event_id,
                provider_subscription_id,
                provider_customer_id,
                actor_type
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(builder.user_id)
        .bind(builder.event_type.to_string())
        .bind(&builder.event_subtype)
        .bind(&builder.event_data)
        .bind(&builder.provider_event_id)
        .bind(&builder.provider_subscription_id)
        .bind(&builder.provider_customer_id)
        .bind(builder.actor_type.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(event_id.0)
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for BillingEvent {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            event_type: row.try_get("event_type")?,
            event_subtype: row.try_get("event_subtype")?,
            event_data: row.try_get("event_data")?,
            provider_event_id: row.try_get("provider_event_id")?,
            provider_subscription_id: row.try_get("provider_subscription_id")?,
            provider_customer_id: row.try_get("provider_customer_id")?,
            actor_type: row.try_get("actor_type")?,
            created_at: row.try_get("created_at")?,
        })
    }
}
