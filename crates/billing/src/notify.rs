//! Billing notifications
//!
//! Narrow sender interface over the notification transport. The concrete
//! implementation posts through the Resend HTTP API; the engine only ever
//! sees `send(kind, recipient, data)` and treats delivery as best-effort
//! (failures are queued in the outbox).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Kinds of billing notifications the engine can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    SubscriptionStarted,
    CancellationScheduled,
    SubscriptionReactivated,
    PlanChanged,
    SubscriptionCanceled,
    RenewalNotice,
    PaymentFailed,
    RefundProcessed,
}

impl NotificationKind {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "subscription_started" => Some(Self::SubscriptionStarted),
            "cancellation_scheduled" => Some(Self::CancellationScheduled),
            "subscription_reactivated" => Some(Self::SubscriptionReactivated),
            "plan_changed" => Some(Self::PlanChanged),
            "subscription_canceled" => Some(Self::SubscriptionCanceled),
            "renewal_notice" => Some(Self::RenewalNotice),
            "payment_failed" => Some(Self::PaymentFailed),
            "refund_processed" => Some(Self::RefundProcessed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubscriptionStarted => "subscription_started",
            Self::CancellationScheduled => "cancellation_scheduled",
            Self::SubscriptionReactivated => "subscription_reactivated",
            Self::PlanChanged => "plan_changed",
            Self::SubscriptionCanceled => "subscription_canceled",
            Self::RenewalNotice => "renewal_notice",
            Self::PaymentFailed => "payment_failed",
            Self::RefundProcessed => "refund_processed",
        }
    }

    fn subject(&self) -> &'static str {
        match self {
            Self::SubscriptionStarted => "Your subscription is active",
            Self::CancellationScheduled => "Your subscription will end at the period close",
            Self::SubscriptionReactivated => "Your subscription has been reactivated",
            Self::PlanChanged => "Your plan has changed",
            Self::SubscriptionCanceled => "Your subscription has been canceled",
            Self::RenewalNotice => "Your subscription has renewed",
            Self::PaymentFailed => "Payment failed for your subscription",
            Self::RefundProcessed => "Your refund has been processed",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// `recipient` is the owning user id; the sender resolves the address.
    async fn send(
        &self,
        kind: NotificationKind,
        recipient: &str,
        data: &serde_json::Value,
    ) -> BillingResult<()>;
}

/// Resend-backed sender.
pub struct ResendNotificationSender {
    http: reqwest::Client,
    api_key: String,
    from_address: String,
    pool: PgPool,
}

impl ResendNotificationSender {
    pub fn new(api_key: String, from_address: String, pool: PgPool) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            from_address,
            pool,
        }
    }

    /// `None` when RESEND_API_KEY is not configured (sends become no-ops).
    pub fn from_env(pool: PgPool) -> Option<Self> {
        let api_key = std::env::var("RESEND_API_KEY").ok()?;
        let from_address = std::env::var("BILLING_FROM_EMAIL")
            .unwrap_or_else(|_| "billing@billsync.dev".to_string());
        Some(Self::new(api_key, from_address, pool))
    }

    async fn resolve_email(&self, recipient: &str) -> BillingResult<String> {
        let user_id = Uuid::parse_str(recipient)
            .map_err(|_| BillingError::Notification(format!("Invalid recipient: {recipient}")))?;

        let email: Option<(String,)> = sqlx::query_as("SELECT email FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        email
            .map(|(e,)| e)
            .ok_or_else(|| BillingError::Notification(format!("No email for user {user_id}")))
    }
}

#[async_trait]
impl NotificationSender for ResendNotificationSender {
    async fn send(
        &self,
        kind: NotificationKind,
        recipient: &str,
        data: &serde_json::Value,
    ) -> BillingResult<()> {
        let to = self.resolve_email(recipient).await?;

        let body = serde_json::json!({
            "from": self.from_address,
            "to": [to],
            "subject": kind.subject(),
            "html": render_notification(kind, data),
        });

        let response = self
            .http
            .post("https://api.resend.com/emails")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BillingError::Notification(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(BillingError::Notification(format!(
                "Resend returned {status}: {text}"
            )));
        }

        tracing::info!(kind = %kind, recipient = %recipient, "Sent billing notification");
        Ok(())
    }
}

/// Sender used when no transport is configured. Logs and drops; useful
/// for self-hosted deployments that do not send email.
pub struct NoopNotificationSender;

#[async_trait]
impl NotificationSender for NoopNotificationSender {
    async fn send(
        &self,
        kind: NotificationKind,
        recipient: &str,
        _data: &serde_json::Value,
    ) -> BillingResult<()> {
        tracing::debug!(kind = %kind, recipient = %recipient, "Notification transport not configured; dropping");
        Ok(())
    }
}

fn render_notification(kind: NotificationKind, data: &serde_json::Value) -> String {
    let detail = match kind {
        NotificationKind::CancellationScheduled => data
            .get("end_date")
            .and_then(|v| v.as_str())
            .map(|d| format!("<p>Access continues until {d}.</p>"))
            .unwrap_or_default(),
        NotificationKind::PlanChanged => data
            .get("plan")
            .and_then(|v| v.as_str())
            .map(|p| format!("<p>You are now on the {p} plan.</p>"))
            .unwrap_or_default(),
        NotificationKind::RefundProcessed => data
            .get("amount_cents")
            .and_then(|v| v.as_i64())
            .map(|cents| format!("<p>Refunded amount: ${:.2}.</p>", cents as f64 / 100.0))
            .unwrap_or_default(),
        _ => String::new(),
    };
    format!("<h2>{}</h2>{}", kind.subject(), detail)
}
