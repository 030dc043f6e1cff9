//! Core domain types for subscription state
//!
//! The `SubscriptionRecord` is the single local source of truth for a
//! user's billing state. It is upserted by user commands and by provider
//! webhooks; it is never hard-deleted (cancellation is a status, not a
//! row removal).

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Subscription plans, ordered by entitlement.
///
/// `Monthly` and `Annual` are the standard paid plans (same entitlements,
/// different billing interval); `Premium` is the top paid plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Monthly,
    Annual,
    Premium,
}

impl Plan {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "free" => Some(Self::Free),
            "monthly" | "month" => Some(Self::Monthly),
            "annual" | "yearly" | "year" => Some(Self::Annual),
            "premium" => Some(Self::Premium),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Monthly => "monthly",
            Self::Annual => "annual",
            Self::Premium => "premium",
        }
    }

    /// Billing period length in calendar months. `None` for free (no cycle).
    pub fn period_months(&self) -> Option<i32> {
        match self {
            Self::Free => None,
            Self::Monthly | Self::Premium => Some(1),
            Self::Annual => Some(12),
        }
    }

    /// Whether this plan carries paid entitlements.
    pub fn is_paid(&self) -> bool {
        !matches!(self, Self::Free)
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Subscription lifecycle status, mirrored from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Canceled,
    Suspended,
    Trialing,
    Incomplete,
}

impl SubscriptionStatus {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(Self::Active),
            "canceled" | "cancelled" => Some(Self::Canceled),
            "suspended" | "past_due" | "unpaid" | "paused" => Some(Self::Suspended),
            "trialing" => Some(Self::Trialing),
            "incomplete" | "incomplete_expired" => Some(Self::Incomplete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Canceled => "canceled",
            Self::Suspended => "suspended",
            Self::Trialing => "trialing",
            Self::Incomplete => "incomplete",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a cancellation takes effect. `None` means no cancellation is in
/// flight; storing it as a value (rather than NULL) lets a partial update
/// clear the field through the same field-merge upsert as any other write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CancelationType {
    #[default]
    None,
    EndOfPeriod,
    Immediate,
}

impl CancelationType {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "end_of_period" => Some(Self::EndOfPeriod),
            "immediate" => Some(Self::Immediate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::EndOfPeriod => "end_of_period",
            Self::Immediate => "immediate",
        }
    }
}

impl std::fmt::Display for CancelationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of the most recent payment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Success,
    Failed,
    Pending,
}

impl PaymentStatus {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "pending" => Some(Self::Pending),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Pending => "pending",
        }
    }
}

/// Refund state for the current subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    #[default]
    None,
    Processed,
    ManualPending,
}

impl RefundStatus {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "processed" => Some(Self::Processed),
            "manual_pending" => Some(Self::ManualPending),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Processed => "processed",
            Self::ManualPending => "manual_pending",
        }
    }
}

/// How the subscription is paid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    #[default]
    Provider,
    Manual,
}

impl PaymentMethod {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "provider" => Some(Self::Provider),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provider => "provider",
            Self::Manual => "manual",
        }
    }
}

/// Access role granted to a user based on subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Premium,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Premium => "premium",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The persisted subscription record, one per user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub user_id: Uuid,
    pub plan: Plan,
    pub status: SubscriptionStatus,
    /// Derived access flag. May remain true while `status = canceled` when
    /// cancellation is scheduled for period end.
    pub is_active: bool,
    pub cancelation_type: CancelationType,
    pub start_date: Option<OffsetDateTime>,
    /// Bounds the period after which `is_active` must become false.
    /// Always absent or a valid instant >= `start_date`.
    pub end_date: Option<OffsetDateTime>,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub provider_price_id: Option<String>,
    pub payment_method: PaymentMethod,
    pub last_payment_date: Option<OffsetDateTime>,
    pub last_transaction_id: Option<String>,
    pub payment_status: Option<PaymentStatus>,
    pub last_failure_reason: Option<String>,
    pub refund_status: RefundStatus,
    pub refund_amount_cents: Option<i64>,
    pub refund_date: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// Whether the paid period has ended.
    pub fn has_lapsed(&self, now: OffsetDateTime) -> bool {
        self.end_date.map(|end| now >= end).unwrap_or(false)
    }

    /// Whether cancellation is scheduled but access is still retained.
    pub fn is_pending_cancellation(&self) -> bool {
        self.status == SubscriptionStatus::Canceled
            && self.cancelation_type == CancelationType::EndOfPeriod
            && self.is_active
    }

    /// The role this record entitles the user to. This is the single
    /// derivation used for every role mutation.
    pub fn entitled_role(&self) -> Role {
        if self.is_active && self.plan.is_paid() {
            Role::Premium
        } else {
            Role::User
        }
    }
}

fn decode_err(column: &str, value: &str) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: format!("unrecognized value: {value}").into(),
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for SubscriptionRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let plan: String = row.try_get("plan")?;
        let status: String = row.try_get("status")?;
        let cancelation_type: String = row.try_get("cancelation_type")?;
        let payment_method: String = row.try_get("payment_method")?;
        let payment_status: Option<String> = row.try_get("payment_status")?;
        let refund_status: String = row.try_get("refund_status")?;

        Ok(Self {
            user_id: row.try_get("user_id")?,
            plan: Plan::from_str(&plan).ok_or_else(|| decode_err("plan", &plan))?,
            status: SubscriptionStatus::from_str(&status)
                .ok_or_else(|| decode_err("status", &status))?,
            is_active: row.try_get("is_active")?,
            cancelation_type: CancelationType::from_str(&cancelation_type)
                .ok_or_else(|| decode_err("cancelation_type", &cancelation_type))?,
            start_date: row.try_get("start_date")?,
            end_date: row.try_get("end_date")?,
            provider_customer_id: row.try_get("provider_customer_id")?,
            provider_subscription_id: row.try_get("provider_subscription_id")?,
            provider_price_id: row.try_get("provider_price_id")?,
            payment_method: PaymentMethod::from_str(&payment_method)
                .ok_or_else(|| decode_err("payment_method", &payment_method))?,
            last_payment_date: row.try_get("last_payment_date")?,
            last_transaction_id: row.try_get("last_transaction_id")?,
            payment_status: match payment_status {
                Some(ref s) => {
                    Some(PaymentStatus::from_str(s).ok_or_else(|| decode_err("payment_status", s))?)
                }
                None => None,
            },
            last_failure_reason: row.try_get("last_failure_reason")?,
            refund_status: RefundStatus::from_str(&refund_status)
                .ok_or_else(|| decode_err("refund_status", &refund_status))?,
            refund_amount_cents: row.try_get("refund_amount_cents")?,
            refund_date: row.try_get("refund_date")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}
