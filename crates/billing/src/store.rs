//! Subscription record store
//!
//! The upsert-by-user-id operation is the single synchronization point for
//! a given user: concurrent writers (a user command and a racing webhook)
//! merge field-wise through one atomic `ON CONFLICT` statement, so the
//! later write wins without dropping an in-flight field.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use billsync_shared::{
    CancelationType, PaymentMethod, PaymentStatus, Plan, RefundStatus, SubscriptionRecord,
    SubscriptionStatus,
};

use crate::error::BillingResult;

/// A partial update to a subscription record. `None` fields are left
/// unchanged by the upsert; `Some` fields overwrite.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionPatch {
    pub plan: Option<Plan>,
    pub status: Option<SubscriptionStatus>,
    pub is_active: Option<bool>,
    pub cancelation_type: Option<CancelationType>,
    pub start_date: Option<OffsetDateTime>,
    pub end_date: Option<OffsetDateTime>,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub provider_price_id: Option<String>,
    pub payment_method: Option<PaymentMethod>,
    pub last_payment_date: Option<OffsetDateTime>,
    pub last_transaction_id: Option<String>,
    pub payment_status: Option<PaymentStatus>,
    pub last_failure_reason: Option<String>,
    pub refund_status: Option<RefundStatus>,
    pub refund_amount_cents: Option<i64>,
    pub refund_date: Option<OffsetDateTime>,
}

impl SubscriptionPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(mut self, plan: Plan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn status(mut self, status: SubscriptionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_active(mut self, active: bool) -> Self {
        self.is_active = Some(active);
        self
    }

    pub fn cancelation_type(mut self, kind: CancelationType) -> Self {
        self.cancelation_type = Some(kind);
        self
    }

    pub fn start_date(mut self, at: OffsetDateTime) -> Self {
        self.start_date = Some(at);
        self
    }

    pub fn end_date(mut self, at: Option<OffsetDateTime>) -> Self {
        self.end_date = at;
        self
    }

    pub fn provider_customer_id(mut self, id: impl Into<String>) -> Self {
        self.provider_customer_id = Some(id.into());
        self
    }

    pub fn provider_subscription_id(mut self, id: impl Into<String>) -> Self {
        self.provider_subscription_id = Some(id.into());
        self
    }

    pub fn provider_price_id(mut self, id: impl Into<String>) -> Self {
        self.provider_price_id = Some(id.into());
        self
    }

    pub fn payment_method(mut self, method: PaymentMethod) -> Self {
        self.payment_method = Some(method);
        self
    }

    /// Drop an `end_date` that cannot hold: before the effective start
    /// date, or before the Unix epoch (the decoded form of a junk value).
    /// Invalid values are stripped from the patch, never stored.
    pub fn sanitized(mut self, existing_start: Option<OffsetDateTime>) -> Self {
        if let Some(end) = self.end_date {
            let start = self.start_date.or(existing_start);
            let nonsense = end.unix_timestamp() <= 0 || start.map(|s| end < s).unwrap_or(false);
            if nonsense {
                tracing::warn!(end_date = %end, "Stripping invalid end_date from subscription update");
                self.end_date = None;
            }
        }
        self
    }

    /// Apply this patch to an in-memory record (the same merge the SQL
    /// upsert performs). Used by the in-memory store and by tests.
    pub fn apply_to(&self, record: &mut SubscriptionRecord, now: OffsetDateTime) {
        if let Some(plan) = self.plan {
            record.plan = plan;
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(active) = self.is_active {
            record.is_active = active;
        }
        if let Some(kind) = self.cancelation_type {
            record.cancelation_type = kind;
        }
        if let Some(at) = self.start_date {
            record.start_date = Some(at);
        }
        if let Some(at) = self.end_date {
            record.end_date = Some(at);
        }
        if let Some(ref id) = self.provider_customer_id {
            record.provider_customer_id = Some(id.clone());
        }
        if let Some(ref id) = self.provider_subscription_id {
            record.provider_subscription_id = Some(id.clone());
        }
        if let Some(ref id) = self.provider_price_id {
            record.provider_price_id = Some(id.clone());
        }
        if let Some(method) = self.payment_method {
            record.payment_method = method;
        }
        if let Some(at) = self.last_payment_date {
            record.last_payment_date = Some(at);
        }
        if let Some(ref id) = self.last_transaction_id {
            record.last_transaction_id = Some(id.clone());
        }
        if let Some(status) = self.payment_status {
            record.payment_status = Some(status);
        }
        if let Some(ref reason) = self.last_failure_reason {
            record.last_failure_reason = Some(reason.clone());
        }
        if let Some(status) = self.refund_status {
            record.refund_status = status;
        }
        if let Some(amount) = self.refund_amount_cents {
            record.refund_amount_cents = Some(amount);
        }
        if let Some(at) = self.refund_date {
            record.refund_date = Some(at);
        }
        record.updated_at = now;
    }

    /// A fresh record produced by applying this patch to defaults.
    pub fn into_new_record(self, user_id: Uuid, now: OffsetDateTime) -> SubscriptionRecord {
        let mut record = SubscriptionRecord {
            user_id,
            plan: Plan::Free,
            status: SubscriptionStatus::Incomplete,
            is_active: false,
            cancelation_type: CancelationType::None,
            start_date: None,
            end_date: None,
            provider_customer_id: None,
            provider_subscription_id: None,
            provider_price_id: None,
            payment_method: PaymentMethod::Provider,
            last_payment_date: None,
            last_transaction_id: None,
            payment_status: None,
            last_failure_reason: None,
            refund_status: RefundStatus::None,
            refund_amount_cents: None,
            refund_date: None,
            created_at: now,
            updated_at: now,
        };
        self.apply_to(&mut record, now);
        record
    }
}

/// Keyed access to subscription records plus webhook-event dedup claims.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_by_user_id(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>>;

    async fn get_by_provider_customer_id(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// Atomically create-or-merge the record for `user_id` and return the
    /// post-merge state.
    async fn upsert_by_user_id(
        &self,
        user_id: Uuid,
        patch: SubscriptionPatch,
    ) -> BillingResult<SubscriptionRecord>;

    /// Claim exclusive processing rights for a webhook event. Returns
    /// false when the event was already processed (or is being processed
    /// by another worker); the caller must treat that as a duplicate.
    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Record the processing outcome for a claimed event.
    async fn finish_webhook_event(
        &self,
        event_id: &str,
        outcome: Result<(), &str>,
    ) -> BillingResult<()>;
}

/// Postgres-backed store.
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Events stuck in `processing` longer than this are re-claimable
/// (worker crashed mid-event).
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn get_by_user_id(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let record: Option<SubscriptionRecord> =
            sqlx::query_as("SELECT * FROM subscriptions WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(record)
    }

    async fn get_by_provider_customer_id(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record: Option<SubscriptionRecord> =
            sqlx::query_as("SELECT * FROM subscriptions WHERE provider_customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(record)
    }

    async fn upsert_by_user_id(
        &self,
        user_id: Uuid,
        patch: SubscriptionPatch,
    ) -> BillingResult<SubscriptionRecord> {
        let existing_start: Option<OffsetDateTime> = sqlx::query_scalar(
            "SELECT start_date FROM subscriptions WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .flatten();

        let patch = patch.sanitized(existing_start);

        // COALESCE(EXCLUDED.col, existing.col) keeps every unpatched field,
        // so two concurrent partial writes merge instead of clobbering.
        let record: SubscriptionRecord = sqlx::query_as(
            r#"
            INSERT INTO subscriptions (
                user_id, plan, status, is_active, cancelation_type,
                start_date, end_date,
                provider_customer_id, provider_subscription_id, provider_price_id,
                payment_method, last_payment_date, last_transaction_id,
                payment_status, last_failure_reason,
                refund_status, refund_amount_cents, refund_date,
                created_at, updated_at
            ) VALUES (
                $1,
                COALESCE($2, 'free'),
                COALESCE($3, 'incomplete'),
                COALESCE($4, FALSE),
                COALESCE($5, 'none'),
                $6, $7, $8, $9, $10,
                COALESCE($11, 'provider'),
                $12, $13, $14, $15,
                COALESCE($16, 'none'),
                $17, $18,
                NOW(), NOW()
            )
            ON CONFLICT (user_id) DO UPDATE SET
                plan = COALESCE($2, subscriptions.plan),
                status = COALESCE($3, subscriptions.status),
                is_active = COALESCE($4, subscriptions.is_active),
                cancelation_type = COALESCE($5, subscriptions.cancelation_type),
                start_date = COALESCE($6, subscriptions.start_date),
                end_date = COALESCE($7, subscriptions.end_date),
                provider_customer_id = COALESCE($8, subscriptions.provider_customer_id),
                provider_subscription_id = COALESCE($9, subscriptions.provider_subscription_id),
                provider_price_id = COALESCE($10, subscriptions.provider_price_id),
                payment_method = COALESCE($11, subscriptions.payment_method),
                last_payment_date = COALESCE($12, subscriptions.last_payment_date),
                last_transaction_id = COALESCE($13, subscriptions.last_transaction_id),
                payment_status = COALESCE($14, subscriptions.payment_status),
                last_failure_reason = COALESCE($15, subscriptions.last_failure_reason),
                refund_status = COALESCE($16, subscriptions.refund_status),
                refund_amount_cents = COALESCE($17, subscriptions.refund_amount_cents),
                refund_date = COALESCE($18, subscriptions.refund_date),
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(patch.plan.map(|p| p.as_str()))
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.is_active)
        .bind(patch.cancelation_type.map(|c| c.as_str()))
        .bind(patch.start_date)
        .bind(patch.end_date)
        .bind(&patch.provider_customer_id)
        .bind(&patch.provider_subscription_id)
        .bind(&patch.provider_price_id)
        .bind(patch.payment_method.map(|m| m.as_str()))
        .bind(patch.last_payment_date)
        .bind(&patch.last_transaction_id)
        .bind(patch.payment_status.map(|s| s.as_str()))
        .bind(&patch.last_failure_reason)
        .bind(patch.refund_status.map(|s| s.as_str()))
        .bind(patch.refund_amount_cents)
        .bind(patch.refund_date)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<bool> {
        // INSERT...ON CONFLICT...RETURNING ensures only one concurrent
        // request can claim processing rights. Events stuck in
        // 'processing' past the timeout are re-claimable.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (provider_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (provider_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Recovered from stuck state at ', NOW()::TEXT)
            WHERE webhook_events.processing_result = 'processing'
              AND webhook_events.processing_started_at < NOW() - ($4 || ' minutes')::INTERVAL
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        outcome: Result<(), &str>,
    ) -> BillingResult<()> {
        let (result, error_message) = match outcome {
            Ok(()) => ("success", None),
            Err(reason) => ("error", Some(reason.to_string())),
        };

        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_result = $1, error_message = $2
            WHERE provider_event_id = $3
            "#,
        )
        .bind(result)
        .bind(&error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_sanitize_strips_end_before_start() {
        let patch = SubscriptionPatch::new()
            .start_date(datetime!(2024-06-01 00:00 UTC))
            .end_date(Some(datetime!(2024-05-01 00:00 UTC)))
            .sanitized(None);
        assert!(patch.end_date.is_none());
        assert!(patch.start_date.is_some());
    }

    #[test]
    fn test_sanitize_strips_epoch_garbage() {
        // An unparsable provider value decodes to the epoch sentinel
        let patch = SubscriptionPatch::new()
            .end_date(Some(datetime!(1970-01-01 00:00 UTC)))
            .sanitized(None);
        assert!(patch.end_date.is_none());
    }

    #[test]
    fn test_sanitize_checks_against_existing_start() {
        let patch = SubscriptionPatch::new()
            .end_date(Some(datetime!(2024-05-01 00:00 UTC)))
            .sanitized(Some(datetime!(2024-06-01 00:00 UTC)));
        assert!(patch.end_date.is_none());

        let patch = SubscriptionPatch::new()
            .end_date(Some(datetime!(2024-07-01 00:00 UTC)))
            .sanitized(Some(datetime!(2024-06-01 00:00 UTC)));
        assert_eq!(patch.end_date, Some(datetime!(2024-07-01 00:00 UTC)));
    }

    #[test]
    fn test_patch_merge_keeps_unset_fields() {
        let now = datetime!(2024-01-01 00:00 UTC);
        let mut record = SubscriptionPatch::new()
            .plan(Plan::Monthly)
            .status(SubscriptionStatus::Active)
            .is_active(true)
            .provider_customer_id("cus_1")
            .into_new_record(Uuid::new_v4(), now);

        // A racing payment-audit patch must not clobber lifecycle fields
        let audit = SubscriptionPatch {
            payment_status: Some(PaymentStatus::Success),
            last_transaction_id: Some("pi_1".to_string()),
            ..Default::default()
        };
        audit.apply_to(&mut record, now);

        assert_eq!(record.plan, Plan::Monthly);
        assert_eq!(record.status, SubscriptionStatus::Active);
        assert_eq!(record.provider_customer_id.as_deref(), Some("cus_1"));
        assert_eq!(record.payment_status, Some(PaymentStatus::Success));
    }
}
