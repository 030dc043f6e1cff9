//! Subscription reconciliation engine
//!
//! The state machine governing subscription status/plan/date transitions.
//! Given a command (user action) or an inbound provider event, it computes
//! the new subscription state, decides whether the provider must also be
//! called, and applies the role change derived from the post-transition
//! record. Every transition is idempotent under webhook re-delivery.
//!
//! Ordering of effects matters: the provider call (when one is needed) is
//! the side-effecting step and happens first; the local record is only
//! written after the remote call confirms, so a timed-out provider call
//! leaves local state untouched.

use std::sync::Arc;

use time::{Date, OffsetDateTime};
use uuid::Uuid;

use billsync_shared::{
    CancelationType, PaymentMethod, PaymentStatus, Plan, RefundStatus, SubscriptionRecord,
    SubscriptionStatus,
};

use crate::client::PlanCatalog;
use crate::entitlement::EntitlementNotifier;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventType, EventSink};
use crate::gateway::{CheckoutSessionInfo, ProviderGateway, ProviderSubscription};
use crate::notify::NotificationKind;
use crate::outbox::OutboxService;
use crate::store::{SubscriptionPatch, SubscriptionStore};

/// Add whole calendar months, clamping the day to the target month's
/// length (Jan 31 + 1 month = Feb 28/29). Used for local period-end
/// fallbacks so annual plans never drift the way fixed day counts would.
pub fn add_calendar_months(at: OffsetDateTime, months: i32) -> OffsetDateTime {
    let total = (at.year() * 12 + at.month() as i32 - 1) + months;
    let year = total.div_euclid(12);
    let month0 = total.rem_euclid(12) as u8;

    let month = match time::Month::try_from(month0 + 1) {
        Ok(m) => m,
        // Unreachable for month0 in 0..12; keep the original on the
        // impossible path rather than panicking.
        Err(_) => return at,
    };

    let max_day = time::util::days_in_year_month(year, month);
    let day = at.day().min(max_day);

    match Date::from_calendar_date(year, month, day) {
        Ok(date) => at.replace_date(date),
        Err(_) => at,
    }
}

/// Correlation identifiers carried by a completed checkout.
#[derive(Debug, Clone, Default)]
pub struct CheckoutCorrelation {
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub price_id: Option<String>,
}

/// Payment facts extracted from a provider invoice event.
#[derive(Debug, Clone)]
pub struct InvoicePayment {
    pub customer_id: Option<String>,
    pub invoice_id: Option<String>,
    /// Payment intent / charge identifier usable for refunds.
    pub transaction_id: Option<String>,
    pub amount_cents: i64,
    pub billing_reason: Option<String>,
    pub failure_message: Option<String>,
    pub occurred_at: Option<OffsetDateTime>,
}

/// Result of `cancel_at_period_end`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CancellationSchedule {
    pub end_date: Option<OffsetDateTime>,
    /// True when the record was already scheduled and no provider call
    /// was issued.
    pub already_scheduled: bool,
}

/// Result of `change_plan`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlanChangeResult {
    pub plan: Plan,
    pub end_date: Option<OffsetDateTime>,
    /// Approximate prorated delta in minor units, for display only; the
    /// provider's own invoice is authoritative.
    pub proration_estimate_cents: Option<i64>,
}

/// Result of `request_refund`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundOutcome {
    Processed { amount_cents: i64 },
    /// Manual-payment subscriptions are flagged for operator follow-up.
    ManualPending,
}

/// How a webhook application resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookDisposition {
    Applied,
    /// Dropped without local effect; the reason is logged.
    NoOp(String),
}

/// The reconciliation engine. All collaborators are injected; the engine
/// holds no global state.
pub struct ReconciliationEngine {
    store: Arc<dyn SubscriptionStore>,
    gateway: Arc<dyn ProviderGateway>,
    entitlements: Arc<dyn EntitlementNotifier>,
    outbox: Arc<OutboxService>,
    events: Arc<dyn EventSink>,
    catalog: PlanCatalog,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        gateway: Arc<dyn ProviderGateway>,
        entitlements: Arc<dyn EntitlementNotifier>,
        outbox: Arc<OutboxService>,
        events: Arc<dyn EventSink>,
        catalog: PlanCatalog,
    ) -> Self {
        Self {
            store,
            gateway,
            entitlements,
            outbox,
            events,
            catalog,
        }
    }

    /// Apply the role derived from the freshly written record. Failures
    /// are logged; a missed role flip is corrected by the next
    /// transition or sweep, and must not fail the transition itself.
    async fn sync_entitlement(&self, record: &SubscriptionRecord) {
        let role = record.entitled_role();
        if let Err(err) = self.entitlements.set_role(record.user_id, role).await {
            tracing::error!(
                user_id = %record.user_id,
                role = %role,
                error = %err,
                "Failed to apply entitlement role"
            );
        }
    }

    async fn log_event(&self, builder: BillingEventBuilder) {
        if let Err(err) = self.events.log(builder).await {
            tracing::warn!(error = %err, "Failed to log billing event");
        }
    }

    fn local_period_end(
        &self,
        plan: Plan,
        start: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> Option<OffsetDateTime> {
        plan.period_months()
            .map(|months| add_calendar_months(start.unwrap_or(now), months))
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Create a provider checkout session for a paid plan. A stub record
    /// is pre-registered best-effort; checkout completion (webhook) is
    /// what creates the authoritative active state.
    pub async fn create_checkout(
        &self,
        user_id: Uuid,
        plan: Plan,
    ) -> BillingResult<CheckoutSessionInfo> {
        if !plan.is_paid() {
            return Err(BillingError::InvalidPlan(plan.to_string()));
        }

        let session = self.gateway.create_checkout_session(user_id, plan).await?;

        // Pre-register only when the user has no record yet; an existing
        // record (possibly active) must not be downgraded to a stub.
        match self.store.get_by_user_id(user_id).await {
            Ok(None) => {
                let patch = SubscriptionPatch::new()
                    .plan(plan)
                    .status(SubscriptionStatus::Incomplete)
                    .payment_method(PaymentMethod::Provider);
                if let Err(err) = self.store.upsert_by_user_id(user_id, patch).await {
                    tracing::warn!(
                        user_id = %user_id,
                        error = %err,
                        "Best-effort checkout pre-registration failed"
                    );
                }
            }
            Ok(Some(_)) => {}
            Err(err) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %err,
                    "Could not check for existing record before checkout pre-registration"
                );
            }
        }

        self.log_event(
            BillingEventBuilder::new(user_id, BillingEventType::CheckoutSessionCreated)
                .data(serde_json::json!({ "plan": plan, "session_id": session.session_id }))
                .actor_type(ActorType::User),
        )
        .await;

        Ok(session)
    }

    /// Schedule cancellation at the current period's end. Idempotent:
    /// re-invoking on an already-scheduled record returns the existing
    /// schedule without a second provider call.
    pub async fn cancel_at_period_end(&self, user_id: Uuid) -> BillingResult<CancellationSchedule> {
        let record = self
            .store
            .get_by_user_id(user_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(user_id.to_string()))?;

        if record.is_pending_cancellation() {
            tracing::info!(
                user_id = %user_id,
                end_date = ?record.end_date,
                "Cancellation already scheduled; returning existing schedule"
            );
            return Ok(CancellationSchedule {
                end_date: record.end_date,
                already_scheduled: true,
            });
        }

        if record.status != SubscriptionStatus::Active {
            return Err(BillingError::NotActive(format!(
                "cannot schedule cancellation while status is {}",
                record.status
            )));
        }

        let now = OffsetDateTime::now_utc();

        // Provider first; an already-gone subscription is a soft success
        // on cancellation paths.
        let provider_end = match (&record.provider_subscription_id, record.payment_method) {
            (Some(sub_id), PaymentMethod::Provider) => {
                match self.gateway.set_cancel_at_period_end(sub_id, true).await {
                    Ok(psub) => psub.current_period_end,
                    Err(BillingError::ProviderGone(msg)) => {
                        tracing::warn!(
                            user_id = %user_id,
                            subscription_id = %sub_id,
                            reason = %msg,
                            "Subscription already gone at provider during scheduled cancellation"
                        );
                        None
                    }
                    Err(err) => return Err(err),
                }
            }
            _ => None,
        };

        let end_date =
            provider_end.or_else(|| self.local_period_end(record.plan, record.start_date, now));

        let patch = SubscriptionPatch::new()
            .status(SubscriptionStatus::Canceled)
            .cancelation_type(CancelationType::EndOfPeriod)
            .is_active(true)
            .end_date(end_date);
        let record = self.store.upsert_by_user_id(user_id, patch).await?;

        self.sync_entitlement(&record).await;
        self.log_event(
            BillingEventBuilder::new(user_id, BillingEventType::CancellationScheduled)
                .data(serde_json::json!({
                    "end_date": record.end_date.map(|d| d.to_string()),
                }))
                .actor_type(ActorType::User),
        )
        .await;
        self.outbox
            .send_notification(
                NotificationKind::CancellationScheduled,
                &user_id.to_string(),
                serde_json::json!({ "end_date": record.end_date.map(|d| d.to_string()) }),
            )
            .await;

        tracing::info!(
            user_id = %user_id,
            end_date = ?record.end_date,
            "Scheduled end-of-period cancellation"
        );

        Ok(CancellationSchedule {
            end_date: record.end_date,
            already_scheduled: false,
        })
    }

    /// Clear a scheduled end-of-period cancellation while the period is
    /// still running.
    pub async fn reactivate(&self, user_id: Uuid) -> BillingResult<SubscriptionRecord> {
        let record = self
            .store
            .get_by_user_id(user_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(user_id.to_string()))?;

        if !record.is_pending_cancellation() {
            return Err(BillingError::NotCancelable(
                "no end-of-period cancellation to reactivate".to_string(),
            ));
        }

        let now = OffsetDateTime::now_utc();
        if record.has_lapsed(now) || record.end_date.is_none() {
            return Err(BillingError::AlreadyLapsed);
        }

        let provider_end = match (&record.provider_subscription_id, record.payment_method) {
            (Some(sub_id), PaymentMethod::Provider) => {
                match self.gateway.set_cancel_at_period_end(sub_id, false).await {
                    Ok(psub) => psub.current_period_end,
                    Err(BillingError::ProviderGone(_)) => return Err(BillingError::AlreadyLapsed),
                    Err(err) => return Err(err),
                }
            }
            _ => None,
        };

        let patch = SubscriptionPatch::new()
            .status(SubscriptionStatus::Active)
            .cancelation_type(CancelationType::None)
            .is_active(true)
            .end_date(provider_end);
        let record = self.store.upsert_by_user_id(user_id, patch).await?;

        self.sync_entitlement(&record).await;
        self.log_event(
            BillingEventBuilder::new(user_id, BillingEventType::SubscriptionReactivated)
                .actor_type(ActorType::User),
        )
        .await;
        self.outbox
            .send_notification(
                NotificationKind::SubscriptionReactivated,
                &user_id.to_string(),
                serde_json::json!({ "plan": record.plan }),
            )
            .await;

        tracing::info!(user_id = %user_id, "Reactivated subscription");

        Ok(record)
    }

    /// Swap to a different paid plan with proration.
    pub async fn change_plan(&self, user_id: Uuid, new_plan: Plan) -> BillingResult<PlanChangeResult> {
        if !new_plan.is_paid() {
            return Err(BillingError::InvalidPlan(new_plan.to_string()));
        }

        let record = self
            .store
            .get_by_user_id(user_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(user_id.to_string()))?;

        if record.status != SubscriptionStatus::Active {
            return Err(BillingError::NotActive(format!(
                "cannot change plan while status is {}",
                record.status
            )));
        }
        if record.plan == new_plan {
            return Err(BillingError::SamePlan(new_plan.to_string()));
        }

        let new_price_id = self
            .catalog
            .price_id_for_plan(new_plan)
            .ok_or_else(|| BillingError::InvalidPlan(new_plan.to_string()))?
            .to_string();

        let sub_id = record.provider_subscription_id.clone().ok_or_else(|| {
            BillingError::MissingCorrelation(format!(
                "no provider subscription on record for user {user_id}"
            ))
        })?;

        // Display-only estimate; never blocks the swap.
        let proration_estimate_cents = self
            .estimate_proration(&record, &new_price_id)
            .await
            .unwrap_or_else(|err| {
                tracing::debug!(user_id = %user_id, error = %err, "Proration estimate unavailable");
                None
            });

        let psub = self.gateway.change_price(&sub_id, &new_price_id).await?;

        let patch = SubscriptionPatch::new()
            .plan(new_plan)
            .provider_price_id(new_price_id)
            .end_date(psub.current_period_end);
        let record = self.store.upsert_by_user_id(user_id, patch).await?;

        // Role stays premium across paid-plan swaps; the derived value
        // makes that explicit.
        self.sync_entitlement(&record).await;
        self.log_event(
            BillingEventBuilder::new(user_id, BillingEventType::PlanChanged)
                .data(serde_json::json!({
                    "to": new_plan,
                    "proration_estimate_cents": proration_estimate_cents,
                }))
                .provider_subscription(&psub.id)
                .actor_type(ActorType::User),
        )
        .await;
        self.outbox
            .send_notification(
                NotificationKind::PlanChanged,
                &user_id.to_string(),
                serde_json::json!({ "plan": new_plan }),
            )
            .await;

        tracing::info!(
            user_id = %user_id,
            plan = %new_plan,
            end_date = ?record.end_date,
            "Changed subscription plan"
        );

        Ok(PlanChangeResult {
            plan: new_plan,
            end_date: record.end_date,
            proration_estimate_cents,
        })
    }

    /// Approximate prorated delta between the current and the new price
    /// over the remaining fraction of the period, in minor units.
    async fn estimate_proration(
        &self,
        record: &SubscriptionRecord,
        new_price_id: &str,
    ) -> BillingResult<Option<i64>> {
        let (Some(old_price_id), Some(start), Some(end)) = (
            record.provider_price_id.as_deref(),
            record.start_date,
            record.end_date,
        ) else {
            return Ok(None);
        };

        let now = OffsetDateTime::now_utc();
        let period_secs = (end - start).whole_seconds();
        if period_secs <= 0 {
            return Ok(None);
        }
        let remaining_secs = (end - now).whole_seconds().clamp(0, period_secs);
        let fraction = remaining_secs as f64 / period_secs as f64;

        let old_amount = self.gateway.price_amount(old_price_id).await?;
        let new_amount = self.gateway.price_amount(new_price_id).await?;

        Ok(Some(
            ((new_amount - old_amount) as f64 * fraction).round() as i64
        ))
    }

    /// Cancel with the provider unconditionally and record the terminal
    /// local state. Admin/refund path.
    pub async fn cancel_immediately(
        &self,
        user_id: Uuid,
        reason: Option<&str>,
    ) -> BillingResult<SubscriptionRecord> {
        let record = self
            .store
            .get_by_user_id(user_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(user_id.to_string()))?;

        if let Some(sub_id) = &record.provider_subscription_id {
            // cancel_now already treats "already gone" as success
            self.gateway.cancel_now(sub_id).await?;
        }

        let record = self.apply_terminal_cancel(&record, ActorType::Admin, reason).await?;

        tracing::info!(
            user_id = %user_id,
            reason = ?reason,
            "Canceled subscription immediately"
        );

        Ok(record)
    }

    /// The terminal local effect shared by `cancel_immediately`,
    /// refund processing, and `subscription.deleted`.
    async fn apply_terminal_cancel(
        &self,
        record: &SubscriptionRecord,
        actor: ActorType,
        reason: Option<&str>,
    ) -> BillingResult<SubscriptionRecord> {
        let now = OffsetDateTime::now_utc();
        let patch = SubscriptionPatch::new()
            .status(SubscriptionStatus::Canceled)
            .cancelation_type(CancelationType::Immediate)
            .is_active(false)
            .end_date(Some(now));
        let record = self.store.upsert_by_user_id(record.user_id, patch).await?;

        self.sync_entitlement(&record).await;
        self.log_event(
            BillingEventBuilder::new(record.user_id, BillingEventType::SubscriptionCanceled)
                .data(serde_json::json!({ "reason": reason }))
                .actor_type(actor),
        )
        .await;
        self.outbox
            .send_notification(
                NotificationKind::SubscriptionCanceled,
                &record.user_id.to_string(),
                serde_json::json!({ "reason": reason }),
            )
            .await;

        Ok(record)
    }

    /// Refund the last transaction and terminate the subscription.
    /// Manual-payment records are flagged for operator follow-up instead.
    pub async fn request_refund(&self, user_id: Uuid, reason: &str) -> BillingResult<RefundOutcome> {
        let record = self
            .store
            .get_by_user_id(user_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(user_id.to_string()))?;

        if record.payment_method == PaymentMethod::Manual {
            let patch = SubscriptionPatch {
                refund_status: Some(RefundStatus::ManualPending),
                ..Default::default()
            };
            self.store.upsert_by_user_id(user_id, patch).await?;
            self.log_event(
                BillingEventBuilder::new(user_id, BillingEventType::RefundIssued)
                    .subtype("manual_pending")
                    .data(serde_json::json!({ "reason": reason }))
                    .actor_type(ActorType::User),
            )
            .await;

            tracing::info!(user_id = %user_id, "Manual-payment refund flagged for follow-up");
            return Ok(RefundOutcome::ManualPending);
        }

        let transaction_id = record.last_transaction_id.clone().ok_or_else(|| {
            BillingError::RefundFailed("no refundable transaction on record".to_string())
        })?;

        let refund = self.gateway.create_refund(&transaction_id, None).await?;

        let patch = SubscriptionPatch {
            refund_status: Some(RefundStatus::Processed),
            refund_amount_cents: Some(refund.amount_cents),
            refund_date: Some(refund.created.unwrap_or_else(OffsetDateTime::now_utc)),
            ..Default::default()
        };
        self.store.upsert_by_user_id(user_id, patch).await?;

        if let Some(sub_id) = &record.provider_subscription_id {
            self.gateway.cancel_now(sub_id).await?;
        }
        self.apply_terminal_cancel(&record, ActorType::User, Some(reason))
            .await?;

        self.log_event(
            BillingEventBuilder::new(user_id, BillingEventType::RefundIssued)
                .data(serde_json::json!({
                    "reason": reason,
                    "refund_id": refund.id,
                    "amount_cents": refund.amount_cents,
                }))
                .actor_type(ActorType::User),
        )
        .await;
        self.outbox
            .send_notification(
                NotificationKind::RefundProcessed,
                &user_id.to_string(),
                serde_json::json!({ "amount_cents": refund.amount_cents }),
            )
            .await;

        tracing::info!(
            user_id = %user_id,
            amount_cents = refund.amount_cents,
            "Processed refund and terminated subscription"
        );

        Ok(RefundOutcome::Processed {
            amount_cents: refund.amount_cents,
        })
    }

    // ------------------------------------------------------------------
    // Webhook-driven transitions
    // ------------------------------------------------------------------

    /// Establish the active state from a completed checkout.
    pub async fn complete_checkout(
        &self,
        user_id: Uuid,
        plan: Plan,
        correlation: CheckoutCorrelation,
    ) -> BillingResult<SubscriptionRecord> {
        if !plan.is_paid() {
            return Err(BillingError::InvalidPlan(plan.to_string()));
        }

        let now = OffsetDateTime::now_utc();
        let end_date = self.local_period_end(plan, Some(now), now);

        let mut patch = SubscriptionPatch::new()
            .plan(plan)
            .status(SubscriptionStatus::Active)
            .is_active(true)
            .cancelation_type(CancelationType::None)
            .start_date(now)
            .end_date(end_date)
            .payment_method(PaymentMethod::Provider);
        patch.provider_customer_id = correlation.customer_id.clone();
        patch.provider_subscription_id = correlation.subscription_id.clone();
        patch.provider_price_id = correlation.price_id.clone();

        let record = self.store.upsert_by_user_id(user_id, patch).await?;

        self.sync_entitlement(&record).await;
        self.log_event(
            BillingEventBuilder::new(user_id, BillingEventType::CheckoutCompleted)
                .data(serde_json::json!({ "plan": plan }))
                .actor_type(ActorType::Provider),
        )
        .await;
        self.outbox
            .record_usage(serde_json::json!({
                "event": "checkout_completed",
                "user_id": user_id,
                "plan": plan,
            }))
            .await;
        self.outbox
            .send_notification(
                NotificationKind::SubscriptionStarted,
                &user_id.to_string(),
                serde_json::json!({ "plan": plan }),
            )
            .await;

        tracing::info!(user_id = %user_id, plan = %plan, "Checkout completed");

        Ok(record)
    }

    /// A late cancellation-shaped event about a subscription the local
    /// record no longer points at must not clobber a fresher active
    /// state. Provider events win only for the object they describe.
    fn is_stale_cancellation(
        local: &SubscriptionRecord,
        event_subscription_id: &str,
        mirrors_cancellation: bool,
    ) -> bool {
        mirrors_cancellation
            && local.status == SubscriptionStatus::Active
            && local
                .provider_subscription_id
                .as_deref()
                .map(|current| current != event_subscription_id)
                .unwrap_or(false)
    }

    /// Mirror a provider `subscription.updated` event into local state.
    pub async fn apply_subscription_updated(
        &self,
        psub: &ProviderSubscription,
    ) -> BillingResult<WebhookDisposition> {
        let Some(local) = self
            .store
            .get_by_provider_customer_id(&psub.customer_id)
            .await?
        else {
            tracing::warn!(
                customer_id = %psub.customer_id,
                subscription_id = %psub.id,
                "subscription.updated for unknown provider customer; dropping"
            );
            return Ok(WebhookDisposition::NoOp("unknown provider customer".to_string()));
        };

        let Some(mapped) = SubscriptionStatus::from_str(&psub.status) else {
            tracing::warn!(
                customer_id = %psub.customer_id,
                provider_status = %psub.status,
                "Unrecognized provider subscription status; dropping"
            );
            return Ok(WebhookDisposition::NoOp("unrecognized provider status".to_string()));
        };

        let mirrors_cancellation =
            mapped == SubscriptionStatus::Canceled || psub.cancel_at_period_end;
        if Self::is_stale_cancellation(&local, &psub.id, mirrors_cancellation) {
            tracing::warn!(
                user_id = %local.user_id,
                event_subscription_id = %psub.id,
                current_subscription_id = ?local.provider_subscription_id,
                "Dropping stale cancellation for superseded subscription"
            );
            return Ok(WebhookDisposition::NoOp("stale cancellation".to_string()));
        }

        let plan = psub
            .price_id
            .as_deref()
            .and_then(|price| self.catalog.plan_for_price_id(price));
        if plan.is_none() {
            tracing::debug!(
                user_id = %local.user_id,
                price_id = ?psub.price_id,
                "Provider price not in catalog; keeping local plan"
            );
        }
        let effective_plan = plan.unwrap_or(local.plan);

        let now = OffsetDateTime::now_utc();
        let end_date = psub.current_period_end.or_else(|| {
            self.local_period_end(effective_plan, psub.current_period_start.or(local.start_date), now)
        });

        let mut patch = SubscriptionPatch::new()
            .provider_subscription_id(&psub.id)
            .provider_customer_id(&psub.customer_id)
            .end_date(end_date);
        patch.plan = plan;
        patch.provider_price_id = psub.price_id.clone();
        patch.start_date = psub.current_period_start;

        if psub.cancel_at_period_end {
            // Scheduled for cancellation: access retained until period end
            patch = patch
                .status(SubscriptionStatus::Canceled)
                .cancelation_type(CancelationType::EndOfPeriod)
                .is_active(true);
        } else if mapped == SubscriptionStatus::Active && local.is_pending_cancellation() {
            // Flag cleared upstream: reactivation
            patch = patch
                .status(SubscriptionStatus::Active)
                .cancelation_type(CancelationType::None)
                .is_active(true);
        } else {
            let retains_access = matches!(
                mapped,
                SubscriptionStatus::Active | SubscriptionStatus::Trialing
            );
            let cancelation = if mapped == SubscriptionStatus::Canceled {
                CancelationType::Immediate
            } else {
                CancelationType::None
            };
            patch = patch
                .status(mapped)
                .cancelation_type(cancelation)
                .is_active(retains_access);
        }

        let record = self.store.upsert_by_user_id(local.user_id, patch).await?;

        self.sync_entitlement(&record).await;
        self.log_event(
            BillingEventBuilder::new(record.user_id, BillingEventType::SubscriptionUpdated)
                .data(serde_json::json!({
                    "status": record.status,
                    "cancel_at_period_end": psub.cancel_at_period_end,
                }))
                .provider_subscription(&psub.id)
                .provider_customer(&psub.customer_id)
                .actor_type(ActorType::Provider),
        )
        .await;

        tracing::info!(
            user_id = %record.user_id,
            status = %record.status,
            is_active = record.is_active,
            "Mirrored provider subscription update"
        );

        Ok(WebhookDisposition::Applied)
    }

    /// Terminal local effect of a provider `subscription.deleted` event.
    pub async fn apply_subscription_deleted(
        &self,
        customer_id: &str,
        subscription_id: &str,
    ) -> BillingResult<WebhookDisposition> {
        let Some(local) = self.store.get_by_provider_customer_id(customer_id).await? else {
            tracing::warn!(
                customer_id = %customer_id,
                subscription_id = %subscription_id,
                "subscription.deleted for unknown provider customer; dropping"
            );
            return Ok(WebhookDisposition::NoOp("unknown provider customer".to_string()));
        };

        if Self::is_stale_cancellation(&local, subscription_id, true) {
            tracing::warn!(
                user_id = %local.user_id,
                event_subscription_id = %subscription_id,
                current_subscription_id = ?local.provider_subscription_id,
                "Dropping stale deletion for superseded subscription"
            );
            return Ok(WebhookDisposition::NoOp("stale deletion".to_string()));
        }

        self.apply_terminal_cancel(&local, ActorType::Provider, Some("provider deletion"))
            .await?;

        tracing::info!(
            user_id = %local.user_id,
            subscription_id = %subscription_id,
            "Subscription deleted at provider; local state terminal"
        );

        Ok(WebhookDisposition::Applied)
    }

    /// Record a successful payment. Audit trail only, no status change.
    pub async fn record_invoice_paid(
        &self,
        payment: &InvoicePayment,
    ) -> BillingResult<WebhookDisposition> {
        let Some(customer_id) = payment.customer_id.as_deref() else {
            tracing::warn!("invoice.paid without customer reference; dropping");
            return Ok(WebhookDisposition::NoOp("no customer reference".to_string()));
        };
        let Some(local) = self.store.get_by_provider_customer_id(customer_id).await? else {
            tracing::warn!(
                customer_id = %customer_id,
                "invoice.paid for unknown provider customer; dropping"
            );
            return Ok(WebhookDisposition::NoOp("unknown provider customer".to_string()));
        };

        let paid_at = payment.occurred_at.unwrap_or_else(OffsetDateTime::now_utc);
        let mut patch = SubscriptionPatch {
            last_payment_date: Some(paid_at),
            payment_status: Some(PaymentStatus::Success),
            ..Default::default()
        };
        patch.last_transaction_id = payment.transaction_id.clone();

        let record = self.store.upsert_by_user_id(local.user_id, patch).await?;

        self.log_event(
            BillingEventBuilder::new(record.user_id, BillingEventType::InvoicePaid)
                .data(serde_json::json!({
                    "amount_cents": payment.amount_cents,
                    "billing_reason": payment.billing_reason,
                }))
                .provider_customer(customer_id)
                .actor_type(ActorType::Provider),
        )
        .await;

        // A billing-cycle invoice marks a renewal
        if payment.billing_reason.as_deref() == Some("subscription_cycle") {
            self.outbox
                .record_usage(serde_json::json!({
                    "event": "subscription_renewed",
                    "user_id": record.user_id,
                    "amount_cents": payment.amount_cents,
                }))
                .await;
            self.outbox
                .send_notification(
                    NotificationKind::RenewalNotice,
                    &record.user_id.to_string(),
                    serde_json::json!({ "amount_cents": payment.amount_cents }),
                )
                .await;
        }

        tracing::info!(
            user_id = %record.user_id,
            amount_cents = payment.amount_cents,
            billing_reason = ?payment.billing_reason,
            "Recorded invoice payment"
        );

        Ok(WebhookDisposition::Applied)
    }

    /// Record a failed payment attempt. Audit trail only; cancellation
    /// on repeated failure is provider policy, mirrored later through
    /// `subscription.updated` / `subscription.deleted`.
    pub async fn record_invoice_failed(
        &self,
        payment: &InvoicePayment,
    ) -> BillingResult<WebhookDisposition> {
        let Some(customer_id) = payment.customer_id.as_deref() else {
            tracing::warn!("invoice.payment_failed without customer reference; dropping");
            return Ok(WebhookDisposition::NoOp("no customer reference".to_string()));
        };
        let Some(local) = self.store.get_by_provider_customer_id(customer_id).await? else {
            tracing::warn!(
                customer_id = %customer_id,
                "invoice.payment_failed for unknown provider customer; dropping"
            );
            return Ok(WebhookDisposition::NoOp("unknown provider customer".to_string()));
        };

        let reason = payment
            .failure_message
            .clone()
            .unwrap_or_else(|| "payment attempt failed".to_string());

        let patch = SubscriptionPatch {
            payment_status: Some(PaymentStatus::Failed),
            last_failure_reason: Some(reason.clone()),
            ..Default::default()
        };
        let record = self.store.upsert_by_user_id(local.user_id, patch).await?;

        self.log_event(
            BillingEventBuilder::new(record.user_id, BillingEventType::InvoiceFailed)
                .data(serde_json::json!({
                    "amount_cents": payment.amount_cents,
                    "reason": reason,
                }))
                .provider_customer(customer_id)
                .actor_type(ActorType::Provider),
        )
        .await;
        self.outbox
            .send_notification(
                NotificationKind::PaymentFailed,
                &record.user_id.to_string(),
                serde_json::json!({ "amount_cents": payment.amount_cents }),
            )
            .await;

        tracing::warn!(
            user_id = %record.user_id,
            amount_cents = payment.amount_cents,
            reason = %reason,
            "Recorded failed invoice payment"
        );

        Ok(WebhookDisposition::Applied)
    }
}
