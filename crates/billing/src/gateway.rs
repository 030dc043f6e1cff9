//! Provider gateway
//!
//! Thin interface to the external payment provider. Every call is bounded
//! by a short timeout so a stalled provider cannot stall the ingress path;
//! a timeout is a failure, never a success, and local state is only
//! written after the remote call confirms.

use std::time::Duration;

use async_trait::async_trait;
use stripe::{
    CancelSubscription, CheckoutSession, CheckoutSessionMode, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateRefund, CustomerId, PaymentIntentId, Price, PriceId,
    Refund, Subscription, SubscriptionId, UpdateSubscription, UpdateSubscriptionItems,
};
use time::OffsetDateTime;
use uuid::Uuid;

use billsync_shared::Plan;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Bounded suspension point for all provider calls.
const PROVIDER_CALL_TIMEOUT: Duration = Duration::from_secs(8);

/// Normalized snapshot of the provider's subscription object.
#[derive(Debug, Clone)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer_id: String,
    pub price_id: Option<String>,
    /// Provider-side status string (`active`, `trialing`, `past_due`, ...)
    pub status: String,
    pub cancel_at_period_end: bool,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
}

/// Strip provider timestamps that do not decode to a real instant.
pub(crate) fn parse_provider_ts(ts: i64) -> Option<OffsetDateTime> {
    if ts <= 0 {
        return None;
    }
    OffsetDateTime::from_unix_timestamp(ts).ok()
}

impl ProviderSubscription {
    pub fn from_stripe(sub: &Subscription) -> Self {
        Self {
            id: sub.id.to_string(),
            customer_id: sub.customer.id().to_string(),
            price_id: sub
                .items
                .data
                .first()
                .and_then(|item| item.price.as_ref())
                .map(|p| p.id.to_string()),
            status: sub.status.to_string(),
            cancel_at_period_end: sub.cancel_at_period_end,
            current_period_start: parse_provider_ts(sub.current_period_start),
            current_period_end: parse_provider_ts(sub.current_period_end),
            trial_end: sub.trial_end.and_then(parse_provider_ts),
        }
    }
}

/// Checkout session handed back to the caller for redirect.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckoutSessionInfo {
    pub session_id: String,
    pub url: Option<String>,
}

/// A processed provider refund.
#[derive(Debug, Clone)]
pub struct RefundInfo {
    pub id: String,
    pub amount_cents: i64,
    pub created: Option<OffsetDateTime>,
}

/// The narrow provider contract consumed by the reconciliation engine.
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    async fn create_checkout_session(
        &self,
        user_id: Uuid,
        plan: Plan,
    ) -> BillingResult<CheckoutSessionInfo>;

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription>;

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<ProviderSubscription>;

    /// Swap the priced item with proration.
    async fn change_price(
        &self,
        subscription_id: &str,
        new_price_id: &str,
    ) -> BillingResult<ProviderSubscription>;

    /// Cancel immediately. `Ok(None)` when the subscription is already
    /// gone at the provider; callers on cancellation paths treat that as
    /// success.
    async fn cancel_now(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<ProviderSubscription>>;

    async fn create_refund(
        &self,
        payment_intent_id: &str,
        amount_cents: Option<i64>,
    ) -> BillingResult<RefundInfo>;

    /// Unit amount in the provider's minor unit for a price.
    async fn price_amount(&self, price_id: &str) -> BillingResult<i64>;
}

/// Stripe-backed gateway.
pub struct StripeGateway {
    stripe: StripeClient,
}

impl StripeGateway {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    async fn bounded<T, F>(&self, fut: F) -> BillingResult<T>
    where
        F: std::future::Future<Output = Result<T, stripe::StripeError>>,
    {
        match tokio::time::timeout(PROVIDER_CALL_TIMEOUT, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(BillingError::ProviderUnavailable(
                "provider call timed out".to_string(),
            )),
        }
    }

    fn parse_subscription_id(&self, id: &str) -> BillingResult<SubscriptionId> {
        id.parse::<SubscriptionId>()
            .map_err(|e| BillingError::Provider(format!("Invalid subscription ID: {}", e)))
    }
}

#[async_trait]
impl ProviderGateway for StripeGateway {
    async fn create_checkout_session(
        &self,
        user_id: Uuid,
        plan: Plan,
    ) -> BillingResult<CheckoutSessionInfo> {
        let price_id = self
            .stripe
            .config()
            .price_ids
            .price_id_for_plan(plan)
            .ok_or_else(|| BillingError::InvalidPlan(plan.to_string()))?
            .to_string();

        let base_url = &self.stripe.config().app_base_url;
        let success_url = format!(
            "{}/billing/success?session_id={{CHECKOUT_SESSION_ID}}",
            base_url
        );
        let cancel_url = format!("{}/billing/cancel", base_url);

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("plan".to_string(), plan.to_string());

        let params = CreateCheckoutSession {
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(vec![CreateCheckoutSessionLineItems {
                price: Some(price_id),
                quantity: Some(1),
                ..Default::default()
            }]),
            success_url: Some(&success_url),
            cancel_url: Some(&cancel_url),
            metadata: Some(metadata),
            allow_promotion_codes: Some(true),
            billing_address_collection: Some(stripe::CheckoutSessionBillingAddressCollection::Auto),
            ..Default::default()
        };

        let session = self
            .bounded(CheckoutSession::create(self.stripe.inner(), params))
            .await?;

        tracing::info!(
            user_id = %user_id,
            session_id = %session.id,
            plan = %plan,
            "Created checkout session"
        );

        Ok(CheckoutSessionInfo {
            session_id: session.id.to_string(),
            url: session.url,
        })
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = self.parse_subscription_id(subscription_id)?;
        let sub = self
            .bounded(Subscription::retrieve(self.stripe.inner(), &sub_id, &[]))
            .await?;
        Ok(ProviderSubscription::from_stripe(&sub))
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = self.parse_subscription_id(subscription_id)?;
        let params = UpdateSubscription {
            cancel_at_period_end: Some(cancel),
            ..Default::default()
        };
        let sub = self
            .bounded(Subscription::update(self.stripe.inner(), &sub_id, params))
            .await?;

        tracing::info!(
            subscription_id = %subscription_id,
            cancel_at_period_end = cancel,
            "Updated cancellation schedule at provider"
        );

        Ok(ProviderSubscription::from_stripe(&sub))
    }

    async fn change_price(
        &self,
        subscription_id: &str,
        new_price_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = self.parse_subscription_id(subscription_id)?;

        // The priced item id is needed for the swap
        let current = self
            .bounded(Subscription::retrieve(self.stripe.inner(), &sub_id, &[]))
            .await?;
        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| {
                BillingError::Provider(format!(
                    "Subscription {} has no priced items",
                    subscription_id
                ))
            })?;

        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                price: Some(new_price_id.to_string()),
                ..Default::default()
            }]),
            proration_behavior: Some(
                stripe::generated::billing::subscription::SubscriptionProrationBehavior::CreateProrations,
            ),
            ..Default::default()
        };
        let sub = self
            .bounded(Subscription::update(self.stripe.inner(), &sub_id, params))
            .await?;

        tracing::info!(
            subscription_id = %subscription_id,
            new_price_id = %new_price_id,
            "Swapped subscription price with proration"
        );

        Ok(ProviderSubscription::from_stripe(&sub))
    }

    async fn cancel_now(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<ProviderSubscription>> {
        let sub_id = self.parse_subscription_id(subscription_id)?;
        let params = CancelSubscription {
            cancellation_details: None,
            invoice_now: None,
            prorate: None,
        };

        match self
            .bounded(Subscription::cancel(self.stripe.inner(), &sub_id, params))
            .await
        {
            Ok(sub) => Ok(Some(ProviderSubscription::from_stripe(&sub))),
            Err(BillingError::ProviderGone(_)) => {
                tracing::info!(
                    subscription_id = %subscription_id,
                    "Subscription already gone at provider; treating cancel as success"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn create_refund(
        &self,
        payment_intent_id: &str,
        amount_cents: Option<i64>,
    ) -> BillingResult<RefundInfo> {
        let intent_id = payment_intent_id
            .parse::<PaymentIntentId>()
            .map_err(|e| BillingError::Provider(format!("Invalid payment intent ID: {}", e)))?;

        let params = CreateRefund {
            payment_intent: Some(intent_id),
            amount: amount_cents,
            ..Default::default()
        };
        let refund = self
            .bounded(Refund::create(self.stripe.inner(), params))
            .await?;

        tracing::info!(
            refund_id = %refund.id,
            payment_intent_id = %payment_intent_id,
            amount_cents = refund.amount,
            "Created provider refund"
        );

        Ok(RefundInfo {
            id: refund.id.to_string(),
            amount_cents: refund.amount,
            created: parse_provider_ts(refund.created),
        })
    }

    async fn price_amount(&self, price_id: &str) -> BillingResult<i64> {
        let price_id = price_id
            .parse::<PriceId>()
            .map_err(|e| BillingError::Provider(format!("Invalid price ID: {}", e)))?;
        let price = self
            .bounded(Price::retrieve(self.stripe.inner(), &price_id, &[]))
            .await?;
        price
            .unit_amount
            .ok_or_else(|| BillingError::Provider(format!("Price {} has no unit amount", price_id)))
    }
}
