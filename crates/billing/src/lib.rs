// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Some provider operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Billsync Billing Module
//!
//! Subscription reconciliation: keeps the local subscription record and
//! the payment provider's subscription object consistent under concurrent
//! commands, partial failures, and at-least-once webhook delivery.
//!
//! ## Features
//!
//! - **Commands**: checkout, cancel at period end, reactivate, change
//!   plan with proration, immediate cancel, refunds
//! - **Webhook ingress**: raw-body signature verification, typed event
//!   union, atomic dedup, idempotent transitions
//! - **Outbox**: best-effort side-effects (usage metrics, notifications)
//!   retried on a fixed sweep, capped queue
//! - **Entitlements**: role changes derived from the post-transition
//!   record, applied in exactly one place

pub mod client;
pub mod engine;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod gateway;
pub mod notify;
pub mod outbox;
pub mod store;
pub mod usage;
pub mod webhooks;

#[cfg(test)]
pub mod mocks;


// Client
pub use client::{PlanCatalog, StripeClient, StripeConfig};

// Engine
pub use engine::{
    add_calendar_months, CancellationSchedule, CheckoutCorrelation, InvoicePayment,
    PlanChangeResult, ReconciliationEngine, RefundOutcome, WebhookDisposition,
};

// Entitlement
pub use entitlement::{EntitlementNotifier, PgEntitlementNotifier};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    ActorType, BillingEvent, BillingEventBuilder, BillingEventType, EventSink, PgEventSink,
};

// Gateway
pub use gateway::{
    CheckoutSessionInfo, ProviderGateway, ProviderSubscription, RefundInfo, StripeGateway,
};

// Notifications
pub use notify::{
    NoopNotificationSender, NotificationKind, NotificationSender, ResendNotificationSender,
};

// Outbox
pub use outbox::{
    OutboxEntry, OutboxKind, OutboxService, OutboxStore, PgOutboxStore, SweepStats, OUTBOX_CAP,
};

// Store
pub use store::{PgSubscriptionStore, SubscriptionPatch, SubscriptionStore};

// Usage
pub use usage::{PgUsageRecorder, UsageRecorder};

// Webhooks
pub use webhooks::{WebhookEvent, WebhookHandler, WebhookVerifier};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that wires the engine to its collaborators.
/// All dependencies are constructed explicitly here; nothing reads
/// global state past this point.
pub struct BillingService {
    pub engine: Arc<ReconciliationEngine>,
    pub webhooks: WebhookHandler,
    pub outbox: Arc<OutboxService>,
    pub store: Arc<dyn SubscriptionStore>,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::new(stripe, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let config = stripe.config().clone();

        let store: Arc<dyn SubscriptionStore> = Arc::new(PgSubscriptionStore::new(pool.clone()));
        let usage: Arc<dyn UsageRecorder> = Arc::new(PgUsageRecorder::new(pool.clone()));
        let notifications: Arc<dyn NotificationSender> =
            match ResendNotificationSender::from_env(pool.clone()) {
                Some(sender) => Arc::new(sender),
                None => {
                    tracing::warn!("RESEND_API_KEY not set; billing notifications are disabled");
                    Arc::new(NoopNotificationSender)
                }
            };
        let outbox_store: Arc<dyn OutboxStore> = Arc::new(PgOutboxStore::new(pool.clone()));
        let outbox = Arc::new(OutboxService::new(outbox_store, usage, notifications));

        let entitlements: Arc<dyn EntitlementNotifier> =
            Arc::new(PgEntitlementNotifier::new(pool.clone()));
        let events: Arc<dyn EventSink> = Arc::new(PgEventSink::new(pool.clone()));
        let gateway: Arc<dyn ProviderGateway> = Arc::new(StripeGateway::new(stripe));

        let engine = Arc::new(ReconciliationEngine::new(
            store.clone(),
            gateway,
            entitlements,
            outbox.clone(),
            events,
            config.price_ids.clone(),
        ));

        let verifier = WebhookVerifier::new(config.webhook_secret.clone());
        let webhooks = WebhookHandler::new(verifier, store.clone(), engine.clone());

        Self {
            engine,
            webhooks,
            outbox,
            store,
        }
    }
}
