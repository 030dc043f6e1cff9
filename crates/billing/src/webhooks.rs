//! Provider webhook ingress
//!
//! Authenticates inbound events against the raw, unparsed body, converts
//! them into the typed `WebhookEvent` union at the boundary, deduplicates
//! by provider event id, and dispatches to the reconciliation engine.
//!
//! Delivery is at-least-once and may be out of order; every dispatched
//! transition is idempotent under re-delivery. Processing failures are
//! logged with the full payload for manual replay and the ingress still
//! reports acknowledgment; returning errors to the provider only buys
//! an unbounded redelivery storm.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use stripe::{Event, EventObject, EventType};
use time::OffsetDateTime;
use uuid::Uuid;

use billsync_shared::Plan;

use crate::engine::{CheckoutCorrelation, InvoicePayment, ReconciliationEngine};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{parse_provider_ts, ProviderSubscription};
use crate::store::SubscriptionStore;

type HmacSha256 = Hmac<Sha256>;

/// Signature timestamp tolerance (replay window).
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Verifies webhook authenticity against the raw body.
///
/// The insecure variant exists for local development and simulation only;
/// constructing it in a production configuration is a configuration
/// error, so it cannot be reached there.
pub struct WebhookVerifier {
    secret: Option<String>,
}

impl WebhookVerifier {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            secret: Some(webhook_secret.into()),
        }
    }

    /// Development-only verifier that skips signature verification.
    pub fn insecure(app_env: &str) -> BillingResult<Self> {
        if app_env == "production" {
            return Err(BillingError::Config(
                "insecure webhook verifier is not available in production".to_string(),
            ));
        }
        tracing::warn!("Webhook signature verification is DISABLED (development mode)");
        Ok(Self { secret: None })
    }

    /// Verify the signature header over the raw payload.
    ///
    /// The header has the form `t=timestamp,v1=signature`; the signed
    /// message is `"{t}.{raw_payload}"`. A re-serialized body would not
    /// reproduce the provider's exact bytes, so verification against the
    /// raw body is the only acceptable input.
    pub fn verify(&self, payload: &str, signature: &str) -> BillingResult<()> {
        let Some(secret) = &self.secret else {
            return Ok(());
        };

        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<String> = None;

        for part in signature.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1].to_string()),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::error!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        let v1_signature = v1_signature.ok_or_else(|| {
            tracing::error!("Missing v1 signature in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::error!(
                timestamp = timestamp,
                now = now,
                diff = (now - timestamp).abs(),
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let signed_payload = format!("{}.{}", timestamp, payload);

        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).map_err(|_| {
            tracing::error!("Invalid webhook secret key");
            BillingError::WebhookSignatureInvalid
        })?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            tracing::error!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        Ok(())
    }
}

/// The recognized provider events, parsed and validated at the ingress
/// boundary. Everything else is acknowledged and ignored.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    CheckoutCompleted {
        user_id: Uuid,
        plan: Plan,
        correlation: CheckoutCorrelation,
    },
    SubscriptionUpdated(ProviderSubscription),
    SubscriptionDeleted {
        customer_id: String,
        subscription_id: String,
    },
    InvoicePaid(InvoicePayment),
    InvoicePaymentFailed(InvoicePayment),
    Ignored {
        event_type: String,
    },
}

fn invoice_payment(invoice: &stripe::Invoice, occurred_at: Option<OffsetDateTime>) -> InvoicePayment {
    InvoicePayment {
        customer_id: invoice.customer.as_ref().map(|c| c.id().to_string()),
        invoice_id: Some(invoice.id.to_string()),
        transaction_id: invoice.payment_intent.as_ref().map(|pi| pi.id().to_string()),
        amount_cents: invoice.amount_paid.or(invoice.amount_due).unwrap_or(0),
        // Snake-case reason string, e.g. "subscription_cycle"
        billing_reason: invoice.billing_reason.as_ref().map(|r| r.to_string()),
        failure_message: invoice.attempt_count.map(|attempts| {
            format!("payment attempt {} failed", attempts)
        }),
        occurred_at,
    }
}

impl WebhookEvent {
    /// Convert a parsed provider event. Missing correlation (no user id
    /// in checkout metadata, unexpected object shapes) yields `Ignored`
    /// with a log line, never an error into the acknowledgment path.
    pub fn from_provider_event(event: &Event) -> Self {
        let event_type = event.type_.to_string();
        let occurred_at = parse_provider_ts(event.created);

        match (&event.type_, &event.data.object) {
            (EventType::CheckoutSessionCompleted, EventObject::CheckoutSession(session)) => {
                let metadata = session.metadata.clone().unwrap_or_default();

                let Some(user_id) = metadata.get("user_id").and_then(|s| Uuid::parse_str(s).ok())
                else {
                    tracing::warn!(
                        event_id = %event.id,
                        "checkout.session.completed without usable user_id metadata; ignoring"
                    );
                    return Self::Ignored { event_type };
                };
                let Some(plan) = metadata.get("plan").and_then(|s| Plan::from_str(s)) else {
                    tracing::warn!(
                        event_id = %event.id,
                        user_id = %user_id,
                        "checkout.session.completed without usable plan metadata; ignoring"
                    );
                    return Self::Ignored { event_type };
                };

                Self::CheckoutCompleted {
                    user_id,
                    plan,
                    correlation: CheckoutCorrelation {
                        customer_id: session.customer.as_ref().map(|c| c.id().to_string()),
                        subscription_id: session
                            .subscription
                            .as_ref()
                            .map(|s| s.id().to_string()),
                        price_id: None,
                    },
                }
            }
            (EventType::CustomerSubscriptionUpdated, EventObject::Subscription(sub)) => {
                Self::SubscriptionUpdated(ProviderSubscription::from_stripe(sub))
            }
            (EventType::CustomerSubscriptionDeleted, EventObject::Subscription(sub)) => {
                Self::SubscriptionDeleted {
                    customer_id: sub.customer.id().to_string(),
                    subscription_id: sub.id.to_string(),
                }
            }
            (EventType::InvoicePaid, EventObject::Invoice(invoice)) => {
                Self::InvoicePaid(invoice_payment(invoice, occurred_at))
            }
            (EventType::InvoicePaymentFailed, EventObject::Invoice(invoice)) => {
                Self::InvoicePaymentFailed(invoice_payment(invoice, occurred_at))
            }
            _ => Self::Ignored { event_type },
        }
    }
}

/// Webhook handler: verify, dedup, dispatch.
pub struct WebhookHandler {
    verifier: WebhookVerifier,
    store: Arc<dyn SubscriptionStore>,
    engine: Arc<ReconciliationEngine>,
}

impl WebhookHandler {
    pub fn new(
        verifier: WebhookVerifier,
        store: Arc<dyn SubscriptionStore>,
        engine: Arc<ReconciliationEngine>,
    ) -> Self {
        Self {
            verifier,
            store,
            engine,
        }
    }

    /// Handle a raw webhook delivery.
    ///
    /// Only authentication failures propagate (the HTTP layer rejects
    /// those); everything past verification is acknowledged, with
    /// failures logged in enough detail to replay manually.
    pub async fn handle(&self, payload: &str, signature: &str) -> BillingResult<()> {
        self.verifier.verify(payload, signature)?;

        let event: Event = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(
                    error = %err,
                    payload = %payload,
                    "Failed to parse verified webhook payload; acknowledging"
                );
                return Ok(());
            }
        };

        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();
        let event_timestamp =
            parse_provider_ts(event.created).unwrap_or_else(OffsetDateTime::now_utc);

        match self
            .store
            .claim_webhook_event(&event_id, &event_type, event_timestamp)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(
                    event_id = %event_id,
                    event_type = %event_type,
                    "Duplicate webhook event; already claimed"
                );
                return Ok(());
            }
            Err(err) => {
                // Dedup unavailable. The transitions are idempotent, so
                // processing anyway is safe; losing the event is not.
                tracing::error!(
                    event_id = %event_id,
                    error = %err,
                    "Failed to claim webhook event; processing without dedup"
                );
            }
        }

        let result = self.dispatch(&event).await;

        let failure = result.as_ref().err().map(|e| e.to_string());
        let outcome = match &failure {
            None => Ok(()),
            Some(msg) => Err(msg.as_str()),
        };
        if let Err(err) = self.store.finish_webhook_event(&event_id, outcome).await {
            tracing::error!(
                event_id = %event_id,
                error = %err,
                "Failed to record webhook processing outcome"
            );
        }

        if let Err(err) = result {
            tracing::error!(
                event_id = %event_id,
                event_type = %event_type,
                error = %err,
                payload = %payload,
                "Webhook processing failed; acknowledged for manual replay"
            );
        }

        Ok(())
    }

    async fn dispatch(&self, event: &Event) -> BillingResult<()> {
        match WebhookEvent::from_provider_event(event) {
            WebhookEvent::CheckoutCompleted {
                user_id,
                plan,
                correlation,
            } => {
                self.engine
                    .complete_checkout(user_id, plan, correlation)
                    .await?;
            }
            WebhookEvent::SubscriptionUpdated(psub) => {
                self.engine.apply_subscription_updated(&psub).await?;
            }
            WebhookEvent::SubscriptionDeleted {
                customer_id,
                subscription_id,
            } => {
                self.engine
                    .apply_subscription_deleted(&customer_id, &subscription_id)
                    .await?;
            }
            WebhookEvent::InvoicePaid(payment) => {
                self.engine.record_invoice_paid(&payment).await?;
            }
            WebhookEvent::InvoicePaymentFailed(payment) => {
                self.engine.record_invoice_failed(&payment).await?;
            }
            WebhookEvent::Ignored { event_type } => {
                tracing::info!(
                    event_type = %event_type,
                    event_id = %event.id,
                    "Acknowledged unhandled provider event type"
                );
            }
        }
        Ok(())
    }
}
