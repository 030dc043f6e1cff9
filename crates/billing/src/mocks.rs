//! In-memory mock implementations for the engine's collaborator traits.
//!
//! Test-only. The store mock applies the same field-merge semantics as
//! the SQL upsert so lifecycle tests exercise the real merge behavior.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use billsync_shared::{Role, SubscriptionRecord};

use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventType, EventSink};
use crate::gateway::{
    CheckoutSessionInfo, ProviderGateway, ProviderSubscription, RefundInfo,
};
use crate::notify::{NotificationKind, NotificationSender};
use crate::outbox::{OutboxEntry, OutboxStore, OUTBOX_CAP};
use crate::store::{SubscriptionPatch, SubscriptionStore};
use crate::usage::UsageRecorder;

#[derive(Default)]
pub struct InMemorySubscriptionStore {
    records: Mutex<HashMap<Uuid, SubscriptionRecord>>,
    claims: Mutex<HashMap<String, Option<String>>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: SubscriptionRecord) -> Self {
        let store = Self::default();
        store
            .records
            .lock()
            .unwrap()
            .insert(record.user_id, record);
        store
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn get_by_user_id(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self.records.lock().unwrap().get(&user_id).cloned())
    }

    async fn get_by_provider_customer_id(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .find(|r| r.provider_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn upsert_by_user_id(
        &self,
        user_id: Uuid,
        patch: SubscriptionPatch,
    ) -> BillingResult<SubscriptionRecord> {
        let mut records = self.records.lock().unwrap();
        let now = OffsetDateTime::now_utc();
        let record = match records.get_mut(&user_id) {
            Some(existing) => {
                let patch = patch.sanitized(existing.start_date);
                patch.apply_to(existing, now);
                existing.clone()
            }
            None => {
                let record = patch.sanitized(None).into_new_record(user_id, now);
                records.insert(user_id, record.clone());
                record
            }
        };
        Ok(record)
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        _event_type: &str,
        _event_timestamp: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut claims = self.claims.lock().unwrap();
        if claims.contains_key(event_id) {
            return Ok(false);
        }
        claims.insert(event_id.to_string(), None);
        Ok(true)
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        outcome: Result<(), &str>,
    ) -> BillingResult<()> {
        self.claims
            .lock()
            .unwrap()
            .insert(event_id.to_string(), outcome.err().map(str::to_string));
        Ok(())
    }
}

pub struct MockProviderGateway {
    pub subscriptions: Mutex<HashMap<String, ProviderSubscription>>,
    pub price_amounts: Mutex<HashMap<String, i64>>,
    pub cancel_schedule_calls: Mutex<Vec<(String, bool)>>,
    pub cancel_now_calls: Mutex<Vec<String>>,
    pub refund_calls: Mutex<Vec<(String, Option<i64>)>>,
    pub refund_amount_cents: i64,
    fail_next: Mutex<Option<BillingError>>,
}

impl Default for MockProviderGateway {
    fn default() -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            price_amounts: Mutex::new(HashMap::new()),
            cancel_schedule_calls: Mutex::new(Vec::new()),
            cancel_now_calls: Mutex::new(Vec::new()),
            refund_calls: Mutex::new(Vec::new()),
            refund_amount_cents: 2900,
            fail_next: Mutex::new(None),
        }
    }
}

impl MockProviderGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscription(self, psub: ProviderSubscription) -> Self {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(psub.id.clone(), psub);
        self
    }

    pub fn with_price(self, price_id: &str, amount_cents: i64) -> Self {
        self.price_amounts
            .lock()
            .unwrap()
            .insert(price_id.to_string(), amount_cents);
        self
    }

    /// Make the next gateway call fail with the given error.
    pub fn fail_next_with(&self, err: BillingError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    fn take_failure(&self) -> Option<BillingError> {
        self.fail_next.lock().unwrap().take()
    }
}

#[async_trait]
impl ProviderGateway for MockProviderGateway {
    async fn create_checkout_session(
        &self,
        user_id: Uuid,
        _plan: billsync_shared::Plan,
    ) -> BillingResult<CheckoutSessionInfo> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok(CheckoutSessionInfo {
            session_id: format!("cs_test_{user_id}"),
            url: Some("https://checkout.example/session".to_string()),
        })
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.subscriptions
            .lock()
            .unwrap()
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| BillingError::ProviderGone(subscription_id.to_string()))
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<ProviderSubscription> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.cancel_schedule_calls
            .lock()
            .unwrap()
            .push((subscription_id.to_string(), cancel));
        let mut subs = self.subscriptions.lock().unwrap();
        let psub = subs
            .get_mut(subscription_id)
            .ok_or_else(|| BillingError::ProviderGone(subscription_id.to_string()))?;
        psub.cancel_at_period_end = cancel;
        Ok(psub.clone())
    }

    async fn change_price(
        &self,
        subscription_id: &str,
        new_price_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let mut subs = self.subscriptions.lock().unwrap();
        let psub = subs
            .get_mut(subscription_id)
            .ok_or_else(|| BillingError::ProviderGone(subscription_id.to_string()))?;
        psub.price_id = Some(new_price_id.to_string());
        Ok(psub.clone())
    }

    async fn cancel_now(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<ProviderSubscription>> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.cancel_now_calls
            .lock()
            .unwrap()
            .push(subscription_id.to_string());
        Ok(self.subscriptions.lock().unwrap().remove(subscription_id))
    }

    async fn create_refund(
        &self,
        payment_intent_id: &str,
        amount_cents: Option<i64>,
    ) -> BillingResult<RefundInfo> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.refund_calls
            .lock()
            .unwrap()
            .push((payment_intent_id.to_string(), amount_cents));
        Ok(RefundInfo {
            id: format!("re_test_{payment_intent_id}"),
            amount_cents: amount_cents.unwrap_or(self.refund_amount_cents),
            created: Some(OffsetDateTime::now_utc()),
        })
    }

    async fn price_amount(&self, price_id: &str) -> BillingResult<i64> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.price_amounts
            .lock()
            .unwrap()
            .get(price_id)
            .copied()
            .ok_or_else(|| BillingError::Provider(format!("unknown price {price_id}")))
    }
}

#[derive(Default)]
pub struct RecordingEntitlementNotifier {
    pub calls: Mutex<Vec<(Uuid, Role)>>,
}

impl RecordingEntitlementNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_role(&self, user_id: Uuid) -> Option<Role> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| *id == user_id)
            .map(|(_, role)| *role)
    }
}

#[async_trait]
impl crate::entitlement::EntitlementNotifier for RecordingEntitlementNotifier {
    async fn set_role(&self, user_id: Uuid, role: Role) -> BillingResult<()> {
        self.calls.lock().unwrap().push((user_id, role));
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryOutboxStore {
    entries: Mutex<Vec<OutboxEntry>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn append(&self, entry: OutboxEntry) -> BillingResult<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.push(entry);
        let cap = OUTBOX_CAP as usize;
        if entries.len() > cap {
            let excess = entries.len() - cap;
            entries.drain(..excess);
        }
        Ok(())
    }

    async fn list(&self) -> BillingResult<Vec<OutboxEntry>> {
        Ok(self.entries.lock().unwrap().clone())
    }

    async fn remove(&self, id: Uuid) -> BillingResult<()> {
        self.entries.lock().unwrap().retain(|e| e.id != id);
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, reason: &str) -> BillingResult<()> {
        if let Some(entry) = self.entries.lock().unwrap().iter_mut().find(|e| e.id == id) {
            entry.failure_reason = Some(reason.to_string());
        }
        Ok(())
    }
}

/// Usage recorder that fails a configurable number of times, then
/// succeeds. Drives the outbox retry tests.
pub struct FlakyUsageRecorder {
    failures_remaining: Mutex<u32>,
    pub recorded: Mutex<Vec<serde_json::Value>>,
}

impl FlakyUsageRecorder {
    pub fn failing(times: u32) -> Self {
        Self {
            failures_remaining: Mutex::new(times),
            recorded: Mutex::new(Vec::new()),
        }
    }

    pub fn reliable() -> Self {
        Self::failing(0)
    }
}

#[async_trait]
impl UsageRecorder for FlakyUsageRecorder {
    async fn record_usage_event(&self, payload: serde_json::Value) -> BillingResult<()> {
        let mut remaining = self.failures_remaining.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(BillingError::Internal("metrics backend unavailable".to_string()));
        }
        drop(remaining);
        self.recorded.lock().unwrap().push(payload);
        Ok(())
    }
}

pub struct CollectingNotificationSender {
    failures_remaining: Mutex<u32>,
    pub sent: Mutex<Vec<(NotificationKind, String, serde_json::Value)>>,
}

impl CollectingNotificationSender {
    pub fn new() -> Self {
        Self::failing(0)
    }

    pub fn failing(times: u32) -> Self {
        Self {
            failures_remaining: Mutex::new(times),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent_kinds(&self) -> Vec<NotificationKind> {
        self.sent.lock().unwrap().iter().map(|(k, _, _)| *k).collect()
    }
}

impl Default for CollectingNotificationSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationSender for CollectingNotificationSender {
    async fn send(
        &self,
        kind: NotificationKind,
        recipient: &str,
        data: &serde_json::Value,
    ) -> BillingResult<()> {
        let mut remaining = self.failures_remaining.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(BillingError::Notification("transport unavailable".to_string()));
        }
        drop(remaining);
        self.sent
            .lock()
            .unwrap()
            .push((kind, recipient.to_string(), data.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct VecEventSink {
    pub logged: Mutex<Vec<(Uuid, BillingEventType)>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn types(&self) -> Vec<BillingEventType> {
        self.logged.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }
}

#[async_trait]
impl EventSink for VecEventSink {
    async fn log(&self, builder: BillingEventBuilder) -> BillingResult<Uuid> {
        self.logged
            .lock()
            .unwrap()
            .push((builder.event_user_id(), builder.event_type()));
        Ok(Uuid::new_v4())
    }
}
