//! Billing error types

use thiserror::Error;

/// Billing-specific errors
///
/// Grouped by the failure class they represent: validation errors are
/// rejected before any state mutation, domain errors violate a lifecycle
/// precondition, provider errors split into retryable and terminal, and
/// correlation errors are logged and dropped on webhook paths.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Subscription is not active: {0}")]
    NotActive(String),

    #[error("Subscription is not cancelable: {0}")]
    NotCancelable(String),

    #[error("Subscription already lapsed; start a new checkout instead")]
    AlreadyLapsed,

    #[error("Already subscribed to plan: {0}")]
    SamePlan(String),

    #[error("Missing correlation: {0}")]
    MissingCorrelation(String),

    #[error("Provider API error: {0}")]
    Provider(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Provider resource already gone: {0}")]
    ProviderGone(String),

    #[error("Refund failed: {0}")]
    RefundFailed(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook event type not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether the caller may retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::ProviderUnavailable(_))
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        match &err {
            stripe::StripeError::Stripe(req) if req.http_status == 404 => {
                BillingError::ProviderGone(err.to_string())
            }
            stripe::StripeError::Timeout => {
                BillingError::ProviderUnavailable("request timed out".to_string())
            }
            stripe::StripeError::ClientError(msg) => BillingError::ProviderUnavailable(msg.clone()),
            _ => BillingError::Provider(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BillingError::ProviderUnavailable("timeout".to_string()).is_retryable());
        assert!(!BillingError::ProviderGone("sub_1".to_string()).is_retryable());
        assert!(!BillingError::AlreadyLapsed.is_retryable());
    }
}
