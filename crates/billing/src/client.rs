//! Stripe client configuration and the plan catalog

use stripe::Client;

use billsync_shared::Plan;

use crate::error::{BillingError, BillingResult};

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Price IDs for each paid plan
    pub price_ids: PlanCatalog,
    /// Base URL for success/cancel redirects
    pub app_base_url: String,
    /// Deployment environment (`development`, `staging`, `production`)
    pub app_env: String,
}

/// Static mapping between provider price identifiers and internal plans.
///
/// `free` has no price; everything else must be configured.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    pub monthly: String,
    pub annual: String,
    pub premium: String,
}

impl PlanCatalog {
    /// Get the price ID for a paid plan. `None` for free.
    pub fn price_id_for_plan(&self, plan: Plan) -> Option<&str> {
        match plan {
            Plan::Free => None,
            Plan::Monthly => Some(&self.monthly),
            Plan::Annual => Some(&self.annual),
            Plan::Premium => Some(&self.premium),
        }
    }

    /// Get the plan for a provider price ID.
    pub fn plan_for_price_id(&self, price_id: &str) -> Option<Plan> {
        if price_id == self.monthly {
            Some(Plan::Monthly)
        } else if price_id == self.annual {
            Some(Plan::Annual)
        } else if price_id == self.premium {
            Some(Plan::Premium)
        } else {
            None
        }
    }
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            price_ids: PlanCatalog {
                monthly: std::env::var("STRIPE_PRICE_MONTHLY")
                    .map_err(|_| BillingError::Config("STRIPE_PRICE_MONTHLY not set".to_string()))?,
                annual: std::env::var("STRIPE_PRICE_ANNUAL")
                    .map_err(|_| BillingError::Config("STRIPE_PRICE_ANNUAL not set".to_string()))?,
                premium: std::env::var("STRIPE_PRICE_PREMIUM")
                    .map_err(|_| BillingError::Config("STRIPE_PRICE_PREMIUM not set".to_string()))?,
            },
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            app_env: std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        })
    }

    pub fn is_production(&self) -> bool {
        self.app_env == "production"
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
