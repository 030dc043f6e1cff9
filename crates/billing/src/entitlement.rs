//! Entitlement notifier
//!
//! Flips the user's access role. Invoked only by the reconciliation
//! engine's post-transition step, never directly by callers; the desired
//! role is always derived from the freshly written record
//! (`SubscriptionRecord::entitled_role`), so there is exactly one
//! derivation and one call site per transition.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use billsync_shared::Role;

use crate::error::BillingResult;

#[async_trait]
pub trait EntitlementNotifier: Send + Sync {
    async fn set_role(&self, user_id: Uuid, role: Role) -> BillingResult<()>;
}

/// Postgres-backed notifier updating the users table directly.
pub struct PgEntitlementNotifier {
    pool: PgPool,
}

impl PgEntitlementNotifier {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntitlementNotifier for PgEntitlementNotifier {
    async fn set_role(&self, user_id: Uuid, role: Role) -> BillingResult<()> {
        let result = sqlx::query("UPDATE users SET role = $1, updated_at = NOW() WHERE id = $2")
            .bind(role.as_str())
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                user_id = %user_id,
                role = %role,
                "Role update matched no user row"
            );
        } else {
            tracing::info!(user_id = %user_id, role = %role, "Updated user role");
        }

        Ok(())
    }
}
