//! Periodic maintenance sweeps
//!
//! Two jobs run on independent schedules: the outbox sweep re-attempts
//! queued side-effects, and the expiry sweep flips `is_active` off on
//! records whose paid period has ended, revoking the role through the
//! entitlement notifier. Neither shares a lock with the request paths.

use sqlx::PgPool;
use tracing::{error, info};
use uuid::Uuid;

use billsync_billing::{EntitlementNotifier, OutboxService};
use billsync_shared::Role;

/// Re-attempt queued outbox entries.
pub async fn run_outbox_sweep(outbox: &OutboxService) {
    let stats = outbox.sweep().await;
    if stats.attempted > 0 {
        info!(
            attempted = stats.attempted,
            delivered = stats.delivered,
            failed = stats.failed,
            "Outbox sweep completed"
        );
    }
}

/// Deactivate subscriptions whose end date has passed and revoke their
/// roles. Covers manual-payment records and any missed provider event;
/// the provider's own deletion webhook normally gets there first.
pub async fn expire_lapsed_subscriptions(pool: &PgPool, entitlements: &dyn EntitlementNotifier) {
    let expired: Vec<(Uuid,)> = match sqlx::query_as(
        r#"
        UPDATE subscriptions
        SET is_active = FALSE, updated_at = NOW()
        WHERE is_active = TRUE
          AND end_date IS NOT NULL
          AND end_date < NOW()
        RETURNING user_id
        "#,
    )
    .fetch_all(pool)
    .await
    {
        Ok(rows) => rows,
        Err(e) => {
            error!(error = %e, "Failed to expire lapsed subscriptions");
            return;
        }
    };

    if expired.is_empty() {
        return;
    }

    info!(count = expired.len(), "Expired lapsed subscriptions");

    for (user_id,) in expired {
        if let Err(e) = entitlements.set_role(user_id, Role::User).await {
            error!(
                user_id = %user_id,
                error = %e,
                "Failed to revoke role for lapsed subscription"
            );
        }
    }
}
