//! Admin usage overrides
//!
//! Per-user limit overrides, independent of plans and subscriptions. An
//! override never mutates a plan or subscription row; it only shadows the
//! snapshot value while unexpired. All mutations are admin actions with a
//! mandatory reason, audited with prior and new values in the same
//! transaction as the change.

use adpilot_shared::LimitKey;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{ActorType, AuditEventBuilder, AuditEventType, AuditLogger};
use crate::error::{BillingError, BillingResult};

/// A usage override row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UsageOverride {
    pub user_id: Uuid,
    pub override_key: String,
    pub value: i32,
    pub expires_at: Option<OffsetDateTime>,
    pub updated_by: Uuid,
    pub updated_at: OffsetDateTime,
}

impl UsageOverride {
    /// Whether the override is in effect at `now`
    pub fn is_active(&self, now: OffsetDateTime) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at > now,
            None => true,
        }
    }
}

/// Store for per-user limit overrides
#[derive(Clone)]
pub struct UsageOverrideService {
    pool: PgPool,
    audit: AuditLogger,
}

impl UsageOverrideService {
    pub fn new(pool: PgPool) -> Self {
        let audit = AuditLogger::new(pool.clone());
        Self { pool, audit }
    }

    /// The unexpired override for (user, key), if any
    pub async fn get_active(
        &self,
        user_id: Uuid,
        key: LimitKey,
        now: OffsetDateTime,
    ) -> BillingResult<Option<UsageOverride>> {
        let row: Option<UsageOverride> = sqlx::query_as(
            r#"
            SELECT user_id, override_key, value, expires_at, updated_by, updated_at
            FROM usage_overrides
            WHERE user_id = $1 AND override_key = $2
              AND (expires_at IS NULL OR expires_at > $3)
            "#,
        )
        .bind(user_id)
        .bind(key.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Every override currently stored for the user, expired ones included
    pub async fn list_for_user(&self, user_id: Uuid) -> BillingResult<Vec<UsageOverride>> {
        let rows: Vec<UsageOverride> = sqlx::query_as(
            r#"
            SELECT user_id, override_key, value, expires_at, updated_by, updated_at
            FROM usage_overrides
            WHERE user_id = $1
            ORDER BY override_key
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Create or replace the override for (user, key)
    pub async fn upsert(
        &self,
        admin_id: Uuid,
        user_id: Uuid,
        key: LimitKey,
        value: i32,
        expires_at: Option<OffsetDateTime>,
        reason: &str,
    ) -> BillingResult<UsageOverride> {
        if reason.trim().is_empty() {
            return Err(BillingError::Validation(
                "a non-empty reason is required for override changes".to_string(),
            ));
        }
        if value < 0 {
            return Err(BillingError::Validation(
                "override value must be >= 0".to_string(),
            ));
        }
        if let Some(expires_at) = expires_at {
            if expires_at <= OffsetDateTime::now_utc() {
                return Err(BillingError::Validation(
                    "override expiry must lie in the future".to_string(),
                ));
            }
        }

        let mut tx = self.pool.begin().await?;

        let prior: Option<i32> = sqlx::query_scalar(
            "SELECT value FROM usage_overrides WHERE user_id = $1 AND override_key = $2 FOR UPDATE",
        )
        .bind(user_id)
        .bind(key.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let row: UsageOverride = sqlx::query_as(
            r#"
            INSERT INTO usage_overrides (user_id, override_key, value, expires_at, updated_by, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (user_id, override_key) DO UPDATE SET
                value = EXCLUDED.value,
                expires_at = EXCLUDED.expires_at,
                updated_by = EXCLUDED.updated_by,
                updated_at = NOW()
            RETURNING user_id, override_key, value, expires_at, updated_by, updated_at
            "#,
        )
        .bind(user_id)
        .bind(key.as_str())
        .bind(value)
        .bind(expires_at)
        .bind(admin_id)
        .fetch_one(&mut *tx)
        .await?;

        self.audit
            .log_tx(
                &mut tx,
                AuditEventBuilder::new(user_id, AuditEventType::OverrideUpserted)
                    .actor(ActorType::Admin, admin_id)
                    .reason(reason)
                    .data(serde_json::json!({
                        "key": key.as_str(),
                        "prior_value": prior,
                        "new_value": value,
                        "expires_at": expires_at.map(|t| t.unix_timestamp()),
                    })),
            )
            .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            key = %key,
            prior = ?prior,
            value = value,
            admin_id = %admin_id,
            "Usage override upserted"
        );
        Ok(row)
    }

    /// Remove the override for (user, key)
    ///
    /// The user silently reverts to the plan snapshot. Deleting an override
    /// that does not exist is a recorded no-op, not an error.
    pub async fn delete(
        &self,
        admin_id: Uuid,
        user_id: Uuid,
        key: LimitKey,
        reason: &str,
    ) -> BillingResult<bool> {
        if reason.trim().is_empty() {
            return Err(BillingError::Validation(
                "a non-empty reason is required for override changes".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        let prior: Option<i32> = sqlx::query_scalar(
            r#"
            DELETE FROM usage_overrides
            WHERE user_id = $1 AND override_key = $2
            RETURNING value
            "#,
        )
        .bind(user_id)
        .bind(key.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        self.audit
            .log_tx(
                &mut tx,
                AuditEventBuilder::new(user_id, AuditEventType::OverrideDeleted)
                    .actor(ActorType::Admin, admin_id)
                    .reason(reason)
                    .data(serde_json::json!({
                        "key": key.as_str(),
                        "prior_value": prior,
                        "existed": prior.is_some(),
                    })),
            )
            .await?;

        tx.commit().await?;

        let existed = prior.is_some();
        tracing::info!(
            user_id = %user_id,
            key = %key,
            existed = existed,
            admin_id = %admin_id,
            "Usage override deleted"
        );
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn override_fixture(expires_at: Option<OffsetDateTime>) -> UsageOverride {
        UsageOverride {
            user_id: Uuid::new_v4(),
            override_key: "campaigns".to_string(),
            value: 25,
            expires_at,
            updated_by: Uuid::new_v4(),
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_override_without_expiry_is_active() {
        let row = override_fixture(None);
        assert!(row.is_active(OffsetDateTime::now_utc()));
    }

    #[test]
    fn test_override_expiry_boundary() {
        let now = OffsetDateTime::now_utc();
        let row = override_fixture(Some(now + Duration::minutes(1)));
        assert!(row.is_active(now));
        // At the exact expiry instant the override no longer applies
        assert!(!row.is_active(now + Duration::minutes(1)));
        assert!(!row.is_active(now + Duration::minutes(2)));
    }
}
