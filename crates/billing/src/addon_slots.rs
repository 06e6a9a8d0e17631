//! Addon slot pool
//!
//! Purchased, time-boxed extra AI-campaign capacity. Slots are never
//! physically removed: consumption sets `consumed_by_campaign_id` exactly
//! once and the row stays behind as its own audit trail. Reservation takes
//! the oldest eligible slot under an exclusive row lock inside the caller's
//! transaction, so two concurrent activations cannot both claim the last
//! slot. A slot whose `expires_at` has passed is never eligible, consumed or
//! not.

use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::audit::{ActorType, AuditEventBuilder, AuditEventType, AuditLogger};
use crate::error::{BillingError, BillingResult};
use crate::payments::Payment;

/// An addon slot row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AddonSlot {
    pub id: Uuid,
    pub user_id: Uuid,
    pub payment_id: Option<Uuid>,
    pub extra_capacity: i32,
    pub purchased_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub consumed_by_campaign_id: Option<Uuid>,
    pub consumed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl AddonSlot {
    /// Eligible for reservation: unconsumed and unexpired at `now`
    pub fn is_available(&self, now: OffsetDateTime) -> bool {
        self.consumed_by_campaign_id.is_none() && self.expires_at > now
    }
}

/// Pool summary for the entitlement surface
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SlotPoolSummary {
    pub available: i64,
    pub consumed: i64,
    pub expired_unconsumed: i64,
}

const SLOT_COLUMNS: &str = "id, user_id, payment_id, extra_capacity, purchased_at, expires_at, \
     consumed_by_campaign_id, consumed_at, created_at";

/// Allocator and admin surface for the addon slot pool
#[derive(Clone)]
pub struct AddonSlotService {
    pool: PgPool,
    audit: AuditLogger,
}

impl AddonSlotService {
    pub fn new(pool: PgPool) -> Self {
        let audit = AuditLogger::new(pool.clone());
        Self { pool, audit }
    }

    /// Reserve the oldest eligible slot for `user_id` inside `tx`
    ///
    /// FIFO by purchase time under `FOR UPDATE`: concurrent callers serialize
    /// on the row lock, and the loser re-evaluates the predicate after the
    /// winner commits, observing the slot as consumed. Exhaustion returns
    /// `Ok(None)`, an expected outcome, not an error.
    pub async fn reserve(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        campaign_id: Uuid,
    ) -> BillingResult<Option<AddonSlot>> {
        let candidate: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM addon_slots
            WHERE user_id = $1
              AND consumed_by_campaign_id IS NULL
              AND expires_at > NOW()
            ORDER BY purchased_at ASC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?;

        let Some((slot_id,)) = candidate else {
            tracing::debug!(user_id = %user_id, "Addon slot pool exhausted");
            return Ok(None);
        };

        let slot: AddonSlot = sqlx::query_as(&format!(
            r#"
            UPDATE addon_slots
            SET consumed_by_campaign_id = $2, consumed_at = NOW()
            WHERE id = $1 AND consumed_by_campaign_id IS NULL
            RETURNING {SLOT_COLUMNS}
            "#
        ))
        .bind(slot_id)
        .bind(campaign_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| {
            // The row was locked above; losing it here means the predicate
            // re-check raced in a way the lock should have excluded.
            BillingError::Database(format!("addon slot {slot_id} vanished during reservation"))
        })?;

        self.audit
            .log_tx(
                tx,
                AuditEventBuilder::new(user_id, AuditEventType::SlotReserved)
                    .actor_type(ActorType::User)
                    .data(serde_json::json!({
                        "slot_id": slot.id,
                        "campaign_id": campaign_id,
                        "purchased_at": slot.purchased_at.unix_timestamp(),
                    })),
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            slot_id = %slot.id,
            campaign_id = %campaign_id,
            "Addon slot reserved"
        );
        Ok(Some(slot))
    }

    /// Create slot rows for a captured addon payment, inside the capture
    /// transaction
    ///
    /// One row per purchased unit; idempotency comes from the capture gate
    /// upstream (a payment only passes through `created -> captured` once).
    pub async fn grant_purchased_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payment: &Payment,
        validity_days: i32,
    ) -> BillingResult<Vec<AddonSlot>> {
        let count = payment.slot_count.ok_or_else(|| {
            BillingError::InvariantViolation(format!(
                "addon payment {} carries no slot count",
                payment.id
            ))
        })?;
        if count < 1 {
            return Err(BillingError::InvariantViolation(format!(
                "addon payment {} has non-positive slot count {count}",
                payment.id
            )));
        }

        let expires_at = OffsetDateTime::now_utc() + Duration::days(i64::from(validity_days));
        let mut slots = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let slot: AddonSlot = sqlx::query_as(&format!(
                r#"
                INSERT INTO addon_slots (user_id, payment_id, extra_capacity, expires_at)
                VALUES ($1, $2, 1, $3)
                RETURNING {SLOT_COLUMNS}
                "#
            ))
            .bind(payment.user_id)
            .bind(payment.id)
            .bind(expires_at)
            .fetch_one(&mut **tx)
            .await?;
            slots.push(slot);
        }

        self.audit
            .log_tx(
                tx,
                AuditEventBuilder::new(payment.user_id, AuditEventType::SlotsGranted)
                    .actor_type(ActorType::Provider)
                    .data(serde_json::json!({
                        "payment_id": payment.id,
                        "count": count,
                        "expires_at": expires_at.unix_timestamp(),
                    })),
            )
            .await?;

        tracing::info!(
            user_id = %payment.user_id,
            payment_id = %payment.id,
            count = count,
            "Addon slots granted"
        );
        Ok(slots)
    }

    pub async fn get(&self, slot_id: Uuid) -> BillingResult<AddonSlot> {
        let slot: Option<AddonSlot> = sqlx::query_as(&format!(
            "SELECT {SLOT_COLUMNS} FROM addon_slots WHERE id = $1"
        ))
        .bind(slot_id)
        .fetch_optional(&self.pool)
        .await?;
        slot.ok_or_else(|| BillingError::NotFound(format!("addon slot {slot_id} not found")))
    }

    /// Number of slots currently reservable for the user
    pub async fn available_count(&self, user_id: Uuid) -> BillingResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM addon_slots
            WHERE user_id = $1
              AND consumed_by_campaign_id IS NULL
              AND expires_at > NOW()
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn pool_summary(&self, user_id: Uuid) -> BillingResult<SlotPoolSummary> {
        let row: (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE consumed_by_campaign_id IS NULL AND expires_at > NOW()),
                COUNT(*) FILTER (WHERE consumed_by_campaign_id IS NOT NULL),
                COUNT(*) FILTER (WHERE consumed_by_campaign_id IS NULL AND expires_at <= NOW())
            FROM addon_slots
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(SlotPoolSummary {
            available: row.0,
            consumed: row.1,
            expired_unconsumed: row.2,
        })
    }

    /// Admin: push a slot's expiry out
    ///
    /// Never touches `consumed_by_campaign_id`; extending a consumed slot is
    /// allowed (it only matters for the audit trail) but extending into the
    /// past is not.
    pub async fn extend_expiry(
        &self,
        admin_id: Uuid,
        slot_id: Uuid,
        new_expires_at: OffsetDateTime,
        reason: &str,
    ) -> BillingResult<AddonSlot> {
        if reason.trim().is_empty() {
            return Err(BillingError::Validation(
                "a non-empty reason is required for slot changes".to_string(),
            ));
        }
        if new_expires_at <= OffsetDateTime::now_utc() {
            return Err(BillingError::Validation(
                "new expiry must lie in the future".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        let before = self.get_for_update_tx(&mut tx, slot_id).await?;

        let after: AddonSlot = sqlx::query_as(&format!(
            r#"
            UPDATE addon_slots SET expires_at = $2
            WHERE id = $1
            RETURNING {SLOT_COLUMNS}
            "#
        ))
        .bind(slot_id)
        .bind(new_expires_at)
        .fetch_one(&mut *tx)
        .await?;

        self.audit
            .log_tx(
                &mut tx,
                AuditEventBuilder::new(before.user_id, AuditEventType::SlotExtended)
                    .actor(ActorType::Admin, admin_id)
                    .reason(reason)
                    .data(serde_json::json!({
                        "slot_id": slot_id,
                        "before": { "expires_at": before.expires_at.unix_timestamp() },
                        "after": { "expires_at": after.expires_at.unix_timestamp() },
                    })),
            )
            .await?;

        tx.commit().await?;

        tracing::info!(
            slot_id = %slot_id,
            new_expires_at = %new_expires_at,
            admin_id = %admin_id,
            "Addon slot expiry extended"
        );
        Ok(after)
    }

    /// Admin: expire a slot immediately, removing it from the pool
    pub async fn force_expire(
        &self,
        admin_id: Uuid,
        slot_id: Uuid,
        reason: &str,
    ) -> BillingResult<AddonSlot> {
        if reason.trim().is_empty() {
            return Err(BillingError::Validation(
                "a non-empty reason is required for slot changes".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        let before = self.get_for_update_tx(&mut tx, slot_id).await?;

        let after: AddonSlot = sqlx::query_as(&format!(
            r#"
            UPDATE addon_slots SET expires_at = NOW()
            WHERE id = $1
            RETURNING {SLOT_COLUMNS}
            "#
        ))
        .bind(slot_id)
        .fetch_one(&mut *tx)
        .await?;

        self.audit
            .log_tx(
                &mut tx,
                AuditEventBuilder::new(before.user_id, AuditEventType::SlotForceExpired)
                    .actor(ActorType::Admin, admin_id)
                    .reason(reason)
                    .data(serde_json::json!({
                        "slot_id": slot_id,
                        "before": { "expires_at": before.expires_at.unix_timestamp() },
                        "after": { "expires_at": after.expires_at.unix_timestamp() },
                    })),
            )
            .await?;

        tx.commit().await?;

        tracing::info!(slot_id = %slot_id, admin_id = %admin_id, "Addon slot force-expired");
        Ok(after)
    }

    /// Admin: correct a slot's capacity value
    pub async fn adjust_capacity(
        &self,
        admin_id: Uuid,
        slot_id: Uuid,
        new_capacity: i32,
        reason: &str,
    ) -> BillingResult<AddonSlot> {
        if reason.trim().is_empty() {
            return Err(BillingError::Validation(
                "a non-empty reason is required for slot changes".to_string(),
            ));
        }
        if new_capacity < 1 {
            return Err(BillingError::Validation(
                "slot capacity must be >= 1".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        let before = self.get_for_update_tx(&mut tx, slot_id).await?;

        let after: AddonSlot = sqlx::query_as(&format!(
            r#"
            UPDATE addon_slots SET extra_capacity = $2
            WHERE id = $1
            RETURNING {SLOT_COLUMNS}
            "#
        ))
        .bind(slot_id)
        .bind(new_capacity)
        .fetch_one(&mut *tx)
        .await?;

        self.audit
            .log_tx(
                &mut tx,
                AuditEventBuilder::new(before.user_id, AuditEventType::SlotAdjusted)
                    .actor(ActorType::Admin, admin_id)
                    .reason(reason)
                    .data(serde_json::json!({
                        "slot_id": slot_id,
                        "before": { "extra_capacity": before.extra_capacity },
                        "after": { "extra_capacity": after.extra_capacity },
                    })),
            )
            .await?;

        tx.commit().await?;

        tracing::info!(
            slot_id = %slot_id,
            capacity = new_capacity,
            admin_id = %admin_id,
            "Addon slot capacity adjusted"
        );
        Ok(after)
    }

    async fn get_for_update_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        slot_id: Uuid,
    ) -> BillingResult<AddonSlot> {
        let slot: Option<AddonSlot> = sqlx::query_as(&format!(
            "SELECT {SLOT_COLUMNS} FROM addon_slots WHERE id = $1 FOR UPDATE"
        ))
        .bind(slot_id)
        .fetch_optional(&mut **tx)
        .await?;
        slot.ok_or_else(|| BillingError::NotFound(format!("addon slot {slot_id} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_fixture(
        consumed: Option<Uuid>,
        expires_at: OffsetDateTime,
    ) -> AddonSlot {
        AddonSlot {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            payment_id: None,
            extra_capacity: 1,
            purchased_at: OffsetDateTime::UNIX_EPOCH,
            expires_at,
            consumed_by_campaign_id: consumed,
            consumed_at: consumed.map(|_| OffsetDateTime::UNIX_EPOCH),
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_unconsumed_unexpired_slot_is_available() {
        let now = OffsetDateTime::now_utc();
        let slot = slot_fixture(None, now + Duration::days(10));
        assert!(slot.is_available(now));
    }

    #[test]
    fn test_consumed_slot_is_not_available() {
        let now = OffsetDateTime::now_utc();
        let slot = slot_fixture(Some(Uuid::new_v4()), now + Duration::days(10));
        assert!(!slot.is_available(now));
    }

    #[test]
    fn test_expired_slot_is_not_available_even_if_unconsumed() {
        let now = OffsetDateTime::now_utc();
        let slot = slot_fixture(None, now - Duration::seconds(1));
        assert!(!slot.is_available(now));
    }
}
