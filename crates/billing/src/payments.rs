//! Payment records
//!
//! A `payments` row is created when the (out of scope) checkout flow opens a
//! provider order, and is driven to `captured`/`failed`/`refunded` by the
//! webhook processor. `provider_order_id` is unique and is the idempotency
//! key for capture: the `created -> captured` transition happens at most
//! once, no matter how many times the provider delivers the event.

use adpilot_shared::{PaymentPurpose, PaymentStatus};
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// A payment row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider_order_id: String,
    pub provider_payment_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub payment_for: String,
    pub plan_id: Option<Uuid>,
    pub slot_count: Option<i32>,
    pub related_reference_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Payment {
    pub fn status_parsed(&self) -> BillingResult<PaymentStatus> {
        self.status.parse().map_err(|_| {
            BillingError::InvariantViolation(format!(
                "payment {} has unknown status '{}'",
                self.id, self.status
            ))
        })
    }

    pub fn purpose(&self) -> BillingResult<PaymentPurpose> {
        self.payment_for.parse().map_err(|_| {
            BillingError::InvariantViolation(format!(
                "payment {} has unknown purpose '{}'",
                self.id, self.payment_for
            ))
        })
    }
}

const PAYMENT_COLUMNS: &str = "id, user_id, provider_order_id, provider_payment_id, amount_cents, \
     currency, status, payment_for, plan_id, slot_count, related_reference_id, \
     created_at, updated_at";

/// Store for payment rows
#[derive(Clone)]
pub struct PaymentService {
    pool: PgPool,
}

/// Parameters for recording a new provider order
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub user_id: Uuid,
    pub provider_order_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub purpose: PaymentPurpose,
    pub plan_id: Option<Uuid>,
    pub slot_count: Option<i32>,
}

impl PaymentService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record an order opened at checkout time
    ///
    /// Idempotent on `provider_order_id`: re-recording an existing order
    /// returns the stored row unchanged.
    pub async fn record_order(&self, new: NewPayment) -> BillingResult<Payment> {
        match new.purpose {
            PaymentPurpose::Subscription if new.plan_id.is_none() => {
                return Err(BillingError::Validation(
                    "subscription payments must reference a plan".to_string(),
                ));
            }
            PaymentPurpose::AddonSlots if new.slot_count.unwrap_or(0) < 1 => {
                return Err(BillingError::Validation(
                    "addon payments must carry a slot count >= 1".to_string(),
                ));
            }
            _ => {}
        }

        sqlx::query(
            r#"
            INSERT INTO payments
                (user_id, provider_order_id, amount_cents, currency, status,
                 payment_for, plan_id, slot_count)
            VALUES ($1, $2, $3, $4, 'created', $5, $6, $7)
            ON CONFLICT (provider_order_id) DO NOTHING
            "#,
        )
        .bind(new.user_id)
        .bind(&new.provider_order_id)
        .bind(new.amount_cents)
        .bind(&new.currency)
        .bind(new.purpose.as_str())
        .bind(new.plan_id)
        .bind(new.slot_count)
        .execute(&self.pool)
        .await?;

        self.find_by_order_id(&new.provider_order_id)
            .await?
            .ok_or_else(|| {
                BillingError::Database("payment row missing after insert".to_string())
            })
    }

    pub async fn get(&self, payment_id: Uuid) -> BillingResult<Payment> {
        let payment: Option<Payment> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;
        payment.ok_or_else(|| BillingError::NotFound(format!("payment {payment_id} not found")))
    }

    pub async fn find_by_order_id(&self, provider_order_id: &str) -> BillingResult<Option<Payment>> {
        let payment: Option<Payment> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE provider_order_id = $1"
        ))
        .bind(provider_order_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    /// Lock the payment row for the duration of the caller's transaction
    ///
    /// Capture processing locks here first; concurrent deliveries of the same
    /// event then serialize on this row and the loser sees `captured`.
    pub async fn find_by_order_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        provider_order_id: &str,
    ) -> BillingResult<Option<Payment>> {
        let payment: Option<Payment> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE provider_order_id = $1 FOR UPDATE"
        ))
        .bind(provider_order_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(payment)
    }

    /// Mark a payment captured inside the caller's transaction
    ///
    /// A `failed` payment may still capture: the provider can succeed on a
    /// retry after reporting an intermediate failure.
    pub async fn mark_captured_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payment_id: Uuid,
        provider_payment_id: &str,
    ) -> BillingResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE payments
            SET status = 'captured', provider_payment_id = $2, updated_at = NOW()
            WHERE id = $1 AND status IN ('created', 'failed')
            "#,
        )
        .bind(payment_id)
        .bind(provider_payment_id)
        .execute(&mut **tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(BillingError::InvariantViolation(format!(
                "payment {payment_id} was not capturable (already captured or refunded)"
            )));
        }
        Ok(())
    }

    /// Mark a payment failed; a no-op for payments already captured/terminal
    pub async fn mark_failed(&self, provider_order_id: &str) -> BillingResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE payments
            SET status = 'failed', updated_at = NOW()
            WHERE provider_order_id = $1 AND status = 'created'
            "#,
        )
        .bind(provider_order_id)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    /// Mark a captured payment refunded inside the caller's transaction
    pub async fn mark_refunded_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payment_id: Uuid,
    ) -> BillingResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE payments
            SET status = 'refunded', updated_at = NOW()
            WHERE id = $1 AND status = 'captured'
            "#,
        )
        .bind(payment_id)
        .execute(&mut **tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(BillingError::Validation(format!(
                "payment {payment_id} is not captured; only captured payments can be refunded"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payment_fixture(status: &str, purpose: &str) -> Payment {
        Payment {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            provider_order_id: "order_test_1".to_string(),
            provider_payment_id: None,
            amount_cents: 9900,
            currency: "USD".to_string(),
            status: status.to_string(),
            payment_for: purpose.to_string(),
            plan_id: Some(Uuid::new_v4()),
            slot_count: None,
            related_reference_id: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_status_parsing() {
        let payment = payment_fixture("captured", "subscription");
        assert_eq!(payment.status_parsed().unwrap(), PaymentStatus::Captured);
        assert_eq!(payment.purpose().unwrap(), PaymentPurpose::Subscription);
    }

    #[test]
    fn test_corrupt_status_is_invariant_violation() {
        let payment = payment_fixture("authorized", "subscription");
        assert!(matches!(
            payment.status_parsed(),
            Err(BillingError::InvariantViolation(_))
        ));
    }
}
