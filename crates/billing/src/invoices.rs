//! Invoice records
//!
//! Exactly one invoice exists per captured subscription payment; it is
//! created inside the activation transaction, so a crash can never leave a
//! captured payment without its invoice. Rows are immutable apart from the
//! status column (`paid` / `refunded` / `void`). Rendering invoices to PDF
//! and mailing them happens elsewhere.

use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{ActorType, AuditEventBuilder, AuditEventType, AuditLogger};
use crate::error::{BillingError, BillingResult};

/// An invoice row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Invoice {
    pub id: Uuid,
    pub number: String,
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub payment_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub issued_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Build the invoice number for a payment
///
/// Deterministic in the payment id so an activation retry for the same
/// payment can never mint a second number.
pub fn invoice_number(issued_on: time::Date, payment_id: Uuid) -> String {
    let (year, month, day) = (
        issued_on.year(),
        issued_on.month() as u8,
        issued_on.day(),
    );
    let short = payment_id.simple().to_string();
    format!("INV-{year:04}{month:02}{day:02}-{}", &short[..8].to_uppercase())
}

const INVOICE_COLUMNS: &str = "id, number, user_id, subscription_id, payment_id, amount_cents, \
     currency, status, issued_at, updated_at";

/// Store for invoice rows
#[derive(Clone)]
pub struct InvoiceService {
    pool: PgPool,
    audit: AuditLogger,
}

impl InvoiceService {
    pub fn new(pool: PgPool) -> Self {
        let audit = AuditLogger::new(pool.clone());
        Self { pool, audit }
    }

    /// Create the invoice for a captured subscription payment
    ///
    /// Runs inside the activation transaction. The unique index on
    /// `payment_id` backstops the exactly-once guarantee.
    pub async fn create_for_payment_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        subscription_id: Uuid,
        payment_id: Uuid,
        amount_cents: i64,
        currency: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Invoice> {
        let number = invoice_number(now.date(), payment_id);

        let invoice: Invoice = sqlx::query_as(&format!(
            r#"
            INSERT INTO invoices
                (number, user_id, subscription_id, payment_id, amount_cents, currency, status, issued_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'paid', $7)
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(&number)
        .bind(user_id)
        .bind(subscription_id)
        .bind(payment_id)
        .bind(amount_cents)
        .bind(currency)
        .bind(now)
        .fetch_one(&mut **tx)
        .await?;

        Ok(invoice)
    }

    pub async fn get(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        let invoice: Option<Invoice> = sqlx::query_as(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = $1"
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;
        invoice.ok_or_else(|| BillingError::NotFound(format!("invoice {invoice_id} not found")))
    }

    pub async fn find_by_payment(&self, payment_id: Uuid) -> BillingResult<Option<Invoice>> {
        let invoice: Option<Invoice> = sqlx::query_as(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE payment_id = $1"
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(invoice)
    }

    pub async fn list_for_user(&self, user_id: Uuid) -> BillingResult<Vec<Invoice>> {
        let invoices: Vec<Invoice> = sqlx::query_as(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE user_id = $1 ORDER BY issued_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(invoices)
    }

    /// Admin status change (`refunded` / `void`), audited with before/after
    pub async fn set_status(
        &self,
        admin_id: Uuid,
        invoice_id: Uuid,
        new_status: &str,
        reason: &str,
    ) -> BillingResult<Invoice> {
        if reason.trim().is_empty() {
            return Err(BillingError::Validation(
                "a non-empty reason is required for invoice status changes".to_string(),
            ));
        }
        if !matches!(new_status, "refunded" | "void") {
            return Err(BillingError::Validation(format!(
                "invalid invoice status '{new_status}' (expected refunded or void)"
            )));
        }

        let before = self.get(invoice_id).await?;
        if before.status == new_status {
            return Ok(before);
        }
        if before.status != "paid" {
            return Err(BillingError::Validation(format!(
                "invoice {} is '{}'; only paid invoices can change status",
                invoice_id, before.status
            )));
        }

        let mut tx = self.pool.begin().await?;

        let after: Invoice = sqlx::query_as(&format!(
            r#"
            UPDATE invoices SET status = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(invoice_id)
        .bind(new_status)
        .fetch_one(&mut *tx)
        .await?;

        self.audit
            .log_tx(
                &mut tx,
                AuditEventBuilder::new(before.user_id, AuditEventType::InvoiceStatusChanged)
                    .actor(ActorType::Admin, admin_id)
                    .reason(reason)
                    .data(serde_json::json!({
                        "invoice_id": invoice_id,
                        "number": before.number,
                        "before": before.status,
                        "after": new_status,
                    })),
            )
            .await?;

        tx.commit().await?;

        tracing::info!(
            invoice_id = %invoice_id,
            from = %before.status,
            to = %new_status,
            admin_id = %admin_id,
            "Invoice status changed"
        );
        Ok(after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Month;

    #[test]
    fn test_invoice_number_is_deterministic() {
        let date = time::Date::from_calendar_date(2025, Month::March, 7).unwrap();
        let payment_id = Uuid::new_v4();
        let a = invoice_number(date, payment_id);
        let b = invoice_number(date, payment_id);
        assert_eq!(a, b);
        assert!(a.starts_with("INV-20250307-"));
        assert_eq!(a.len(), "INV-20250307-".len() + 8);
    }

    #[test]
    fn test_invoice_number_distinct_per_payment() {
        let date = time::Date::from_calendar_date(2025, Month::March, 7).unwrap();
        let a = invoice_number(date, Uuid::new_v4());
        let b = invoice_number(date, Uuid::new_v4());
        assert_ne!(a, b);
    }
}
