//! Billing Invariants Module
//!
//! Provides runnable consistency checks for the billing system.
//! These invariants can be run after any mutation or webhook replay to ensure
//! the system is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write
//! 4. **Complete**: Covers all critical billing consistency requirements

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - entitlements or billing may be wrong right now
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Row type for multiple entitling subscriptions violation
#[derive(Debug, sqlx::FromRow)]
struct MultipleSubsRow {
    user_id: Uuid,
    sub_count: i64,
}

/// Row type for grace without deadline violation
#[derive(Debug, sqlx::FromRow)]
struct GraceNoDeadlineRow {
    sub_id: Uuid,
    user_id: Uuid,
}

/// Row type for captured payment without subscription violation
#[derive(Debug, sqlx::FromRow)]
struct OrphanCaptureRow {
    payment_id: Uuid,
    user_id: Uuid,
    provider_order_id: String,
}

/// Row type for invoice count mismatch violation
#[derive(Debug, sqlx::FromRow)]
struct InvoiceMismatchRow {
    payment_id: Uuid,
    user_id: Uuid,
    invoice_count: i64,
}

/// Row type for dangling slot consumption violation
#[derive(Debug, sqlx::FromRow)]
struct DanglingSlotRow {
    slot_id: Uuid,
    user_id: Uuid,
    consumed_by_campaign_id: Uuid,
}

/// Row type for unaudited override violation
#[derive(Debug, sqlx::FromRow)]
struct UnauditedOverrideRow {
    user_id: Uuid,
    override_key: String,
    updated_at: OffsetDateTime,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_entitled_subscription().await?);
        violations.extend(self.check_grace_has_deadline().await?);
        violations.extend(self.check_captured_subscription_payment_activated().await?);
        violations.extend(self.check_one_invoice_per_captured_payment().await?);
        violations.extend(self.check_consumed_slots_reference_campaigns().await?);
        violations.extend(self.check_override_changes_audited().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: At most 1 entitling subscription per user
    ///
    /// A user with two trial/active/grace subscriptions would get doubled
    /// limits and ambiguous snapshots.
    async fn check_single_entitled_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleSubsRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) as sub_count
            FROM subscriptions
            WHERE status IN ('trial', 'active', 'grace')
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_entitled_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} entitling subscriptions (expected at most 1)",
                    row.sub_count
                ),
                context: serde_json::json!({
                    "subscription_count": row.sub_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Grace subscriptions carry a deadline
    ///
    /// The expiry sweep keys on `grace_ends_at`; a grace row without one
    /// would keep its access forever.
    async fn check_grace_has_deadline(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<GraceNoDeadlineRow> = sqlx::query_as(
            r#"
            SELECT id as sub_id, user_id
            FROM subscriptions
            WHERE status = 'grace' AND grace_ends_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "grace_has_deadline".to_string(),
                user_ids: vec![row.user_id],
                description: "Grace subscription has no grace_ends_at deadline".to_string(),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: Captured subscription payments have their invoice
    ///
    /// Capture, activation (or period extension), and invoice creation
    /// commit in one transaction; a captured subscription payment without an
    /// invoice means that transaction was bypassed.
    async fn check_captured_subscription_payment_activated(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OrphanCaptureRow> = sqlx::query_as(
            r#"
            SELECT p.id as payment_id, p.user_id, p.provider_order_id
            FROM payments p
            WHERE p.status = 'captured'
              AND p.payment_for = 'subscription'
              AND NOT EXISTS (
                  SELECT 1 FROM invoices i WHERE i.payment_id = p.id
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "captured_payment_activated".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Captured subscription payment '{}' has no invoice",
                    row.provider_order_id
                ),
                context: serde_json::json!({
                    "payment_id": row.payment_id,
                    "provider_order_id": row.provider_order_id,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: At most one invoice per captured payment
    async fn check_one_invoice_per_captured_payment(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<InvoiceMismatchRow> = sqlx::query_as(
            r#"
            SELECT p.id as payment_id, p.user_id, COUNT(i.id) as invoice_count
            FROM payments p
            JOIN invoices i ON i.payment_id = p.id
            GROUP BY p.id, p.user_id
            HAVING COUNT(i.id) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "one_invoice_per_payment".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Payment has {} invoices (expected exactly 1)",
                    row.invoice_count
                ),
                context: serde_json::json!({
                    "payment_id": row.payment_id,
                    "invoice_count": row.invoice_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 5: Consumed slots reference an existing campaign
    ///
    /// `consumed_by_campaign_id` is set once by reservation inside the
    /// activation transaction; a dangling reference means the campaign write
    /// was lost while the slot write survived.
    async fn check_consumed_slots_reference_campaigns(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DanglingSlotRow> = sqlx::query_as(
            r#"
            SELECT s.id as slot_id, s.user_id, s.consumed_by_campaign_id
            FROM addon_slots s
            WHERE s.consumed_by_campaign_id IS NOT NULL
              AND NOT EXISTS (
                  SELECT 1 FROM campaigns c WHERE c.id = s.consumed_by_campaign_id
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "consumed_slot_references_campaign".to_string(),
                user_ids: vec![row.user_id],
                description: "Consumed addon slot references a campaign that does not exist"
                    .to_string(),
                context: serde_json::json!({
                    "slot_id": row.slot_id,
                    "consumed_by_campaign_id": row.consumed_by_campaign_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 6: Override changes have audit records
    ///
    /// Every override upsert writes its audit row in the same transaction,
    /// so a row updated without a matching ledger entry points at an
    /// out-of-band write.
    async fn check_override_changes_audited(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnauditedOverrideRow> = sqlx::query_as(
            r#"
            SELECT o.user_id, o.override_key, o.updated_at
            FROM usage_overrides o
            WHERE NOT EXISTS (
                SELECT 1 FROM audit_log a
                WHERE a.user_id = o.user_id
                  AND a.event_type = 'override_upserted'
                  AND a.created_at BETWEEN o.updated_at - INTERVAL '5 minutes'
                                       AND o.updated_at + INTERVAL '5 minutes'
            )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "override_changes_audited".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Override '{}' changed at {:?} with no audit record",
                    row.override_key, row.updated_at
                ),
                context: serde_json::json!({
                    "override_key": row.override_key,
                    "updated_at": row.updated_at,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_entitled_subscription" => self.check_single_entitled_subscription().await,
            "grace_has_deadline" => self.check_grace_has_deadline().await,
            "captured_payment_activated" => {
                self.check_captured_subscription_payment_activated().await
            }
            "one_invoice_per_payment" => self.check_one_invoice_per_captured_payment().await,
            "consumed_slot_references_campaign" => {
                self.check_consumed_slots_reference_campaigns().await
            }
            "override_changes_audited" => self.check_override_changes_audited().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_entitled_subscription",
            "grace_has_deadline",
            "captured_payment_activated",
            "one_invoice_per_payment",
            "consumed_slot_references_campaign",
            "override_changes_audited",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"single_entitled_subscription"));
        assert!(checks.contains(&"one_invoice_per_payment"));
    }
}
