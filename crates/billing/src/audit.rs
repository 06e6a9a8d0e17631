//! Billing audit ledger
//!
//! Append-only record of every mutating billing operation. Admin mutations
//! write their audit row inside the same transaction as the mutation itself
//! (`log_tx`), so a failed mutation leaves no partial trail. Webhook and
//! lifecycle handlers log best-effort through `log`; a lost audit row there
//! is a warning, not a failure of the operation.

use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::BillingResult;

/// Who performed the audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// Human administrator acting through the admin API
    Admin,
    /// The end user themselves
    User,
    /// The payment provider, via webhook
    Provider,
    /// Scheduled jobs and internal automation
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::Admin => "admin",
            ActorType::User => "user",
            ActorType::Provider => "provider",
            ActorType::System => "system",
        }
    }
}

/// Event types recorded in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    TrialStarted,
    SubscriptionActivated,
    SubscriptionAssigned,
    SubscriptionCanceled,
    SubscriptionCompleted,
    GraceEntered,
    GraceExpired,
    TrialExpired,
    PaymentCaptured,
    PaymentFailed,
    PaymentRefunded,
    InvoiceIssued,
    InvoiceStatusChanged,
    SlotsGranted,
    SlotReserved,
    SlotExtended,
    SlotForceExpired,
    SlotAdjusted,
    OverrideUpserted,
    OverrideDeleted,
    SettingsUpdated,
    AiOptimizationEnabled,
    AiOptimizationDisabled,
    WebhookProcessed,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::TrialStarted => "trial_started",
            AuditEventType::SubscriptionActivated => "subscription_activated",
            AuditEventType::SubscriptionAssigned => "subscription_assigned",
            AuditEventType::SubscriptionCanceled => "subscription_canceled",
            AuditEventType::SubscriptionCompleted => "subscription_completed",
            AuditEventType::GraceEntered => "grace_entered",
            AuditEventType::GraceExpired => "grace_expired",
            AuditEventType::TrialExpired => "trial_expired",
            AuditEventType::PaymentCaptured => "payment_captured",
            AuditEventType::PaymentFailed => "payment_failed",
            AuditEventType::PaymentRefunded => "payment_refunded",
            AuditEventType::InvoiceIssued => "invoice_issued",
            AuditEventType::InvoiceStatusChanged => "invoice_status_changed",
            AuditEventType::SlotsGranted => "slots_granted",
            AuditEventType::SlotReserved => "slot_reserved",
            AuditEventType::SlotExtended => "slot_extended",
            AuditEventType::SlotForceExpired => "slot_force_expired",
            AuditEventType::SlotAdjusted => "slot_adjusted",
            AuditEventType::OverrideUpserted => "override_upserted",
            AuditEventType::OverrideDeleted => "override_deleted",
            AuditEventType::SettingsUpdated => "settings_updated",
            AuditEventType::AiOptimizationEnabled => "ai_optimization_enabled",
            AuditEventType::AiOptimizationDisabled => "ai_optimization_disabled",
            AuditEventType::WebhookProcessed => "webhook_processed",
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Builder for a single audit entry
#[derive(Debug, Clone)]
pub struct AuditEventBuilder {
    user_id: Option<Uuid>,
    event_type: AuditEventType,
    actor_type: ActorType,
    actor_id: Option<Uuid>,
    reason: Option<String>,
    data: serde_json::Value,
}

impl AuditEventBuilder {
    pub fn new(user_id: Uuid, event_type: AuditEventType) -> Self {
        Self {
            user_id: Some(user_id),
            event_type,
            actor_type: ActorType::System,
            actor_id: None,
            reason: None,
            data: serde_json::json!({}),
        }
    }

    /// An entry with no subject user (e.g. platform settings changes)
    pub fn platform(event_type: AuditEventType) -> Self {
        Self {
            user_id: None,
            event_type,
            actor_type: ActorType::System,
            actor_id: None,
            reason: None,
            data: serde_json::json!({}),
        }
    }

    pub fn actor(mut self, actor_type: ActorType, actor_id: Uuid) -> Self {
        self.actor_type = actor_type;
        self.actor_id = Some(actor_id);
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Writer for the append-only audit ledger
#[derive(Clone)]
pub struct AuditLogger {
    pool: PgPool,
}

impl AuditLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append an entry outside any caller transaction (best-effort paths)
    pub async fn log(&self, event: AuditEventBuilder) -> BillingResult<Uuid> {
        let id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO audit_log (user_id, event_type, actor_type, actor_id, reason, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(event.user_id)
        .bind(event.event_type.as_str())
        .bind(event.actor_type.as_str())
        .bind(event.actor_id)
        .bind(&event.reason)
        .bind(&event.data)
        .fetch_one(&self.pool)
        .await?;

        Ok(id.0)
    }

    /// Append an entry inside the caller's transaction
    ///
    /// Admin mutations must use this so the audit row commits or rolls back
    /// together with the state change.
    pub async fn log_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: AuditEventBuilder,
    ) -> BillingResult<Uuid> {
        let id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO audit_log (user_id, event_type, actor_type, actor_id, reason, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(event.user_id)
        .bind(event.event_type.as_str())
        .bind(event.actor_type.as_str())
        .bind(event.actor_id)
        .bind(&event.reason)
        .bind(&event.data)
        .fetch_one(&mut **tx)
        .await?;

        Ok(id.0)
    }

    /// Log, downgrading failure to a warning
    ///
    /// Used on paths where the primary operation already committed and an
    /// audit miss must not fail the request.
    pub async fn log_best_effort(&self, event: AuditEventBuilder) {
        let event_type = event.event_type;
        if let Err(e) = self.log(event).await {
            tracing::warn!(event_type = %event_type, error = %e, "Failed to append audit entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_type_strings() {
        assert_eq!(ActorType::Admin.as_str(), "admin");
        assert_eq!(ActorType::Provider.as_str(), "provider");
        assert_eq!(ActorType::System.as_str(), "system");
    }

    #[test]
    fn test_builder_defaults_to_system_actor() {
        let event = AuditEventBuilder::new(Uuid::new_v4(), AuditEventType::GraceEntered);
        assert_eq!(event.actor_type, ActorType::System);
        assert!(event.actor_id.is_none());
        assert!(event.reason.is_none());
    }

    #[test]
    fn test_builder_actor_and_reason() {
        let admin = Uuid::new_v4();
        let event = AuditEventBuilder::new(Uuid::new_v4(), AuditEventType::OverrideUpserted)
            .actor(ActorType::Admin, admin)
            .reason("support escalation #4411")
            .data(serde_json::json!({"prior": 3, "new": 5}));
        assert_eq!(event.actor_type, ActorType::Admin);
        assert_eq!(event.actor_id, Some(admin));
        assert_eq!(event.reason.as_deref(), Some("support escalation #4411"));
        assert_eq!(event.data["new"], 5);
    }

    #[test]
    fn test_platform_entries_have_no_subject() {
        let event = AuditEventBuilder::platform(AuditEventType::SettingsUpdated);
        assert!(event.user_id.is_none());
    }
}
