//! Billing error types
//!
//! One enum covers the whole taxonomy: authentication failures, validation
//! failures, typed business denials (capacity, cooldown, rate limit), lookup
//! misses, illegal state transitions, and infrastructure faults. Business
//! denials are side-effect-free; infrastructure faults are retryable and
//! must be propagated so upstream retry mechanisms (the payment provider's
//! webhook redelivery in particular) can repair them.

use adpilot_shared::{RemediationAction, SubscriptionStatus};

/// Result alias used throughout the billing crate
pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Webhook signature did not match; rejected before parsing the body
    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// Webhook body failed to parse after the signature checked out
    #[error("webhook payload invalid: {0}")]
    WebhookPayloadInvalid(String),

    /// Caller input rejected before any mutation (missing reason, bad key, ...)
    #[error("validation failed: {0}")]
    Validation(String),

    /// Plan limit reached and no addon slot available
    #[error("capacity exceeded: limit of {limit} reached")]
    CapacityExceeded {
        limit: i64,
        action: RemediationAction,
    },

    /// Per-campaign cooldown since the last automated action has not elapsed
    #[error("cooldown active: retry in {retry_after_seconds}s")]
    CooldownActive { retry_after_seconds: i64 },

    /// Daily automated-action budget exhausted
    #[error("daily action limit reached: retry in {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: i64 },

    /// Global kill-switch is on
    #[error("automation is disabled platform-wide")]
    AutomationDisabled,

    /// A feature-specific admin toggle forbids this action
    #[error("feature disabled: {0}")]
    FeatureDisabled(String),

    /// No trial/active/grace subscription exists for the user
    #[error("an active subscription is required")]
    SubscriptionRequired,

    #[error("not found: {0}")]
    NotFound(String),

    /// The state machine forbids this move
    #[error("illegal subscription transition {from} -> {to}")]
    InvalidTransition {
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },

    /// Configuration/programming defect (e.g. activation with no resolvable
    /// plan); logged loudly, surfaced as an internal error, never swallowed
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Whether a retry can plausibly succeed without operator intervention
    ///
    /// Webhook handlers use this to decide between a non-2xx response (so the
    /// provider redelivers) and a 2xx acknowledgement of a business no-op.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::Database(_)
                | BillingError::CooldownActive { .. }
                | BillingError::RateLimited { .. }
        )
    }

    /// Stable machine-readable code for the API surface
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::WebhookSignatureInvalid => "webhook_signature_invalid",
            BillingError::WebhookPayloadInvalid(_) => "webhook_payload_invalid",
            BillingError::Validation(_) => "validation_failed",
            BillingError::CapacityExceeded { .. } => "capacity_exceeded",
            BillingError::CooldownActive { .. } => "cooldown_active",
            BillingError::RateLimited { .. } => "rate_limited",
            BillingError::AutomationDisabled => "automation_disabled",
            BillingError::FeatureDisabled(_) => "feature_disabled",
            BillingError::SubscriptionRequired => "subscription_required",
            BillingError::NotFound(_) => "not_found",
            BillingError::InvalidTransition { .. } => "invalid_transition",
            BillingError::InvariantViolation(_) => "invariant_violation",
            BillingError::Database(_) => "database_error",
            BillingError::Config(_) => "configuration_error",
        }
    }

    /// Remediation hint, if this denial carries one
    pub fn remediation(&self) -> Option<RemediationAction> {
        match self {
            BillingError::CapacityExceeded { action, .. } => Some(*action),
            BillingError::CooldownActive { .. } | BillingError::RateLimited { .. } => {
                Some(RemediationAction::Wait)
            }
            BillingError::SubscriptionRequired => Some(RemediationAction::UpgradePlan),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => BillingError::NotFound("row not found".to_string()),
            other => BillingError::Database(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adpilot_shared::RemediationAction;

    #[test]
    fn test_capacity_error_carries_remediation() {
        let err = BillingError::CapacityExceeded {
            limit: 3,
            action: RemediationAction::BuySlots,
        };
        assert_eq!(err.code(), "capacity_exceeded");
        assert_eq!(err.remediation(), Some(RemediationAction::BuySlots));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_classification() {
        assert!(BillingError::Database("timeout".into()).is_transient());
        assert!(BillingError::CooldownActive {
            retry_after_seconds: 30
        }
        .is_transient());
        assert!(!BillingError::WebhookSignatureInvalid.is_transient());
        assert!(!BillingError::SubscriptionRequired.is_transient());
    }

    #[test]
    fn test_transient_denials_advise_waiting() {
        let err = BillingError::RateLimited {
            retry_after_seconds: 3600,
        };
        assert_eq!(err.remediation(), Some(RemediationAction::Wait));
        let err = BillingError::SubscriptionRequired;
        assert_eq!(err.remediation(), Some(RemediationAction::UpgradePlan));
    }
}
