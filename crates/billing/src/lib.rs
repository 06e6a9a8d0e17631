// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! AdPilot Billing Module
//!
//! Entitlement enforcement and billing lifecycle for AI-optimized ad
//! campaigns.
//!
//! ## Features
//!
//! - **Subscription Lifecycle**: trial, paid activation, grace, expiry,
//!   cancellation, admin assignment
//! - **Entitlement Resolution**: plan snapshots + admin overrides + addon
//!   slots composed into one allow/deny decision
//! - **Addon Slots**: purchased, time-boxed extra campaign capacity with
//!   FIFO locked reservation
//! - **Usage Overrides**: audited per-user limit overrides
//! - **Webhooks**: idempotent processing of provider billing events
//! - **Audit Ledger**: append-only record of every mutating call
//! - **Invariant Checks**: runnable consistency queries over the whole store

pub mod addon_slots;
pub mod audit;
pub mod entitlement;
pub mod error;
pub mod invariants;
pub mod invoices;
pub mod overrides;
pub mod payments;
pub mod plans;
pub mod settings;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Addon slots
pub use addon_slots::{AddonSlot, AddonSlotService, SlotPoolSummary};

// Audit
pub use audit::{ActorType, AuditEventBuilder, AuditEventType, AuditLogger};

// Entitlement
pub use entitlement::{
    AuthorizedActivation, CapacityDecision, EffectiveLimit, EntitlementService,
    EntitlementSnapshot, EntitlementSummary, evaluate_activation,
};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Invoices
pub use invoices::{Invoice, InvoiceService};

// Overrides
pub use overrides::{UsageOverride, UsageOverrideService};

// Payments
pub use payments::{NewPayment, Payment, PaymentService};

// Plans
pub use plans::{Plan, PlanStore};

// Settings
pub use settings::{OptimizationMode, RuntimeSettings, RuntimeSettingsUpdate, SettingsService};

// Subscriptions
pub use subscriptions::{ActivationResult, Subscription, SubscriptionService, SweepOutcome};

// Webhooks
pub use webhooks::{WebhookEnvelope, WebhookHandler, WebhookOutcome, verify_signature};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub audit: AuditLogger,
    pub entitlements: EntitlementService,
    pub invariants: InvariantChecker,
    pub invoices: InvoiceService,
    pub overrides: UsageOverrideService,
    pub payments: PaymentService,
    pub plans: PlanStore,
    pub settings: SettingsService,
    pub slots: AddonSlotService,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let webhooks = WebhookHandler::from_env(pool.clone())?;
        Ok(Self::with_webhooks(pool, webhooks))
    }

    /// Create a new billing service with an explicit webhook secret
    pub fn new(pool: PgPool, webhook_secret: String) -> Self {
        let webhooks = WebhookHandler::new(pool.clone(), webhook_secret);
        Self::with_webhooks(pool, webhooks)
    }

    fn with_webhooks(pool: PgPool, webhooks: WebhookHandler) -> Self {
        Self {
            audit: AuditLogger::new(pool.clone()),
            entitlements: EntitlementService::new(pool.clone()),
            invariants: InvariantChecker::new(pool.clone()),
            invoices: InvoiceService::new(pool.clone()),
            overrides: UsageOverrideService::new(pool.clone()),
            payments: PaymentService::new(pool.clone()),
            plans: PlanStore::new(pool.clone()),
            settings: SettingsService::new(pool.clone()),
            slots: AddonSlotService::new(pool.clone()),
            subscriptions: SubscriptionService::new(pool),
            webhooks,
        }
    }
}
