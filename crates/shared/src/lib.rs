#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shared domain types for AdPilot
//!
//! Value types used by the api, billing, and worker crates, plus database
//! pool construction and migration helpers. This crate must stay free of
//! business logic: anything that reads or writes billing state belongs in
//! `adpilot-billing`.

pub mod db;
pub mod types;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use types::{
    BillingCycle, LimitKey, PaymentPurpose, PaymentStatus, RemediationAction, ResourceKind,
    SubscriptionStatus,
};
