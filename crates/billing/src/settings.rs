//! Runtime enforcement settings
//!
//! A single versioned configuration row holding the global kill-switch,
//! the optimization mode toggle, and the enforcement knobs (daily action
//! budget, cooldown, grace window, slot validity). Enforcement code loads a
//! snapshot once per check and decides against that snapshot; there are no
//! ambient process-wide flags. Admin updates bump `version` and are audited
//! in the same transaction.

use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{ActorType, AuditEventBuilder, AuditEventType, AuditLogger};
use crate::error::{BillingError, BillingResult};

/// Platform-wide AI optimization mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationMode {
    /// AI features fully off (stronger than the kill-switch message-wise:
    /// this is a product decision, not an emergency stop)
    Off,
    /// AI may suggest changes; nothing is applied automatically
    Suggest,
    /// AI may apply changes automatically
    Auto,
}

impl OptimizationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizationMode::Off => "off",
            OptimizationMode::Suggest => "suggest",
            OptimizationMode::Auto => "auto",
        }
    }

    /// Whether enabling AI optimization on a campaign is permitted
    pub fn allows_activation(&self) -> bool {
        !matches!(self, OptimizationMode::Off)
    }
}

impl std::str::FromStr for OptimizationMode {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(OptimizationMode::Off),
            "suggest" => Ok(OptimizationMode::Suggest),
            "auto" => Ok(OptimizationMode::Auto),
            other => Err(BillingError::Validation(format!(
                "invalid optimization mode '{other}' (expected off, suggest, or auto)"
            ))),
        }
    }
}

impl std::fmt::Display for OptimizationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable snapshot of the runtime settings row
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSettings {
    pub version: i64,
    pub global_kill_switch: bool,
    pub optimization_mode: OptimizationMode,
    pub daily_action_limit: i32,
    pub action_cooldown_minutes: i32,
    pub grace_window_days: i32,
    pub addon_slot_validity_days: i32,
    pub trial_plan_code: String,
    pub updated_at: OffsetDateTime,
}

/// Fields an admin can change; `None` leaves the current value in place
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeSettingsUpdate {
    pub global_kill_switch: Option<bool>,
    pub optimization_mode: Option<OptimizationMode>,
    pub daily_action_limit: Option<i32>,
    pub action_cooldown_minutes: Option<i32>,
    pub grace_window_days: Option<i32>,
    pub addon_slot_validity_days: Option<i32>,
    pub trial_plan_code: Option<String>,
}

impl RuntimeSettingsUpdate {
    fn is_empty(&self) -> bool {
        self.global_kill_switch.is_none()
            && self.optimization_mode.is_none()
            && self.daily_action_limit.is_none()
            && self.action_cooldown_minutes.is_none()
            && self.grace_window_days.is_none()
            && self.addon_slot_validity_days.is_none()
            && self.trial_plan_code.is_none()
    }

    fn validate(&self) -> BillingResult<()> {
        if let Some(limit) = self.daily_action_limit {
            if limit < 0 {
                return Err(BillingError::Validation(
                    "daily_action_limit must be >= 0".to_string(),
                ));
            }
        }
        if let Some(minutes) = self.action_cooldown_minutes {
            if minutes < 0 {
                return Err(BillingError::Validation(
                    "action_cooldown_minutes must be >= 0".to_string(),
                ));
            }
        }
        if let Some(days) = self.grace_window_days {
            if days < 1 {
                return Err(BillingError::Validation(
                    "grace_window_days must be >= 1".to_string(),
                ));
            }
        }
        if let Some(days) = self.addon_slot_validity_days {
            if days < 1 {
                return Err(BillingError::Validation(
                    "addon_slot_validity_days must be >= 1".to_string(),
                ));
            }
        }
        if let Some(code) = &self.trial_plan_code {
            if code.trim().is_empty() {
                return Err(BillingError::Validation(
                    "trial_plan_code must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Loader/updater for the runtime settings record
#[derive(Clone)]
pub struct SettingsService {
    pool: PgPool,
    audit: AuditLogger,
}

impl SettingsService {
    pub fn new(pool: PgPool) -> Self {
        let audit = AuditLogger::new(pool.clone());
        Self { pool, audit }
    }

    /// Load the current settings snapshot
    ///
    /// The row is seeded by migration; its absence is a deployment defect.
    pub async fn load(&self) -> BillingResult<RuntimeSettings> {
        let row = sqlx::query(
            r#"
            SELECT version, global_kill_switch, optimization_mode, daily_action_limit,
                   action_cooldown_minutes, grace_window_days, addon_slot_validity_days,
                   trial_plan_code, updated_at
            FROM runtime_settings
            WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            BillingError::InvariantViolation("runtime_settings row is missing".to_string())
        })?;

        let mode: String = row.try_get("optimization_mode")?;
        Ok(RuntimeSettings {
            version: row.try_get("version")?,
            global_kill_switch: row.try_get("global_kill_switch")?,
            optimization_mode: mode.parse()?,
            daily_action_limit: row.try_get("daily_action_limit")?,
            action_cooldown_minutes: row.try_get("action_cooldown_minutes")?,
            grace_window_days: row.try_get("grace_window_days")?,
            addon_slot_validity_days: row.try_get("addon_slot_validity_days")?,
            trial_plan_code: row.try_get("trial_plan_code")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// Apply an admin update, bumping the version and auditing before/after
    pub async fn update(
        &self,
        admin_id: Uuid,
        update: RuntimeSettingsUpdate,
        reason: &str,
    ) -> BillingResult<RuntimeSettings> {
        if reason.trim().is_empty() {
            return Err(BillingError::Validation(
                "a non-empty reason is required for settings changes".to_string(),
            ));
        }
        if update.is_empty() {
            return Err(BillingError::Validation(
                "settings update contains no changes".to_string(),
            ));
        }
        update.validate()?;

        let before = self.load().await?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE runtime_settings SET
                version = version + 1,
                global_kill_switch = COALESCE($1, global_kill_switch),
                optimization_mode = COALESCE($2, optimization_mode),
                daily_action_limit = COALESCE($3, daily_action_limit),
                action_cooldown_minutes = COALESCE($4, action_cooldown_minutes),
                grace_window_days = COALESCE($5, grace_window_days),
                addon_slot_validity_days = COALESCE($6, addon_slot_validity_days),
                trial_plan_code = COALESCE($7, trial_plan_code),
                updated_by = $8,
                updated_at = NOW()
            WHERE id = 1
            "#,
        )
        .bind(update.global_kill_switch)
        .bind(update.optimization_mode.map(|m| m.as_str()))
        .bind(update.daily_action_limit)
        .bind(update.action_cooldown_minutes)
        .bind(update.grace_window_days)
        .bind(update.addon_slot_validity_days)
        .bind(&update.trial_plan_code)
        .bind(admin_id)
        .execute(&mut *tx)
        .await?;

        self.audit
            .log_tx(
                &mut tx,
                AuditEventBuilder::platform(AuditEventType::SettingsUpdated)
                    .actor(ActorType::Admin, admin_id)
                    .reason(reason)
                    .data(serde_json::json!({
                        "before": {
                            "version": before.version,
                            "global_kill_switch": before.global_kill_switch,
                            "optimization_mode": before.optimization_mode.as_str(),
                            "daily_action_limit": before.daily_action_limit,
                            "action_cooldown_minutes": before.action_cooldown_minutes,
                            "grace_window_days": before.grace_window_days,
                            "addon_slot_validity_days": before.addon_slot_validity_days,
                            "trial_plan_code": before.trial_plan_code,
                        },
                        "changes": {
                            "global_kill_switch": update.global_kill_switch,
                            "optimization_mode": update.optimization_mode.map(|m| m.as_str()),
                            "daily_action_limit": update.daily_action_limit,
                            "action_cooldown_minutes": update.action_cooldown_minutes,
                            "grace_window_days": update.grace_window_days,
                            "addon_slot_validity_days": update.addon_slot_validity_days,
                            "trial_plan_code": update.trial_plan_code,
                        },
                    })),
            )
            .await?;

        tx.commit().await?;

        let after = self.load().await?;
        tracing::info!(
            admin_id = %admin_id,
            version = after.version,
            kill_switch = after.global_kill_switch,
            mode = %after.optimization_mode,
            "Runtime settings updated"
        );
        Ok(after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_mode_parsing() {
        assert_eq!(
            OptimizationMode::from_str("auto").unwrap(),
            OptimizationMode::Auto
        );
        assert!(OptimizationMode::from_str("aggressive").is_err());
    }

    #[test]
    fn test_mode_activation_gate() {
        assert!(!OptimizationMode::Off.allows_activation());
        assert!(OptimizationMode::Suggest.allows_activation());
        assert!(OptimizationMode::Auto.allows_activation());
    }

    #[test]
    fn test_empty_update_detected() {
        assert!(RuntimeSettingsUpdate::default().is_empty());
        let update = RuntimeSettingsUpdate {
            global_kill_switch: Some(true),
            ..Default::default()
        };
        assert!(!update.is_empty());
    }

    #[test]
    fn test_update_validation_bounds() {
        let update = RuntimeSettingsUpdate {
            daily_action_limit: Some(-1),
            ..Default::default()
        };
        assert!(update.validate().is_err());

        let update = RuntimeSettingsUpdate {
            grace_window_days: Some(0),
            ..Default::default()
        };
        assert!(update.validate().is_err());

        let update = RuntimeSettingsUpdate {
            trial_plan_code: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(update.validate().is_err());

        let update = RuntimeSettingsUpdate {
            daily_action_limit: Some(0),
            grace_window_days: Some(7),
            ..Default::default()
        };
        assert!(update.validate().is_ok());
    }
}
