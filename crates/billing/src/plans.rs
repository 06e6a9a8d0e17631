//! Plan catalog
//!
//! Plans are plain rows; subscriptions copy their limit columns at
//! activation time and never read the live plan again, so editing a plan
//! here only affects future activations.

use adpilot_shared::{BillingCycle, LimitKey};
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// A subscription plan row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub price_cents: i64,
    pub billing_cycle: String,
    pub trial_days: i32,
    pub ai_campaign_limit: i32,
    pub ad_account_limit: i32,
    pub team_member_limit: i32,
    pub monthly_credits: i32,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Plan {
    pub fn cycle(&self) -> BillingResult<BillingCycle> {
        self.billing_cycle.parse().map_err(|_| {
            BillingError::InvariantViolation(format!(
                "plan {} has unknown billing cycle '{}'",
                self.code, self.billing_cycle
            ))
        })
    }

    /// The plan's limit for a given key (the value that gets snapshotted)
    pub fn limit_for(&self, key: LimitKey) -> i32 {
        match key {
            LimitKey::Campaigns => self.ai_campaign_limit,
            LimitKey::AdAccounts => self.ad_account_limit,
            LimitKey::TeamMembers => self.team_member_limit,
            LimitKey::Credits => self.monthly_credits,
        }
    }
}

const PLAN_COLUMNS: &str = "id, code, name, price_cents, billing_cycle, trial_days, \
     ai_campaign_limit, ad_account_limit, team_member_limit, monthly_credits, \
     is_active, created_at, updated_at";

/// Read access to the plan catalog
#[derive(Clone)]
pub struct PlanStore {
    pool: PgPool,
}

impl PlanStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, plan_id: Uuid) -> BillingResult<Plan> {
        let plan: Option<Plan> =
            sqlx::query_as(&format!("SELECT {PLAN_COLUMNS} FROM plans WHERE id = $1"))
                .bind(plan_id)
                .fetch_optional(&self.pool)
                .await?;
        plan.ok_or_else(|| BillingError::NotFound(format!("plan {plan_id} not found")))
    }

    pub async fn get_by_code(&self, code: &str) -> BillingResult<Plan> {
        let plan: Option<Plan> =
            sqlx::query_as(&format!("SELECT {PLAN_COLUMNS} FROM plans WHERE code = $1"))
                .bind(code)
                .fetch_optional(&self.pool)
                .await?;
        plan.ok_or_else(|| BillingError::NotFound(format!("plan '{code}' not found")))
    }

    /// Fetch a plan inside an open transaction (activation snapshots)
    pub async fn get_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        plan_id: Uuid,
    ) -> BillingResult<Plan> {
        let plan: Option<Plan> =
            sqlx::query_as(&format!("SELECT {PLAN_COLUMNS} FROM plans WHERE id = $1"))
                .bind(plan_id)
                .fetch_optional(&mut **tx)
                .await?;
        plan.ok_or_else(|| BillingError::NotFound(format!("plan {plan_id} not found")))
    }

    pub async fn list_active(&self) -> BillingResult<Vec<Plan>> {
        let plans: Vec<Plan> = sqlx::query_as(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE is_active ORDER BY price_cents"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(plans)
    }

    /// The plan new trials are created from
    ///
    /// Resolved through `runtime_settings.trial_plan_code`. A dangling code
    /// is a configuration defect, not a user error.
    pub async fn trial_plan(&self, trial_plan_code: &str) -> BillingResult<Plan> {
        self.get_by_code(trial_plan_code).await.map_err(|e| match e {
            BillingError::NotFound(_) => BillingError::InvariantViolation(format!(
                "trial plan '{trial_plan_code}' is not present in the plan catalog"
            )),
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_fixture() -> Plan {
        Plan {
            id: Uuid::new_v4(),
            code: "growth".to_string(),
            name: "Growth".to_string(),
            price_cents: 9900,
            billing_cycle: "monthly".to_string(),
            trial_days: 0,
            ai_campaign_limit: 10,
            ad_account_limit: 5,
            team_member_limit: 5,
            monthly_credits: 2000,
            is_active: true,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_limit_for_maps_every_key() {
        let plan = plan_fixture();
        assert_eq!(plan.limit_for(LimitKey::Campaigns), 10);
        assert_eq!(plan.limit_for(LimitKey::AdAccounts), 5);
        assert_eq!(plan.limit_for(LimitKey::TeamMembers), 5);
        assert_eq!(plan.limit_for(LimitKey::Credits), 2000);
    }

    #[test]
    fn test_unknown_cycle_is_invariant_violation() {
        let mut plan = plan_fixture();
        plan.billing_cycle = "weekly".to_string();
        assert!(matches!(
            plan.cycle(),
            Err(BillingError::InvariantViolation(_))
        ));
    }
}
