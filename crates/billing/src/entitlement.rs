//! Entitlement resolution
//!
//! Answers "may this user consume one more unit of a capacity-gated
//! resource?" by composing the runtime flags, the subscription limit
//! snapshot, any admin override, and the addon slot pool into a single
//! allow/deny decision.
//!
//! ## Design Principles
//!
//! 1. **Explicit loads**: all inputs are gathered by side-effect-free
//!    queries into an [`EntitlementSnapshot`]; no lazy traversal.
//! 2. **Pure decision**: [`evaluate_activation`] is deterministic over the
//!    snapshot and unit-testable without a database.
//! 3. **One write**: the only mutation an authorization can make is the
//!    addon-slot consumption (plus the action record), and both happen in
//!    the caller's transaction so they commit together with the caller's
//!    own resource-activation write.

use adpilot_shared::{LimitKey, RemediationAction, ResourceKind};
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::addon_slots::{AddonSlot, AddonSlotService, SlotPoolSummary};
use crate::error::{BillingError, BillingResult};
use crate::overrides::UsageOverrideService;
use crate::settings::{RuntimeSettings, SettingsService};
use crate::subscriptions::{Subscription, SubscriptionService};

/// Everything the activation decision depends on, loaded up front
#[derive(Debug, Clone)]
pub struct EntitlementSnapshot {
    pub now: OffsetDateTime,
    pub kill_switch: bool,
    pub mode_allows_activation: bool,
    pub daily_action_limit: i64,
    pub action_cooldown_minutes: i64,
    pub has_entitled_subscription: bool,
    pub effective_limit: i64,
    pub active_count: i64,
    pub actions_today: i64,
    pub last_action_at: Option<OffsetDateTime>,
    pub slots_available: i64,
    pub resource: ResourceKind,
}

/// How an allowed activation is to be satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityDecision {
    /// The plan/override limit has headroom; no slot needed
    WithinLimit,
    /// The limit is full; an addon slot must be consumed
    NeedsSlot,
}

/// Result of a transactional authorization
#[derive(Debug, Clone)]
pub struct AuthorizedActivation {
    pub decision: CapacityDecision,
    /// The slot consumed to satisfy the activation, when one was needed
    pub slot: Option<AddonSlot>,
}

/// Entitlement summary exposed to the account surface
#[derive(Debug, Clone, Serialize)]
pub struct EntitlementSummary {
    pub subscription: Option<Subscription>,
    pub effective_limits: Vec<EffectiveLimit>,
    pub slots: SlotPoolSummary,
    pub active_ai_campaigns: i64,
    pub active_ad_accounts: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EffectiveLimit {
    pub key: LimitKey,
    pub value: i64,
    /// True when an unexpired admin override shadows the plan snapshot
    pub overridden: bool,
}

/// Ordered activation checks, pure over the snapshot
///
/// Every failure mode is a distinct typed error; `Ok` carries whether the
/// activation fits the limit or must consume a slot.
pub fn evaluate_activation(snapshot: &EntitlementSnapshot) -> BillingResult<CapacityDecision> {
    if snapshot.kill_switch {
        return Err(BillingError::AutomationDisabled);
    }
    if !snapshot.mode_allows_activation {
        return Err(BillingError::FeatureDisabled(
            "ai optimization is turned off platform-wide".to_string(),
        ));
    }
    if snapshot.actions_today >= snapshot.daily_action_limit {
        return Err(BillingError::RateLimited {
            retry_after_seconds: seconds_until_next_utc_day(snapshot.now),
        });
    }
    if let Some(last) = snapshot.last_action_at {
        let cooldown = Duration::minutes(snapshot.action_cooldown_minutes);
        let elapsed = snapshot.now - last;
        if elapsed < cooldown {
            return Err(BillingError::CooldownActive {
                retry_after_seconds: (cooldown - elapsed).whole_seconds().max(1),
            });
        }
    }
    if !snapshot.has_entitled_subscription {
        return Err(BillingError::SubscriptionRequired);
    }
    if snapshot.active_count < snapshot.effective_limit {
        return Ok(CapacityDecision::WithinLimit);
    }
    if snapshot.resource.supports_addon_slots() && snapshot.slots_available > 0 {
        return Ok(CapacityDecision::NeedsSlot);
    }
    Err(BillingError::CapacityExceeded {
        limit: snapshot.effective_limit,
        action: if snapshot.resource.supports_addon_slots() {
            RemediationAction::BuySlots
        } else {
            RemediationAction::UpgradePlan
        },
    })
}

fn seconds_until_next_utc_day(now: OffsetDateTime) -> i64 {
    let next_midnight = now
        .date()
        .next_day()
        .map(|d| d.midnight().assume_utc())
        .unwrap_or(now);
    (next_midnight - now).whole_seconds().max(1)
}

/// Resolver composing settings, subscription snapshot, overrides, and slots
#[derive(Clone)]
pub struct EntitlementService {
    pool: PgPool,
    settings: SettingsService,
    subscriptions: SubscriptionService,
    overrides: UsageOverrideService,
    slots: AddonSlotService,
}

impl EntitlementService {
    pub fn new(pool: PgPool) -> Self {
        let settings = SettingsService::new(pool.clone());
        let subscriptions = SubscriptionService::new(pool.clone());
        let overrides = UsageOverrideService::new(pool.clone());
        let slots = AddonSlotService::new(pool.clone());
        Self {
            pool,
            settings,
            subscriptions,
            overrides,
            slots,
        }
    }

    /// Resolve the effective limit for (user, key)
    ///
    /// An unexpired override wins; otherwise the snapshot field on the
    /// current entitling subscription; with no subscription the limit is 0.
    /// This is the single implementation of override precedence; every
    /// other surface goes through it.
    pub async fn get_effective_limit(&self, user_id: Uuid, key: LimitKey) -> BillingResult<i64> {
        let subscription = self.subscriptions.current_for_user(user_id).await?;
        let (value, _) = self
            .resolve_limit(user_id, key, subscription.as_ref(), OffsetDateTime::now_utc())
            .await?;
        Ok(value)
    }

    async fn resolve_limit(
        &self,
        user_id: Uuid,
        key: LimitKey,
        subscription: Option<&Subscription>,
        now: OffsetDateTime,
    ) -> BillingResult<(i64, bool)> {
        if let Some(ovr) = self.overrides.get_active(user_id, key, now).await? {
            return Ok((i64::from(ovr.value), true));
        }
        match subscription {
            Some(sub) => Ok((i64::from(snapshot_limit(sub, key)), false)),
            None => Ok((0, false)),
        }
    }

    /// Read-only preflight: would an activation of `resource` be allowed?
    ///
    /// Performs the full ordered check including pool availability, but
    /// consumes nothing. `campaign_id` scopes the cooldown check; without it
    /// the cooldown stage is skipped.
    pub async fn assert_allowed(
        &self,
        user_id: Uuid,
        resource: ResourceKind,
        campaign_id: Option<Uuid>,
    ) -> BillingResult<CapacityDecision> {
        let snapshot = self.load_snapshot(user_id, resource, campaign_id).await?;
        evaluate_activation(&snapshot)
    }

    /// Authorize an AI activation inside the caller's transaction
    ///
    /// Re-runs the ordered checks against transaction-local reads, consumes
    /// an addon slot when the limit is full, and records the automation
    /// action. The caller performs its own activation write in the same
    /// transaction and commits; a rollback releases the slot lock with the
    /// row unchanged, so a slot can never be claimed without the activation
    /// it paid for.
    pub async fn authorize_activation(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        campaign_id: Uuid,
    ) -> BillingResult<AuthorizedActivation> {
        let resource = ResourceKind::AiCampaign;
        let mut snapshot = self
            .load_snapshot(user_id, resource, Some(campaign_id))
            .await?;

        // Re-count inside the transaction so the decision reflects writes
        // committed since the preflight load.
        snapshot.active_count = self.count_active_tx(tx, user_id, resource).await?;

        let decision = evaluate_activation(&snapshot)?;

        let slot = match decision {
            CapacityDecision::WithinLimit => None,
            CapacityDecision::NeedsSlot => {
                match self.slots.reserve(tx, user_id, campaign_id).await? {
                    Some(slot) => Some(slot),
                    // The pool emptied between the snapshot read and the
                    // locked reservation; surface the same typed denial a
                    // fresh check would have produced.
                    None => {
                        return Err(BillingError::CapacityExceeded {
                            limit: snapshot.effective_limit,
                            action: RemediationAction::BuySlots,
                        })
                    }
                }
            }
        };

        sqlx::query(
            r#"
            INSERT INTO automation_actions (user_id, campaign_id, action_type)
            VALUES ($1, $2, 'enable_ai_optimization')
            "#,
        )
        .bind(user_id)
        .bind(campaign_id)
        .execute(&mut **tx)
        .await?;

        Ok(AuthorizedActivation { decision, slot })
    }

    /// Account-surface summary of the user's entitlements
    pub async fn summary(&self, user_id: Uuid) -> BillingResult<EntitlementSummary> {
        let now = OffsetDateTime::now_utc();
        let subscription = self.subscriptions.current_for_user(user_id).await?;

        let mut effective_limits = Vec::with_capacity(4);
        for key in LimitKey::all() {
            let (value, overridden) = self
                .resolve_limit(user_id, key, subscription.as_ref(), now)
                .await?;
            effective_limits.push(EffectiveLimit {
                key,
                value,
                overridden,
            });
        }

        let slots = self.slots.pool_summary(user_id).await?;
        let active_ai_campaigns = self.count_active(user_id, ResourceKind::AiCampaign).await?;
        let active_ad_accounts = self.count_active(user_id, ResourceKind::AdAccount).await?;

        Ok(EntitlementSummary {
            subscription,
            effective_limits,
            slots,
            active_ai_campaigns,
            active_ad_accounts,
        })
    }

    async fn load_snapshot(
        &self,
        user_id: Uuid,
        resource: ResourceKind,
        campaign_id: Option<Uuid>,
    ) -> BillingResult<EntitlementSnapshot> {
        let now = OffsetDateTime::now_utc();
        let settings: RuntimeSettings = self.settings.load().await?;

        let subscription = self.subscriptions.current_for_user(user_id).await?;
        let (effective_limit, _) = self
            .resolve_limit(user_id, resource.limit_key(), subscription.as_ref(), now)
            .await?;
        let active_count = self.count_active(user_id, resource).await?;
        let actions_today = self.count_actions_today(user_id, now).await?;
        let last_action_at = match campaign_id {
            Some(campaign_id) => self.last_action_for_campaign(campaign_id).await?,
            None => None,
        };
        let slots_available = if resource.supports_addon_slots() {
            self.slots.available_count(user_id).await?
        } else {
            0
        };

        Ok(EntitlementSnapshot {
            now,
            kill_switch: settings.global_kill_switch,
            mode_allows_activation: settings.optimization_mode.allows_activation(),
            daily_action_limit: i64::from(settings.daily_action_limit),
            action_cooldown_minutes: i64::from(settings.action_cooldown_minutes),
            has_entitled_subscription: subscription.is_some(),
            effective_limit,
            active_count,
            actions_today,
            last_action_at,
            slots_available,
            resource,
        })
    }

    async fn count_active(&self, user_id: Uuid, resource: ResourceKind) -> BillingResult<i64> {
        let count: i64 = match resource {
            ResourceKind::AiCampaign => {
                sqlx::query_scalar(
                    r#"
                    SELECT COUNT(*) FROM campaigns
                    WHERE user_id = $1 AND ai_optimization_enabled AND status <> 'archived'
                    "#,
                )
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?
            }
            ResourceKind::AdAccount => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM ad_accounts WHERE user_id = $1 AND status = 'active'",
                )
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?
            }
        };
        Ok(count)
    }

    async fn count_active_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        resource: ResourceKind,
    ) -> BillingResult<i64> {
        let count: i64 = match resource {
            ResourceKind::AiCampaign => {
                sqlx::query_scalar(
                    r#"
                    SELECT COUNT(*) FROM campaigns
                    WHERE user_id = $1 AND ai_optimization_enabled AND status <> 'archived'
                    "#,
                )
                .bind(user_id)
                .fetch_one(&mut **tx)
                .await?
            }
            ResourceKind::AdAccount => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM ad_accounts WHERE user_id = $1 AND status = 'active'",
                )
                .bind(user_id)
                .fetch_one(&mut **tx)
                .await?
            }
        };
        Ok(count)
    }

    async fn count_actions_today(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<i64> {
        let day_start = now.date().midnight().assume_utc();
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM automation_actions WHERE user_id = $1 AND applied_at >= $2",
        )
        .bind(user_id)
        .bind(day_start)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn last_action_for_campaign(
        &self,
        campaign_id: Uuid,
    ) -> BillingResult<Option<OffsetDateTime>> {
        let last: Option<OffsetDateTime> = sqlx::query_scalar(
            "SELECT MAX(applied_at) FROM automation_actions WHERE campaign_id = $1",
        )
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(last)
    }
}

/// The subscription snapshot column backing a limit key
fn snapshot_limit(sub: &Subscription, key: LimitKey) -> i32 {
    match key {
        LimitKey::Campaigns => sub.ai_campaign_limit,
        LimitKey::AdAccounts => sub.ad_account_limit,
        LimitKey::TeamMembers => sub.team_member_limit,
        LimitKey::Credits => sub.monthly_credits,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_fixture() -> EntitlementSnapshot {
        EntitlementSnapshot {
            now: OffsetDateTime::now_utc(),
            kill_switch: false,
            mode_allows_activation: true,
            daily_action_limit: 50,
            action_cooldown_minutes: 60,
            has_entitled_subscription: true,
            effective_limit: 3,
            active_count: 0,
            actions_today: 0,
            last_action_at: None,
            slots_available: 0,
            resource: ResourceKind::AiCampaign,
        }
    }

    #[test]
    fn test_allow_within_limit() {
        let snapshot = snapshot_fixture();
        assert_eq!(
            evaluate_activation(&snapshot).unwrap(),
            CapacityDecision::WithinLimit
        );
    }

    #[test]
    fn test_kill_switch_checked_first() {
        let mut snapshot = snapshot_fixture();
        snapshot.kill_switch = true;
        // Even with every other gate failing, the kill switch wins
        snapshot.has_entitled_subscription = false;
        snapshot.actions_today = 1_000;
        assert!(matches!(
            evaluate_activation(&snapshot),
            Err(BillingError::AutomationDisabled)
        ));
    }

    #[test]
    fn test_mode_off_is_feature_disabled() {
        let mut snapshot = snapshot_fixture();
        snapshot.mode_allows_activation = false;
        assert!(matches!(
            evaluate_activation(&snapshot),
            Err(BillingError::FeatureDisabled(_))
        ));
    }

    #[test]
    fn test_daily_budget_exhausted_is_rate_limited() {
        let mut snapshot = snapshot_fixture();
        snapshot.actions_today = 50;
        match evaluate_activation(&snapshot) {
            Err(BillingError::RateLimited {
                retry_after_seconds,
            }) => {
                assert!(retry_after_seconds >= 1);
                assert!(retry_after_seconds <= 86_400);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn test_cooldown_blocks_until_elapsed() {
        let mut snapshot = snapshot_fixture();
        snapshot.last_action_at = Some(snapshot.now - Duration::minutes(10));
        match evaluate_activation(&snapshot) {
            Err(BillingError::CooldownActive {
                retry_after_seconds,
            }) => {
                // 60 minute cooldown, 10 elapsed
                assert!(retry_after_seconds > 49 * 60);
                assert!(retry_after_seconds <= 50 * 60);
            }
            other => panic!("expected CooldownActive, got {other:?}"),
        }
    }

    #[test]
    fn test_cooldown_elapsed_allows() {
        let mut snapshot = snapshot_fixture();
        snapshot.last_action_at = Some(snapshot.now - Duration::minutes(61));
        assert!(evaluate_activation(&snapshot).is_ok());
    }

    #[test]
    fn test_no_subscription_is_denied() {
        let mut snapshot = snapshot_fixture();
        snapshot.has_entitled_subscription = false;
        assert!(matches!(
            evaluate_activation(&snapshot),
            Err(BillingError::SubscriptionRequired)
        ));
    }

    #[test]
    fn test_limit_full_with_slot_needs_slot() {
        let mut snapshot = snapshot_fixture();
        snapshot.active_count = 3;
        snapshot.slots_available = 1;
        assert_eq!(
            evaluate_activation(&snapshot).unwrap(),
            CapacityDecision::NeedsSlot
        );
    }

    #[test]
    fn test_limit_full_without_slot_advises_buying() {
        let mut snapshot = snapshot_fixture();
        snapshot.active_count = 3;
        snapshot.slots_available = 0;
        match evaluate_activation(&snapshot) {
            Err(BillingError::CapacityExceeded { limit, action }) => {
                assert_eq!(limit, 3);
                assert_eq!(action, RemediationAction::BuySlots);
            }
            other => panic!("expected CapacityExceeded, got {other:?}"),
        }
    }

    #[test]
    fn test_ad_account_capacity_advises_upgrade() {
        let mut snapshot = snapshot_fixture();
        snapshot.resource = ResourceKind::AdAccount;
        snapshot.effective_limit = 2;
        snapshot.active_count = 2;
        // Slot pool must be irrelevant for ad accounts
        snapshot.slots_available = 5;
        match evaluate_activation(&snapshot) {
            Err(BillingError::CapacityExceeded { action, .. }) => {
                assert_eq!(action, RemediationAction::UpgradePlan);
            }
            other => panic!("expected CapacityExceeded, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_limit_without_slots_is_exceeded() {
        let mut snapshot = snapshot_fixture();
        snapshot.effective_limit = 0;
        assert!(matches!(
            evaluate_activation(&snapshot),
            Err(BillingError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn test_seconds_until_next_utc_day_bounds() {
        let now = OffsetDateTime::now_utc();
        let secs = seconds_until_next_utc_day(now);
        assert!(secs >= 1);
        assert!(secs <= 86_400);
    }
}
