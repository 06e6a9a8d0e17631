//! Core billing domain enums
//!
//! These enums are persisted as lowercase snake_case text columns. Parsing is
//! strict: an unknown value in the database is a data defect and surfaces as
//! an error instead of being silently coerced.

use serde::{Deserialize, Serialize};

/// Error returned when a persisted enum column holds an unknown value
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind} value '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Subscription lifecycle status
///
/// Legal transitions: `pending -> active <-> grace -> expired`,
/// `trial -> active | expired`, and any non-terminal status `-> canceled`.
/// `expired` and `canceled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Pending,
    Trial,
    Active,
    Grace,
    Expired,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Grace => "grace",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    /// Terminal statuses can never be left
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Expired | SubscriptionStatus::Canceled
        )
    }

    /// Statuses that grant entitlement (at most one per user at a time)
    pub fn is_entitled(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trial | SubscriptionStatus::Active | SubscriptionStatus::Grace
        )
    }

    /// Whether the state machine permits moving from `self` to `to`
    pub fn can_transition_to(&self, to: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, to) {
            // Any non-terminal status can be canceled
            (_, Canceled) => true,
            (Pending, Active) => true,
            (Trial, Active) | (Trial, Expired) => true,
            (Active, Grace) | (Active, Expired) => true,
            (Grace, Active) | (Grace, Expired) => true,
            _ => false,
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SubscriptionStatus::Pending),
            "trial" => Ok(SubscriptionStatus::Trial),
            "active" => Ok(SubscriptionStatus::Active),
            "grace" => Ok(SubscriptionStatus::Grace),
            "expired" => Ok(SubscriptionStatus::Expired),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            other => Err(UnknownVariant {
                kind: "subscription status",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Keys a usage override (and the matching plan snapshot column) can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKey {
    Campaigns,
    AdAccounts,
    TeamMembers,
    Credits,
}

impl LimitKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKey::Campaigns => "campaigns",
            LimitKey::AdAccounts => "ad_accounts",
            LimitKey::TeamMembers => "team_members",
            LimitKey::Credits => "credits",
        }
    }

    pub fn all() -> [LimitKey; 4] {
        [
            LimitKey::Campaigns,
            LimitKey::AdAccounts,
            LimitKey::TeamMembers,
            LimitKey::Credits,
        ]
    }
}

impl std::str::FromStr for LimitKey {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "campaigns" => Ok(LimitKey::Campaigns),
            "ad_accounts" => Ok(LimitKey::AdAccounts),
            "team_members" => Ok(LimitKey::TeamMembers),
            "credits" => Ok(LimitKey::Credits),
            other => Err(UnknownVariant {
                kind: "limit key",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for LimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Capacity-gated resource kinds the entitlement resolver understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// An AI-optimized campaign slot (addon slots can extend this pool)
    AiCampaign,
    /// A connected ad account (plan-limited only, no addon pool)
    AdAccount,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::AiCampaign => "ai_campaign",
            ResourceKind::AdAccount => "ad_account",
        }
    }

    /// The limit key whose effective value caps this resource
    pub fn limit_key(&self) -> LimitKey {
        match self {
            ResourceKind::AiCampaign => LimitKey::Campaigns,
            ResourceKind::AdAccount => LimitKey::AdAccounts,
        }
    }

    /// Only AI campaign capacity can be extended by purchased addon slots
    pub fn supports_addon_slots(&self) -> bool {
        matches!(self, ResourceKind::AiCampaign)
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payment record status; `created -> captured` is the idempotent hot path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Created,
    Captured,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Created => "created",
            PaymentStatus::Captured => "captured",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(PaymentStatus::Created),
            "captured" => Ok(PaymentStatus::Captured),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(UnknownVariant {
                kind: "payment status",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a payment was taken for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentPurpose {
    Subscription,
    AddonSlots,
}

impl PaymentPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentPurpose::Subscription => "subscription",
            PaymentPurpose::AddonSlots => "addon_slots",
        }
    }
}

impl std::str::FromStr for PaymentPurpose {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscription" => Ok(PaymentPurpose::Subscription),
            "addon_slots" => Ok(PaymentPurpose::AddonSlots),
            other => Err(UnknownVariant {
                kind: "payment purpose",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for PaymentPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Billing cycle of a plan/subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
        }
    }

    /// Length of one billing period in whole days
    pub fn period_days(&self) -> i64 {
        match self {
            BillingCycle::Monthly => 30,
            BillingCycle::Yearly => 365,
        }
    }
}

impl std::str::FromStr for BillingCycle {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" => Ok(BillingCycle::Monthly),
            "yearly" => Ok(BillingCycle::Yearly),
            other => Err(UnknownVariant {
                kind: "billing cycle",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Machine-readable remediation hint attached to a capacity denial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    /// A bigger plan would raise the limit
    UpgradePlan,
    /// Purchasing addon slots would extend the pool
    BuySlots,
    /// The denial is transient (cooldown / rate limit); retry later
    Wait,
}

impl RemediationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemediationAction::UpgradePlan => "upgrade_plan",
            RemediationAction::BuySlots => "buy_slots",
            RemediationAction::Wait => "wait",
        }
    }
}

impl std::fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_round_trip() {
        for s in [
            SubscriptionStatus::Pending,
            SubscriptionStatus::Trial,
            SubscriptionStatus::Active,
            SubscriptionStatus::Grace,
            SubscriptionStatus::Expired,
            SubscriptionStatus::Canceled,
        ] {
            assert_eq!(SubscriptionStatus::from_str(s.as_str()).unwrap(), s);
        }
    }

    #[test]
    fn test_unknown_status_is_error() {
        assert!(SubscriptionStatus::from_str("paused").is_err());
        assert!(SubscriptionStatus::from_str("").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(SubscriptionStatus::Expired.is_terminal());
        assert!(SubscriptionStatus::Canceled.is_terminal());
        assert!(!SubscriptionStatus::Grace.is_terminal());
        assert!(!SubscriptionStatus::Trial.is_terminal());
    }

    #[test]
    fn test_entitled_statuses() {
        assert!(SubscriptionStatus::Trial.is_entitled());
        assert!(SubscriptionStatus::Active.is_entitled());
        assert!(SubscriptionStatus::Grace.is_entitled());
        assert!(!SubscriptionStatus::Pending.is_entitled());
        assert!(!SubscriptionStatus::Expired.is_entitled());
    }

    #[test]
    fn test_legal_transitions() {
        use SubscriptionStatus::*;
        assert!(Pending.can_transition_to(Active));
        assert!(Trial.can_transition_to(Active));
        assert!(Trial.can_transition_to(Expired));
        assert!(Active.can_transition_to(Grace));
        assert!(Grace.can_transition_to(Active));
        assert!(Grace.can_transition_to(Expired));
        assert!(Active.can_transition_to(Canceled));
        assert!(Trial.can_transition_to(Canceled));
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        use SubscriptionStatus::*;
        for to in [Pending, Trial, Active, Grace, Expired, Canceled] {
            assert!(!Expired.can_transition_to(to), "expired -> {to} must be illegal");
            assert!(!Canceled.can_transition_to(to), "canceled -> {to} must be illegal");
        }
    }

    #[test]
    fn test_illegal_forward_jumps() {
        use SubscriptionStatus::*;
        assert!(!Pending.can_transition_to(Grace));
        assert!(!Pending.can_transition_to(Trial));
        assert!(!Trial.can_transition_to(Grace));
        assert!(!Active.can_transition_to(Trial));
    }

    #[test]
    fn test_limit_key_round_trip() {
        for key in LimitKey::all() {
            assert_eq!(LimitKey::from_str(key.as_str()).unwrap(), key);
        }
        assert!(LimitKey::from_str("mcps").is_err());
    }

    #[test]
    fn test_resource_kind_limit_keys() {
        assert_eq!(ResourceKind::AiCampaign.limit_key(), LimitKey::Campaigns);
        assert_eq!(ResourceKind::AdAccount.limit_key(), LimitKey::AdAccounts);
        assert!(ResourceKind::AiCampaign.supports_addon_slots());
        assert!(!ResourceKind::AdAccount.supports_addon_slots());
    }

    #[test]
    fn test_remediation_action_wire_format() {
        assert_eq!(
            serde_json::to_string(&RemediationAction::UpgradePlan).unwrap(),
            "\"upgrade_plan\""
        );
        assert_eq!(
            serde_json::to_string(&RemediationAction::BuySlots).unwrap(),
            "\"buy_slots\""
        );
        assert_eq!(serde_json::to_string(&RemediationAction::Wait).unwrap(), "\"wait\"");
    }

    #[test]
    fn test_billing_cycle_period_days() {
        assert_eq!(BillingCycle::Monthly.period_days(), 30);
        assert_eq!(BillingCycle::Yearly.period_days(), 365);
    }
}
