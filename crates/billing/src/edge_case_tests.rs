// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing System
//!
//! Tests critical boundary conditions in:
//! - Entitlement decisions (ENT-01 to ENT-10)
//! - Subscription state machine (SUB-01 to SUB-06)
//! - Webhook verification and parsing (WH-01 to WH-07)
//! - Overrides and slots (OVR-01 to OVR-04)

#[cfg(test)]
mod entitlement_decision_tests {
    use crate::entitlement::{evaluate_activation, CapacityDecision, EntitlementSnapshot};
    use crate::error::BillingError;
    use adpilot_shared::{RemediationAction, ResourceKind};
    use time::OffsetDateTime;

    fn snapshot(limit: i64, active: i64, slots: i64) -> EntitlementSnapshot {
        EntitlementSnapshot {
            now: OffsetDateTime::now_utc(),
            kill_switch: false,
            mode_allows_activation: true,
            daily_action_limit: 50,
            action_cooldown_minutes: 60,
            has_entitled_subscription: true,
            effective_limit: limit,
            active_count: active,
            actions_today: 0,
            last_action_at: None,
            slots_available: slots,
            resource: ResourceKind::AiCampaign,
        }
    }

    // =========================================================================
    // ENT-01: limit 3, 2 active - within limit, no slot touched
    // =========================================================================
    #[test]
    fn test_one_below_limit_allows_without_slot() {
        let result = evaluate_activation(&snapshot(3, 2, 5)).unwrap();
        assert_eq!(result, CapacityDecision::WithinLimit);
    }

    // =========================================================================
    // ENT-02: limit 3, 3 active, 1 slot - 4th activation rides the slot
    // =========================================================================
    #[test]
    fn test_at_limit_with_slot_needs_slot() {
        let result = evaluate_activation(&snapshot(3, 3, 1)).unwrap();
        assert_eq!(result, CapacityDecision::NeedsSlot);
    }

    // =========================================================================
    // ENT-03: limit 3, 4 active (one via slot), pool empty - 5th is denied
    //         with buy_slots
    // =========================================================================
    #[test]
    fn test_past_limit_with_empty_pool_denied_buy_slots() {
        match evaluate_activation(&snapshot(3, 4, 0)) {
            Err(BillingError::CapacityExceeded { limit, action }) => {
                assert_eq!(limit, 3);
                assert_eq!(action, RemediationAction::BuySlots);
            }
            other => panic!("expected CapacityExceeded, got {other:?}"),
        }
    }

    // =========================================================================
    // ENT-04: active_count exactly at limit, no slots - denied, not allowed
    // =========================================================================
    #[test]
    fn test_exactly_at_limit_without_slots_denied() {
        assert!(matches!(
            evaluate_activation(&snapshot(3, 3, 0)),
            Err(BillingError::CapacityExceeded { .. })
        ));
    }

    // =========================================================================
    // ENT-05: daily budget at limit-1 allows, at limit denies
    // =========================================================================
    #[test]
    fn test_daily_budget_boundary() {
        let mut snap = snapshot(3, 0, 0);
        snap.actions_today = 49;
        assert!(evaluate_activation(&snap).is_ok());

        snap.actions_today = 50;
        assert!(matches!(
            evaluate_activation(&snap),
            Err(BillingError::RateLimited { .. })
        ));
    }

    // =========================================================================
    // ENT-06: cooldown boundary - one second short blocks, exact elapse allows
    // =========================================================================
    #[test]
    fn test_cooldown_boundary() {
        use time::Duration;
        let mut snap = snapshot(3, 0, 0);

        snap.last_action_at = Some(snap.now - Duration::minutes(60) + Duration::seconds(1));
        assert!(matches!(
            evaluate_activation(&snap),
            Err(BillingError::CooldownActive { .. })
        ));

        snap.last_action_at = Some(snap.now - Duration::minutes(60));
        assert!(evaluate_activation(&snap).is_ok());
    }

    // =========================================================================
    // ENT-07: check ordering - kill switch outranks rate limit outranks
    //         cooldown outranks missing subscription
    // =========================================================================
    #[test]
    fn test_check_ordering() {
        use time::Duration;
        let mut snap = snapshot(3, 3, 0);
        snap.actions_today = 1_000;
        snap.last_action_at = Some(snap.now);
        snap.has_entitled_subscription = false;

        snap.kill_switch = true;
        assert!(matches!(
            evaluate_activation(&snap),
            Err(BillingError::AutomationDisabled)
        ));

        snap.kill_switch = false;
        snap.mode_allows_activation = false;
        assert!(matches!(
            evaluate_activation(&snap),
            Err(BillingError::FeatureDisabled(_))
        ));

        snap.mode_allows_activation = true;
        assert!(matches!(
            evaluate_activation(&snap),
            Err(BillingError::RateLimited { .. })
        ));

        snap.actions_today = 0;
        assert!(matches!(
            evaluate_activation(&snap),
            Err(BillingError::CooldownActive { .. })
        ));

        snap.last_action_at = Some(snap.now - Duration::hours(2));
        assert!(matches!(
            evaluate_activation(&snap),
            Err(BillingError::SubscriptionRequired)
        ));
    }

    // =========================================================================
    // ENT-08: zero-limit user with slots still activates through the pool
    // =========================================================================
    #[test]
    fn test_zero_limit_with_slots_uses_pool() {
        let result = evaluate_activation(&snapshot(0, 0, 2)).unwrap();
        assert_eq!(result, CapacityDecision::NeedsSlot);
    }

    // =========================================================================
    // ENT-09: ad accounts never consult the slot pool
    // =========================================================================
    #[test]
    fn test_ad_accounts_ignore_slot_pool() {
        let mut snap = snapshot(2, 2, 10);
        snap.resource = ResourceKind::AdAccount;
        match evaluate_activation(&snap) {
            Err(BillingError::CapacityExceeded { action, .. }) => {
                assert_eq!(action, RemediationAction::UpgradePlan);
            }
            other => panic!("expected CapacityExceeded, got {other:?}"),
        }
    }

    // =========================================================================
    // ENT-10: denial is side-effect free by construction (pure function);
    //         repeated evaluation is stable
    // =========================================================================
    #[test]
    fn test_evaluation_is_deterministic() {
        let snap = snapshot(3, 3, 0);
        for _ in 0..3 {
            assert!(matches!(
                evaluate_activation(&snap),
                Err(BillingError::CapacityExceeded { limit: 3, .. })
            ));
        }
    }
}

#[cfg(test)]
mod subscription_state_tests {
    use adpilot_shared::SubscriptionStatus::*;

    // =========================================================================
    // SUB-01: full legal-transition matrix
    // =========================================================================
    #[test]
    fn test_transition_matrix() {
        let legal = [
            (Pending, Active),
            (Pending, Canceled),
            (Trial, Active),
            (Trial, Expired),
            (Trial, Canceled),
            (Active, Grace),
            (Active, Expired),
            (Active, Canceled),
            (Grace, Active),
            (Grace, Expired),
            (Grace, Canceled),
        ];
        for (from, to) in legal {
            assert!(from.can_transition_to(to), "{from} -> {to} must be legal");
        }

        let illegal = [
            (Pending, Trial),
            (Pending, Grace),
            (Pending, Expired),
            (Trial, Grace),
            (Active, Trial),
            (Active, Pending),
            (Grace, Trial),
            (Grace, Pending),
        ];
        for (from, to) in illegal {
            assert!(!from.can_transition_to(to), "{from} -> {to} must be illegal");
        }
    }

    // =========================================================================
    // SUB-02: expired and canceled absorb everything
    // =========================================================================
    #[test]
    fn test_terminal_absorption() {
        for terminal in [Expired, Canceled] {
            for to in [Pending, Trial, Active, Grace, Expired, Canceled] {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    // =========================================================================
    // SUB-03: entitled set is exactly {trial, active, grace}
    // =========================================================================
    #[test]
    fn test_entitled_set() {
        assert!(Trial.is_entitled());
        assert!(Active.is_entitled());
        assert!(Grace.is_entitled());
        assert!(!Pending.is_entitled());
        assert!(!Expired.is_entitled());
        assert!(!Canceled.is_entitled());
    }
}

#[cfg(test)]
mod webhook_tests {
    use crate::webhooks::{verify_signature, WebhookEnvelope};

    fn sign(secret: &str, body: &[u8]) -> String {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    // =========================================================================
    // WH-01: known-answer vector (RFC 4231-style check against another impl)
    // =========================================================================
    #[test]
    fn test_known_answer_vector() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        let expected = "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8";
        assert!(verify_signature(
            "key",
            b"The quick brown fox jumps over the lazy dog",
            expected
        ));
    }

    // =========================================================================
    // WH-02: uppercase hex of the same digest also verifies
    // =========================================================================
    #[test]
    fn test_uppercase_hex_accepted() {
        let body = b"payload";
        let signature = sign("secret", body).to_uppercase();
        assert!(verify_signature("secret", body, &signature));
    }

    // =========================================================================
    // WH-03: empty body still signs and verifies
    // =========================================================================
    #[test]
    fn test_empty_body() {
        let signature = sign("secret", b"");
        assert!(verify_signature("secret", b"", &signature));
        assert!(!verify_signature("secret", b"x", &signature));
    }

    // =========================================================================
    // WH-04: signature of a different body never verifies
    // =========================================================================
    #[test]
    fn test_cross_body_signature_rejected() {
        let signature = sign("secret", b"body-a");
        assert!(!verify_signature("secret", b"body-b", &signature));
    }

    // =========================================================================
    // WH-05: all routed event names parse as envelopes
    // =========================================================================
    #[test]
    fn test_routed_event_names() {
        let routed = [
            "payment.captured",
            "payment.failed",
            "invoice.paid",
            "subscription.pending",
            "subscription.activated",
            "subscription.charged",
            "subscription.paused",
            "subscription.cancelled",
            "subscription.completed",
        ];
        for event in routed {
            let body = format!(r#"{{"event":"{event}","payload":{{}}}}"#);
            let envelope: WebhookEnvelope = serde_json::from_str(&body).unwrap();
            assert_eq!(envelope.event, event);
        }
        assert_eq!(routed.len(), 9, "9 routed event types");
    }

    // =========================================================================
    // WH-06: unknown event types still parse (they are acknowledged, not
    //        rejected)
    // =========================================================================
    #[test]
    fn test_unknown_event_parses() {
        let envelope: WebhookEnvelope = serde_json::from_str(
            r#"{"event":"order.paid","payload":{"order":{"entity":{"id":"order_x"}}}}"#,
        )
        .unwrap();
        assert_eq!(envelope.event, "order.paid");
    }

    // =========================================================================
    // WH-07: a body that is not JSON is a parse failure, not a panic
    // =========================================================================
    #[test]
    fn test_garbage_body_fails_parse() {
        let result: Result<WebhookEnvelope, _> = serde_json::from_slice(b"\x00\x01\x02");
        assert!(result.is_err());
    }
}

#[cfg(test)]
mod override_and_slot_tests {
    use crate::addon_slots::AddonSlot;
    use crate::overrides::UsageOverride;
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    // =========================================================================
    // OVR-01: override with expiry in the past no longer applies, without
    //         any explicit deletion
    // =========================================================================
    #[test]
    fn test_expired_override_reverts_silently() {
        let now = OffsetDateTime::now_utc();
        let ovr = UsageOverride {
            user_id: Uuid::new_v4(),
            override_key: "campaigns".to_string(),
            value: 50,
            expires_at: Some(now - Duration::seconds(1)),
            updated_by: Uuid::new_v4(),
            updated_at: now - Duration::days(7),
        };
        assert!(!ovr.is_active(now));
    }

    // =========================================================================
    // OVR-02: override with no expiry applies indefinitely
    // =========================================================================
    #[test]
    fn test_open_ended_override() {
        let now = OffsetDateTime::now_utc();
        let ovr = UsageOverride {
            user_id: Uuid::new_v4(),
            override_key: "credits".to_string(),
            value: 0,
            expires_at: None,
            updated_by: Uuid::new_v4(),
            updated_at: now,
        };
        assert!(ovr.is_active(now + Duration::days(365 * 10)));
    }

    // =========================================================================
    // OVR-03: a slot expiring this instant is no longer eligible
    // =========================================================================
    #[test]
    fn test_slot_expiry_is_exclusive() {
        let now = OffsetDateTime::now_utc();
        let slot = AddonSlot {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            payment_id: None,
            extra_capacity: 1,
            purchased_at: now - Duration::days(30),
            expires_at: now,
            consumed_by_campaign_id: None,
            consumed_at: None,
            created_at: now - Duration::days(30),
        };
        assert!(!slot.is_available(now));
        assert!(slot.is_available(now - Duration::seconds(1)));
    }

    // =========================================================================
    // OVR-04: consumption makes a slot permanently unavailable even before
    //         expiry
    // =========================================================================
    #[test]
    fn test_consumed_slot_stays_consumed() {
        let now = OffsetDateTime::now_utc();
        let slot = AddonSlot {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            payment_id: None,
            extra_capacity: 1,
            purchased_at: now,
            expires_at: now + Duration::days(30),
            consumed_by_campaign_id: Some(Uuid::new_v4()),
            consumed_at: Some(now),
            created_at: now,
        };
        assert!(!slot.is_available(now));
    }
}
