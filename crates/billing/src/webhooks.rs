//! Payment provider webhook handling
//!
//! Consumes Razorpay billing events and drives the subscription lifecycle.
//! Verification is a hex HMAC-SHA256 over the exact raw body bytes, compared
//! in constant time, and happens strictly before any parsing. Delivery is
//! neither ordered nor exactly-once, so every handler is idempotent keyed by
//! the provider's own identifiers (order id / payment id / subscription id),
//! never by delivery sequence. Event types outside the routing table are
//! acknowledged as ignored; the provider ships new types without notice and
//! retries on anything non-2xx.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use sqlx::PgPool;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::addon_slots::AddonSlotService;
use crate::audit::{ActorType, AuditEventBuilder, AuditEventType, AuditLogger};
use crate::error::{BillingError, BillingResult};
use crate::invoices::InvoiceService;
use crate::payments::{Payment, PaymentService};
use crate::settings::SettingsService;
use crate::subscriptions::{Subscription, SubscriptionService};

type HmacSha256 = Hmac<Sha256>;

/// Verify a hex HMAC-SHA256 signature over the raw request body
///
/// Pure function so it is testable with known vectors. The comparison runs
/// in constant time over the decoded digests; a signature that is not valid
/// hex fails without further work.
pub fn verify_signature(secret: &str, raw_body: &[u8], signature: &str) -> bool {
    let Ok(supplied) = hex::decode(signature.trim()) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(raw_body);
    let computed = mac.finalize().into_bytes();

    computed.as_slice().ct_eq(supplied.as_slice()).into()
}

/// Outcome of processing one verified delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The event mutated local state
    Processed,
    /// The event was recognized but everything it implies had already
    /// happened (replay, reordering)
    NoOp,
    /// The event type is outside the routing table
    Ignored,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Processed => "processed",
            WebhookOutcome::NoOp => "no_op",
            WebhookOutcome::Ignored => "ignored",
        }
    }
}

/// Provider webhook envelope
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    pub event: String,
    #[serde(default)]
    pub payload: WebhookPayload,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPayload {
    pub payment: Option<Wrapped<PaymentEntity>>,
    pub subscription: Option<Wrapped<SubscriptionEntity>>,
    pub invoice: Option<Wrapped<InvoiceEntity>>,
}

/// Provider entities arrive wrapped one level deep
#[derive(Debug, Clone, Deserialize)]
pub struct Wrapped<T> {
    pub entity: T,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentEntity {
    pub id: String,
    pub order_id: Option<String>,
    /// Amount in the currency's minor unit
    pub amount: Option<i64>,
    pub currency: Option<String>,
    #[serde(default)]
    pub notes: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionEntity {
    pub id: String,
    pub status: Option<String>,
    #[serde(default)]
    pub notes: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceEntity {
    pub id: String,
    pub order_id: Option<String>,
}

/// Webhook handler for provider billing events
pub struct WebhookHandler {
    pool: PgPool,
    webhook_secret: String,
    subscriptions: SubscriptionService,
    payments: PaymentService,
    invoices: InvoiceService,
    slots: AddonSlotService,
    settings: SettingsService,
    audit: AuditLogger,
}

impl WebhookHandler {
    pub fn new(pool: PgPool, webhook_secret: String) -> Self {
        let subscriptions = SubscriptionService::new(pool.clone());
        let payments = PaymentService::new(pool.clone());
        let invoices = InvoiceService::new(pool.clone());
        let slots = AddonSlotService::new(pool.clone());
        let settings = SettingsService::new(pool.clone());
        let audit = AuditLogger::new(pool.clone());
        Self {
            pool,
            webhook_secret,
            subscriptions,
            payments,
            invoices,
            slots,
            settings,
            audit,
        }
    }

    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let secret = std::env::var("RAZORPAY_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("RAZORPAY_WEBHOOK_SECRET is not set".to_string()))?;
        if secret.is_empty() {
            return Err(BillingError::Config(
                "RAZORPAY_WEBHOOK_SECRET is empty".to_string(),
            ));
        }
        Ok(Self::new(pool, secret))
    }

    /// Verify the signature over the raw bytes; no parsing happens first
    pub fn verify(&self, raw_body: &[u8], signature: &str) -> BillingResult<()> {
        if verify_signature(&self.webhook_secret, raw_body, signature) {
            Ok(())
        } else {
            tracing::warn!(
                body_len = raw_body.len(),
                "Webhook signature verification failed"
            );
            Err(BillingError::WebhookSignatureInvalid)
        }
    }

    /// Parse a verified body into the envelope
    pub fn parse(&self, raw_body: &[u8]) -> BillingResult<WebhookEnvelope> {
        serde_json::from_slice(raw_body)
            .map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))
    }

    /// Full pipeline: verify, parse, dispatch, record
    pub async fn handle(
        &self,
        raw_body: &[u8],
        signature: &str,
        provider_event_id: Option<&str>,
    ) -> BillingResult<WebhookOutcome> {
        self.verify(raw_body, signature)?;
        let envelope = self.parse(raw_body)?;

        tracing::info!(
            event = %envelope.event,
            event_id = provider_event_id.unwrap_or("-"),
            "Processing provider webhook event"
        );

        let result = self.dispatch(&envelope).await;

        // The record is observability, not idempotency; handlers already
        // converge on provider identifiers, so a lost row here is harmless.
        let (outcome_str, error_message) = match &result {
            Ok(outcome) => (outcome.as_str(), None),
            Err(e) => ("error", Some(e.to_string())),
        };
        if let Err(e) = self
            .record_event(provider_event_id, &envelope.event, outcome_str, error_message)
            .await
        {
            tracing::warn!(error = %e, "Failed to record webhook event");
        }

        result
    }

    /// Fixed routing table; anything else is acknowledged as ignored
    pub async fn dispatch(&self, envelope: &WebhookEnvelope) -> BillingResult<WebhookOutcome> {
        match envelope.event.as_str() {
            "payment.captured" => self.handle_payment_captured(envelope).await,
            "payment.failed" => self.handle_payment_failed(envelope).await,
            "invoice.paid" => self.handle_invoice_paid(envelope).await,
            "subscription.pending" => self.handle_subscription_pending(envelope).await,
            "subscription.activated" => self.handle_subscription_activated(envelope).await,
            "subscription.charged" => self.handle_subscription_charged(envelope).await,
            "subscription.paused" => self.handle_subscription_paused(envelope).await,
            "subscription.cancelled" => self.handle_subscription_cancelled(envelope).await,
            "subscription.completed" => self.handle_subscription_completed(envelope).await,
            other => {
                tracing::info!(
                    event = %other,
                    "Unhandled provider event type - acknowledged without processing"
                );
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    /// `payment.captured`: capture + downstream activation in one transaction
    ///
    /// The payment row is locked first, so concurrent deliveries of the same
    /// order serialize; the loser observes `captured` and no-ops. Capture,
    /// subscription activation (or slot grant), and invoice creation commit
    /// atomically: a crash in between leaves the payment `created` and the
    /// provider's retry repairs it.
    async fn handle_payment_captured(
        &self,
        envelope: &WebhookEnvelope,
    ) -> BillingResult<WebhookOutcome> {
        let entity = require_payment(envelope)?;
        let order_id = entity.order_id.as_deref().ok_or_else(|| {
            BillingError::WebhookPayloadInvalid("payment entity carries no order_id".to_string())
        })?;

        let settings = self.settings.load().await?;
        let mut tx = self.pool.begin().await?;

        let payment = self
            .payments
            .find_by_order_for_update(&mut tx, order_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("payment order '{order_id}' unknown")))?;

        if matches!(payment.status.as_str(), "captured" | "refunded") {
            tx.rollback().await?;
            tracing::info!(
                order_id = %order_id,
                payment_id = %payment.id,
                "Payment already captured - duplicate delivery ignored"
            );
            return Ok(WebhookOutcome::NoOp);
        }

        self.payments
            .mark_captured_tx(&mut tx, payment.id, &entity.id)
            .await?;

        self.apply_captured_payment(&mut tx, &payment, settings.addon_slot_validity_days)
            .await?;

        self.audit
            .log_tx(
                &mut tx,
                AuditEventBuilder::new(payment.user_id, AuditEventType::PaymentCaptured)
                    .actor_type(ActorType::Provider)
                    .data(serde_json::json!({
                        "payment_id": payment.id,
                        "provider_order_id": order_id,
                        "provider_payment_id": entity.id,
                        "amount_cents": payment.amount_cents,
                        "payment_for": payment.payment_for,
                    })),
            )
            .await?;

        tx.commit().await?;

        tracing::info!(
            order_id = %order_id,
            payment_id = %payment.id,
            user_id = %payment.user_id,
            "Payment captured and applied"
        );
        Ok(WebhookOutcome::Processed)
    }

    async fn handle_payment_failed(
        &self,
        envelope: &WebhookEnvelope,
    ) -> BillingResult<WebhookOutcome> {
        let entity = require_payment(envelope)?;
        let Some(order_id) = entity.order_id.as_deref() else {
            // Failures for orders we never opened carry nothing to update
            return Ok(WebhookOutcome::NoOp);
        };

        let changed = self.payments.mark_failed(order_id).await?;
        if !changed {
            return Ok(WebhookOutcome::NoOp);
        }

        if let Some(payment) = self.payments.find_by_order_id(order_id).await? {
            self.audit
                .log_best_effort(
                    AuditEventBuilder::new(payment.user_id, AuditEventType::PaymentFailed)
                        .actor_type(ActorType::Provider)
                        .data(serde_json::json!({
                            "payment_id": payment.id,
                            "provider_order_id": order_id,
                        })),
                )
                .await;
        }

        tracing::info!(order_id = %order_id, "Payment marked failed");
        Ok(WebhookOutcome::Processed)
    }

    /// `invoice.paid` accompanies subscription charges; the payment entity in
    /// the payload is authoritative, so this routes through the same
    /// idempotent capture path
    async fn handle_invoice_paid(&self, envelope: &WebhookEnvelope) -> BillingResult<WebhookOutcome> {
        if envelope.payload.payment.is_some() {
            return self.handle_payment_captured(envelope).await;
        }
        tracing::info!("invoice.paid without payment entity - nothing to apply");
        Ok(WebhookOutcome::NoOp)
    }

    async fn handle_subscription_pending(
        &self,
        envelope: &WebhookEnvelope,
    ) -> BillingResult<WebhookOutcome> {
        let Some(sub) = self.resolve_subscription(envelope).await? else {
            return Ok(WebhookOutcome::NoOp);
        };
        let settings = self.settings.load().await?;

        if sub.status == "grace" {
            return Ok(WebhookOutcome::NoOp);
        }
        self.subscriptions
            .enter_grace(sub.id, settings.grace_window_days)
            .await?;
        Ok(WebhookOutcome::Processed)
    }

    async fn handle_subscription_activated(
        &self,
        envelope: &WebhookEnvelope,
    ) -> BillingResult<WebhookOutcome> {
        let Some(sub) = self.resolve_subscription(envelope).await? else {
            return Ok(WebhookOutcome::NoOp);
        };
        if sub.status == "active" {
            return Ok(WebhookOutcome::NoOp);
        }
        self.subscriptions.reactivate(sub.id).await?;
        Ok(WebhookOutcome::Processed)
    }

    /// `subscription.charged`: a renewal charge succeeded
    ///
    /// Idempotent on the charge's provider order id: a replay finds the
    /// payment already captured and stops before touching the period.
    async fn handle_subscription_charged(
        &self,
        envelope: &WebhookEnvelope,
    ) -> BillingResult<WebhookOutcome> {
        let Some(sub) = self.resolve_subscription(envelope).await? else {
            return Ok(WebhookOutcome::NoOp);
        };
        let entity = require_payment(envelope)?;
        let order_id = entity.order_id.as_deref().ok_or_else(|| {
            BillingError::WebhookPayloadInvalid("charge carries no order_id".to_string())
        })?;

        let mut tx = self.pool.begin().await?;

        // Renewal orders originate at the provider, so the local row may not
        // exist yet; seed it, then serialize on the row lock like any other
        // capture.
        sqlx::query(
            r#"
            INSERT INTO payments
                (user_id, provider_order_id, amount_cents, currency, status, payment_for, plan_id)
            VALUES ($1, $2, $3, $4, 'created', 'subscription', $5)
            ON CONFLICT (provider_order_id) DO NOTHING
            "#,
        )
        .bind(sub.user_id)
        .bind(order_id)
        .bind(entity.amount.unwrap_or(0))
        .bind(entity.currency.as_deref().unwrap_or("USD"))
        .bind(sub.plan_id)
        .execute(&mut *tx)
        .await?;

        let payment = self
            .payments
            .find_by_order_for_update(&mut tx, order_id)
            .await?
            .ok_or_else(|| {
                BillingError::Database(format!("renewal payment '{order_id}' missing after seed"))
            })?;

        if matches!(payment.status.as_str(), "captured" | "refunded") {
            tx.rollback().await?;
            tracing::info!(
                order_id = %order_id,
                "Renewal charge already applied - duplicate delivery ignored"
            );
            return Ok(WebhookOutcome::NoOp);
        }

        self.payments
            .mark_captured_tx(&mut tx, payment.id, &entity.id)
            .await?;
        let renewed = self.subscriptions.extend_period_tx(&mut tx, sub.id).await?;
        let invoice = self
            .invoices
            .create_for_payment_tx(
                &mut tx,
                sub.user_id,
                sub.id,
                payment.id,
                payment.amount_cents,
                &payment.currency,
                time::OffsetDateTime::now_utc(),
            )
            .await?;

        self.audit
            .log_tx(
                &mut tx,
                AuditEventBuilder::new(sub.user_id, AuditEventType::PaymentCaptured)
                    .actor_type(ActorType::Provider)
                    .data(serde_json::json!({
                        "provider_order_id": order_id,
                        "provider_payment_id": entity.id,
                        "subscription_id": sub.id,
                        "renewal": true,
                        "invoice_number": invoice.number,
                        "new_period_end": renewed.ends_at.unix_timestamp(),
                    })),
            )
            .await?;

        tx.commit().await?;

        Ok(WebhookOutcome::Processed)
    }

    /// The provider pauses collection but access continues while the pause is
    /// resolved, which is exactly the grace semantics
    async fn handle_subscription_paused(
        &self,
        envelope: &WebhookEnvelope,
    ) -> BillingResult<WebhookOutcome> {
        self.handle_subscription_pending(envelope).await
    }

    async fn handle_subscription_cancelled(
        &self,
        envelope: &WebhookEnvelope,
    ) -> BillingResult<WebhookOutcome> {
        let Some(sub) = self.resolve_subscription(envelope).await? else {
            return Ok(WebhookOutcome::NoOp);
        };
        if sub.status == "canceled" {
            return Ok(WebhookOutcome::NoOp);
        }
        self.subscriptions
            .cancel(sub.id, ActorType::Provider, None, None)
            .await?;
        Ok(WebhookOutcome::Processed)
    }

    async fn handle_subscription_completed(
        &self,
        envelope: &WebhookEnvelope,
    ) -> BillingResult<WebhookOutcome> {
        let Some(sub) = self.resolve_subscription(envelope).await? else {
            return Ok(WebhookOutcome::NoOp);
        };
        if sub.status == "expired" {
            return Ok(WebhookOutcome::NoOp);
        }
        self.subscriptions.complete(sub.id).await?;
        Ok(WebhookOutcome::Processed)
    }

    /// Route a captured payment to what it paid for
    async fn apply_captured_payment(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        payment: &Payment,
        slot_validity_days: i32,
    ) -> BillingResult<()> {
        match payment.purpose()? {
            adpilot_shared::PaymentPurpose::Subscription => {
                self.subscriptions.activate_paid_tx(tx, payment).await?;
            }
            adpilot_shared::PaymentPurpose::AddonSlots => {
                self.slots
                    .grant_purchased_tx(tx, payment, slot_validity_days)
                    .await?;
            }
        }
        Ok(())
    }

    /// Find the local subscription a provider subscription event refers to
    ///
    /// The provider echoes back the `user_id` we put into the subscription's
    /// notes at checkout time. Events for users with no entitling
    /// subscription (already expired locally, unknown user) resolve to
    /// `None` and are acknowledged as no-ops; a retry cannot improve on
    /// that.
    async fn resolve_subscription(
        &self,
        envelope: &WebhookEnvelope,
    ) -> BillingResult<Option<Subscription>> {
        let entity = envelope
            .payload
            .subscription
            .as_ref()
            .map(|w| &w.entity)
            .ok_or_else(|| {
                BillingError::WebhookPayloadInvalid(
                    "subscription event without subscription entity".to_string(),
                )
            })?;

        let Some(user_id) = entity.notes.get("user_id") else {
            tracing::warn!(
                provider_subscription_id = %entity.id,
                "Subscription event carries no user_id note"
            );
            return Ok(None);
        };
        let user_id: Uuid = user_id.parse().map_err(|_| {
            BillingError::WebhookPayloadInvalid(format!("malformed user_id note '{user_id}'"))
        })?;

        let sub = self.subscriptions.current_for_user(user_id).await?;
        if sub.is_none() {
            tracing::info!(
                user_id = %user_id,
                provider_subscription_id = %entity.id,
                event = %envelope.event,
                "No entitling subscription for provider event"
            );
        }
        Ok(sub)
    }

    async fn record_event(
        &self,
        provider_event_id: Option<&str>,
        event_type: &str,
        outcome: &str,
        error_message: Option<String>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_events (provider_event_id, event_type, outcome, error_message)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (provider_event_id) WHERE provider_event_id IS NOT NULL DO UPDATE SET
                outcome = EXCLUDED.outcome,
                error_message = EXCLUDED.error_message
            "#,
        )
        .bind(provider_event_id)
        .bind(event_type)
        .bind(outcome)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn require_payment(envelope: &WebhookEnvelope) -> BillingResult<&PaymentEntity> {
    envelope
        .payload
        .payment
        .as_ref()
        .map(|w| &w.entity)
        .ok_or_else(|| {
            BillingError::WebhookPayloadInvalid(format!(
                "event '{}' arrived without a payment entity",
                envelope.event
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_valid_signature_accepted() {
        let secret = "whsec_test";
        let body = br#"{"event":"payment.captured"}"#;
        let signature = sign(secret, body);
        assert!(verify_signature(secret, body, &signature));
    }

    #[test]
    fn test_signature_over_exact_bytes() {
        let secret = "whsec_test";
        let body = br#"{"event":"payment.captured"}"#;
        let signature = sign(secret, body);
        // One byte of difference must fail
        let tampered = br#"{"event":"payment.captured" }"#;
        assert!(!verify_signature(secret, tampered, &signature));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let body = br#"{"event":"x"}"#;
        let signature = sign("secret_a", body);
        assert!(!verify_signature("secret_b", body, &signature));
    }

    #[test]
    fn test_non_hex_signature_rejected() {
        assert!(!verify_signature("secret", b"body", "not-hex!!"));
        assert!(!verify_signature("secret", b"body", ""));
    }

    #[test]
    fn test_truncated_signature_rejected() {
        let secret = "secret";
        let body = b"body";
        let signature = sign(secret, body);
        assert!(!verify_signature(secret, body, &signature[..32]));
    }

    #[test]
    fn test_signature_whitespace_tolerated() {
        let secret = "secret";
        let body = b"body";
        let signature = format!("  {}\n", sign(secret, body));
        assert!(verify_signature(secret, body, &signature));
    }

    #[test]
    fn test_envelope_parsing() {
        let body = r#"{
            "event": "payment.captured",
            "payload": {
                "payment": {
                    "entity": {
                        "id": "pay_29QQoUBi66xm2f",
                        "order_id": "order_9A33XWu170gUtm",
                        "notes": {"user_id": "7c9e6679-7425-40de-944b-e07fc1f90ae7"}
                    }
                }
            }
        }"#;
        let envelope: WebhookEnvelope = serde_json::from_str(body).unwrap();
        assert_eq!(envelope.event, "payment.captured");
        let payment = envelope.payload.payment.unwrap().entity;
        assert_eq!(payment.id, "pay_29QQoUBi66xm2f");
        assert_eq!(payment.order_id.as_deref(), Some("order_9A33XWu170gUtm"));
        assert_eq!(
            payment.notes.get("user_id").map(String::as_str),
            Some("7c9e6679-7425-40de-944b-e07fc1f90ae7")
        );
    }

    #[test]
    fn test_envelope_tolerates_unknown_fields() {
        let body = r#"{
            "event": "subscription.charged",
            "account_id": "acc_xyz",
            "created_at": 1724000000,
            "payload": {
                "subscription": {
                    "entity": {
                        "id": "sub_00000000000001",
                        "status": "active",
                        "quantity": 1,
                        "notes": {"user_id": "7c9e6679-7425-40de-944b-e07fc1f90ae7"}
                    }
                },
                "payment": {
                    "entity": {"id": "pay_1", "order_id": "order_1", "method": "card"}
                }
            }
        }"#;
        let envelope: WebhookEnvelope = serde_json::from_str(body).unwrap();
        assert!(envelope.payload.subscription.is_some());
        assert!(envelope.payload.payment.is_some());
    }

    #[test]
    fn test_envelope_without_payload() {
        let envelope: WebhookEnvelope =
            serde_json::from_str(r#"{"event": "account.updated"}"#).unwrap();
        assert_eq!(envelope.event, "account.updated");
        assert!(envelope.payload.payment.is_none());
    }

    #[test]
    fn test_require_payment_missing_is_payload_error() {
        let envelope: WebhookEnvelope =
            serde_json::from_str(r#"{"event": "payment.captured"}"#).unwrap();
        assert!(matches!(
            require_payment(&envelope),
            Err(BillingError::WebhookPayloadInvalid(_))
        ));
    }

    #[test]
    fn test_outcome_strings() {
        assert_eq!(WebhookOutcome::Processed.as_str(), "processed");
        assert_eq!(WebhookOutcome::NoOp.as_str(), "no_op");
        assert_eq!(WebhookOutcome::Ignored.as_str(), "ignored");
    }
}
