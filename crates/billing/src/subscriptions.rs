//! Subscription lifecycle management
//!
//! The only writer of subscription rows. Status follows a strict machine:
//! `pending -> active <-> grace -> expired`, `trial -> active | expired`,
//! any non-terminal status `-> canceled`; terminal rows are never mutated
//! again and never deleted. Limit columns are snapshotted from the plan at
//! activation time and never re-read, so later plan edits cannot change an
//! existing subscriber's entitlement.

use adpilot_shared::SubscriptionStatus;
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::audit::{ActorType, AuditEventBuilder, AuditEventType, AuditLogger};
use crate::error::{BillingError, BillingResult};
use crate::invoices::{Invoice, InvoiceService};
use crate::payments::{Payment, PaymentService};
use crate::plans::{Plan, PlanStore};

/// A subscription row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub status: String,
    pub billing_cycle: String,
    pub starts_at: OffsetDateTime,
    pub ends_at: OffsetDateTime,
    pub grace_ends_at: Option<OffsetDateTime>,
    pub ai_campaign_limit: i32,
    pub ad_account_limit: i32,
    pub team_member_limit: i32,
    pub monthly_credits: i32,
    pub is_trial: bool,
    pub created_by_admin: bool,
    pub assigned_by_admin: Option<Uuid>,
    pub payment_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    pub fn status_parsed(&self) -> BillingResult<SubscriptionStatus> {
        self.status.parse().map_err(|_| {
            BillingError::InvariantViolation(format!(
                "subscription {} has unknown status '{}'",
                self.id, self.status
            ))
        })
    }
}

/// Result of an activation
#[derive(Debug, Clone, Serialize)]
pub struct ActivationResult {
    pub subscription: Subscription,
    pub invoice: Option<Invoice>,
    /// False when the payment had already activated a subscription earlier
    pub newly_activated: bool,
}

/// Outcome of one idempotent sweep run
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SweepOutcome {
    pub subscriptions_expired: u64,
    pub campaigns_deactivated: u64,
}

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan_id, status, billing_cycle, starts_at, ends_at, \
     grace_ends_at, ai_campaign_limit, ad_account_limit, team_member_limit, monthly_credits, \
     is_trial, created_by_admin, assigned_by_admin, payment_id, created_at, updated_at";

/// Owner of the subscription state machine
#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
    plans: PlanStore,
    payments: PaymentService,
    invoices: InvoiceService,
    audit: AuditLogger,
}

impl SubscriptionService {
    pub fn new(pool: PgPool) -> Self {
        let plans = PlanStore::new(pool.clone());
        let payments = PaymentService::new(pool.clone());
        let invoices = InvoiceService::new(pool.clone());
        let audit = AuditLogger::new(pool.clone());
        Self {
            pool,
            plans,
            payments,
            invoices,
            audit,
        }
    }

    /// The user's current entitling subscription (trial/active/grace), if any
    pub async fn current_for_user(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let sub: Option<Subscription> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE user_id = $1 AND status IN ('trial', 'active', 'grace')
            "#
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    pub async fn get(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        let sub: Option<Subscription> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        sub.ok_or_else(|| BillingError::NotFound(format!("subscription {subscription_id} not found")))
    }

    /// Idempotently ensure the user has a subscription, starting a trial if not
    ///
    /// Returns the existing trial/active/grace subscription when one exists;
    /// otherwise creates a trial from the configured trial plan. Safe under
    /// concurrent calls: the partial unique index on entitled rows turns the
    /// losing insert into a no-op and both callers observe the same row.
    pub async fn ensure_trial(
        &self,
        user_id: Uuid,
        trial_plan_code: &str,
    ) -> BillingResult<Subscription> {
        if let Some(existing) = self.current_for_user(user_id).await? {
            return Ok(existing);
        }

        let plan = self.plans.trial_plan(trial_plan_code).await?;
        let now = OffsetDateTime::now_utc();
        let ends_at = now + Duration::days(i64::from(plan.trial_days.max(1)));

        // RETURNING only fires for the caller whose insert won; the loser
        // falls through to the row the winner created.
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO subscriptions
                (user_id, plan_id, status, billing_cycle, starts_at, ends_at,
                 ai_campaign_limit, ad_account_limit, team_member_limit, monthly_credits, is_trial)
            VALUES ($1, $2, 'trial', $3, $4, $5, $6, $7, $8, $9, TRUE)
            ON CONFLICT (user_id) WHERE status IN ('trial', 'active', 'grace') DO NOTHING
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(plan.id)
        .bind(&plan.billing_cycle)
        .bind(now)
        .bind(ends_at)
        .bind(plan.ai_campaign_limit)
        .bind(plan.ad_account_limit)
        .bind(plan.team_member_limit)
        .bind(plan.monthly_credits)
        .fetch_optional(&self.pool)
        .await?;

        let sub = self.current_for_user(user_id).await?.ok_or_else(|| {
            BillingError::Database("subscription row missing after trial insert".to_string())
        })?;

        if inserted.is_some() {
            self.audit
                .log_best_effort(
                    AuditEventBuilder::new(user_id, AuditEventType::TrialStarted)
                        .actor_type(ActorType::User)
                        .data(serde_json::json!({
                            "subscription_id": sub.id,
                            "plan_code": plan.code,
                            "ends_at": sub.ends_at.unix_timestamp(),
                        })),
                )
                .await;
            tracing::info!(user_id = %user_id, subscription_id = %sub.id, "Trial subscription started");
        }

        Ok(sub)
    }

    /// Activate a paid subscription from a captured payment
    ///
    /// Convenience wrapper that owns its transaction; webhook capture
    /// processing uses [`SubscriptionService::activate_paid_tx`] inside its
    /// own payment-capture transaction instead.
    pub async fn activate_paid(&self, payment_id: Uuid) -> BillingResult<ActivationResult> {
        let payment = self.payments.get(payment_id).await?;
        let mut tx = self.pool.begin().await?;
        let result = self.activate_paid_tx(&mut tx, &payment).await?;
        tx.commit().await?;
        Ok(result)
    }

    /// The activation transaction body
    ///
    /// Idempotency key is the payment id: if a subscription already references
    /// this payment the stored row is returned untouched. Otherwise, inside
    /// the caller's transaction: every entitling subscription for the user is
    /// expired, a new active row is inserted with limits snapshotted from the
    /// plan at this instant, and the invoice is created. All three commit or
    /// none do.
    pub async fn activate_paid_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payment: &Payment,
    ) -> BillingResult<ActivationResult> {
        // Serialize activations per user: without this, two concurrent
        // activations for different payments could each expire the other's
        // predecessor and race the partial unique index.
        self.lock_user_tx(tx, payment.user_id).await?;

        if let Some(existing) = self.find_by_payment_tx(tx, payment.id).await? {
            tracing::info!(
                payment_id = %payment.id,
                subscription_id = %existing.id,
                "Payment already activated a subscription; returning it unchanged"
            );
            let invoice = self.invoices.find_by_payment(payment.id).await?;
            return Ok(ActivationResult {
                subscription: existing,
                invoice,
                newly_activated: false,
            });
        }

        let plan_id = payment.plan_id.ok_or_else(|| {
            BillingError::InvariantViolation(format!(
                "subscription payment {} carries no plan reference",
                payment.id
            ))
        })?;
        let plan = self.plans.get_tx(tx, plan_id).await?;
        let now = OffsetDateTime::now_utc();

        let displaced = self.expire_entitled_tx(tx, payment.user_id).await?;

        let subscription = self
            .insert_active_tx(tx, payment.user_id, &plan, Some(payment.id), None, now)
            .await?;

        let invoice = self
            .invoices
            .create_for_payment_tx(
                tx,
                payment.user_id,
                subscription.id,
                payment.id,
                payment.amount_cents,
                &payment.currency,
                now,
            )
            .await?;

        self.audit
            .log_tx(
                tx,
                AuditEventBuilder::new(payment.user_id, AuditEventType::SubscriptionActivated)
                    .actor_type(ActorType::Provider)
                    .data(serde_json::json!({
                        "subscription_id": subscription.id,
                        "plan_code": plan.code,
                        "payment_id": payment.id,
                        "invoice_number": invoice.number,
                        "displaced_subscriptions": displaced,
                    })),
            )
            .await?;

        tracing::info!(
            user_id = %payment.user_id,
            subscription_id = %subscription.id,
            plan_code = %plan.code,
            displaced = displaced,
            "Paid subscription activated"
        );

        Ok(ActivationResult {
            subscription,
            invoice: Some(invoice),
            newly_activated: true,
        })
    }

    /// Admin-assigned subscription (no payment, no invoice)
    pub async fn admin_assign(
        &self,
        admin_id: Uuid,
        user_id: Uuid,
        plan_id: Uuid,
        reason: &str,
    ) -> BillingResult<Subscription> {
        if reason.trim().is_empty() {
            return Err(BillingError::Validation(
                "a non-empty reason is required when assigning a plan".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        self.lock_user_tx(&mut tx, user_id).await?;
        let plan = self.plans.get_tx(&mut tx, plan_id).await?;
        let now = OffsetDateTime::now_utc();

        let displaced = self.expire_entitled_tx(&mut tx, user_id).await?;
        let subscription = self
            .insert_active_tx(&mut tx, user_id, &plan, None, Some(admin_id), now)
            .await?;

        self.audit
            .log_tx(
                &mut tx,
                AuditEventBuilder::new(user_id, AuditEventType::SubscriptionAssigned)
                    .actor(ActorType::Admin, admin_id)
                    .reason(reason)
                    .data(serde_json::json!({
                        "subscription_id": subscription.id,
                        "plan_code": plan.code,
                        "displaced_subscriptions": displaced,
                    })),
            )
            .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            admin_id = %admin_id,
            "Subscription assigned by admin"
        );
        Ok(subscription)
    }

    /// Move a subscription into grace
    ///
    /// `grace_ends_at` is fixed here, at entry time, from the configured
    /// window; the sweep later reads only the per-row deadline.
    pub async fn enter_grace(
        &self,
        subscription_id: Uuid,
        grace_window_days: i32,
    ) -> BillingResult<Subscription> {
        let sub = self.get(subscription_id).await?;
        let from = sub.status_parsed()?;

        if from == SubscriptionStatus::Grace {
            return Ok(sub); // already in grace; keep the original deadline
        }
        if !from.can_transition_to(SubscriptionStatus::Grace) {
            return Err(BillingError::InvalidTransition {
                from,
                to: SubscriptionStatus::Grace,
            });
        }

        let grace_ends_at = sub.ends_at + Duration::days(i64::from(grace_window_days));

        let updated: Subscription = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions
            SET status = 'grace', grace_ends_at = $2, updated_at = NOW()
            WHERE id = $1 AND status = $3
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(subscription_id)
        .bind(grace_ends_at)
        .bind(from.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            BillingError::Database(format!(
                "subscription {subscription_id} changed status concurrently"
            ))
        })?;

        self.audit
            .log_best_effort(
                AuditEventBuilder::new(updated.user_id, AuditEventType::GraceEntered)
                    .actor_type(ActorType::Provider)
                    .data(serde_json::json!({
                        "subscription_id": updated.id,
                        "grace_ends_at": grace_ends_at.unix_timestamp(),
                    })),
            )
            .await;

        tracing::info!(
            subscription_id = %updated.id,
            user_id = %updated.user_id,
            grace_ends_at = %grace_ends_at,
            "Subscription entered grace period"
        );
        Ok(updated)
    }

    /// Recover a grace (or promote a pending) subscription back to active
    ///
    /// Used when the provider reports the subscription healthy again. A
    /// subscription already active is returned unchanged.
    pub async fn reactivate(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        let sub = self.get(subscription_id).await?;
        let from = sub.status_parsed()?;

        if from == SubscriptionStatus::Active {
            return Ok(sub);
        }
        if !from.can_transition_to(SubscriptionStatus::Active) {
            return Err(BillingError::InvalidTransition {
                from,
                to: SubscriptionStatus::Active,
            });
        }

        let updated: Subscription = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions
            SET status = 'active', grace_ends_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(subscription_id)
        .bind(from.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            BillingError::Database(format!(
                "subscription {subscription_id} changed status concurrently"
            ))
        })?;

        tracing::info!(
            subscription_id = %updated.id,
            from = %from,
            "Subscription reactivated"
        );
        Ok(updated)
    }

    /// Extend the current period after a successful renewal charge
    pub async fn extend_period(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        let mut tx = self.pool.begin().await?;
        let updated = self.extend_period_tx(&mut tx, subscription_id).await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Period extension inside the caller's transaction
    ///
    /// Renewals anchor on the old period end, not on processing time, so
    /// late webhook delivery does not shorten the period. A grace or pending
    /// subscription recovers to active.
    pub async fn extend_period_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        subscription_id: Uuid,
    ) -> BillingResult<Subscription> {
        let sub: Option<Subscription> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1 FOR UPDATE"
        ))
        .bind(subscription_id)
        .fetch_optional(&mut **tx)
        .await?;
        let sub = sub.ok_or_else(|| {
            BillingError::NotFound(format!("subscription {subscription_id} not found"))
        })?;

        let from = sub.status_parsed()?;
        if from.is_terminal() {
            return Err(BillingError::InvalidTransition {
                from,
                to: SubscriptionStatus::Active,
            });
        }

        let cycle: adpilot_shared::BillingCycle = sub.billing_cycle.parse().map_err(|_| {
            BillingError::InvariantViolation(format!(
                "subscription {} has unknown billing cycle '{}'",
                sub.id, sub.billing_cycle
            ))
        })?;

        let new_end =
            sub.ends_at.max(OffsetDateTime::now_utc()) + Duration::days(cycle.period_days());

        let updated: Subscription = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions
            SET status = 'active', ends_at = $2, grace_ends_at = NULL, updated_at = NOW()
            WHERE id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(subscription_id)
        .bind(new_end)
        .fetch_one(&mut **tx)
        .await?;

        tracing::info!(
            subscription_id = %updated.id,
            new_period_end = %new_end,
            "Subscription period extended"
        );
        Ok(updated)
    }

    /// Cancel a non-terminal subscription
    pub async fn cancel(
        &self,
        subscription_id: Uuid,
        actor_type: ActorType,
        actor_id: Option<Uuid>,
        reason: Option<&str>,
    ) -> BillingResult<Subscription> {
        let sub = self.get(subscription_id).await?;
        let from = sub.status_parsed()?;

        if from == SubscriptionStatus::Canceled {
            return Ok(sub);
        }
        if !from.can_transition_to(SubscriptionStatus::Canceled) {
            return Err(BillingError::InvalidTransition {
                from,
                to: SubscriptionStatus::Canceled,
            });
        }

        let updated: Subscription = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions
            SET status = 'canceled', updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(subscription_id)
        .bind(from.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            BillingError::Database(format!(
                "subscription {subscription_id} changed status concurrently"
            ))
        })?;

        let mut event =
            AuditEventBuilder::new(updated.user_id, AuditEventType::SubscriptionCanceled)
                .actor_type(actor_type)
                .data(serde_json::json!({
                    "subscription_id": updated.id,
                    "previous_status": from.as_str(),
                }));
        if let Some(actor_id) = actor_id {
            event = event.actor(actor_type, actor_id);
        }
        if let Some(reason) = reason {
            event = event.reason(reason);
        }
        self.audit.log_best_effort(event).await;

        tracing::info!(
            subscription_id = %updated.id,
            previous_status = %from,
            "Subscription canceled"
        );
        Ok(updated)
    }

    /// Expire a subscription whose final cycle completed at the provider
    pub async fn complete(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        let sub = self.get(subscription_id).await?;
        let from = sub.status_parsed()?;

        if from == SubscriptionStatus::Expired {
            return Ok(sub);
        }
        if !from.can_transition_to(SubscriptionStatus::Expired) {
            return Err(BillingError::InvalidTransition {
                from,
                to: SubscriptionStatus::Expired,
            });
        }

        let updated: Subscription = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions
            SET status = 'expired', updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(subscription_id)
        .bind(from.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            BillingError::Database(format!(
                "subscription {subscription_id} changed status concurrently"
            ))
        })?;

        self.audit
            .log_best_effort(
                AuditEventBuilder::new(updated.user_id, AuditEventType::SubscriptionCompleted)
                    .actor_type(ActorType::Provider)
                    .data(serde_json::json!({ "subscription_id": updated.id })),
            )
            .await;

        Ok(updated)
    }

    /// Expire every grace subscription whose deadline has passed
    ///
    /// Pure idempotent batch: the predicate only matches rows still in
    /// `grace`, so an immediate second run updates zero rows. AI optimization
    /// is switched off for the affected users' campaigns in the same
    /// transaction.
    pub async fn expire_grace_sweep(&self, now: OffsetDateTime) -> BillingResult<SweepOutcome> {
        let mut tx = self.pool.begin().await?;

        let expired: Vec<(Uuid, Uuid)> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET status = 'expired', updated_at = NOW()
            WHERE status = 'grace' AND grace_ends_at < $1
            RETURNING id, user_id
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let users: Vec<Uuid> = expired.iter().map(|r| r.1).collect();
        let campaigns_deactivated = self.deactivate_ai_for_users_tx(&mut tx, &users).await?;

        for (subscription_id, user_id) in &expired {
            self.audit
                .log_tx(
                    &mut tx,
                    AuditEventBuilder::new(*user_id, AuditEventType::GraceExpired)
                        .data(serde_json::json!({ "subscription_id": subscription_id })),
                )
                .await?;
        }

        tx.commit().await?;

        let outcome = SweepOutcome {
            subscriptions_expired: expired.len() as u64,
            campaigns_deactivated,
        };
        if outcome.subscriptions_expired > 0 {
            tracing::info!(
                expired = outcome.subscriptions_expired,
                campaigns_deactivated = outcome.campaigns_deactivated,
                "Grace expiry sweep complete"
            );
        }
        Ok(outcome)
    }

    /// Expire every trial subscription past its end date
    pub async fn expire_trials_sweep(&self, now: OffsetDateTime) -> BillingResult<SweepOutcome> {
        let mut tx = self.pool.begin().await?;

        let expired: Vec<(Uuid, Uuid)> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET status = 'expired', updated_at = NOW()
            WHERE status = 'trial' AND ends_at < $1
            RETURNING id, user_id
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let users: Vec<Uuid> = expired.iter().map(|r| r.1).collect();
        let campaigns_deactivated = self.deactivate_ai_for_users_tx(&mut tx, &users).await?;

        for (subscription_id, user_id) in &expired {
            self.audit
                .log_tx(
                    &mut tx,
                    AuditEventBuilder::new(*user_id, AuditEventType::TrialExpired)
                        .data(serde_json::json!({ "subscription_id": subscription_id })),
                )
                .await?;
        }

        tx.commit().await?;

        let outcome = SweepOutcome {
            subscriptions_expired: expired.len() as u64,
            campaigns_deactivated,
        };
        if outcome.subscriptions_expired > 0 {
            tracing::info!(
                expired = outcome.subscriptions_expired,
                campaigns_deactivated = outcome.campaigns_deactivated,
                "Trial expiry sweep complete"
            );
        }
        Ok(outcome)
    }

    /// Take the user row lock for the remainder of the transaction
    async fn lock_user_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
    ) -> BillingResult<()> {
        let locked: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM users WHERE id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_optional(&mut **tx)
                .await?;
        if locked.is_none() {
            return Err(BillingError::NotFound(format!("user {user_id} not found")));
        }
        Ok(())
    }

    async fn find_by_payment_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payment_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let sub: Option<Subscription> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE payment_id = $1"
        ))
        .bind(payment_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(sub)
    }

    /// Expire every entitling subscription for the user; returns rows moved
    async fn expire_entitled_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'expired', updated_at = NOW()
            WHERE user_id = $1 AND status IN ('trial', 'active', 'grace')
            "#,
        )
        .bind(user_id)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_active_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        plan: &Plan,
        payment_id: Option<Uuid>,
        assigned_by_admin: Option<Uuid>,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let cycle = plan.cycle()?;
        let ends_at = now + Duration::days(cycle.period_days());

        let sub: Subscription = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions
                (user_id, plan_id, status, billing_cycle, starts_at, ends_at,
                 ai_campaign_limit, ad_account_limit, team_member_limit, monthly_credits,
                 is_trial, created_by_admin, assigned_by_admin, payment_id)
            VALUES ($1, $2, 'active', $3, $4, $5, $6, $7, $8, $9, FALSE, $10, $11, $12)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(plan.id)
        .bind(&plan.billing_cycle)
        .bind(now)
        .bind(ends_at)
        .bind(plan.ai_campaign_limit)
        .bind(plan.ad_account_limit)
        .bind(plan.team_member_limit)
        .bind(plan.monthly_credits)
        .bind(assigned_by_admin.is_some())
        .bind(assigned_by_admin)
        .bind(payment_id)
        .fetch_one(&mut **tx)
        .await?;

        Ok(sub)
    }

    async fn deactivate_ai_for_users_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_ids: &[Uuid],
    ) -> BillingResult<u64> {
        if user_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET ai_optimization_enabled = FALSE, updated_at = NOW()
            WHERE user_id = ANY($1) AND ai_optimization_enabled
            "#,
        )
        .bind(user_ids)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription_fixture(status: &str) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            status: status.to_string(),
            billing_cycle: "monthly".to_string(),
            starts_at: OffsetDateTime::UNIX_EPOCH,
            ends_at: OffsetDateTime::UNIX_EPOCH + Duration::days(30),
            grace_ends_at: None,
            ai_campaign_limit: 3,
            ad_account_limit: 2,
            team_member_limit: 2,
            monthly_credits: 500,
            is_trial: false,
            created_by_admin: false,
            assigned_by_admin: None,
            payment_id: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_status_parses() {
        let sub = subscription_fixture("grace");
        assert_eq!(sub.status_parsed().unwrap(), SubscriptionStatus::Grace);
    }

    #[test]
    fn test_corrupt_status_surfaces_as_invariant_violation() {
        let sub = subscription_fixture("past_due");
        assert!(matches!(
            sub.status_parsed(),
            Err(BillingError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_sweep_outcome_default_is_empty() {
        let outcome = SweepOutcome::default();
        assert_eq!(outcome.subscriptions_expired, 0);
        assert_eq!(outcome.campaigns_deactivated, 0);
    }
}
