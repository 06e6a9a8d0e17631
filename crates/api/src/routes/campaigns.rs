//! Campaign AI-optimization activation flow
//!
//! The capacity-gated consumer of the entitlement resolver. Enabling opens
//! one transaction: authorization (which may consume an addon slot) and the
//! campaign flag write commit together, so a slot can never be burned
//! without its activation nor claimed twice by concurrent requests.

use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde::Serialize;
use uuid::Uuid;

use adpilot_billing::{ActorType, AuditEventBuilder, AuditEventType, CapacityDecision};
use adpilot_shared::ResourceKind;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ActivationResponse {
    pub campaign_id: Uuid,
    pub ai_optimization_enabled: bool,
    /// "within_limit" or "needs_slot"
    pub satisfied_by: Option<CapacityDecision>,
    pub slot_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub allowed: bool,
    pub decision: CapacityDecision,
}

#[derive(Debug, sqlx::FromRow)]
struct CampaignRow {
    user_id: Uuid,
    status: String,
    ai_optimization_enabled: bool,
}

async fn fetch_owned_campaign(
    state: &AppState,
    user: &AuthUser,
    campaign_id: Uuid,
) -> Result<CampaignRow, ApiError> {
    let campaign: Option<CampaignRow> = sqlx::query_as(
        "SELECT user_id, status, ai_optimization_enabled FROM campaigns WHERE id = $1",
    )
    .bind(campaign_id)
    .fetch_optional(&state.pool)
    .await?;

    let campaign = campaign.ok_or(ApiError::NotFound)?;
    if campaign.user_id != user.user_id {
        // Hide other users' campaign ids
        return Err(ApiError::NotFound);
    }
    Ok(campaign)
}

/// Preflight: report whether activation would be allowed, consuming nothing
pub async fn check_ai_optimization(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<CheckResponse>, ApiError> {
    fetch_owned_campaign(&state, &user, campaign_id).await?;

    let decision = state
        .billing
        .entitlements
        .assert_allowed(user.user_id, ResourceKind::AiCampaign, Some(campaign_id))
        .await?;

    Ok(Json(CheckResponse {
        allowed: true,
        decision,
    }))
}

pub async fn enable_ai_optimization(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<ActivationResponse>, ApiError> {
    let campaign = fetch_owned_campaign(&state, &user, campaign_id).await?;

    if campaign.status == "archived" {
        return Err(ApiError::BadRequest(
            "archived campaigns cannot be optimized".to_string(),
        ));
    }
    if campaign.ai_optimization_enabled {
        return Ok(Json(ActivationResponse {
            campaign_id,
            ai_optimization_enabled: true,
            satisfied_by: None,
            slot_id: None,
        }));
    }

    let mut tx = state.pool.begin().await.map_err(ApiError::from)?;

    let authorized = state
        .billing
        .entitlements
        .authorize_activation(&mut tx, user.user_id, campaign_id)
        .await?;

    let updated = sqlx::query(
        r#"
        UPDATE campaigns
        SET ai_optimization_enabled = TRUE, ai_enabled_at = NOW(), updated_at = NOW()
        WHERE id = $1 AND NOT ai_optimization_enabled
        "#,
    )
    .bind(campaign_id)
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() == 0 {
        // A concurrent request enabled it first; roll back so the slot (if
        // any) stays unconsumed.
        tx.rollback().await.map_err(ApiError::from)?;
        return Ok(Json(ActivationResponse {
            campaign_id,
            ai_optimization_enabled: true,
            satisfied_by: None,
            slot_id: None,
        }));
    }

    state
        .billing
        .audit
        .log_tx(
            &mut tx,
            AuditEventBuilder::new(user.user_id, AuditEventType::AiOptimizationEnabled)
                .actor(ActorType::User, user.user_id)
                .data(serde_json::json!({
                    "campaign_id": campaign_id,
                    "satisfied_by": authorized.decision,
                    "slot_id": authorized.slot.as_ref().map(|s| s.id),
                })),
        )
        .await?;

    tx.commit().await.map_err(ApiError::from)?;

    tracing::info!(
        user_id = %user.user_id,
        campaign_id = %campaign_id,
        satisfied_by = ?authorized.decision,
        "AI optimization enabled"
    );

    Ok(Json(ActivationResponse {
        campaign_id,
        ai_optimization_enabled: true,
        satisfied_by: Some(authorized.decision),
        slot_id: authorized.slot.map(|s| s.id),
    }))
}

/// Disabling is not capacity-gated and never refunds a consumed slot
pub async fn disable_ai_optimization(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<ActivationResponse>, ApiError> {
    fetch_owned_campaign(&state, &user, campaign_id).await?;

    let updated = sqlx::query(
        r#"
        UPDATE campaigns
        SET ai_optimization_enabled = FALSE, updated_at = NOW()
        WHERE id = $1 AND ai_optimization_enabled
        "#,
    )
    .bind(campaign_id)
    .execute(&state.pool)
    .await?;

    if updated.rows_affected() > 0 {
        state
            .billing
            .audit
            .log_best_effort(
                AuditEventBuilder::new(user.user_id, AuditEventType::AiOptimizationDisabled)
                    .actor(ActorType::User, user.user_id)
                    .data(serde_json::json!({ "campaign_id": campaign_id })),
            )
            .await;
    }

    Ok(Json(ActivationResponse {
        campaign_id,
        ai_optimization_enabled: false,
        satisfied_by: None,
        slot_id: None,
    }))
}
