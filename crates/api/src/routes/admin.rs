//! Admin routes
//!
//! Every mutation here requires the admin role, a non-empty reason, and is
//! audited by the underlying service inside the mutation transaction.

use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use adpilot_billing::{
    ActorType, AddonSlot, InvariantCheckSummary, InvariantViolation, RuntimeSettings,
    RuntimeSettingsUpdate, Subscription, UsageOverride,
};
use adpilot_shared::LimitKey;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

fn parse_limit_key(key: &str) -> Result<LimitKey, ApiError> {
    key.parse()
        .map_err(|_| ApiError::BadRequest(format!("unknown limit key '{key}'")))
}

// ---------------------------------------------------------------------------
// Overrides
// ---------------------------------------------------------------------------

pub async fn list_overrides(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Vec<UsageOverride>>, ApiError> {
    let overrides = state.billing.overrides.list_for_user(user_id).await?;
    Ok(Json(overrides))
}

#[derive(Debug, Deserialize)]
pub struct UpsertOverrideRequest {
    pub value: i32,
    pub expires_at: Option<OffsetDateTime>,
    pub reason: String,
}

pub async fn upsert_override(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path((user_id, key)): Path<(Uuid, String)>,
    Json(req): Json<UpsertOverrideRequest>,
) -> Result<Json<UsageOverride>, ApiError> {
    let key = parse_limit_key(&key)?;
    let row = state
        .billing
        .overrides
        .upsert(
            admin.user_id,
            user_id,
            key,
            req.value,
            req.expires_at,
            &req.reason,
        )
        .await?;
    Ok(Json(row))
}

#[derive(Debug, Deserialize)]
pub struct ReasonRequest {
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteOverrideResponse {
    pub deleted: bool,
}

pub async fn delete_override(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path((user_id, key)): Path<(Uuid, String)>,
    Json(req): Json<ReasonRequest>,
) -> Result<Json<DeleteOverrideResponse>, ApiError> {
    let key = parse_limit_key(&key)?;
    let deleted = state
        .billing
        .overrides
        .delete(admin.user_id, user_id, key, &req.reason)
        .await?;
    Ok(Json(DeleteOverrideResponse { deleted }))
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AssignSubscriptionRequest {
    pub plan_id: Uuid,
    pub reason: String,
}

pub async fn assign_subscription(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<AssignSubscriptionRequest>,
) -> Result<Json<Subscription>, ApiError> {
    let sub = state
        .billing
        .subscriptions
        .admin_assign(admin.user_id, user_id, req.plan_id, &req.reason)
        .await?;
    Ok(Json(sub))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<ReasonRequest>,
) -> Result<Json<Subscription>, ApiError> {
    if req.reason.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "a non-empty reason is required".to_string(),
        ));
    }

    let current = state
        .billing
        .subscriptions
        .current_for_user(user_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let sub = state
        .billing
        .subscriptions
        .cancel(
            current.id,
            ActorType::Admin,
            Some(admin.user_id),
            Some(&req.reason),
        )
        .await?;
    Ok(Json(sub))
}

// ---------------------------------------------------------------------------
// Addon slots
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ExtendSlotRequest {
    pub new_expires_at: OffsetDateTime,
    pub reason: String,
}

pub async fn extend_slot(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(slot_id): Path<Uuid>,
    Json(req): Json<ExtendSlotRequest>,
) -> Result<Json<AddonSlot>, ApiError> {
    let slot = state
        .billing
        .slots
        .extend_expiry(admin.user_id, slot_id, req.new_expires_at, &req.reason)
        .await?;
    Ok(Json(slot))
}

pub async fn expire_slot(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(slot_id): Path<Uuid>,
    Json(req): Json<ReasonRequest>,
) -> Result<Json<AddonSlot>, ApiError> {
    let slot = state
        .billing
        .slots
        .force_expire(admin.user_id, slot_id, &req.reason)
        .await?;
    Ok(Json(slot))
}

#[derive(Debug, Deserialize)]
pub struct AdjustSlotRequest {
    pub extra_capacity: i32,
    pub reason: String,
}

pub async fn adjust_slot(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(slot_id): Path<Uuid>,
    Json(req): Json<AdjustSlotRequest>,
) -> Result<Json<AddonSlot>, ApiError> {
    let slot = state
        .billing
        .slots
        .adjust_capacity(admin.user_id, slot_id, req.extra_capacity, &req.reason)
        .await?;
    Ok(Json(slot))
}

// ---------------------------------------------------------------------------
// Runtime settings
// ---------------------------------------------------------------------------

pub async fn get_settings(
    State(state): State<AppState>,
) -> Result<Json<RuntimeSettings>, ApiError> {
    let settings = state.billing.settings.load().await?;
    Ok(Json(settings))
}

#[derive(Debug, Deserialize)]
pub struct UpdateSettingsRequest {
    #[serde(flatten)]
    pub changes: RuntimeSettingsUpdate,
    pub reason: String,
}

pub async fn update_settings(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Json(req): Json<UpdateSettingsRequest>,
) -> Result<Json<RuntimeSettings>, ApiError> {
    let settings = state
        .billing
        .settings
        .update(admin.user_id, req.changes, &req.reason)
        .await?;
    Ok(Json(settings))
}

// ---------------------------------------------------------------------------
// Invariants
// ---------------------------------------------------------------------------

pub async fn run_invariants(
    State(state): State<AppState>,
) -> Result<Json<InvariantCheckSummary>, ApiError> {
    let summary = state.billing.invariants.run_all_checks().await?;
    if !summary.healthy {
        tracing::warn!(
            violations = summary.violations.len(),
            "Invariant check found violations"
        );
    }
    Ok(Json(summary))
}

pub async fn run_invariant(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<InvariantViolation>>, ApiError> {
    let violations = state.billing.invariants.run_check(&name).await?;
    Ok(Json(violations))
}
