//! Entitlement summary endpoints

use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde::Serialize;

use adpilot_billing::EntitlementSummary;
use adpilot_shared::LimitKey;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

pub async fn get_entitlements(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<EntitlementSummary>, ApiError> {
    let summary = state.billing.entitlements.summary(user.user_id).await?;
    Ok(Json(summary))
}

#[derive(Debug, Serialize)]
pub struct EffectiveLimitResponse {
    pub key: LimitKey,
    pub value: i64,
}

pub async fn get_effective_limit(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(key): Path<String>,
) -> Result<Json<EffectiveLimitResponse>, ApiError> {
    let key: LimitKey = key
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("unknown limit key '{key}'")))?;

    let value = state
        .billing
        .entitlements
        .get_effective_limit(user.user_id, key)
        .await?;

    Ok(Json(EffectiveLimitResponse { key, value }))
}
