//! Billing surface: trials, checkout order recording, invoices
//!
//! Checkout itself (creating the order at the provider, collecting the
//! payment method) happens in the frontend against the provider; this
//! surface only records the resulting order so the webhook processor can
//! resolve it later.

use axum::extract::State;
use axum::{Extension, Json};
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use adpilot_billing::{Invoice, NewPayment, Payment, Subscription};
use adpilot_shared::PaymentPurpose;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Start (or return the existing) trial subscription
pub async fn start_trial(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Subscription>, ApiError> {
    let settings = state.billing.settings.load().await?;
    let sub = state
        .billing
        .subscriptions
        .ensure_trial(user.user_id, &settings.trial_plan_code)
        .await?;
    Ok(Json(sub))
}

#[derive(Debug, Deserialize)]
pub struct RecordOrderRequest {
    pub provider_order_id: String,
    pub amount_cents: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub purpose: PaymentPurpose,
    pub plan_id: Option<Uuid>,
    pub slot_count: Option<i32>,
}

fn default_currency() -> String {
    "USD".to_string()
}

pub async fn record_order(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<RecordOrderRequest>,
) -> Result<Json<Payment>, ApiError> {
    if req.provider_order_id.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "provider_order_id must not be empty".to_string(),
        ));
    }
    if req.amount_cents < 0 {
        return Err(ApiError::BadRequest(
            "amount_cents must be >= 0".to_string(),
        ));
    }

    let payment = state
        .billing
        .payments
        .record_order(NewPayment {
            user_id: user.user_id,
            provider_order_id: req.provider_order_id,
            amount_cents: req.amount_cents,
            currency: req.currency,
            purpose: req.purpose,
            plan_id: req.plan_id,
            slot_count: req.slot_count,
        })
        .await?;

    tracing::info!(
        user_id = %user.user_id,
        payment_id = %payment.id,
        order_id = %payment.provider_order_id,
        purpose = %payment.payment_for,
        "Checkout order recorded"
    );
    Ok(Json(payment))
}

#[derive(Debug, serde::Serialize)]
pub struct InvoiceListResponse {
    pub invoices: Vec<Invoice>,
    pub fetched_at: OffsetDateTime,
}

pub async fn list_invoices(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<InvoiceListResponse>, ApiError> {
    let invoices = state.billing.invoices.list_for_user(user.user_id).await?;
    Ok(Json(InvoiceListResponse {
        invoices,
        fetched_at: OffsetDateTime::now_utc(),
    }))
}
