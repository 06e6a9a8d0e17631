//! Provider webhook endpoint
//!
//! The body is taken as raw bytes: the signature covers the exact bytes on
//! the wire, so any re-serialization before verification would break it.
//! The response is 200 for every verified, parseable delivery, including
//! event types we ignore, because the provider retries on anything else.
//! Only signature and parse failures return error statuses.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;

use crate::error::ApiError;
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "x-razorpay-signature";
const EVENT_ID_HEADER: &str = "x-razorpay-event-id";

pub async fn razorpay_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    tracing::info!(body_len = body.len(), "Provider webhook received");

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Provider webhook missing signature header");
            ApiError::Billing(adpilot_billing::BillingError::WebhookSignatureInvalid)
        })?;

    let event_id = headers.get(EVENT_ID_HEADER).and_then(|v| v.to_str().ok());

    let outcome = state
        .billing
        .webhooks
        .handle(&body, signature, event_id)
        .await?;

    tracing::info!(outcome = outcome.as_str(), "Provider webhook processed");
    Ok((
        StatusCode::OK,
        Json(serde_json::json!({ "status": outcome.as_str() })),
    ))
}
