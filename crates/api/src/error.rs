//! API error responses
//!
//! Maps the billing error taxonomy onto HTTP statuses with a stable JSON
//! body: `{"code", "message", "action"?}`. Capacity denials carry the
//! machine-readable remediation action so clients can route the user to an
//! upgrade or slot purchase instead of pattern-matching message text.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use adpilot_billing::BillingError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Billing(#[from] BillingError),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("{0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,

    #[error("internal error")]
    Internal(String),
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => ApiError::NotFound,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Billing(e) => match e {
                BillingError::WebhookSignatureInvalid => StatusCode::UNAUTHORIZED,
                BillingError::WebhookPayloadInvalid(_) => StatusCode::BAD_REQUEST,
                BillingError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                BillingError::SubscriptionRequired => StatusCode::PAYMENT_REQUIRED,
                BillingError::CapacityExceeded { .. } => StatusCode::CONFLICT,
                BillingError::CooldownActive { .. } | BillingError::RateLimited { .. } => {
                    StatusCode::TOO_MANY_REQUESTS
                }
                BillingError::AutomationDisabled | BillingError::FeatureDisabled(_) => {
                    StatusCode::FORBIDDEN
                }
                BillingError::NotFound(_) => StatusCode::NOT_FOUND,
                BillingError::InvalidTransition { .. } => StatusCode::CONFLICT,
                BillingError::InvariantViolation(_)
                | BillingError::Database(_)
                | BillingError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Billing(e) => e.code(),
            ApiError::Unauthorized => "unauthorized",
            ApiError::Forbidden => "forbidden",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound => "not_found",
            ApiError::Internal(_) => "internal_error",
        }
    }

    /// Client-safe message; internals are logged, not leaked
    fn public_message(&self) -> String {
        match self {
            ApiError::Billing(e) => match e {
                BillingError::InvariantViolation(_)
                | BillingError::Database(_)
                | BillingError::Config(_) => "internal error".to_string(),
                other => other.to_string(),
            },
            ApiError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(error = %self, detail = ?self, "Request failed with internal error");
        } else {
            tracing::debug!(error = %self, status = %status, "Request rejected");
        }

        let action = match &self {
            ApiError::Billing(e) => e.remediation().map(|a| a.as_str()),
            _ => None,
        };

        let mut body = serde_json::json!({
            "code": self.code(),
            "message": self.public_message(),
        });
        if let Some(action) = action {
            body["action"] = serde_json::Value::String(action.to_string());
        }
        if let ApiError::Billing(
            BillingError::CooldownActive {
                retry_after_seconds,
            }
            | BillingError::RateLimited {
                retry_after_seconds,
            },
        ) = &self
        {
            body["retry_after_seconds"] = serde_json::json!(retry_after_seconds);
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adpilot_shared::RemediationAction;

    #[test]
    fn test_capacity_maps_to_conflict() {
        let err = ApiError::Billing(BillingError::CapacityExceeded {
            limit: 3,
            action: RemediationAction::BuySlots,
        });
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.code(), "capacity_exceeded");
    }

    #[test]
    fn test_signature_failure_is_unauthorized() {
        let err = ApiError::Billing(BillingError::WebhookSignatureInvalid);
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_internal_detail_not_leaked() {
        let err = ApiError::Billing(BillingError::Database("password=hunter2".to_string()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.public_message(), "internal error");
    }

    #[test]
    fn test_transient_denials_map_to_429() {
        let err = ApiError::Billing(BillingError::RateLimited {
            retry_after_seconds: 60,
        });
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
