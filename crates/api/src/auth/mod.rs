//! Authentication
//!
//! HS256 bearer tokens. The middleware verifies the token and stores an
//! [`AuthUser`] in request extensions; `require_admin` additionally gates on
//! the `admin` role. Token issuance lives in the identity service; this
//! crate only verifies.

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Verified caller identity, inserted into request extensions
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub role: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

/// JWT claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: user id
    pub sub: String,
    /// Role: "user" or "admin"
    pub role: String,
    /// Expiry (unix seconds)
    pub exp: i64,
}

/// Token verification (and test-only issuance)
#[derive(Clone)]
pub struct JwtManager {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtManager {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, ApiError> {
        let validation = Validation::new(Algorithm::HS256);
        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "Token verification failed");
                ApiError::Unauthorized
            })
    }

    /// Issue a token; used by tests and local tooling
    pub fn issue(&self, user_id: Uuid, role: &str, ttl_seconds: i64) -> Result<String, ApiError> {
        let claims = Claims {
            sub: user_id.to_string(),
            role: role.to_string(),
            exp: time::OffsetDateTime::now_utc().unix_timestamp() + ttl_seconds,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| ApiError::Internal(e.to_string()))
    }
}

fn bearer_token(request: &Request) -> Result<&str, ApiError> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)
}

/// Middleware: any authenticated user
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let claims = state.jwt_manager.verify(bearer_token(&request)?)?;
    let user_id: Uuid = claims.sub.parse().map_err(|_| ApiError::Unauthorized)?;

    request.extensions_mut().insert(AuthUser {
        user_id,
        role: claims.role,
    });
    Ok(next.run(request).await)
}

/// Middleware: admin role required
pub async fn require_admin(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let claims = state.jwt_manager.verify(bearer_token(&request)?)?;
    let user_id: Uuid = claims.sub.parse().map_err(|_| ApiError::Unauthorized)?;

    let user = AuthUser {
        user_id,
        role: claims.role,
    };
    if !user.is_admin() {
        tracing::warn!(user_id = %user.user_id, "Non-admin attempted admin route");
        return Err(ApiError::Forbidden);
    }

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> JwtManager {
        JwtManager::new("unit-test-secret-at-least-32-bytes!!")
    }

    #[test]
    fn test_issue_and_verify_round_trip() {
        let manager = manager();
        let user_id = Uuid::new_v4();
        let token = manager.issue(user_id, "admin", 3600).unwrap();
        let claims = manager.verify(&token).unwrap();
        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.role, "admin");
    }

    #[test]
    fn test_expired_token_rejected() {
        let manager = manager();
        let token = manager.issue(Uuid::new_v4(), "user", -120).unwrap();
        assert!(manager.verify(&token).is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = manager().issue(Uuid::new_v4(), "user", 3600).unwrap();
        let other = JwtManager::new("a-completely-different-32-byte-key!");
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn test_admin_role_check() {
        let admin = AuthUser {
            user_id: Uuid::new_v4(),
            role: "admin".to_string(),
        };
        let user = AuthUser {
            user_id: Uuid::new_v4(),
            role: "user".to_string(),
        };
        assert!(admin.is_admin());
        assert!(!user.is_admin());
    }
}
