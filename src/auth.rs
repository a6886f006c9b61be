//! Caller identity at the HTTP boundary. Tokens are issued elsewhere; this
//! module only verifies them.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::queue::SubscriptionTier;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub sub: Uuid,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub tier: SubscriptionTier,
    pub exp: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("admin role required")]
    Forbidden,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match self {
            AuthError::MissingToken | AuthError::InvalidToken(_) => {
                tracing::debug!(error = %self, "Rejected request");
                StatusCode::UNAUTHORIZED.into_response()
            }
            AuthError::Forbidden => StatusCode::FORBIDDEN.into_response(),
        }
    }
}

/// HS256 verifier for caller tokens.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        Ok(decode::<Claims>(token, &self.key, &self.validation)?.claims)
    }
}

fn bearer_token(parts: &Parts) -> Result<&str, AuthError> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::MissingToken)
}

/// Any authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub role: Role,
    pub tier: SubscriptionTier,
}

impl From<Claims> for AuthUser {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.sub,
            role: claims.role,
            tier: claims.tier,
        }
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        Ok(state.jwt.verify(token)?.into())
    }
}

/// A caller holding the admin role.
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthUser);

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        if user.role != Role::Admin {
            tracing::warn!(user_id = %user.user_id, "Non-admin caller on admin route");
            return Err(AuthError::Forbidden);
        }
        Ok(AdminUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn token(claims: &Claims, secret: &str) -> String {
        encode(&Header::new(Algorithm::HS256), claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn claims(role: Role) -> Claims {
        Claims {
            sub: Uuid::new_v4(),
            role,
            tier: SubscriptionTier::Premium,
            exp: chrono::Utc::now().timestamp() + 600,
        }
    }

    #[test]
    fn test_valid_token_round_trips() {
        let claims = claims(Role::Admin);
        let verified = JwtVerifier::new(SECRET).verify(&token(&claims, SECRET)).unwrap();
        assert_eq!(verified, claims);
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let result = JwtVerifier::new(SECRET).verify(&token(&claims(Role::User), "other"));
        let err = tokio_test::assert_err!(result);
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let mut claims = claims(Role::User);
        claims.exp = chrono::Utc::now().timestamp() - 3600;
        assert!(JwtVerifier::new(SECRET).verify(&token(&claims, SECRET)).is_err());
    }

    #[test]
    fn test_missing_claims_default_to_user_and_free() {
        let raw = serde_json::json!({ "sub": Uuid::new_v4(), "exp": chrono::Utc::now().timestamp() + 600 });
        let encoded = encode(&Header::new(Algorithm::HS256), &raw, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap();
        let verified = tokio_test::assert_ok!(JwtVerifier::new(SECRET).verify(&encoded));
        assert_eq!((verified.role, verified.tier), (Role::User, SubscriptionTier::Free));
    }

    #[test]
    fn test_bearer_token_parsing() {
        let (parts, _) = Request::builder()
            .header(AUTHORIZATION, "Bearer abc.def")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(bearer_token(&parts).unwrap(), "abc.def");

        let (parts, _) = Request::builder()
            .header(AUTHORIZATION, "Basic xyz")
            .body(())
            .unwrap()
            .into_parts();
        assert!(matches!(bearer_token(&parts), Err(AuthError::MissingToken)));
    }

    #[test]
    fn test_rejections_map_to_status_codes() {
        assert_eq!(AuthError::MissingToken.into_response().status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::Forbidden.into_response().status(), StatusCode::FORBIDDEN);
    }
}
