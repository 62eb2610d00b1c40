use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use lexguard_core::Principal;
use serde::{Deserialize, Serialize};

use crate::{routes::ApiError, AppState};

/// Bearer token claims. `sub` is the principal id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: u64,
}

/// HS256 verification keys derived from `JWT_SECRET`.
pub struct JwtKeys {
    decoding: DecodingKey,
    #[cfg(test)]
    encoding: jsonwebtoken::EncodingKey,
}

impl JwtKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            #[cfg(test)]
            encoding: jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Principal, ApiError> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|e| ApiError::Unauthorized(format!("invalid token: {e}")))?;
        if data.claims.sub.trim().is_empty() {
            return Err(ApiError::Unauthorized("token has no subject".into()));
        }
        Ok(Principal::new(data.claims.sub))
    }

    #[cfg(test)]
    pub fn issue(&self, sub: &str, ttl_secs: u64) -> String {
        let exp = chrono::Utc::now().timestamp() as u64 + ttl_secs;
        let claims = Claims {
            sub: sub.to_string(),
            exp,
        };
        jsonwebtoken::encode(&jsonwebtoken::Header::default(), &claims, &self.encoding)
            .unwrap_or_default()
    }
}

/// `Authorization: Bearer <jwt>`, or `?token=<jwt>` for EventSource clients that cannot set headers.
fn bearer_token(parts: &Parts) -> Option<String> {
    if let Some(value) = parts.headers.get(header::AUTHORIZATION) {
        let value = value.to_str().ok()?;
        return value
            .strip_prefix("Bearer ")
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
    }
    parts
        .uri
        .query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// The authenticated caller of a request.
pub struct AuthPrincipal(pub Principal);

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthPrincipal {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| ApiError::Unauthorized("missing bearer token".into()))?;
        state.jwt.verify(&token).map(AuthPrincipal)
    }
}
