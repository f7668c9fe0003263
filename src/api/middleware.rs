use crate::api::AppState;
use crate::error::{AppError, Result};
use crate::services::auth::TokenIdentity;
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use std::sync::Arc;

/// Validated identity for a request. Accepts the token either as an
/// `Authorization: Bearer` header or as a `token` query parameter; media
/// elements cannot attach headers when pointed at a URL directly, so the
/// query form exists for them. The header wins when both are present.
pub struct RequireAuth(pub TokenIdentity);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequireAuth {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self> {
        let header_token = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);

        let token = header_token
            .or_else(|| query_token(parts.uri.query()))
            .ok_or(AppError::Unauthorized)?;

        let identity = state.auth_service.validate(&token)?;
        Ok(RequireAuth(identity))
    }
}

pub struct RequireAdmin(pub TokenIdentity);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequireAdmin {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self> {
        let RequireAuth(identity) = RequireAuth::from_request_parts(parts, state).await?;

        if !identity.admin {
            return Err(AppError::Forbidden);
        }

        Ok(RequireAdmin(identity))
    }
}

/// Pull `token=<tok>` out of a raw query string. Tokens are URL-safe JWTs,
/// so no percent-decoding is needed.
fn query_token(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == "token" && !value.is_empty()).then(|| value.to_string())
        })
}
