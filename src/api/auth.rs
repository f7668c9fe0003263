//! Account endpoints. The tokens issued here are the same ones the media
//! endpoints accept, whether as a bearer header or as the `token` query
//! param a bare `<audio src>` has to use.

use crate::api::middleware::RequireAuth;
use crate::api::AppState;
use crate::error::{AppError, Result};
use crate::models::{AuthResponse, CreateUserRequest, LoginRequest, UserInfo};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use validator::Validate;

pub fn auth_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/me", get(me))
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<AuthResponse>)> {
    validated(&req)?;
    let response = state.auth_service.register(req).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthResponse>> {
    validated(&req)?;
    let response = state.auth_service.login(req).await?;
    Ok(Json(response))
}

/// Who the presented token belongs to. Useful for clients checking whether
/// a stored token is still good before starting playback.
async fn me(
    State(state): State<Arc<AppState>>,
    RequireAuth(identity): RequireAuth,
) -> Result<Json<UserInfo>> {
    let user = state.auth_service.get_user(identity.user_id).await?;
    Ok(Json(user.into()))
}

fn validated<T: Validate>(req: &T) -> Result<()> {
    req.validate()
        .map_err(|e| AppError::Validation(e.to_string()))
}
