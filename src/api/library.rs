//! Thin catalog reads, plus the track deletion that feeds cache
//! invalidation. Scanning and richer library features live elsewhere.

use crate::api::middleware::{RequireAdmin, RequireAuth};
use crate::api::AppState;
use crate::error::{AppError, Result};
use crate::models::Track;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;

pub fn library_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tracks", get(list_tracks))
        .route("/tracks/:id", get(get_track).delete(delete_track))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_tracks(
    State(state): State<Arc<AppState>>,
    RequireAuth(_): RequireAuth,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<Track>>> {
    let tracks = state
        .catalog
        .list_tracks(page.limit.unwrap_or(100), page.offset.unwrap_or(0))
        .await?;
    Ok(Json(tracks))
}

async fn get_track(
    State(state): State<Arc<AppState>>,
    RequireAuth(_): RequireAuth,
    Path(id): Path<i64>,
) -> Result<Json<Track>> {
    let track = state
        .catalog
        .get_track(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Track {} not found", id)))?;
    Ok(Json(track))
}

async fn delete_track(
    State(state): State<Arc<AppState>>,
    RequireAdmin(_): RequireAdmin,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    state.catalog.delete_track(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
