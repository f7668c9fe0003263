//! Read access to the track catalog.
//!
//! The streaming core consumes track records produced by the scanner and
//! never mutates them, with one exception: deleting a track, which also
//! publishes the id so the stream cache can drop the track's artifacts.

use crate::error::{AppError, Result};
use crate::models::Track;
use sqlx::PgPool;
use tokio::sync::broadcast;

pub struct Catalog {
    db: PgPool,
    deletions: broadcast::Sender<i64>,
}

impl Catalog {
    pub fn new(db: PgPool) -> Self {
        let (deletions, _) = broadcast::channel(64);
        Catalog { db, deletions }
    }

    pub async fn get_track(&self, id: i64) -> Result<Option<Track>> {
        let track = sqlx::query_as::<_, Track>("SELECT * FROM tracks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(track)
    }

    pub async fn list_tracks(&self, limit: i64, offset: i64) -> Result<Vec<Track>> {
        let tracks = sqlx::query_as::<_, Track>(
            "SELECT * FROM tracks ORDER BY artist, album, id LIMIT $1 OFFSET $2",
        )
        .bind(limit.clamp(1, 500))
        .bind(offset.max(0))
        .fetch_all(&self.db)
        .await?;
        Ok(tracks)
    }

    /// Remove a track and announce the deletion to cache listeners.
    pub async fn delete_track(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM tracks WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Track {} not found", id)));
        }
        // Receivers may lag or be absent; the delete itself already happened
        let _ = self.deletions.send(id);
        Ok(())
    }

    /// Subscribe to track deletions. Each deleted track id is delivered to
    /// every subscriber.
    pub fn subscribe_deletions(&self) -> broadcast::Receiver<i64> {
        self.deletions.subscribe()
    }
}
