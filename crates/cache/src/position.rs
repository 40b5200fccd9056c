//! Where playback of each episode stopped.
//!
//! Positions are local: the service's resume point only seeds the first
//! one (see [`EpisodeStore`](crate::models::EpisodeStore)), after which the
//! last saved position wins.

use crate::Database;
use crate::error::{Error, ErrorKind, Result};
use crate::models::{from_integer, from_nanos, to_integer, to_nanos};
use exn::ResultExt;
use std::time::Duration;
use time::UtcDateTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackPosition {
    pub episode_id: String,
    pub position: Duration,
    pub fully_played: bool,
    pub updated_at: UtcDateTime,
}

#[derive(sqlx::FromRow)]
struct PositionRow {
    id: String,
    position_ms: i64,
    fully_played: bool,
    updated_at: i64,
}

impl TryFrom<PositionRow> for PlaybackPosition {
    type Error = Error;
    fn try_from(row: PositionRow) -> Result<Self> {
        Ok(Self {
            episode_id: row.id,
            position: Duration::from_millis(from_integer(row.position_ms, "playback position")?),
            fully_played: row.fully_played,
            updated_at: from_nanos(row.updated_at, "position time")?,
        })
    }
}

#[derive(Clone)]
pub struct PlaybackPositions {
    db: Database,
}

impl PlaybackPositions {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn position_of(&self, episode_id: &str) -> Result<Option<PlaybackPosition>> {
        let row: Option<PositionRow> = sqlx::query_as(include_str!("../queries/get_position.sql"))
            .bind(episode_id)
            .fetch_optional(self.db.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(PlaybackPosition::try_from).transpose()
    }

    /// Replace the stored position of `episode_id`.
    pub async fn save_position(
        &self,
        episode_id: &str,
        position: Duration,
        fully_played: bool,
    ) -> Result<PlaybackPosition> {
        if episode_id.is_empty() {
            exn::bail!(ErrorKind::Validation("episode ids must not be empty".to_string()));
        }
        let saved = PlaybackPosition {
            episode_id: episode_id.to_string(),
            position,
            fully_played,
            updated_at: UtcDateTime::now(),
        };
        sqlx::query(include_str!("../queries/upsert_position.sql"))
            .bind(&saved.episode_id)
            .bind(to_integer(position.as_millis(), "playback position")?)
            .bind(fully_played)
            .bind(to_nanos(saved.updated_at)?)
            .execute(self.db.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        tracing::trace!(episode_id, position_ms = %position.as_millis(), fully_played, "Saved playback position");
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_last_write_wins() {
        let positions = PlaybackPositions::new(Database::connect_in_memory().await.unwrap());
        assert_eq!(positions.position_of("e1").await.unwrap(), None);

        positions.save_position("e1", Duration::from_secs(90), false).await.unwrap();
        let saved = positions.save_position("e1", Duration::from_secs(30), true).await.unwrap();
        let stored = positions.position_of("e1").await.unwrap().unwrap();
        assert_eq!(stored, saved);
        assert_eq!(stored.position, Duration::from_secs(30));
        assert!(stored.fully_played);
    }

    #[tokio::test]
    async fn test_empty_id_is_rejected() {
        let positions = PlaybackPositions::new(Database::connect_in_memory().await.unwrap());
        let err = positions.save_position("", Duration::ZERO, false).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Validation(_)));
    }
}
