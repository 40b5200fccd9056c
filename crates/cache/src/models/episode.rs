use crate::error::{Error, ErrorKind, Result};
use crate::models::{from_integer, from_nanos, to_integer, to_nanos};
use crate::repo::{EntityStore, Fetcher, Stored};
use async_trait::async_trait;
use exn::ResultExt;
use melo_remote::ApiHandle;
use melo_remote::error::Result as RemoteResult;
use melo_remote::models::{RemoteEpisode, ShowRef};
use sqlx::SqliteConnection;
use std::time::Duration;
use time::UtcDateTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Episode {
    pub id: String,
    pub name: String,
    pub show: ShowRef,
    pub description: Option<String>,
    pub duration: Duration,
    pub release_date: Option<String>,
}

#[derive(sqlx::FromRow)]
pub(crate) struct EpisodeRow {
    id: String,
    name: String,
    show_id: String,
    show_name: String,
    description: Option<String>,
    duration_ms: i64,
    release_date: Option<String>,
    fetched_at: Option<i64>,
}

impl TryFrom<EpisodeRow> for Stored<Episode> {
    type Error = Error;
    fn try_from(row: EpisodeRow) -> Result<Self> {
        Ok(Stored {
            value: Episode {
                id: row.id,
                name: row.name,
                show: ShowRef { id: row.show_id, name: row.show_name },
                description: row.description,
                duration: Duration::from_millis(from_integer(row.duration_ms, "episode duration")?),
                release_date: row.release_date,
            },
            fetched_at: row.fetched_at.map(|at| from_nanos(at, "episode fetch time")).transpose()?,
        })
    }
}

/// Stores episodes. The service's resume point seeds the local playback
/// position, but never overrides one that was already recorded locally.
pub struct EpisodeStore;

#[async_trait]
impl EntityStore<Episode, RemoteEpisode> for EpisodeStore {
    fn table(&self) -> &'static str {
        "episodes"
    }

    async fn load(&self, conn: &mut SqliteConnection, id: &str) -> Result<Option<Stored<Episode>>> {
        let row: Option<EpisodeRow> = sqlx::query_as(include_str!("../../queries/get_episode.sql"))
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(Stored::try_from).transpose()
    }

    async fn convert(
        &self,
        conn: &mut SqliteConnection,
        remote: RemoteEpisode,
        fetched_at: UtcDateTime,
    ) -> Result<Episode> {
        sqlx::query(include_str!("../../queries/upsert_episode.sql"))
            .bind(&remote.id)
            .bind(&remote.name)
            .bind(&remote.show.id)
            .bind(&remote.show.name)
            .bind(&remote.description)
            .bind(to_integer(remote.duration_ms, "episode duration")?)
            .bind(&remote.release_date)
            .bind(to_nanos(fetched_at)?)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if let Some(resume) = remote.resume_point {
            sqlx::query(
                "INSERT INTO episode_positions (id, position_ms, fully_played, updated_at) VALUES (?, ?, ?, ?)
                 ON CONFLICT (id) DO NOTHING",
            )
            .bind(&remote.id)
            .bind(to_integer(resume.resume_position_ms, "resume position")?)
            .bind(resume.fully_played)
            .bind(to_nanos(fetched_at)?)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        }
        Ok(Episode {
            id: remote.id,
            name: remote.name,
            show: remote.show,
            description: remote.description,
            duration: Duration::from_millis(remote.duration_ms),
            release_date: remote.release_date,
        })
    }
}

pub struct EpisodeFetcher {
    api: ApiHandle,
    batch: usize,
}

impl EpisodeFetcher {
    pub fn new(api: ApiHandle, max_batch_size: usize) -> Self {
        let batch = max_batch_size.min(api.max_batch_size());
        Self { api, batch }
    }
}

#[async_trait]
impl Fetcher<RemoteEpisode> for EpisodeFetcher {
    fn max_batch_size(&self) -> usize {
        self.batch
    }

    async fn fetch(&self, ids: &[String]) -> RemoteResult<Vec<RemoteEpisode>> {
        self.api.episodes(ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use melo_remote::models::ResumePoint;

    fn remote_episode(position_ms: u64) -> RemoteEpisode {
        RemoteEpisode {
            id: "e1".to_string(),
            name: "Pilot".to_string(),
            show: ShowRef { id: "s1".to_string(), name: "Show".to_string() },
            description: Some("The first one".to_string()),
            duration_ms: 3_600_000,
            release_date: Some("2024-01-01".to_string()),
            resume_point: Some(ResumePoint { resume_position_ms: position_ms, fully_played: false }),
        }
    }

    async fn position(conn: &mut SqliteConnection) -> i64 {
        sqlx::query_scalar("SELECT position_ms FROM episode_positions WHERE id = 'e1'")
            .fetch_one(&mut *conn)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_resume_point_only_seeds() {
        let db = Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let episode = EpisodeStore.convert(&mut conn, remote_episode(1_000), UtcDateTime::now()).await.unwrap();
        assert_eq!(episode.duration, Duration::from_secs(3600));
        assert_eq!(position(&mut conn).await, 1_000);
        EpisodeStore.convert(&mut conn, remote_episode(9_000), UtcDateTime::now()).await.unwrap();
        assert_eq!(position(&mut conn).await, 1_000);
        let stored = EpisodeStore.load(&mut conn, "e1").await.unwrap().unwrap();
        assert_eq!(stored.value, episode);
    }
}
