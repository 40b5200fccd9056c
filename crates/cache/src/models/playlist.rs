use crate::error::{Error, ErrorKind, Result};
use crate::models::{from_json, from_nanos, to_json, to_nanos};
use crate::repo::{EntityStore, Fetcher, Stored};
use async_trait::async_trait;
use exn::ResultExt;
use melo_remote::ApiHandle;
use melo_remote::error::{ErrorKind as RemoteErrorKind, Result as RemoteResult};
use melo_remote::models::{Owner, RemotePlaylist};
use sqlx::SqliteConnection;
use time::UtcDateTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Playlist {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub owner: Owner,
    /// Changes whenever the playlist's contents change upstream.
    pub snapshot_id: Option<String>,
    pub track_ids: Vec<String>,
}

impl From<RemotePlaylist> for Playlist {
    fn from(remote: RemotePlaylist) -> Self {
        Self {
            id: remote.id,
            name: remote.name,
            description: remote.description,
            owner: remote.owner,
            snapshot_id: remote.snapshot_id,
            track_ids: remote.tracks,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct PlaylistRow {
    id: String,
    name: String,
    description: Option<String>,
    owner_id: String,
    owner_name: Option<String>,
    snapshot_id: Option<String>,
    tracks: String,
    fetched_at: Option<i64>,
}

impl TryFrom<PlaylistRow> for Stored<Playlist> {
    type Error = Error;
    fn try_from(row: PlaylistRow) -> Result<Self> {
        Ok(Stored {
            value: Playlist {
                id: row.id,
                name: row.name,
                description: row.description,
                owner: Owner { id: row.owner_id, display_name: row.owner_name },
                snapshot_id: row.snapshot_id,
                track_ids: from_json(&row.tracks, "playlist tracks")?,
            },
            fetched_at: row.fetched_at.map(|at| from_nanos(at, "playlist fetch time")).transpose()?,
        })
    }
}

pub struct PlaylistStore;

#[async_trait]
impl EntityStore<Playlist, RemotePlaylist> for PlaylistStore {
    fn table(&self) -> &'static str {
        "playlists"
    }

    async fn load(&self, conn: &mut SqliteConnection, id: &str) -> Result<Option<Stored<Playlist>>> {
        let row: Option<PlaylistRow> = sqlx::query_as(include_str!("../../queries/get_playlist.sql"))
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(Stored::try_from).transpose()
    }

    async fn convert(
        &self,
        conn: &mut SqliteConnection,
        remote: RemotePlaylist,
        fetched_at: UtcDateTime,
    ) -> Result<Playlist> {
        let playlist = Playlist::from(remote);
        sqlx::query(include_str!("../../queries/upsert_playlist.sql"))
            .bind(&playlist.id)
            .bind(&playlist.name)
            .bind(&playlist.description)
            .bind(&playlist.owner.id)
            .bind(&playlist.owner.display_name)
            .bind(&playlist.snapshot_id)
            .bind(to_json(&playlist.track_ids, "playlist tracks")?)
            .bind(to_nanos(fetched_at)?)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(playlist)
    }
}

/// Playlists have no multi-id endpoint: every id is its own request.
pub struct PlaylistFetcher {
    api: ApiHandle,
}

impl PlaylistFetcher {
    pub fn new(api: ApiHandle) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Fetcher<RemotePlaylist> for PlaylistFetcher {
    fn max_batch_size(&self) -> usize {
        1
    }

    async fn fetch(&self, ids: &[String]) -> RemoteResult<Vec<RemotePlaylist>> {
        let mut playlists = Vec::with_capacity(ids.len());
        for id in ids {
            match self.api.playlist(id).await {
                Ok(playlist) => playlists.push(playlist),
                // Report unknown ids the same way multi-id endpoints do.
                Err(err) if matches!(&*err, RemoteErrorKind::NotFound(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(playlists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use melo_remote::{Call, MockCatalog};
    use std::sync::Arc;

    fn remote_playlist(id: &str) -> RemotePlaylist {
        RemotePlaylist {
            id: id.to_string(),
            name: "Late Night".to_string(),
            description: None,
            owner: Owner { id: "u1".to_string(), display_name: Some("Someone".to_string()) },
            snapshot_id: Some("s1".to_string()),
            tracks: vec!["t1".to_string()],
        }
    }

    #[tokio::test]
    async fn test_unknown_playlists_are_absent() {
        let api = Arc::new(MockCatalog::default().with_playlists([remote_playlist("p1")]));
        let fetcher = PlaylistFetcher::new(api.clone());
        let found = fetcher.fetch(&["p1".to_string(), "p2".to_string()]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(api.calls(Call::Playlist), 2);
    }

    #[tokio::test]
    async fn test_network_errors_propagate() {
        let api = Arc::new(MockCatalog::default());
        api.fail(Call::Playlist, RemoteErrorKind::Network("offline".to_string()));
        let err = PlaylistFetcher::new(api).fetch(&["p1".to_string()]).await.unwrap_err();
        assert!(matches!(&*err, RemoteErrorKind::Network(_)));
    }

    #[tokio::test]
    async fn test_convert_then_load() {
        let db = crate::Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let playlist = PlaylistStore.convert(&mut conn, remote_playlist("p1"), UtcDateTime::now()).await.unwrap();
        let stored = PlaylistStore.load(&mut conn, "p1").await.unwrap().unwrap();
        assert_eq!(stored.value, playlist);
        assert_eq!(stored.value.owner.display_name.as_deref(), Some("Someone"));
    }
}
