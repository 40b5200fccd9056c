use crate::error::{Error, ErrorKind, Result};
use crate::models::{from_json, from_nanos, to_json, to_nanos};
use crate::repo::{EntityStore, Fetcher, Stored};
use async_trait::async_trait;
use exn::ResultExt;
use melo_remote::ApiHandle;
use melo_remote::error::Result as RemoteResult;
use melo_remote::models::{ArtistRef, Image, RemoteAlbum};
use sqlx::SqliteConnection;
use time::UtcDateTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Album {
    pub id: String,
    pub name: String,
    pub album_type: Option<String>,
    pub artists: Vec<ArtistRef>,
    /// As sent by the service: `YYYY`, `YYYY-MM` or `YYYY-MM-DD`.
    pub release_date: Option<String>,
    pub images: Vec<Image>,
    /// Track ids in disc/track order.
    pub track_ids: Vec<String>,
}

impl From<RemoteAlbum> for Album {
    fn from(remote: RemoteAlbum) -> Self {
        Self {
            id: remote.id,
            name: remote.name,
            album_type: remote.album_type,
            artists: remote.artists,
            release_date: remote.release_date,
            images: remote.images,
            track_ids: remote.tracks,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct AlbumRow {
    id: String,
    name: String,
    album_type: Option<String>,
    artists: String,
    release_date: Option<String>,
    images: String,
    tracks: String,
    fetched_at: Option<i64>,
}

impl TryFrom<AlbumRow> for Stored<Album> {
    type Error = Error;
    fn try_from(row: AlbumRow) -> Result<Self> {
        Ok(Stored {
            value: Album {
                id: row.id,
                name: row.name,
                album_type: row.album_type,
                artists: from_json(&row.artists, "album artists")?,
                release_date: row.release_date,
                images: from_json(&row.images, "album images")?,
                track_ids: from_json(&row.tracks, "album tracks")?,
            },
            fetched_at: row.fetched_at.map(|at| from_nanos(at, "album fetch time")).transpose()?,
        })
    }
}

pub struct AlbumStore;

#[async_trait]
impl EntityStore<Album, RemoteAlbum> for AlbumStore {
    fn table(&self) -> &'static str {
        "albums"
    }

    async fn load(&self, conn: &mut SqliteConnection, id: &str) -> Result<Option<Stored<Album>>> {
        let row: Option<AlbumRow> = sqlx::query_as(include_str!("../../queries/get_album.sql"))
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(Stored::try_from).transpose()
    }

    async fn convert(&self, conn: &mut SqliteConnection, remote: RemoteAlbum, fetched_at: UtcDateTime) -> Result<Album> {
        let album = Album::from(remote);
        sqlx::query(include_str!("../../queries/upsert_album.sql"))
            .bind(&album.id)
            .bind(&album.name)
            .bind(&album.album_type)
            .bind(to_json(&album.artists, "album artists")?)
            .bind(&album.release_date)
            .bind(to_json(&album.images, "album images")?)
            .bind(to_json(&album.track_ids, "album tracks")?)
            .bind(to_nanos(fetched_at)?)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(album)
    }
}

pub struct AlbumFetcher {
    api: ApiHandle,
    batch: usize,
}

impl AlbumFetcher {
    pub fn new(api: ApiHandle, max_batch_size: usize) -> Self {
        let batch = max_batch_size.min(api.max_batch_size());
        Self { api, batch }
    }
}

#[async_trait]
impl Fetcher<RemoteAlbum> for AlbumFetcher {
    fn max_batch_size(&self) -> usize {
        self.batch
    }

    async fn fetch(&self, ids: &[String]) -> RemoteResult<Vec<RemoteAlbum>> {
        self.api.albums(ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[tokio::test]
    async fn test_track_order_survives_storage() {
        let db = Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let remote = RemoteAlbum {
            id: "al1".to_string(),
            name: "Geogaddi".to_string(),
            album_type: Some("album".to_string()),
            artists: vec![ArtistRef { id: "a1".to_string(), name: "Boards of Canada".to_string() }],
            release_date: Some("2002-02".to_string()),
            images: vec![],
            tracks: vec!["t3".to_string(), "t1".to_string(), "t2".to_string()],
        };
        let album = AlbumStore.convert(&mut conn, remote, UtcDateTime::now()).await.unwrap();
        let stored = AlbumStore.load(&mut conn, "al1").await.unwrap().unwrap();
        assert_eq!(stored.value, album);
        assert_eq!(stored.value.track_ids, vec!["t3", "t1", "t2"]);
    }

    #[test]
    fn test_batch_follows_the_smaller_limit() {
        let api: ApiHandle = std::sync::Arc::new(melo_remote::MockCatalog::default().with_max_batch_size(20));
        assert_eq!(AlbumFetcher::new(api.clone(), 50).max_batch_size(), 20);
        assert_eq!(AlbumFetcher::new(api, 5).max_batch_size(), 5);
    }
}
