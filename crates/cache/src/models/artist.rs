use crate::error::{Error, ErrorKind, Result};
use crate::models::{from_integer, from_json, from_nanos, to_integer, to_json, to_nanos};
use crate::repo::{EntityStore, Fetcher, Stored};
use async_trait::async_trait;
use exn::ResultExt;
use melo_remote::ApiHandle;
use melo_remote::error::Result as RemoteResult;
use melo_remote::models::{Image, RemoteArtist};
use sqlx::SqliteConnection;
use time::UtcDateTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artist {
    pub id: String,
    pub name: String,
    pub genres: Vec<String>,
    pub images: Vec<Image>,
    pub popularity: Option<u32>,
    pub followers: Option<u64>,
}

impl From<RemoteArtist> for Artist {
    fn from(remote: RemoteArtist) -> Self {
        Self {
            id: remote.id,
            name: remote.name,
            genres: remote.genres,
            images: remote.images,
            popularity: remote.popularity,
            followers: remote.followers,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct ArtistRow {
    id: String,
    name: String,
    genres: String,
    images: String,
    popularity: Option<i64>,
    followers: Option<i64>,
    fetched_at: Option<i64>,
}

impl TryFrom<ArtistRow> for Stored<Artist> {
    type Error = Error;
    fn try_from(row: ArtistRow) -> Result<Self> {
        Ok(Stored {
            value: Artist {
                id: row.id,
                name: row.name,
                genres: from_json(&row.genres, "artist genres")?,
                images: from_json(&row.images, "artist images")?,
                popularity: row.popularity.map(|p| from_integer(p, "artist popularity")).transpose()?,
                followers: row.followers.map(|f| from_integer(f, "artist followers")).transpose()?,
            },
            fetched_at: row.fetched_at.map(|at| from_nanos(at, "artist fetch time")).transpose()?,
        })
    }
}

pub struct ArtistStore;

#[async_trait]
impl EntityStore<Artist, RemoteArtist> for ArtistStore {
    fn table(&self) -> &'static str {
        "artists"
    }

    async fn load(&self, conn: &mut SqliteConnection, id: &str) -> Result<Option<Stored<Artist>>> {
        let row: Option<ArtistRow> = sqlx::query_as(include_str!("../../queries/get_artist.sql"))
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(Stored::try_from).transpose()
    }

    async fn convert(&self, conn: &mut SqliteConnection, remote: RemoteArtist, fetched_at: UtcDateTime) -> Result<Artist> {
        let artist = Artist::from(remote);
        sqlx::query(include_str!("../../queries/upsert_artist.sql"))
            .bind(&artist.id)
            .bind(&artist.name)
            .bind(to_json(&artist.genres, "artist genres")?)
            .bind(to_json(&artist.images, "artist images")?)
            .bind(artist.popularity.map(i64::from))
            .bind(artist.followers.map(|f| to_integer(f, "artist followers")).transpose()?)
            .bind(to_nanos(fetched_at)?)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(artist)
    }
}

pub struct ArtistFetcher {
    api: ApiHandle,
    batch: usize,
}

impl ArtistFetcher {
    pub fn new(api: ApiHandle, max_batch_size: usize) -> Self {
        let batch = max_batch_size.min(api.max_batch_size());
        Self { api, batch }
    }
}

#[async_trait]
impl Fetcher<RemoteArtist> for ArtistFetcher {
    fn max_batch_size(&self) -> usize {
        self.batch
    }

    async fn fetch(&self, ids: &[String]) -> RemoteResult<Vec<RemoteArtist>> {
        self.api.artists(ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn remote_artist(id: &str) -> RemoteArtist {
        RemoteArtist {
            id: id.to_string(),
            name: format!("Artist {id}"),
            genres: vec!["ambient".to_string()],
            images: vec![Image { url: format!("https://img.example/{id}.jpg"), width: Some(64), height: None }],
            popularity: Some(42),
            followers: None,
        }
    }

    #[tokio::test]
    async fn test_convert_then_load() {
        let db = Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let fetched_at = UtcDateTime::now();
        let artist = ArtistStore.convert(&mut conn, remote_artist("a1"), fetched_at).await.unwrap();
        assert_eq!(artist.genres, vec!["ambient".to_string()]);

        let stored = ArtistStore.load(&mut conn, "a1").await.unwrap().unwrap();
        assert_eq!(stored.value, artist);
        assert_eq!(stored.fetched_at, Some(fetched_at));
        assert!(ArtistStore.load(&mut conn, "a2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidate_keeps_data() {
        let db = Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        ArtistStore.convert(&mut conn, remote_artist("a1"), UtcDateTime::now()).await.unwrap();
        assert!(ArtistStore.invalidate(&mut conn, "a1").await.unwrap());
        assert!(!ArtistStore.invalidate(&mut conn, "a2").await.unwrap());
        let stored = ArtistStore.load(&mut conn, "a1").await.unwrap().unwrap();
        assert_eq!(stored.fetched_at, None);
        assert_eq!(stored.value.name, "Artist a1");
    }
}
