use crate::error::{Error, ErrorKind, Result};
use crate::models::{from_integer, from_json, from_nanos, to_integer, to_json, to_nanos};
use crate::rating::RatingRepository;
use crate::repo::{EntityStore, Fetcher, Stored};
use async_trait::async_trait;
use exn::ResultExt;
use melo_remote::ApiHandle;
use melo_remote::error::Result as RemoteResult;
use melo_remote::models::{AlbumRef, ArtistRef, RemoteTrack};
use sqlx::SqliteConnection;
use std::time::Duration;
use time::UtcDateTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub id: String,
    pub name: String,
    pub album: Option<AlbumRef>,
    pub artists: Vec<ArtistRef>,
    pub duration: Duration,
    pub disc_number: u32,
    pub track_number: u32,
    pub explicit: bool,
}

impl From<RemoteTrack> for Track {
    fn from(remote: RemoteTrack) -> Self {
        Self {
            id: remote.id,
            name: remote.name,
            album: remote.album,
            artists: remote.artists,
            duration: Duration::from_millis(remote.duration_ms),
            disc_number: remote.disc_number,
            track_number: remote.track_number,
            explicit: remote.explicit,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct TrackRow {
    id: String,
    name: String,
    album_id: Option<String>,
    album_name: Option<String>,
    artists: String,
    duration_ms: i64,
    disc_number: i64,
    track_number: i64,
    explicit: bool,
    fetched_at: Option<i64>,
}

impl TryFrom<TrackRow> for Stored<Track> {
    type Error = Error;
    fn try_from(row: TrackRow) -> Result<Self> {
        let album = match (row.album_id, row.album_name) {
            (Some(id), Some(name)) => Some(AlbumRef { id, name }),
            (None, None) => None,
            _ => exn::bail!(ErrorKind::InvalidData("track album")),
        };
        Ok(Stored {
            value: Track {
                id: row.id,
                name: row.name,
                album,
                artists: from_json(&row.artists, "track artists")?,
                duration: Duration::from_millis(from_integer(row.duration_ms, "track duration")?),
                disc_number: from_integer(row.disc_number, "disc number")?,
                track_number: from_integer(row.track_number, "track number")?,
                explicit: row.explicit,
            },
            fetched_at: row.fetched_at.map(|at| from_nanos(at, "track fetch time")).transpose()?,
        })
    }
}

/// Stores tracks along with their artist attribution, which the rating
/// averages are computed from.
#[derive(Clone, Default)]
pub struct TrackStore {
    ratings: Option<RatingRepository>,
}

impl TrackStore {
    /// Refresh the artist averages of `ratings` whenever fetched tracks may
    /// have changed attribution.
    pub fn with_ratings(ratings: RatingRepository) -> Self {
        Self { ratings: Some(ratings) }
    }
}

#[async_trait]
impl EntityStore<Track, RemoteTrack> for TrackStore {
    fn table(&self) -> &'static str {
        "tracks"
    }

    async fn load(&self, conn: &mut SqliteConnection, id: &str) -> Result<Option<Stored<Track>>> {
        let row: Option<TrackRow> = sqlx::query_as(include_str!("../../queries/get_track.sql"))
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(Stored::try_from).transpose()
    }

    async fn convert(&self, conn: &mut SqliteConnection, remote: RemoteTrack, fetched_at: UtcDateTime) -> Result<Track> {
        let track = Track::from(remote);
        sqlx::query(include_str!("../../queries/upsert_track.sql"))
            .bind(&track.id)
            .bind(&track.name)
            .bind(track.album.as_ref().map(|a| a.id.as_str()))
            .bind(track.album.as_ref().map(|a| a.name.as_str()))
            .bind(to_json(&track.artists, "track artists")?)
            .bind(to_integer(track.duration.as_millis(), "track duration")?)
            .bind(i64::from(track.disc_number))
            .bind(i64::from(track.track_number))
            .bind(track.explicit)
            .bind(to_nanos(fetched_at)?)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        sqlx::query("DELETE FROM track_artists WHERE track_id = ?")
            .bind(&track.id)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        for (position, artist) in track.artists.iter().enumerate() {
            sqlx::query("INSERT OR IGNORE INTO track_artists (track_id, artist_id, position) VALUES (?, ?, ?)")
                .bind(&track.id)
                .bind(&artist.id)
                .bind(to_integer(position, "artist position")?)
                .execute(&mut *conn)
                .await
                .or_raise(|| ErrorKind::Database)?;
        }
        Ok(track)
    }

    async fn persisted(&self, _ids: &[String]) {
        if let Some(ratings) = &self.ratings {
            ratings.refresh_averages().await;
        }
    }
}

pub struct TrackFetcher {
    api: ApiHandle,
    batch: usize,
}

impl TrackFetcher {
    pub fn new(api: ApiHandle, max_batch_size: usize) -> Self {
        let batch = max_batch_size.min(api.max_batch_size());
        Self { api, batch }
    }
}

#[async_trait]
impl Fetcher<RemoteTrack> for TrackFetcher {
    fn max_batch_size(&self) -> usize {
        self.batch
    }

    async fn fetch(&self, ids: &[String]) -> RemoteResult<Vec<RemoteTrack>> {
        self.api.tracks(ids).await
    }
}
