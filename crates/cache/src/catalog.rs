use crate::error::{ErrorKind, Result};
use crate::models::{AlbumFetcher, AlbumStore, ArtistFetcher, ArtistStore, EpisodeFetcher, EpisodeStore};
use crate::models::{PlaylistFetcher, PlaylistStore, TrackFetcher, TrackStore};
use crate::position::PlaybackPositions;
use crate::rating::RatingRepository;
use crate::saved::SavedRepository;
use crate::{AlbumRepository, ArtistRepository, Database, EpisodeRepository, PlaylistRepository, TrackRepository};
use exn::ResultExt;
use melo_config::Config;
use melo_remote::ApiHandle;
use melo_remote::models::SavedKind;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Every repository of one catalog, sharing a database and a cancellation
/// scope.
///
/// Create one at startup and [`close`](Self::close) it at shutdown.
pub struct Catalog {
    db: Database,
    cancel: CancellationToken,
    artists: ArtistRepository,
    albums: AlbumRepository,
    tracks: TrackRepository,
    playlists: PlaylistRepository,
    episodes: EpisodeRepository,
    /// In [`SavedKind::ALL`] order.
    saved: [SavedRepository; 5],
    ratings: RatingRepository,
    positions: PlaybackPositions,
}

impl Catalog {
    /// Open (and migrate) the configured database and build every
    /// repository on top of it.
    #[tracing::instrument("opening catalog", skip_all, fields(database = %config.database.display(), api = api.name()))]
    pub async fn open(config: &Config, api: ApiHandle) -> Result<Self> {
        config.validate().or_raise(|| ErrorKind::Validation("invalid configuration".to_string()))?;
        let db = Database::connect(&config.database).await?;
        Ok(Self::with_database(config, api, db))
    }

    /// Build the repositories on an already connected database.
    pub fn with_database(config: &Config, api: ApiHandle, db: Database) -> Self {
        let cancel = CancellationToken::new();
        let batch = config.max_batch_size;
        let strategies = &config.strategies;
        let ratings = RatingRepository::new(db.clone(), config.max_rating, cancel.child_token());
        let artists = ArtistRepository::new(
            db.clone(),
            Arc::new(ArtistFetcher::new(api.clone(), batch)),
            Arc::new(ArtistStore),
            strategies.artist.into(),
            cancel.child_token(),
        );
        let albums = AlbumRepository::new(
            db.clone(),
            Arc::new(AlbumFetcher::new(api.clone(), batch)),
            Arc::new(AlbumStore),
            strategies.album.into(),
            cancel.child_token(),
        );
        let tracks = TrackRepository::new(
            db.clone(),
            Arc::new(TrackFetcher::new(api.clone(), batch)),
            Arc::new(TrackStore::with_ratings(ratings.clone())),
            strategies.track.into(),
            cancel.child_token(),
        );
        let playlists = PlaylistRepository::new(
            db.clone(),
            Arc::new(PlaylistFetcher::new(api.clone())),
            Arc::new(PlaylistStore),
            strategies.playlist.into(),
            cancel.child_token(),
        );
        let episodes = EpisodeRepository::new(
            db.clone(),
            Arc::new(EpisodeFetcher::new(api.clone(), batch)),
            Arc::new(EpisodeStore),
            strategies.episode.into(),
            cancel.child_token(),
        );
        let saved = SavedKind::ALL.map(|kind| {
            SavedRepository::new(
                kind,
                db.clone(),
                api.clone(),
                batch,
                config.library_page_size,
                strategies.library.into(),
                cancel.child_token(),
            )
        });
        let positions = PlaybackPositions::new(db.clone());
        Self { db, cancel, artists, albums, tracks, playlists, episodes, saved, ratings, positions }
    }

    pub fn artists(&self) -> &ArtistRepository {
        &self.artists
    }

    pub fn albums(&self) -> &AlbumRepository {
        &self.albums
    }

    pub fn tracks(&self) -> &TrackRepository {
        &self.tracks
    }

    pub fn playlists(&self) -> &PlaylistRepository {
        &self.playlists
    }

    pub fn episodes(&self) -> &EpisodeRepository {
        &self.episodes
    }

    /// The saved items of one kind.
    pub fn saved(&self, kind: SavedKind) -> &SavedRepository {
        let index = match kind {
            SavedKind::Track => 0,
            SavedKind::Album => 1,
            SavedKind::Artist => 2,
            SavedKind::Playlist => 3,
            SavedKind::Episode => 4,
        };
        &self.saved[index]
    }

    pub fn ratings(&self) -> &RatingRepository {
        &self.ratings
    }

    pub fn positions(&self) -> &PlaybackPositions {
        &self.positions
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Cancel everything in flight, then close the database.
    pub async fn close(&self) {
        tracing::debug!("Closing catalog");
        self.cancel.cancel();
        self.db.close().await;
    }
}
