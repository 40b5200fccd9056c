//! Local cache of a streaming service's catalog and the user's library.
//!
//! The cache keeps catalog entities (artists, albums, tracks, playlists,
//! episodes) in SQLite and hands them out as live [`StateCell`]s, which
//! are updated as fetches progress. The streaming service stays the source
//! of truth for the catalog: deleting the database only costs refetches.
//! Ratings and playback positions are local and exist nowhere else.
//!
//! # Architecture
//! - [`Repository`] serves one entity type. Cached copies are checked
//!   against a [`CacheStrategy`], concurrent requests for an id share one
//!   network fetch, and network calls are batched.
//! - [`SavedRepository`](saved::SavedRepository) tracks what the user saved,
//!   with optimistic toggles and all-or-nothing library syncs.
//! - [`RatingRepository`](rating::RatingRepository) keeps rating history and
//!   derives per-artist averages.
//! - [`Catalog`] builds all of them over one [`Database`] and closes them
//!   together.

mod catalog;
mod db;
pub mod error;
pub mod models;
pub mod position;
pub mod rating;
pub mod repo;
pub mod saved;
pub mod state;
pub mod strategy;
#[cfg(test)]
mod testing;

pub use crate::catalog::Catalog;
pub use crate::db::Database;
pub use crate::repo::Repository;
pub use crate::state::{CacheState, StateCell, Toggle, ToggleableState};
pub use crate::strategy::{CacheStrategy, Freshness};
use melo_remote::models::{RemoteAlbum, RemoteArtist, RemoteEpisode, RemotePlaylist, RemoteTrack};

pub type ArtistRepository = Repository<models::Artist, RemoteArtist>;
pub type AlbumRepository = Repository<models::Album, RemoteAlbum>;
pub type TrackRepository = Repository<models::Track, RemoteTrack>;
pub type PlaylistRepository = Repository<models::Playlist, RemotePlaylist>;
pub type EpisodeRepository = Repository<models::Episode, RemoteEpisode>;
