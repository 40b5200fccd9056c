//! Fixtures shared by unit tests.

use melo_remote::models::{AlbumRef, ArtistRef, RemoteTrack};

pub(crate) fn remote_track(id: &str, artists: &[&str]) -> RemoteTrack {
    RemoteTrack {
        id: id.to_string(),
        name: format!("Track {id}"),
        album: Some(AlbumRef { id: "al1".to_string(), name: "Album".to_string() }),
        artists: artists.iter().map(|a| ArtistRef { id: a.to_string(), name: format!("Artist {a}") }).collect(),
        duration_ms: 180_000,
        disc_number: 1,
        track_number: 1,
        explicit: false,
    }
}

pub(crate) fn ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}
