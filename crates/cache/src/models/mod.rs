//! Catalog entities and how they are stored.
//!
//! Each entity module holds the view model, its database row, the
//! [`EntityStore`](crate::repo::EntityStore) persisting it and the
//! [`Fetcher`](crate::repo::Fetcher) requesting it from the catalog API.

mod album;
mod artist;
mod episode;
mod playlist;
mod track;

pub use self::album::{Album, AlbumFetcher, AlbumStore};
pub use self::artist::{Artist, ArtistFetcher, ArtistStore};
pub use self::episode::{Episode, EpisodeFetcher, EpisodeStore};
pub use self::playlist::{Playlist, PlaylistFetcher, PlaylistStore};
pub use self::track::{Track, TrackFetcher, TrackStore};

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::UtcDateTime;

pub(crate) fn to_nanos(at: UtcDateTime) -> Result<i64> {
    i64::try_from(at.unix_timestamp_nanos()).or_raise(|| ErrorKind::InvalidData("timestamp"))
}

pub(crate) fn from_nanos(nanos: i64, what: &'static str) -> Result<UtcDateTime> {
    UtcDateTime::from_unix_timestamp_nanos(i128::from(nanos)).or_raise(|| ErrorKind::InvalidData(what))
}

pub(crate) fn to_json<V: Serialize + ?Sized>(value: &V, what: &'static str) -> Result<String> {
    serde_json::to_string(value).or_raise(|| ErrorKind::InvalidData(what))
}

pub(crate) fn from_json<V: DeserializeOwned>(json: &str, what: &'static str) -> Result<V> {
    serde_json::from_str(json).or_raise(|| ErrorKind::InvalidData(what))
}

pub(crate) fn to_integer<I: TryInto<i64>>(value: I, what: &'static str) -> Result<i64> {
    value.try_into().ok().ok_or_else(|| exn::Exn::from(ErrorKind::InvalidData(what)))
}

pub(crate) fn from_integer<I: TryFrom<i64>>(value: i64, what: &'static str) -> Result<I> {
    I::try_from(value).ok().ok_or_else(|| exn::Exn::from(ErrorKind::InvalidData(what)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_keep_nanoseconds() {
        let now = UtcDateTime::now();
        assert_eq!(from_nanos(to_nanos(now).unwrap(), "now").unwrap(), now);
    }

    #[test]
    fn test_integer_conversions_reject_out_of_range() {
        assert_eq!(from_integer::<u32>(7, "disc").unwrap(), 7);
        let err = from_integer::<u32>(-1, "disc").unwrap_err();
        assert_eq!(*err, ErrorKind::InvalidData("disc"));
        assert!(to_integer(u64::MAX, "followers").is_err());
    }

    #[test]
    fn test_bad_json_is_invalid_data() {
        let err = from_json::<Vec<String>>("{", "genres").unwrap_err();
        assert_eq!(*err, ErrorKind::InvalidData("genres"));
    }
}
