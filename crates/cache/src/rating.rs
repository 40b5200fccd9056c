//! Local ratings with full history.
//!
//! Ratings never leave the device. Every call to [`RatingRepository::rate`]
//! appends a record; clearing a rating appends a tombstone, so earlier
//! ratings stay in the history. The current rating of an id is its most
//! recent record.

use crate::Database;
use crate::error::{Error, ErrorKind, Result};
use crate::models::{from_integer, from_nanos, to_nanos};
use crate::state::{StateCell, ToggleableState};
use derive_more::Display;
use exn::ResultExt;
use melo_asyncutils::{Broadcast, WeakBroadcast};
use sqlx::SqliteConnection;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::UtcDateTime;
use tokio_util::sync::CancellationToken;

/// A rating between zero and the configured maximum.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rating(u8);

impl Rating {
    pub fn new(value: u8, max: u8) -> Result<Self> {
        if value > max {
            exn::bail!(ErrorKind::Validation(format!("rating {value} is out of range 0..={max}")));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

/// One entry of an id's rating history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatingRecord {
    pub id: String,
    /// `None` records clearing the rating.
    pub rating: Option<Rating>,
    pub rated_at: UtcDateTime,
}

#[derive(sqlx::FromRow)]
struct RatingRow {
    id: String,
    rating: Option<i64>,
    rated_at: i64,
}

impl TryFrom<RatingRow> for RatingRecord {
    type Error = Error;
    fn try_from(row: RatingRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            rating: row.rating.map(|r| from_integer(r, "rating").map(Rating)).transpose()?,
            rated_at: from_nanos(row.rated_at, "rating time")?,
        })
    }
}

type RatingCell = StateCell<ToggleableState<Option<Rating>>>;
type AverageCell = StateCell<ToggleableState<Option<f64>>>;

struct Inner {
    db: Database,
    max: u8,
    ratings: Mutex<HashMap<String, WeakBroadcast<ToggleableState<Option<Rating>>>>>,
    averages: Mutex<HashMap<String, WeakBroadcast<ToggleableState<Option<f64>>>>>,
    /// Held from reading an average to publishing it, so the last value
    /// published is never older than the last rating.
    recompute: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn live_cell<V: Clone>(cells: &Mutex<HashMap<String, WeakBroadcast<V>>>, id: &str) -> Option<Broadcast<V>> {
    lock(cells).get(id).and_then(WeakBroadcast::upgrade)
}

/// Returns the cell and whether it was just created.
fn cell<V: Clone>(cells: &Mutex<HashMap<String, WeakBroadcast<V>>>, id: &str, initial: V) -> (Broadcast<V>, bool) {
    let mut cells = lock(cells);
    if let Some(cell) = cells.get(id).and_then(WeakBroadcast::upgrade) {
        return (cell, false);
    }
    cells.retain(|_, cell| !cell.is_dropped());
    let cell = Broadcast::new(initial);
    cells.insert(id.to_string(), cell.downgrade());
    (cell, true)
}

/// User ratings of tracks (or anything else with an id), and per-artist
/// averages derived from track ratings.
#[derive(Clone)]
pub struct RatingRepository {
    inner: Arc<Inner>,
}

impl RatingRepository {
    pub fn new(db: Database, max_rating: u8, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                max: max_rating,
                ratings: Mutex::new(HashMap::new()),
                averages: Mutex::new(HashMap::new()),
                recompute: tokio::sync::Mutex::new(()),
                cancel,
            }),
        }
    }

    pub fn max_rating(&self) -> u8 {
        self.inner.max
    }

    /// A [`Rating`] within this repository's range.
    pub fn rating(&self, value: u8) -> Result<Rating> {
        Rating::new(value, self.inner.max)
    }

    /// Record a new current rating for `id`, or clear it with `None`.
    pub async fn rate(&self, id: &str, rating: Option<Rating>) -> Result<RatingRecord> {
        if id.is_empty() {
            exn::bail!(ErrorKind::Validation("rated ids must not be empty".to_string()));
        }
        if let Some(rating) = rating {
            Rating::new(rating.value(), self.inner.max)?;
        }
        let record = RatingRecord { id: id.to_string(), rating, rated_at: UtcDateTime::now() };
        let row = record.clone();
        let artists: Vec<String> = self
            .inner
            .db
            .transaction("record rating", move |conn| {
                Box::pin(async move {
                    sqlx::query(include_str!("../queries/insert_rating.sql"))
                        .bind(&row.id)
                        .bind(row.rating.map(|r| i64::from(r.value())))
                        .bind(to_nanos(row.rated_at)?)
                        .execute(&mut *conn)
                        .await
                        .or_raise(|| ErrorKind::Database)?;
                    sqlx::query_scalar("SELECT artist_id FROM track_artists WHERE track_id = ?")
                        .bind(&row.id)
                        .fetch_all(&mut *conn)
                        .await
                        .or_raise(|| ErrorKind::Database)
                })
            })
            .await?;
        tracing::debug!(id, rating = ?rating.map(Rating::value), "Rated");

        if let Some(cell) = live_cell(&self.inner.ratings, id) {
            cell.publish(ToggleableState::Set(rating));
        }
        self.inner.publish_averages(artists).await;
        Ok(record)
    }

    /// Recompute every observed artist average, for when track attribution
    /// changed.
    pub async fn refresh_averages(&self) {
        let artists: Vec<String> = lock(&self.inner.averages)
            .iter()
            .filter(|(_, cell)| !cell.is_dropped())
            .map(|(artist, _)| artist.clone())
            .collect();
        self.inner.publish_averages(artists).await;
    }

    /// Live current rating of `id`, `Unknown` until loaded.
    ///
    /// # Panics
    /// If `id` is empty.
    pub fn rating_state(&self, id: &str) -> RatingCell {
        assert!(!id.is_empty(), "rated ids must not be empty");
        let (cell, created) = cell(&self.inner.ratings, id, ToggleableState::Unknown);
        if created {
            let inner = Arc::clone(&self.inner);
            let key = id.to_string();
            self.inner.load_into(cell.clone(), async move { inner.last(&key).await.map(|r| r.and_then(|r| r.rating)) });
        }
        cell
    }

    /// Every rating ever given to `id`, newest first.
    pub async fn all_ratings_of(&self, id: &str) -> Result<Vec<RatingRecord>> {
        let key = id.to_string();
        let rows: Vec<RatingRow> = self
            .inner
            .db
            .transaction("load rating history", move |conn| {
                Box::pin(async move {
                    sqlx::query_as(include_str!("../queries/get_ratings.sql"))
                        .bind(&key)
                        .fetch_all(&mut *conn)
                        .await
                        .or_raise(|| ErrorKind::Database)
                })
            })
            .await?;
        rows.into_iter().map(RatingRecord::try_from).collect()
    }

    /// The current rating of `id`: `None` if it was never rated or was
    /// cleared last.
    pub async fn last_rating_of(&self, id: &str) -> Result<Option<Rating>> {
        Ok(self.inner.last(id).await?.and_then(|record| record.rating))
    }

    /// Live mean of the current ratings of every track attributed to
    /// `artist_id`. Unrated tracks are left out; `None` when no track is
    /// rated.
    ///
    /// # Panics
    /// If `artist_id` is empty.
    pub fn average_rating_state_of_artist(&self, artist_id: &str) -> AverageCell {
        assert!(!artist_id.is_empty(), "artist ids must not be empty");
        let (cell, created) = cell(&self.inner.averages, artist_id, ToggleableState::Unknown);
        if created {
            let inner = Arc::clone(&self.inner);
            let key = artist_id.to_string();
            self.inner.load_into(cell.clone(), async move { inner.average(&key).await });
        }
        cell
    }

    pub fn close(&self) {
        self.inner.cancel.cancel();
    }
}

impl Inner {
    async fn publish_averages(&self, artists: Vec<String>) {
        let _guard = self.recompute.lock().await;
        for artist in artists {
            let Some(cell) = live_cell(&self.averages, &artist) else {
                continue;
            };
            match self.average(&artist).await {
                Ok(average) => cell.publish(ToggleableState::Set(average)),
                Err(err) => tracing::warn!(%artist, error = ?err, "Could not recompute artist rating"),
            }
        }
    }

    /// Publish the result of `load` into `cell` unless something newer was
    /// published first.
    fn load_into<V, F>(&self, cell: StateCell<ToggleableState<V>>, load: F)
    where
        V: Clone + Send + Sync + 'static,
        F: Future<Output = Result<V>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {},
                loaded = load => match loaded {
                    Ok(value) => {
                        cell.update(|state| matches!(state, ToggleableState::Unknown).then(|| ToggleableState::Set(value)));
                    },
                    Err(err) => tracing::warn!(error = ?err, "Could not load rating"),
                },
            }
        });
    }

    async fn last(&self, id: &str) -> Result<Option<RatingRecord>> {
        let key = id.to_string();
        let row: Option<RatingRow> = self
            .db
            .transaction("load last rating", move |conn| Box::pin(async move { last_row(conn, &key).await }))
            .await?;
        row.map(RatingRecord::try_from).transpose()
    }

    async fn average(&self, artist_id: &str) -> Result<Option<f64>> {
        let key = artist_id.to_string();
        self.db
            .transaction("average artist rating", move |conn| {
                Box::pin(async move {
                    sqlx::query_scalar(include_str!("../queries/get_artist_average.sql"))
                        .bind(&key)
                        .fetch_one(&mut *conn)
                        .await
                        .or_raise(|| ErrorKind::Database)
                })
            })
            .await
    }
}

async fn last_row(conn: &mut SqliteConnection, id: &str) -> Result<Option<RatingRow>> {
    sqlx::query_as(include_str!("../queries/get_last_rating.sql"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TrackStore;
    use crate::repo::EntityStore;
    use crate::testing::remote_track;
    use rstest::rstest;

    async fn repository() -> RatingRepository {
        let db = Database::connect_in_memory().await.unwrap();
        RatingRepository::new(db, 5, CancellationToken::new())
    }

    async fn with_track(repo: &RatingRepository, id: &str, artists: &[&str]) {
        let mut conn = repo.inner.db.pool().acquire().await.unwrap();
        TrackStore::default().convert(&mut conn, remote_track(id, artists), UtcDateTime::now()).await.unwrap();
    }

    #[rstest]
    #[case(0, true)]
    #[case(5, true)]
    #[case(6, false)]
    fn test_rating_range(#[case] value: u8, #[case] valid: bool) {
        match Rating::new(value, 5) {
            Ok(rating) => {
                assert!(valid);
                assert_eq!(rating.value(), value);
            },
            Err(err) => {
                assert!(!valid);
                assert!(matches!(&*err, ErrorKind::Validation(_)));
            },
        }
    }

    #[tokio::test]
    async fn test_clearing_keeps_history() {
        let repo = repository().await;
        repo.rate("t1", Some(repo.rating(3).unwrap())).await.unwrap();
        assert_eq!(repo.last_rating_of("t1").await.unwrap().map(Rating::value), Some(3));

        repo.rate("t1", None).await.unwrap();
        assert_eq!(repo.last_rating_of("t1").await.unwrap(), None);
        let history = repo.all_ratings_of("t1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].rating, None);
        assert_eq!(history[1].rating.map(Rating::value), Some(3));
        assert!(history[0].rated_at >= history[1].rated_at);
    }

    #[tokio::test]
    async fn test_never_rated() {
        let repo = repository().await;
        assert_eq!(repo.last_rating_of("t1").await.unwrap(), None);
        assert!(repo.all_ratings_of("t1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_rating_is_rejected() {
        let db = Database::connect_in_memory().await.unwrap();
        let strict = RatingRepository::new(db, 3, CancellationToken::new());
        let err = strict.rate("t1", Some(Rating::new(5, 10).unwrap())).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Validation(_)));
        assert!(strict.all_ratings_of("t1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rating_state_follows_rates() {
        let repo = repository().await;
        repo.rate("t1", Some(repo.rating(4).unwrap())).await.unwrap();
        let cell = repo.rating_state("t1");
        let loaded = cell.subscribe().wait_for(|state| state.known().is_some()).await.unwrap();
        assert_eq!(loaded, ToggleableState::Set(Some(repo.rating(4).unwrap())));

        repo.rate("t1", None).await.unwrap();
        assert_eq!(cell.get(), ToggleableState::Set(None));
    }

    #[tokio::test]
    async fn test_artist_average_excludes_unrated() {
        let repo = repository().await;
        with_track(&repo, "t1", &["a1"]).await;
        with_track(&repo, "t2", &["a1"]).await;
        with_track(&repo, "t3", &["a1", "a2"]).await;
        repo.rate("t1", Some(repo.rating(2).unwrap())).await.unwrap();
        repo.rate("t2", Some(repo.rating(4).unwrap())).await.unwrap();
        repo.rate("t3", Some(repo.rating(5).unwrap())).await.unwrap();
        repo.rate("t3", None).await.unwrap();

        let cell = repo.average_rating_state_of_artist("a1");
        let average = cell.subscribe().wait_for(|state| state.known().is_some()).await.unwrap();
        assert_eq!(average, ToggleableState::Set(Some(3.0)));

        let unrated = repo.average_rating_state_of_artist("a2");
        let average = unrated.subscribe().wait_for(|state| state.known().is_some()).await.unwrap();
        assert_eq!(average, ToggleableState::Set(None));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_rates_publish_the_latest_average() {
        let repo = repository().await;
        let tracks: Vec<String> = (0..12).map(|n| format!("t{n}")).collect();
        for track in &tracks {
            with_track(&repo, track, &["a1"]).await;
        }
        let cell = repo.average_rating_state_of_artist("a1");
        cell.subscribe().wait_for(|state| state.known().is_some()).await.unwrap();

        let rates = tracks.iter().enumerate().map(|(n, track)| {
            let repo = repo.clone();
            let track = track.clone();
            let value = if n % 2 == 0 { 1 } else { 5 };
            tokio::spawn(async move { repo.rate(&track, Some(repo.rating(value).unwrap())).await })
        });
        for rated in futures::future::join_all(rates).await {
            rated.unwrap().unwrap();
        }
        assert_eq!(cell.get(), ToggleableState::Set(Some(3.0)));
    }

    #[tokio::test]
    async fn test_artist_average_is_recomputed() {
        let repo = repository().await;
        with_track(&repo, "t1", &["a1"]).await;
        with_track(&repo, "t2", &["a1"]).await;
        let cell = repo.average_rating_state_of_artist("a1");
        cell.subscribe().wait_for(|state| state.known().is_some()).await.unwrap();
        assert_eq!(cell.get(), ToggleableState::Set(None));

        repo.rate("t1", Some(repo.rating(1).unwrap())).await.unwrap();
        assert_eq!(cell.get(), ToggleableState::Set(Some(1.0)));
        repo.rate("t2", Some(repo.rating(4).unwrap())).await.unwrap();
        assert_eq!(cell.get(), ToggleableState::Set(Some(2.5)));
        // Ratings of unattributed ids do not touch the average.
        repo.rate("t9", Some(repo.rating(5).unwrap())).await.unwrap();
        assert_eq!(cell.get(), ToggleableState::Set(Some(2.5)));
    }
}
