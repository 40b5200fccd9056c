//! In-memory catalog for testing.

use crate::api::{CatalogApi, DEFAULT_MAX_BATCH_SIZE};
use crate::error::{ErrorKind, Result};
use crate::models::{Identified, RemoteAlbum, RemoteArtist, RemoteEpisode, RemotePlaylist, RemoteTrack, SavedKind};
use async_trait::async_trait;
use melo_asyncutils::Page;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// The [`CatalogApi`] method a request went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    Artists,
    Albums,
    Tracks,
    Episodes,
    Playlist,
    SavedPage,
    CheckSaved,
    PushSaved,
}

#[derive(Default)]
struct State {
    artists: HashMap<String, RemoteArtist>,
    albums: HashMap<String, RemoteAlbum>,
    tracks: HashMap<String, RemoteTrack>,
    episodes: HashMap<String, RemoteEpisode>,
    playlists: HashMap<String, RemotePlaylist>,
    saved: HashMap<SavedKind, Vec<String>>,
    scripted_pages: HashMap<SavedKind, Vec<Vec<String>>>,
    failures: HashMap<Call, ErrorKind>,
    failing_page: Option<usize>,
    requests: Vec<(Call, Vec<String>)>,
}

/// In-memory streaming service for testing.
///
/// Everything lives behind a [`Mutex`] so all trait methods can operate on
/// `&self`, and tests can change the catalog (or make it fail) while other
/// tasks are using it. Every request is recorded and can be inspected with
/// [`calls()`](Self::calls) and [`requests()`](Self::requests).
///
/// # Examples
///
/// ```
/// use melo_remote::{Call, CatalogApi, MockCatalog};
/// use melo_remote::models::{RemoteArtist, SavedKind};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let api = MockCatalog::default()
///     .with_artists([RemoteArtist {
///         id: "a1".to_string(),
///         name: "Boards of Canada".to_string(),
///         genres: vec![],
///         images: vec![],
///         popularity: None,
///         followers: None,
///     }])
///     .with_saved(SavedKind::Artist, ["a1"]);
/// let found = api.artists(&["a1".to_string(), "nope".to_string()]).await.unwrap();
/// assert_eq!(found.len(), 1);
/// assert_eq!(api.calls(Call::Artists), 1);
/// # }
/// ```
pub struct MockCatalog {
    name: String,
    state: Mutex<State>,
    delay: Option<Duration>,
    max_batch_size: usize,
}

impl Default for MockCatalog {
    fn default() -> Self {
        Self {
            name: "mock".to_string(),
            state: Mutex::new(State::default()),
            delay: None,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl MockCatalog {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Delay every response, so that concurrent callers overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_artists(self, artists: impl IntoIterator<Item = RemoteArtist>) -> Self {
        self.lock().artists.extend(artists.into_iter().map(|a| (a.id.clone(), a)));
        self
    }

    pub fn with_albums(self, albums: impl IntoIterator<Item = RemoteAlbum>) -> Self {
        self.lock().albums.extend(albums.into_iter().map(|a| (a.id.clone(), a)));
        self
    }

    pub fn with_tracks(self, tracks: impl IntoIterator<Item = RemoteTrack>) -> Self {
        self.lock().tracks.extend(tracks.into_iter().map(|t| (t.id.clone(), t)));
        self
    }

    pub fn with_episodes(self, episodes: impl IntoIterator<Item = RemoteEpisode>) -> Self {
        self.lock().episodes.extend(episodes.into_iter().map(|e| (e.id.clone(), e)));
        self
    }

    pub fn with_playlists(self, playlists: impl IntoIterator<Item = RemotePlaylist>) -> Self {
        self.lock().playlists.extend(playlists.into_iter().map(|p| (p.id.clone(), p)));
        self
    }

    /// Saved ids for `kind`, newest first.
    pub fn with_saved(self, kind: SavedKind, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.lock().saved.insert(kind, ids.into_iter().map(Into::into).collect());
        self
    }

    /// Serve `kind`'s saved set with exactly these pages, ignoring the
    /// requested page size. Membership checks still use the flattened pages.
    pub fn with_saved_pages<I, S>(self, kind: SavedKind, pages: impl IntoIterator<Item = I>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pages: Vec<Vec<String>> = pages.into_iter().map(|p| p.into_iter().map(Into::into).collect()).collect();
        let mut state = self.lock();
        state.saved.insert(kind, pages.iter().flatten().cloned().collect());
        state.scripted_pages.insert(kind, pages);
        drop(state);
        self
    }

    /// Make every request to `call` fail with `kind` until cleared.
    pub fn fail(&self, call: Call, kind: ErrorKind) {
        self.lock().failures.insert(call, kind);
    }

    pub fn clear_failure(&self, call: Call) {
        self.lock().failures.remove(&call);
    }

    /// Make the saved-set page at `index` (zero-based) fail with a network error.
    pub fn fail_page(&self, index: usize) {
        self.lock().failing_page = Some(index);
    }

    pub fn clear_failing_page(&self) {
        self.lock().failing_page = None;
    }

    pub fn insert_track(&self, track: RemoteTrack) {
        self.lock().tracks.insert(track.id.clone(), track);
    }

    pub fn remove_track(&self, id: &str) {
        self.lock().tracks.remove(id);
    }

    /// Current saved ids for `kind` as the service sees them.
    pub fn saved_ids(&self, kind: SavedKind) -> Vec<String> {
        self.lock().saved.get(&kind).cloned().unwrap_or_default()
    }

    /// Number of requests made to `call`.
    pub fn calls(&self, call: Call) -> usize {
        self.lock().requests.iter().filter(|(c, _)| *c == call).count()
    }

    /// Ids sent with every request made to `call`, in request order.
    pub fn requests(&self, call: Call) -> Vec<Vec<String>> {
        self.lock().requests.iter().filter(|(c, _)| *c == call).map(|(_, ids)| ids.clone()).collect()
    }

    async fn request(&self, call: Call, ids: &[String]) -> Result<()> {
        tracing::trace!(service = %self.name, ?call, ids = ids.len(), "Mock catalog request");
        self.lock().requests.push((call, ids.to_vec()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if ids.len() > self.max_batch_size {
            exn::bail!(ErrorKind::InvalidResponse(format!("batch of {} exceeds {}", ids.len(), self.max_batch_size)));
        }
        match self.lock().failures.get(&call) {
            Some(kind) => Err(exn::Exn::from(kind.clone())),
            None => Ok(()),
        }
    }

    fn pick<T: Clone + Identified>(map: &HashMap<String, T>, ids: &[String]) -> Vec<T> {
        ids.iter().filter_map(|id| map.get(id)).cloned().collect()
    }
}

#[async_trait]
impl CatalogApi for MockCatalog {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn artists(&self, ids: &[String]) -> Result<Vec<RemoteArtist>> {
        self.request(Call::Artists, ids).await?;
        Ok(Self::pick(&self.lock().artists, ids))
    }

    async fn albums(&self, ids: &[String]) -> Result<Vec<RemoteAlbum>> {
        self.request(Call::Albums, ids).await?;
        Ok(Self::pick(&self.lock().albums, ids))
    }

    async fn tracks(&self, ids: &[String]) -> Result<Vec<RemoteTrack>> {
        self.request(Call::Tracks, ids).await?;
        Ok(Self::pick(&self.lock().tracks, ids))
    }

    async fn episodes(&self, ids: &[String]) -> Result<Vec<RemoteEpisode>> {
        self.request(Call::Episodes, ids).await?;
        Ok(Self::pick(&self.lock().episodes, ids))
    }

    async fn playlist(&self, id: &str) -> Result<RemotePlaylist> {
        self.request(Call::Playlist, &[id.to_string()]).await?;
        self.lock().playlists.get(id).cloned().ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(id.to_string())))
    }

    async fn saved_page(&self, kind: SavedKind, cursor: Option<&str>, page_size: usize) -> Result<Page<String>> {
        self.request(Call::SavedPage, &cursor.map(|c| vec![c.to_string()]).unwrap_or_default()).await?;
        let index = match cursor {
            Some(cursor) => cursor
                .parse::<usize>()
                .map_err(|_| exn::Exn::from(ErrorKind::InvalidResponse(format!("bad cursor: {cursor}"))))?,
            None => 0,
        };
        let state = self.lock();
        if state.failing_page == Some(index) {
            exn::bail!(ErrorKind::Network(format!("connection reset on page {index}")));
        }
        let pages: Vec<Vec<String>> = match state.scripted_pages.get(&kind) {
            Some(pages) => pages.clone(),
            None => {
                let saved = state.saved.get(&kind).cloned().unwrap_or_default();
                match saved.is_empty() {
                    true => vec![vec![]],
                    false => saved.chunks(page_size.max(1)).map(<[String]>::to_vec).collect(),
                }
            },
        };
        let items = pages.get(index).cloned().unwrap_or_default();
        let next = (index + 1 < pages.len()).then(|| (index + 1).to_string());
        Ok(Page::new(items, next))
    }

    async fn check_saved(&self, kind: SavedKind, ids: &[String]) -> Result<Vec<bool>> {
        self.request(Call::CheckSaved, ids).await?;
        let state = self.lock();
        let saved = state.saved.get(&kind);
        Ok(ids.iter().map(|id| saved.is_some_and(|s| s.contains(id))).collect())
    }

    async fn push_saved(&self, kind: SavedKind, ids: &[String], saved: bool) -> Result<()> {
        self.request(Call::PushSaved, ids).await?;
        let mut state = self.lock();
        state.scripted_pages.remove(&kind);
        let set = state.saved.entry(kind).or_default();
        for id in ids {
            set.retain(|s| s != id);
            if saved {
                set.insert(0, id.clone());
            }
        }
        Ok(())
    }
}
