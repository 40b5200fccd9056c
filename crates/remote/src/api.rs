//! Network collaborator contract.

use crate::error::Result;
use crate::models::{RemoteAlbum, RemoteArtist, RemoteEpisode, RemotePlaylist, RemoteTrack, SavedKind};
use async_trait::async_trait;
use melo_asyncutils::Page;

/// Largest number of ids the service accepts in one multi-id request.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 50;

/// Unified interface to the streaming service's Web API.
///
/// Implementations own transport, authentication and retries; the cache
/// layer only sees models and classified errors.
///
/// # Batching
/// Multi-id methods must not be called with more than
/// [`max_batch_size()`](Self::max_batch_size) ids. Ids unknown to the
/// service are silently absent from the response (the service answers
/// `null` for them); single-id methods answer
/// [`NotFound`](crate::error::ErrorKind::NotFound) instead.
///
/// # Examples
///
/// ```
/// use melo_remote::{CatalogApi, models::SavedKind, error::Result};
///
/// async fn first_saved_track(api: &dyn CatalogApi) -> Result<Option<String>> {
///     let page = api.saved_page(SavedKind::Track, None, 1).await?;
///     Ok(page.items.into_iter().next())
/// }
/// ```
#[async_trait]
pub trait CatalogApi: Send + Sync {
    /// Name of the service (used for logging only).
    fn name(&self) -> &str;

    /// Upper bound for the number of ids in one multi-id request.
    fn max_batch_size(&self) -> usize {
        DEFAULT_MAX_BATCH_SIZE
    }

    async fn artists(&self, ids: &[String]) -> Result<Vec<RemoteArtist>>;

    async fn albums(&self, ids: &[String]) -> Result<Vec<RemoteAlbum>>;

    async fn tracks(&self, ids: &[String]) -> Result<Vec<RemoteTrack>>;

    async fn episodes(&self, ids: &[String]) -> Result<Vec<RemoteEpisode>>;

    /// Playlists can only be requested one at a time.
    async fn playlist(&self, id: &str) -> Result<RemotePlaylist>;

    /// One page of the user's saved ids for `kind`, newest first.
    ///
    /// `cursor` is `None` for the first page and the previous page's
    /// [`next`](Page::next) afterwards.
    async fn saved_page(&self, kind: SavedKind, cursor: Option<&str>, page_size: usize) -> Result<Page<String>>;

    /// Whether each of `ids` is saved, in the same order as `ids`.
    async fn check_saved(&self, kind: SavedKind, ids: &[String]) -> Result<Vec<bool>>;

    /// Save or remove `ids` from the user's library.
    async fn push_saved(&self, kind: SavedKind, ids: &[String], saved: bool) -> Result<()>;
}
