//! Saved items ("library") of one kind, such as liked tracks or followed
//! artists.
//!
//! Membership is known at two levels:
//! - a per-id flag, learned from `check_saved`, from a toggle, or from a
//!   library sync,
//! - the whole [`Library`], replaced wholesale by [`SavedRepository::library_sync`].
//!
//! Toggles are optimistic: the cell flips right away and goes back if the
//! service rejects the change.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{from_json, from_nanos, to_json, to_nanos};
use crate::state::{StateCell, Toggle, ToggleableState};
use crate::strategy::{CacheStrategy, Freshness};
use exn::ResultExt;
use futures::TryStreamExt;
use futures::future::join_all;
use melo_asyncutils::{Broadcast, WeakBroadcast, paginate};
use melo_remote::ApiHandle;
use melo_remote::models::SavedKind;
use sqlx::SqliteConnection;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::UtcDateTime;
use tokio_util::sync::CancellationToken;

/// Everything saved of one kind, as of the last full sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Library {
    pub kind: SavedKind,
    /// `None` until the first successful sync.
    pub ids: Option<BTreeSet<String>>,
    pub cached_at: Option<UtcDateTime>,
}

impl Library {
    fn unknown(kind: SavedKind) -> Self {
        Self { kind, ids: None, cached_at: None }
    }

    /// Whether `id` is saved, if the library is known.
    pub fn contains(&self, id: &str) -> Option<bool> {
        self.ids.as_ref().map(|ids| ids.contains(id))
    }

    pub fn is_known(&self) -> bool {
        self.ids.is_some()
    }
}

/// Membership changes found by a library sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibraryDiff {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl LibraryDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

type SavedCell = StateCell<ToggleableState<bool>>;

#[derive(Debug, Clone, Copy)]
struct Pending {
    generation: u64,
    saved: bool,
}

struct Inner {
    kind: SavedKind,
    db: Database,
    api: ApiHandle,
    batch: usize,
    page_size: usize,
    strategy: CacheStrategy,
    cells: Mutex<HashMap<String, WeakBroadcast<ToggleableState<bool>>>>,
    /// Ids with a resolution task running.
    resolving: Mutex<HashSet<String>>,
    pending: Mutex<HashMap<String, Pending>>,
    toggles: AtomicU64,
    /// Serializes library syncs.
    sync: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Saved state of every id of one [`SavedKind`].
///
/// Cloning is cheap and yields a handle to the same repository.
#[derive(Clone)]
pub struct SavedRepository {
    inner: Arc<Inner>,
}

impl SavedRepository {
    pub fn new(
        kind: SavedKind,
        db: Database,
        api: ApiHandle,
        max_batch_size: usize,
        page_size: usize,
        strategy: CacheStrategy,
        cancel: CancellationToken,
    ) -> Self {
        let batch = max_batch_size.min(api.max_batch_size()).max(1);
        Self {
            inner: Arc::new(Inner {
                kind,
                db,
                api,
                batch,
                page_size: page_size.max(1),
                strategy,
                cells: Mutex::new(HashMap::new()),
                resolving: Mutex::new(HashSet::new()),
                pending: Mutex::new(HashMap::new()),
                toggles: AtomicU64::new(0),
                sync: tokio::sync::Mutex::new(()),
                cancel,
            }),
        }
    }

    pub fn kind(&self) -> SavedKind {
        self.inner.kind
    }

    /// Live saved state of `id`. Starts [`Unknown`](ToggleableState::Unknown)
    /// and is resolved in the background: from the stored flag, then the
    /// library, then the network.
    ///
    /// # Panics
    /// If `id` is empty.
    pub fn saved_state_of(&self, id: &str) -> SavedCell {
        let cell = self.inner.cell(id);
        self.inner.resolve(vec![(id.to_string(), cell.clone())]);
        cell
    }

    /// Batched [`saved_state_of`](Self::saved_state_of). Ids left over for
    /// the network are checked in chunks.
    ///
    /// # Panics
    /// If any id is empty.
    pub fn saved_states_of<I, S>(&self, ids: I) -> Vec<SavedCell>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: Vec<String> = ids.into_iter().map(|id| id.as_ref().to_string()).collect();
        let cells: Vec<SavedCell> = ids.iter().map(|id| self.inner.cell(id)).collect();
        let mut seen = HashSet::new();
        let targets = ids
            .into_iter()
            .zip(cells.iter().cloned())
            .filter(|(id, _)| seen.insert(id.clone()))
            .collect();
        self.inner.resolve(targets);
        cells
    }

    /// Save or unsave `id`.
    ///
    /// The cell shows `saved` while the change is pushed. If the push fails
    /// the cell goes back to what it showed before (the opposite of `saved`
    /// if that was unknown) and [`Toggle::RolledBack`] is returned; the
    /// failure itself is only logged.
    pub async fn set_saved(&self, id: &str, saved: bool) -> Result<Toggle<bool>> {
        if id.is_empty() {
            exn::bail!(ErrorKind::Validation("saved ids must not be empty".to_string()));
        }
        let inner = &self.inner;
        let cell = inner.cell(id);
        let generation = inner.toggles.fetch_add(1, Ordering::Relaxed) + 1;
        lock(&inner.pending).insert(id.to_string(), Pending { generation, saved });
        let previous = cell.get();
        cell.publish(ToggleableState::Set(saved));

        let ids = [id.to_string()];
        let pushed = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => Err(exn::Exn::from(ErrorKind::Cancelled)),
            pushed = inner.api.push_saved(inner.kind, &ids, saved) => pushed.or_raise(|| ErrorKind::Remote),
        };
        let result = match pushed {
            Ok(()) => inner.confirm(id, saved).await.map(|()| Toggle::Confirmed(saved)),
            Err(err) => {
                let restored = previous.known().unwrap_or(!saved);
                let superseded = lock(&inner.pending).get(id).is_some_and(|p| p.generation != generation);
                if !superseded {
                    cell.update(|state| (*state == ToggleableState::Set(saved)).then_some(ToggleableState::Set(restored)));
                }
                tracing::warn!(kind = %inner.kind, id, saved, error = ?err, "Could not update saved state; rolled back");
                Ok(Toggle::RolledBack { attempted: saved, previous: restored })
            },
        };
        let mut pending = lock(&inner.pending);
        if pending.get(id).is_some_and(|p| p.generation == generation) {
            pending.remove(id);
        }
        result
    }

    /// The toggle of `id` still waiting for the service, if any.
    pub fn pending(&self, id: &str) -> Option<Toggle<bool>> {
        lock(&self.inner.pending).get(id).map(|p| Toggle::Optimistic(p.saved))
    }

    /// The library as of the last successful sync.
    pub async fn library(&self) -> Result<Library> {
        let kind = self.inner.kind;
        self.inner
            .db
            .transaction("load library", move |conn| Box::pin(async move { load_library(conn, kind).await }))
            .await
    }

    /// Download the whole saved set and make it the library.
    ///
    /// Either every page arrives and the library, the per-id flags and the
    /// live cells all change together, or nothing changes and the error is
    /// returned.
    #[tracing::instrument("syncing library", skip(self), fields(kind = %self.inner.kind))]
    pub async fn library_sync(&self) -> Result<LibraryDiff> {
        let inner = &self.inner;
        let _guard = inner.sync.lock().await;
        let kind = inner.kind;
        let api = Arc::clone(&inner.api);
        let page_size = inner.page_size;
        // Toggles confirmed from here on are newer than anything drained.
        let started = UtcDateTime::now();
        let drained = paginate(move |cursor: Option<String>| {
            let api = Arc::clone(&api);
            async move { api.saved_page(kind, cursor.as_deref(), page_size).await }
        })
        .try_collect::<Vec<String>>();
        let members: BTreeSet<String> = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => exn::bail!(ErrorKind::Cancelled),
            drained = drained => drained.or_raise(|| ErrorKind::Remote)?.into_iter().collect(),
        };

        let now = UtcDateTime::now();
        let (diff, members, newer) = inner
            .db
            .transaction("replace library", move |conn| {
                Box::pin(async move {
                    let newer = flags_since(conn, kind, started).await?;
                    let mut members = members;
                    for (id, saved) in &newer {
                        match *saved {
                            true => members.insert(id.clone()),
                            false => members.remove(id),
                        };
                    }
                    let previous = match load_library(conn, kind).await?.ids {
                        Some(ids) => ids,
                        None => saved_ids(conn, kind).await?,
                    };
                    let diff = LibraryDiff {
                        added: members.difference(&previous).cloned().collect(),
                        removed: previous.difference(&members).cloned().collect(),
                    };
                    store_library(conn, kind, Some(&members), now).await?;
                    sqlx::query(include_str!("../queries/clear_saved_flags.sql"))
                        .bind(to_nanos(now)?)
                        .bind(kind.as_str())
                        .bind(to_nanos(started)?)
                        .execute(&mut *conn)
                        .await
                        .or_raise(|| ErrorKind::Database)?;
                    for id in members.iter().filter(|id| !newer.contains_key(*id)) {
                        store_flag(conn, kind, id, true, now).await?;
                    }
                    Ok((diff, members, newer))
                })
            })
            .await?;

        let live: Vec<(String, SavedCell)> = {
            let cells = lock(&inner.cells);
            cells.iter().filter_map(|(id, cell)| Some((id.clone(), cell.upgrade()?))).collect()
        };
        let pending = lock(&inner.pending).keys().cloned().collect::<HashSet<_>>();
        for (id, cell) in live {
            if pending.contains(&id) || newer.contains_key(&id) {
                continue;
            }
            let state = ToggleableState::Set(members.contains(&id));
            cell.update(|current| (*current != state).then_some(state));
        }
        tracing::info!(saved = members.len(), added = diff.added.len(), removed = diff.removed.len(), "Library synced");
        Ok(diff)
    }

    /// Sync unless the library strategy still considers the last sync valid.
    pub async fn sync_if_stale(&self) -> Result<Option<LibraryDiff>> {
        let library = self.library().await?;
        match self.inner.strategy.decide(library.cached_at, UtcDateTime::now()) {
            Freshness::Valid => Ok(None),
            Freshness::Refreshable | Freshness::Invalid => self.library_sync().await.map(Some),
        }
    }

    /// Stop resolving and pushing. Toggles in flight roll back.
    pub fn close(&self) {
        tracing::debug!(kind = %self.inner.kind, "Closing saved repository");
        self.inner.cancel.cancel();
    }
}

impl Inner {
    fn cell(&self, id: &str) -> SavedCell {
        assert!(!id.is_empty(), "{}: saved ids must not be empty", self.kind);
        let mut cells = lock(&self.cells);
        if let Some(cell) = cells.get(id).and_then(WeakBroadcast::upgrade) {
            return cell;
        }
        cells.retain(|_, cell| !cell.is_dropped());
        let cell = Broadcast::new(ToggleableState::Unknown);
        cells.insert(id.to_string(), cell.downgrade());
        cell
    }

    /// Start resolving every target still unknown and not already being
    /// resolved.
    fn resolve(self: &Arc<Self>, targets: Vec<(String, SavedCell)>) {
        let targets: Vec<(String, SavedCell)> = {
            let mut resolving = lock(&self.resolving);
            targets
                .into_iter()
                .filter(|(id, cell)| cell.get() == ToggleableState::Unknown && resolving.insert(id.clone()))
                .collect()
        };
        if targets.is_empty() || self.cancel.is_cancelled() {
            lock(&self.resolving).retain(|id| !targets.iter().any(|(target, _)| target == id));
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => {
                    tracing::debug!(kind = %inner.kind, ids = targets.len(), "Saved state resolution cancelled");
                },
                resolved = inner.resolve_now(&targets) => if let Err(err) = resolved {
                    tracing::warn!(kind = %inner.kind, error = ?err, "Could not resolve saved state");
                },
            }
            let mut resolving = lock(&inner.resolving);
            for (id, _) in &targets {
                resolving.remove(id);
            }
        });
    }

    async fn resolve_now(&self, targets: &[(String, SavedCell)]) -> Result<()> {
        let kind = self.kind;
        let ids: Vec<String> = targets.iter().map(|(id, _)| id.clone()).collect();
        let (flags, library) = self
            .db
            .transaction("load saved flags", move |conn| {
                Box::pin(async move {
                    let mut flags = HashMap::with_capacity(ids.len());
                    for id in ids {
                        if let Some(saved) = load_flag(conn, kind, &id).await? {
                            flags.insert(id, saved);
                        }
                    }
                    Ok((flags, load_library(conn, kind).await?))
                })
            })
            .await?;

        let mut unresolved = Vec::new();
        for (id, cell) in targets {
            match flags.get(id).copied().or_else(|| library.contains(id)) {
                Some(saved) => publish_if_unknown(cell, saved),
                None => unresolved.push((id, cell)),
            }
        }
        if unresolved.is_empty() {
            return Ok(());
        }
        let checked = join_all(unresolved.chunks(self.batch).map(|chunk| self.check_chunk(chunk))).await;
        checked.into_iter().collect()
    }

    async fn check_chunk(&self, chunk: &[(&String, &SavedCell)]) -> Result<()> {
        let ids: Vec<String> = chunk.iter().map(|(id, _)| (*id).clone()).collect();
        tracing::debug!(kind = %self.kind, ids = ids.len(), "Checking saved state");
        let flags = self.api.check_saved(self.kind, &ids).await.or_raise(|| ErrorKind::Remote)?;
        if flags.len() != ids.len() {
            exn::bail!(ErrorKind::Remote);
        }
        let kind = self.kind;
        let now = UtcDateTime::now();
        let rows: Vec<(String, bool)> = ids.into_iter().zip(flags.iter().copied()).collect();
        self.db
            .transaction("record saved flags", move |conn| {
                Box::pin(async move {
                    for (id, saved) in rows {
                        sqlx::query(include_str!("../queries/insert_saved_flag.sql"))
                            .bind(kind.as_str())
                            .bind(&id)
                            .bind(saved)
                            .bind(to_nanos(now)?)
                            .execute(&mut *conn)
                            .await
                            .or_raise(|| ErrorKind::Database)?;
                    }
                    Ok(())
                })
            })
            .await?;
        for ((_, cell), saved) in chunk.iter().zip(flags) {
            publish_if_unknown(cell, saved);
        }
        Ok(())
    }

    /// Persist a pushed toggle, keeping a known library in step.
    async fn confirm(&self, id: &str, saved: bool) -> Result<()> {
        let kind = self.kind;
        let id = id.to_string();
        let now = UtcDateTime::now();
        self.db
            .transaction("confirm saved toggle", move |conn| {
                Box::pin(async move {
                    store_flag(conn, kind, &id, saved, now).await?;
                    let library = load_library(conn, kind).await?;
                    if let (Some(mut ids), Some(cached_at)) = (library.ids, library.cached_at) {
                        let changed = match saved {
                            true => ids.insert(id),
                            false => ids.remove(&id),
                        };
                        if changed {
                            store_library(conn, kind, Some(&ids), cached_at).await?;
                        }
                    }
                    Ok(())
                })
            })
            .await
    }
}

fn publish_if_unknown(cell: &SavedCell, saved: bool) {
    cell.update(|state| (*state == ToggleableState::Unknown).then_some(ToggleableState::Set(saved)));
}

async fn load_flag(conn: &mut SqliteConnection, kind: SavedKind, id: &str) -> Result<Option<bool>> {
    sqlx::query_scalar(include_str!("../queries/get_saved_flag.sql"))
        .bind(kind.as_str())
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)
}

async fn store_flag(conn: &mut SqliteConnection, kind: SavedKind, id: &str, saved: bool, at: UtcDateTime) -> Result<()> {
    sqlx::query(include_str!("../queries/upsert_saved_flag.sql"))
        .bind(kind.as_str())
        .bind(id)
        .bind(saved)
        .bind(to_nanos(at)?)
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(())
}

/// Flags written at or after `since`, such as toggles confirmed during a sync.
async fn flags_since(conn: &mut SqliteConnection, kind: SavedKind, since: UtcDateTime) -> Result<HashMap<String, bool>> {
    let rows: Vec<(String, bool)> = sqlx::query_as(include_str!("../queries/get_saved_flags_since.sql"))
        .bind(kind.as_str())
        .bind(to_nanos(since)?)
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(rows.into_iter().collect())
}

async fn saved_ids(conn: &mut SqliteConnection, kind: SavedKind) -> Result<BTreeSet<String>> {
    let ids: Vec<String> = sqlx::query_scalar(include_str!("../queries/get_saved_ids.sql"))
        .bind(kind.as_str())
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(ids.into_iter().collect())
}

async fn load_library(conn: &mut SqliteConnection, kind: SavedKind) -> Result<Library> {
    let row: Option<(Option<String>, Option<i64>)> = sqlx::query_as(include_str!("../queries/get_library.sql"))
        .bind(kind.as_str())
        .fetch_optional(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    let Some((ids, cached_at)) = row else {
        return Ok(Library::unknown(kind));
    };
    Ok(Library {
        kind,
        ids: ids.map(|ids| from_json(&ids, "library ids")).transpose()?,
        cached_at: cached_at.map(|at| from_nanos(at, "library sync time")).transpose()?,
    })
}

async fn store_library(
    conn: &mut SqliteConnection,
    kind: SavedKind,
    ids: Option<&BTreeSet<String>>,
    cached_at: UtcDateTime,
) -> Result<()> {
    sqlx::query(include_str!("../queries/upsert_library.sql"))
        .bind(kind.as_str())
        .bind(ids.map(|ids| to_json(ids, "library ids")).transpose()?)
        .bind(to_nanos(cached_at)?)
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(())
}
