//! Generic repository over one kind of catalog entity.
//!
//! A [`Repository`] mediates between three collaborators:
//! - a [`Fetcher`] that talks to the remote catalog,
//! - an [`EntityStore`] that persists and reloads entities in the
//!   [`Database`],
//! - a [`CacheStrategy`] that decides whether a cached copy can be served.
//!
//! Callers receive live [`StateCell`]s and never see errors directly: a
//! failed fetch is published as [`CacheState::Error`].
//!
//! # Fetch cycles
//! Every access that needs work spawns one *cycle* for all the ids it
//! covers. A cycle reloads the ids from the store, publishes what can be
//! served, fetches the rest from the network in chunks of
//! [`Fetcher::max_batch_size`], persists each chunk in a single transaction,
//! and publishes the results. While a cycle is running, every other request
//! for one of its ids attaches to it instead of starting another one.

mod inflight;

use crate::Database;
use crate::error::{FetchError, Result};
use crate::repo::inflight::{InFlight, Outcome, Ticket};
use crate::state::{CacheState, StateCell};
use crate::strategy::{CacheStrategy, Freshness};
use async_trait::async_trait;
use exn::ResultExt;
use futures::future::join_all;
use melo_asyncutils::{Broadcast, WeakBroadcast};
use melo_remote::error::Result as RemoteResult;
use melo_remote::models::Identified;
use sqlx::SqliteConnection;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::UtcDateTime;
use tokio_util::sync::CancellationToken;

/// Network half of a repository.
#[async_trait]
pub trait Fetcher<N>: Send + Sync {
    /// Largest number of ids passed to one [`fetch`](Self::fetch) call.
    fn max_batch_size(&self) -> usize;

    /// Fetch `ids`. Ids unknown upstream are absent from the result.
    async fn fetch(&self, ids: &[String]) -> RemoteResult<Vec<N>>;
}

/// A cached entity together with the time it was last fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<T> {
    pub value: T,
    /// `None` once invalidated.
    pub fetched_at: Option<UtcDateTime>,
}

/// Persistence half of a repository.
#[async_trait]
pub trait EntityStore<T, N: Send + 'static>: Send + Sync {
    /// Table holding the entities. Also names the repository in logs.
    fn table(&self) -> &'static str;

    async fn load(&self, conn: &mut SqliteConnection, id: &str) -> Result<Option<Stored<T>>>;

    /// Persist a network model and build the view model from it.
    ///
    /// Always runs inside the transaction persisting the whole fetched chunk.
    async fn convert(&self, conn: &mut SqliteConnection, remote: N, fetched_at: UtcDateTime) -> Result<T>;

    /// Forget when `id` was fetched, keeping its data. Returns whether the
    /// id was cached.
    async fn invalidate(&self, conn: &mut SqliteConnection, id: &str) -> Result<bool> {
        let sql = format!("UPDATE {} SET fetched_at = NULL WHERE id = ?", self.table());
        let done = sqlx::query(&sql)
            .bind(id)
            .execute(&mut *conn)
            .await
            .or_raise(|| crate::error::ErrorKind::Database)?;
        Ok(done.rows_affected() > 0)
    }

    /// Runs after a fetched chunk is committed and published.
    async fn persisted(&self, _ids: &[String]) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Only evaluate ids whose cell could be out of date.
    IfStale,
    /// Evaluate against the store no matter what the cell shows.
    Reload,
    /// Skip the strategy and go to the network.
    Fetch,
}

type Cell<T> = StateCell<CacheState<T>>;
type Target<T> = (String, Cell<T>);

struct Inner<T, N> {
    db: Database,
    fetcher: Arc<dyn Fetcher<N>>,
    store: Arc<dyn EntityStore<T, N>>,
    strategy: CacheStrategy,
    cells: Mutex<HashMap<String, WeakBroadcast<CacheState<T>>>>,
    in_flight: InFlight<T>,
    cancel: CancellationToken,
}

/// Cached, deduplicated access to entities of type `T`, fetched as network
/// models of type `N`.
///
/// Cloning is cheap and yields a handle to the same repository. The
/// accessors returning cells spawn their work on the current Tokio runtime
/// and must be called from within one.
pub struct Repository<T, N> {
    inner: Arc<Inner<T, N>>,
}

impl<T, N> Clone for Repository<T, N> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T, N> Repository<T, N>
where
    T: Clone + Send + Sync + 'static,
    N: Identified + Send + 'static,
{
    pub fn new(
        db: Database,
        fetcher: Arc<dyn Fetcher<N>>,
        store: Arc<dyn EntityStore<T, N>>,
        strategy: CacheStrategy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                fetcher,
                store,
                strategy,
                cells: Mutex::new(HashMap::new()),
                in_flight: InFlight::default(),
                cancel,
            }),
        }
    }

    /// Live state cell for `id`, evaluated in the background.
    ///
    /// A cell that was never evaluated starts as [`CacheState::NotFound`];
    /// subscribers always see that first, before `Loading` or `Loaded`.
    ///
    /// # Panics
    /// If `id` is empty.
    pub fn state_of(&self, id: &str) -> Cell<T> {
        let cell = self.inner.cell(id);
        self.inner.schedule(vec![(id.to_string(), cell.clone())], Mode::IfStale);
        cell
    }

    /// Batched [`state_of`](Self::state_of): one cycle covers every distinct
    /// id that needs work, and network calls are chunked.
    ///
    /// # Panics
    /// If any id is empty.
    pub fn states_of<I, S>(&self, ids: I) -> Vec<Cell<T>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: Vec<String> = ids.into_iter().map(|id| id.as_ref().to_string()).collect();
        let cells: Vec<Cell<T>> = ids.iter().map(|id| self.inner.cell(id)).collect();
        let mut seen = HashSet::new();
        let targets = ids
            .into_iter()
            .zip(cells.iter().cloned())
            .filter(|(id, _)| seen.insert(id.clone()))
            .collect();
        self.inner.schedule(targets, Mode::IfStale);
        cells
    }

    /// Wait for the state of `id` to settle and return it.
    ///
    /// Serves from the cell when it needs no work; otherwise waits for the
    /// running (or newly started) cycle.
    pub async fn get(&self, id: &str) -> CacheState<T> {
        let cell = self.inner.cell(id);
        match self.inner.schedule(vec![(id.to_string(), cell.clone())], Mode::IfStale).pop() {
            Some(ticket) => ticket.outcome.await.state,
            None => cell.get(),
        }
    }

    /// Fetch `id` from the network regardless of the cache strategy and
    /// return the state the fetch ended in.
    ///
    /// Attaches to a fetch already in flight for `id`. If the running cycle
    /// turns out to serve `id` from the store, another cycle is started so
    /// that the caller always gets a network result.
    ///
    /// # Panics
    /// If `id` is empty.
    pub async fn refresh(&self, id: &str) -> CacheState<T> {
        loop {
            let cell = self.inner.cell(id);
            let Some(ticket) = self.inner.schedule(vec![(id.to_string(), cell.clone())], Mode::Fetch).pop() else {
                return cell.get();
            };
            let joined = ticket.joined;
            let outcome = ticket.outcome.await;
            if !joined || outcome.fetched || matches!(outcome.state, CacheState::Error(_)) {
                return outcome.state;
            }
            tracing::trace!(repository = self.inner.name(), id, "Joined cycle did not fetch; fetching again");
        }
    }

    /// Mark the cached copy of `id` as stale.
    ///
    /// A live cell is re-evaluated right away; otherwise the next access
    /// fetches.
    pub async fn invalidate(&self, id: &str) -> Result<()> {
        let store = Arc::clone(&self.inner.store);
        let key = id.to_string();
        let found = self
            .inner
            .db
            .transaction("invalidate cached entity", move |conn| {
                Box::pin(async move { store.invalidate(conn, &key).await })
            })
            .await?;
        if found && let Some(cell) = self.inner.live_cell(id) {
            self.inner.schedule(vec![(id.to_string(), cell)], Mode::Reload);
        }
        Ok(())
    }

    /// Whether a cycle is currently responsible for `id`.
    pub fn is_in_flight(&self, id: &str) -> bool {
        self.inner.in_flight.contains(id)
    }

    /// Number of live (observed or held) cells.
    pub fn live_cells(&self) -> usize {
        self.inner.lock_cells().values().filter(|cell| !cell.is_dropped()).count()
    }

    /// Cancel every running cycle. Cells showing `Loading` go back to what
    /// they showed before; later accesses publish nothing new.
    pub fn close(&self) {
        tracing::debug!(repository = self.inner.name(), "Closing repository");
        self.inner.cancel.cancel();
    }
}

impl<T, N> Inner<T, N>
where
    T: Clone + Send + Sync + 'static,
    N: Identified + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.store.table()
    }

    fn lock_cells(&self) -> MutexGuard<'_, HashMap<String, WeakBroadcast<CacheState<T>>>> {
        self.cells.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cell(&self, id: &str) -> Cell<T> {
        assert!(!id.is_empty(), "{}: entity ids must not be empty", self.name());
        let mut cells = self.lock_cells();
        if let Some(cell) = cells.get(id).and_then(WeakBroadcast::upgrade) {
            return cell;
        }
        cells.retain(|_, cell| !cell.is_dropped());
        let cell = Broadcast::new(CacheState::NotFound);
        cells.insert(id.to_string(), cell.downgrade());
        cell
    }

    fn live_cell(&self, id: &str) -> Option<Cell<T>> {
        self.lock_cells().get(id).and_then(WeakBroadcast::upgrade)
    }

    fn needs_evaluation(&self, state: &CacheState<T>, now: UtcDateTime) -> bool {
        match state {
            CacheState::NotFound => true,
            CacheState::Loaded { cached_at, .. } => self.strategy.decide(Some(*cached_at), now) != Freshness::Valid,
            // Errors stick until refreshed; Loading only exists inside a cycle.
            CacheState::Loading | CacheState::Error(_) => false,
        }
    }

    /// Attach to running cycles, and start one cycle for every target that
    /// still needs work. Returns a ticket per target that has a cycle.
    fn schedule(self: &Arc<Self>, targets: Vec<Target<T>>, mode: Mode) -> Vec<Ticket<T>> {
        let now = UtcDateTime::now();
        let mut registry = self.in_flight.lock();
        let mut tickets = Vec::new();
        let mut fresh = Vec::new();
        for (id, cell) in targets {
            if let Some(ticket) = registry.join(&id) {
                tracing::trace!(repository = self.name(), %id, "Attaching to in-flight cycle");
                tickets.push(ticket);
            } else if mode != Mode::IfStale || self.needs_evaluation(&cell.get(), now) {
                fresh.push((id, cell));
            }
        }
        if fresh.is_empty() {
            return tickets;
        }
        let generation = registry.next_generation();
        let ids = fresh.iter().map(|(id, _)| id.clone()).collect();
        // Registered before the lock is released, so the cycle cannot
        // unregister (or be duplicated) before every id is claimed.
        let handle = tokio::spawn(Arc::clone(self).run(fresh, mode, generation));
        tickets.extend(registry.register(ids, generation, handle));
        tickets
    }

    async fn run(self: Arc<Self>, targets: Vec<Target<T>>, mode: Mode, generation: u64) -> inflight::Outcomes<T> {
        let snapshots: Vec<CacheState<T>> = targets.iter().map(|(_, cell)| cell.get()).collect();
        let outcomes = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::debug!(repository = self.name(), ids = targets.len(), "Cycle cancelled");
                for ((_, cell), snapshot) in targets.iter().zip(snapshots) {
                    cell.update(|state| state.is_loading().then_some(snapshot));
                }
                targets.iter().map(|(id, _)| (id.clone(), Outcome::cancelled())).collect()
            },
            outcomes = self.cycle(&targets, mode) => outcomes,
        };
        self.in_flight.finish(targets.iter().map(|(id, _)| id), generation);
        Arc::new(outcomes)
    }

    async fn cycle(&self, targets: &[Target<T>], mode: Mode) -> HashMap<String, Outcome<T>> {
        let mut outcomes = HashMap::with_capacity(targets.len());
        let to_fetch: Vec<&Target<T>> = match mode {
            Mode::Fetch => {
                for (_, cell) in targets {
                    cell.publish(CacheState::Loading);
                }
                targets.iter().collect()
            },
            Mode::IfStale | Mode::Reload => match self.load(targets).await {
                Ok(mut found) => {
                    let now = UtcDateTime::now();
                    let mut to_fetch = Vec::new();
                    for target in targets {
                        let (id, cell) = target;
                        match found.remove(id) {
                            Some(Stored { value, fetched_at: Some(cached_at) }) => {
                                let freshness = self.strategy.decide(Some(cached_at), now);
                                let state = CacheState::Loaded { value, cached_at };
                                match freshness {
                                    Freshness::Valid => {
                                        cell.publish(state.clone());
                                        outcomes.insert(id.clone(), Outcome { state, fetched: false });
                                    },
                                    Freshness::Refreshable => {
                                        cell.publish(state);
                                        to_fetch.push(target);
                                    },
                                    // Expired copies are never served.
                                    Freshness::Invalid => {
                                        cell.publish(CacheState::Loading);
                                        to_fetch.push(target);
                                    },
                                }
                            },
                            _ => {
                                cell.publish(CacheState::Loading);
                                to_fetch.push(target);
                            },
                        }
                    }
                    to_fetch
                },
                Err(err) => {
                    tracing::warn!(repository = self.name(), error = ?err, "Could not read cached entities");
                    let state = CacheState::Error(FetchError::from_store(&err));
                    for (id, cell) in targets {
                        cell.publish(state.clone());
                        outcomes.insert(id.clone(), Outcome { state: state.clone(), fetched: false });
                    }
                    Vec::new()
                },
            },
        };
        if to_fetch.is_empty() {
            return outcomes;
        }
        let batch = self.fetcher.max_batch_size().max(1);
        let chunks = join_all(to_fetch.chunks(batch).map(|chunk| self.fetch_chunk(chunk))).await;
        outcomes.extend(chunks.into_iter().flatten());
        outcomes
    }

    async fn load(&self, targets: &[Target<T>]) -> Result<HashMap<String, Stored<T>>> {
        let store = Arc::clone(&self.store);
        let ids: Vec<String> = targets.iter().map(|(id, _)| id.clone()).collect();
        self.db
            .transaction("load cached entities", move |conn| {
                Box::pin(async move {
                    let mut found = HashMap::with_capacity(ids.len());
                    for id in ids {
                        if let Some(stored) = store.load(conn, &id).await? {
                            found.insert(id, stored);
                        }
                    }
                    Ok(found)
                })
            })
            .await
    }

    /// Fetch, persist and publish one chunk of ids.
    async fn fetch_chunk(&self, chunk: &[&Target<T>]) -> Vec<(String, Outcome<T>)> {
        let ids: Vec<String> = chunk.iter().map(|(id, _)| id.clone()).collect();
        tracing::debug!(repository = self.name(), ids = ids.len(), "Fetching from network");
        let mut persisted = false;
        let states: Vec<CacheState<T>> = match self.fetcher.fetch(&ids).await {
            Ok(models) => match self.persist(models).await {
                Ok((mut values, cached_at)) => {
                    persisted = true;
                    ids.iter()
                        .map(|id| match values.remove(id) {
                            Some(value) => CacheState::Loaded { value, cached_at },
                            None => CacheState::Error(FetchError::NotFoundRemote(id.clone())),
                        })
                        .collect()
                },
                Err(err) => {
                    tracing::warn!(repository = self.name(), error = ?err, "Could not persist fetched entities");
                    vec![CacheState::Error(FetchError::from_store(&err)); ids.len()]
                },
            },
            Err(err) => {
                tracing::warn!(repository = self.name(), error = ?err, "Fetch failed");
                vec![CacheState::Error(FetchError::from_remote(&err)); ids.len()]
            },
        };
        tracing::debug!(repository = self.name(), ids = ids.len(), "Fetch finished");
        let outcomes = chunk
            .iter()
            .zip(states)
            .map(|((id, cell), state)| {
                cell.publish(state.clone());
                (id.clone(), Outcome { state, fetched: true })
            })
            .collect();
        if persisted {
            self.store.persisted(&ids).await;
        }
        outcomes
    }

    async fn persist(&self, models: Vec<N>) -> Result<(HashMap<String, T>, UtcDateTime)> {
        let store = Arc::clone(&self.store);
        let fetched_at = UtcDateTime::now();
        let values = self
            .db
            .transaction("persist fetched entities", move |conn| {
                Box::pin(async move {
                    let mut values = HashMap::with_capacity(models.len());
                    for model in models {
                        let id = model.id().to_string();
                        values.insert(id, store.convert(conn, model, fetched_at).await?);
                    }
                    Ok(values)
                })
            })
            .await?;
        Ok((values, fetched_at))
    }
}

#[cfg(test)]
mod tests;
