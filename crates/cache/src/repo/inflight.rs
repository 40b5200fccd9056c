//! Bookkeeping for fetch cycles that are still running.

use crate::error::FetchError;
use crate::state::CacheState;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

/// How one id's fetch cycle ended.
#[derive(Debug, Clone)]
pub(crate) struct Outcome<T> {
    pub(crate) state: CacheState<T>,
    /// Whether the cycle went to the network for this id.
    pub(crate) fetched: bool,
}

impl<T> Outcome<T> {
    pub(crate) fn cancelled() -> Self {
        Self { state: CacheState::Error(FetchError::Cancelled), fetched: false }
    }
}

pub(crate) type Outcomes<T> = Arc<HashMap<String, Outcome<T>>>;
pub(crate) type PendingOutcome<T> = Shared<BoxFuture<'static, Outcome<T>>>;

struct Pending<T> {
    generation: u64,
    outcome: PendingOutcome<T>,
}

/// A caller's claim on the outcome of an id's fetch cycle.
pub(crate) struct Ticket<T> {
    pub(crate) id: String,
    pub(crate) outcome: PendingOutcome<T>,
    /// `true` when the caller attached to a cycle someone else started.
    pub(crate) joined: bool,
}

/// Map of id to the cycle currently responsible for it.
///
/// At most one cycle is registered per id. Registration and lookup happen
/// under the same lock, and a cycle only unregisters the ids it registered
/// itself (tracked by generation).
pub(crate) struct InFlight<T> {
    pending: Mutex<HashMap<String, Pending<T>>>,
    generation: AtomicU64,
}

impl<T> Default for InFlight<T> {
    fn default() -> Self {
        Self { pending: Mutex::new(HashMap::new()), generation: AtomicU64::new(0) }
    }
}

pub(crate) struct Registry<'a, T> {
    guard: MutexGuard<'a, HashMap<String, Pending<T>>>,
    generation: &'a AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> InFlight<T> {
    /// Lock the map for a check-then-register sequence.
    pub(crate) fn lock(&self) -> Registry<'_, T> {
        Registry {
            guard: self.pending.lock().unwrap_or_else(PoisonError::into_inner),
            generation: &self.generation,
        }
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.lock().guard.contains_key(id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().guard.len()
    }

    /// Unregister `ids`, unless a newer cycle has claimed them meanwhile.
    pub(crate) fn finish<'i>(&self, ids: impl IntoIterator<Item = &'i String>, generation: u64) {
        let mut registry = self.lock();
        for id in ids {
            if registry.guard.get(id).is_some_and(|p| p.generation == generation) {
                registry.guard.remove(id);
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Registry<'_, T> {
    /// Attach to the cycle running for `id`, if any.
    pub(crate) fn join(&self, id: &str) -> Option<Ticket<T>> {
        self.guard.get(id).map(|pending| Ticket {
            id: id.to_string(),
            outcome: pending.outcome.clone(),
            joined: true,
        })
    }

    /// Reserve a generation number for a cycle about to be spawned.
    pub(crate) fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a spawned cycle as responsible for `ids`.
    pub(crate) fn register(
        &mut self,
        ids: Vec<String>,
        generation: u64,
        handle: JoinHandle<Outcomes<T>>,
    ) -> Vec<Ticket<T>> {
        // A panicked cycle leaves no outcome behind; callers see a cancellation.
        let batch = async move { handle.await.unwrap_or_default() }.boxed().shared();
        ids.into_iter()
            .map(|id| {
                let key = id.clone();
                let outcome = batch
                    .clone()
                    .map(move |outcomes| outcomes.get(&key).cloned().unwrap_or_else(Outcome::cancelled))
                    .boxed()
                    .shared();
                self.guard.insert(id.clone(), Pending { generation, outcome: outcome.clone() });
                Ticket { id, outcome, joined: false }
            })
            .collect()
    }
}
