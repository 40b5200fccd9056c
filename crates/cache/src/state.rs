//! Observable state published by the repositories.

use crate::error::FetchError;
use melo_asyncutils::Broadcast;
use time::UtcDateTime;

/// Live, observable cell. Subscribers receive the current value first and
/// then every later value, in publication order.
pub type StateCell<V> = Broadcast<V>;

/// What the cache currently knows about one id.
///
/// Within a fetch cycle the transitions are `NotFound | Loaded` → `Loading`
/// → `Loaded | Error`. A failed fetch replaces a previously loaded value.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheState<T> {
    /// Nothing cached and nothing in flight (yet).
    NotFound,
    Loading,
    Loaded { value: T, cached_at: UtcDateTime },
    Error(FetchError),
}

impl<T> CacheState<T> {
    /// Whether a fetch cycle would end in this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Loaded { .. } | Self::Error(_))
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Loaded { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Loaded { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&FetchError> {
        match self {
            Self::Error(err) => Some(err),
            _ => None,
        }
    }
}

/// A value that may not be known yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleableState<T> {
    Unknown,
    Set(T),
}

impl<T: Copy> ToggleableState<T> {
    pub fn known(&self) -> Option<T> {
        match self {
            Self::Unknown => None,
            Self::Set(value) => Some(*value),
        }
    }
}

/// Outcome of a two-phase optimistic update.
///
/// [`Optimistic`](Self::Optimistic) is what observers see while the remote
/// write is in flight; the call itself resolves to one of the other two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle<T> {
    Optimistic(T),
    Confirmed(T),
    /// The remote write failed and the cell shows `previous` again.
    RolledBack { attempted: T, previous: T },
}

impl<T: Copy> Toggle<T> {
    /// The value the cell shows once this phase is reached.
    pub fn current(&self) -> T {
        match self {
            Self::Optimistic(value) | Self::Confirmed(value) => *value,
            Self::RolledBack { previous, .. } => *previous,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_state_accessors() {
        let loaded = CacheState::Loaded { value: 3, cached_at: UtcDateTime::now() };
        assert_eq!(loaded.value(), Some(&3));
        assert!(loaded.is_terminal());
        let failed: CacheState<u8> = CacheState::Error(FetchError::Cancelled);
        assert!(failed.is_terminal());
        assert_eq!(failed.error(), Some(&FetchError::Cancelled));
        assert!(!CacheState::<u8>::Loading.is_terminal());
        assert!(CacheState::<u8>::NotFound.into_value().is_none());
    }

    #[test]
    fn test_toggle_current() {
        assert!(Toggle::Confirmed(true).current());
        assert!(!Toggle::RolledBack { attempted: true, previous: false }.current());
        assert_eq!(ToggleableState::Set(true).known(), Some(true));
        assert_eq!(ToggleableState::<bool>::Unknown.known(), None);
    }
}
