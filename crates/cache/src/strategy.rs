//! Freshness policies for cached values.

use melo_config::StrategyConfig;
use std::time::Duration;
use time::UtcDateTime;

/// What to do with a cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Serve the cached value as-is.
    Valid,
    /// Do not serve the cached value; fetch first.
    Invalid,
    /// Serve the cached value, then refresh it in the background.
    Refreshable,
}

/// Pure, stateless freshness policy.
///
/// The age of a value is measured from its cache time to `now`. Cache times
/// in the future (clock skew between devices) count as age zero, and a value
/// that was never cached is always [`Freshness::Invalid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStrategy {
    NeverInvalidate,
    /// Valid while younger than `refresh_after` (or `valid_for` when there is
    /// no refresh window), refreshable until `valid_for`, then invalid.
    /// A value exactly `valid_for` old is invalid.
    Ttl {
        valid_for: Duration,
        refresh_after: Option<Duration>,
    },
    NeverValid,
}

impl CacheStrategy {
    pub fn ttl(valid_for: Duration) -> Self {
        Self::Ttl { valid_for, refresh_after: None }
    }

    pub fn decide(&self, cached_at: Option<UtcDateTime>, now: UtcDateTime) -> Freshness {
        let Some(cached_at) = cached_at else {
            return Freshness::Invalid;
        };
        match self {
            Self::NeverInvalidate => Freshness::Valid,
            Self::NeverValid => Freshness::Invalid,
            Self::Ttl { valid_for, refresh_after } => {
                let age = Duration::try_from(now - cached_at).unwrap_or(Duration::ZERO);
                if age >= *valid_for {
                    Freshness::Invalid
                } else if refresh_after.is_some_and(|refresh_after| age >= refresh_after) {
                    Freshness::Refreshable
                } else {
                    Freshness::Valid
                }
            },
        }
    }
}

impl From<StrategyConfig> for CacheStrategy {
    fn from(config: StrategyConfig) -> Self {
        match config {
            StrategyConfig::NeverInvalidate => Self::NeverInvalidate,
            StrategyConfig::NeverValid => Self::NeverValid,
            StrategyConfig::Ttl { valid_for, refresh_after } => Self::Ttl {
                valid_for: Duration::from_secs(valid_for),
                refresh_after: refresh_after.map(Duration::from_secs),
            },
        }
    }
}
