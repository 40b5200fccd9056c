//! Configuration loading and validation.
//!
//! Sources are layered with [`figment`], later sources overriding earlier
//! ones:
//!
//! 1. Built-in defaults ([`Config::default`]).
//! 2. An optional file, format chosen by extension (`.toml`, `.yaml`/`.yml`
//!    or `.json`).
//! 3. Environment variables prefixed with `MELO_`, nested keys separated by
//!    a double underscore (e.g. `MELO_STRATEGIES__TRACK__VALID_FOR=60`).

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::instrument;

const ENV_PREFIX: &str = "MELO_";
const DATABASE_FILENAME: &str = "cache.sqlite";

const DAY: u64 = 24 * 60 * 60;

/// Freshness policy for one kind of cached entity.
///
/// Durations are expressed in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum StrategyConfig {
    /// Once cached, never fetch again unless explicitly refreshed.
    NeverInvalidate,
    /// Cached values expire after `valid_for`. When `refresh_after` is set,
    /// values older than that are served immediately but refreshed in the
    /// background.
    Ttl {
        valid_for: u64,
        #[serde(default)]
        refresh_after: Option<u64>,
    },
    /// Always fetch before serving.
    NeverValid,
}

/// Per-entity freshness policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Strategies {
    pub artist: StrategyConfig,
    pub album: StrategyConfig,
    pub track: StrategyConfig,
    pub playlist: StrategyConfig,
    pub episode: StrategyConfig,
    /// Freshness of the saved-items libraries (used by stale-only syncs).
    pub library: StrategyConfig,
}
impl Default for Strategies {
    fn default() -> Self {
        // Catalog metadata barely changes; playlists and libraries are
        // edited by the user from other devices.
        Self {
            artist: StrategyConfig::Ttl { valid_for: 7 * DAY, refresh_after: Some(DAY) },
            album: StrategyConfig::Ttl { valid_for: 30 * DAY, refresh_after: Some(7 * DAY) },
            track: StrategyConfig::Ttl { valid_for: 30 * DAY, refresh_after: Some(7 * DAY) },
            playlist: StrategyConfig::Ttl { valid_for: DAY, refresh_after: Some(10 * 60) },
            episode: StrategyConfig::Ttl { valid_for: DAY, refresh_after: Some(60 * 60) },
            library: StrategyConfig::Ttl { valid_for: DAY, refresh_after: Some(15 * 60) },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Location of the SQLite cache database.
    pub database: PathBuf,
    /// Largest number of ids sent in one multi-id request.
    pub max_batch_size: usize,
    /// Page size used when draining the saved-items libraries.
    pub library_page_size: usize,
    /// Highest accepted rating value (ratings start at zero).
    pub max_rating: u8,
    pub strategies: Strategies,
}
impl Default for Config {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            max_batch_size: 50,
            library_page_size: 50,
            max_rating: 5,
            strategies: Strategies::default(),
        }
    }
}

fn default_database_path() -> PathBuf {
    match ProjectDirs::from("", "", "melo") {
        Some(dirs) => dirs.data_dir().join(DATABASE_FILENAME),
        None => PathBuf::from(DATABASE_FILENAME),
    }
}

impl Config {
    /// Load configuration from defaults, an optional file, and the environment.
    #[instrument("loading configuration")]
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(file) = file {
            figment = match file.extension().and_then(|e| e.to_str()) {
                Some("toml") => figment.merge(Toml::file_exact(file)),
                Some("yaml" | "yml") => figment.merge(Yaml::file_exact(file)),
                Some("json") => figment.merge(Json::file_exact(file)),
                _ => exn::bail!(ErrorKind::Invalid(format!("unsupported config format: {}", file.display()))),
            };
        }
        let config: Config =
            figment.merge(Env::prefixed(ENV_PREFIX).split("__")).extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        tracing::debug!(database = %config.database.display(), "Configuration loaded");
        Ok(config)
    }

    /// Reject values that would make the cache misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            exn::bail!(ErrorKind::Invalid("max_batch_size must be at least 1".to_string()));
        }
        if self.library_page_size == 0 {
            exn::bail!(ErrorKind::Invalid("library_page_size must be at least 1".to_string()));
        }
        let strategies = [
            ("artist", &self.strategies.artist),
            ("album", &self.strategies.album),
            ("track", &self.strategies.track),
            ("playlist", &self.strategies.playlist),
            ("episode", &self.strategies.episode),
            ("library", &self.strategies.library),
        ];
        for (name, strategy) in strategies {
            if let StrategyConfig::Ttl { valid_for, refresh_after: Some(refresh_after) } = strategy
                && refresh_after >= valid_for
            {
                exn::bail!(ErrorKind::Invalid(format!("{name}: refresh_after must be shorter than valid_for")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    fn write_config(extension: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(extension).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[rstest]
    #[case(".toml", "max_rating = 10\n[strategies.track]\npolicy = \"never_valid\"\n")]
    #[case(".yaml", "max_rating: 10\nstrategies:\n  track:\n    policy: never_valid\n")]
    #[case(".json", r#"{"max_rating": 10, "strategies": {"track": {"policy": "never_valid"}}}"#)]
    fn test_file_overrides_defaults(#[case] extension: &str, #[case] contents: &str) {
        let file = write_config(extension, contents);
        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.max_rating, 10);
        assert_eq!(config.strategies.track, StrategyConfig::NeverValid);
        // Untouched values keep their defaults.
        assert_eq!(config.max_batch_size, 50);
        assert_eq!(config.strategies.album, Strategies::default().album);
    }

    #[test]
    fn test_ttl_without_refresh_window() {
        let file = write_config(".toml", "[strategies.artist]\npolicy = \"ttl\"\nvalid_for = 10\n");
        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.strategies.artist, StrategyConfig::Ttl { valid_for: 10, refresh_after: None });
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let file = write_config(".ini", "max_rating=3");
        let err = Config::load(Some(file.path())).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(_)));
    }

    #[test]
    fn test_missing_file_fails_to_load() {
        let err = Config::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert_eq!(*err, ErrorKind::Load);
    }

    #[rstest]
    #[case("max_batch_size = 0\n")]
    #[case("library_page_size = 0\n")]
    #[case("[strategies.playlist]\npolicy = \"ttl\"\nvalid_for = 60\nrefresh_after = 60\n")]
    fn test_invalid_values_are_rejected(#[case] contents: &str) {
        let file = write_config(".toml", contents);
        let err = Config::load(Some(file.path())).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(_)));
    }
}
