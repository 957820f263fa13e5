//! Repository configuration
//!
//! ```toml
//! [index]
//! max_blobs = 50000
//! max_age_secs = 600
//! load_concurrency = 4
//! duplicates = "warn"
//! compact_threshold = 10000
//!
//! [cache]
//! enabled = true
//! dir = "/var/cache/blobdex"
//!
//! [backend]
//! type = "fs"
//! path = "/path/to/repository"
//! ```
use crate::backends::BackendConfig;

use std::{fs, io, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
    #[error("Parse error: {source}")]
    Parse {
        #[from]
        source: toml::de::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Everything needed to open a repository, except the key.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Session and merge behaviour of the master index
    #[serde(default)]
    pub index: IndexConfig,
    /// Local metadata cache
    #[serde(default)]
    pub cache: CacheConfig,
    /// Where objects are stored
    pub backend: BackendConfig,
}

impl Config {
    pub fn new(backend: BackendConfig) -> Self {
        Config {
            index: IndexConfig::default(),
            cache: CacheConfig::default(),
            backend,
        }
    }

    pub fn from_toml(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Config::from_toml(&fs::read_to_string(path)?)
    }
}

/// What to do when two unrelated indexes place the same blob in
/// different locations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// The most recently merged index wins, silently
    LastWins,
    /// The most recently merged index wins, and the merge is logged
    #[default]
    Warn,
    /// Fail the merge
    Reject,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct IndexConfig {
    /// A session index with this many records is full
    pub max_blobs: usize,
    /// A session index this old is full
    pub max_age_secs: u64,
    /// Number of index objects fetched in parallel on load
    pub load_concurrency: usize,
    pub duplicates: DuplicatePolicy,
    /// Indexes smaller than this are candidates for compaction
    pub compact_threshold: usize,
}

impl IndexConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            max_blobs: 50_000,
            max_age_secs: 600,
            load_concurrency: 4,
            duplicates: DuplicatePolicy::default(),
            compact_threshold: 10_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Base directory; the platform cache directory if unset
    pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: true,
            dir: None,
        }
    }
}
