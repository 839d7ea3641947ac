//! Storage configuration.
//!
//! A [`StorageConfig`] tells the [`StorageHost`](crate::local_db_host::StorageHost)
//! where database directories live and how large each LMDB environment may grow.

use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

pub const ENV_STORE_DIR: &str = "QUILL_STORE_DIR";
pub const ENV_MAP_SIZE: &str = "QUILL_STORE_MAP_SIZE";
pub const ENV_MAX_DBS: &str = "QUILL_STORE_MAX_DBS";

const DEFAULT_MAP_SIZE: usize = 64 * 1024 * 1024;
const DEFAULT_MAX_DBS: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one `<name>.lmdb` directory per named database.
    pub root: PathBuf,
    /// Maximum size of a single database environment, in bytes.
    pub map_size: usize,
    /// Maximum number of LMDB sub-databases per environment. Every collection
    /// takes one plus one per index, and the metadata table takes one more.
    pub max_dbs: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("quill_data"),
            map_size: DEFAULT_MAP_SIZE,
            max_dbs: DEFAULT_MAX_DBS,
        }
    }
}

impl StorageConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn with_map_size(mut self, map_size: usize) -> Self {
        self.map_size = map_size;
        self
    }

    pub fn with_max_dbs(mut self, max_dbs: u32) -> Self {
        self.max_dbs = max_dbs;
        self
    }

    /// Defaults overridden by `QUILL_STORE_*` environment variables.
    ///
    /// Unparseable numeric values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var(ENV_STORE_DIR) {
            if !dir.trim().is_empty() {
                config.root = PathBuf::from(dir);
            }
        }

        if let Ok(raw) = std::env::var(ENV_MAP_SIZE) {
            match raw.trim().parse::<usize>() {
                Ok(size) if size > 0 => config.map_size = size,
                _ => warn!("Ignoring invalid {ENV_MAP_SIZE} value: {raw}"),
            }
        }

        if let Ok(raw) = std::env::var(ENV_MAX_DBS) {
            match raw.trim().parse::<u32>() {
                Ok(max) if max > 0 => config.max_dbs = max,
                _ => warn!("Ignoring invalid {ENV_MAX_DBS} value: {raw}"),
            }
        }

        config
    }

    pub fn database_dir(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.lmdb"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
