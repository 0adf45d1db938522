//! Cache configuration
//!
//! Values are layered, later sources winning:
//!
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. `GENCACHE_*` environment variables (`GENCACHE_MAX_ITEMS=50000`)

use crate::cache::{LruCache, PAGE_SIZE};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

const ENV_PREFIX: &str = "GENCACHE";

const DEFAULT_MAX_ITEMS: i64 = 100_000;
const DEFAULT_MAX_SIZE: i64 = 1 << 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub index_path: PathBuf,
    pub data_path: PathBuf,
    pub max_items: usize,
    pub max_size: u64,
    /// Size `trim` shrinks the cache to; 90% of `max_size` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trim_target: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            index_path: PathBuf::from("gencache.idx"),
            data_path: PathBuf::from("gencache.dat"),
            max_items: DEFAULT_MAX_ITEMS as usize,
            max_size: DEFAULT_MAX_SIZE as u64,
            trim_target: None,
        }
    }
}

impl CacheConfig {
    /// Load defaults, then `path` (if given), then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
    }

    fn load_with_env(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let defaults = Self::default();
        let mut builder = config::Config::builder()
            .set_default("index_path", defaults.index_path.to_string_lossy().into_owned())
            .map_err(config_error)?
            .set_default("data_path", defaults.data_path.to_string_lossy().into_owned())
            .map_err(config_error)?
            .set_default("max_items", DEFAULT_MAX_ITEMS)
            .map_err(config_error)?
            .set_default("max_size", DEFAULT_MAX_SIZE)
            .map_err(config_error)?;

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        let config: Self = builder
            .add_source(env)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(config_error)?;
        config.validate()?;

        debug!(?config, "Loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_items == 0 {
            return Err(Error::Config("max_items must be at least 1".to_string()));
        }
        if self.max_size < PAGE_SIZE as u64 {
            return Err(Error::Config(format!(
                "max_size must be at least {} bytes, got {}",
                PAGE_SIZE, self.max_size
            )));
        }
        if let Some(target) = self.trim_target {
            if target > self.max_size {
                return Err(Error::Config(format!(
                    "trim_target {} exceeds max_size {}",
                    target, self.max_size
                )));
            }
        }
        Ok(())
    }

    pub fn trim_target(&self) -> u64 {
        self.trim_target.unwrap_or(self.max_size / 10 * 9)
    }

    /// Open the configured cache, creating or resizing it as needed
    pub fn open_cache(&self) -> Result<LruCache> {
        LruCache::open_and_modify(&self.index_path, &self.data_path, self.max_items, self.max_size)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

fn config_error(e: config::ConfigError) -> Error {
    Error::Config(e.to_string())
}
