//! Proxy configuration
//! Every field has a default, so a config file only needs the overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Directory holding the packed `.cache` files
    pub cache_dir: PathBuf,
    /// SQLite file recording sizes and covered ranges
    pub index_path: PathBuf,
    /// Loopback port; 0 picks a free one on first start
    pub port: u16,
    /// Free space the cache directory must keep before anything is cached
    pub min_free_space: u64,
    /// Leading bytes fetched by a prefetch
    pub prefetch_size: usize,
    pub buffer_min: usize,
    pub buffer_max: usize,
    /// Largest single read from the origin
    pub network_chunk: usize,
    /// Buffer used to move packed bytes during an insert
    pub shift_buffer: usize,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("MediaCacheProxy");

        Self {
            cache_dir: data_dir.join("media"),
            index_path: data_dir.join("db").join("cache_index.db"),
            port: 0,
            min_free_space: 50 * 1024 * 1024,
            prefetch_size: 312 * 1024,
            buffer_min: 256 * 1024,
            buffer_max: 4 * 1024 * 1024,
            network_chunk: 40 * 1024,
            shift_buffer: 256 * 1024,
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ProxyConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Size of the buffer a request accumulates downloads in before writing
    /// them to the cache: about a tenth of the file, within the configured
    /// bounds and never below one network read.
    pub fn buffer_len(&self, file_size: u64) -> usize {
        let tenth = (file_size as f64 / 9.9) as usize;
        tenth
            .min(self.buffer_max)
            .max(self.buffer_min)
            .max(self.network_chunk)
    }
}
