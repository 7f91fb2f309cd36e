//! Loopback caching proxy for streamed media.
//!
//! A player is pointed at `http://127.0.0.1:<port>/<origin url>`. The proxy
//! answers its range requests from a sparse on-disk cache, fetches the gaps
//! from the origin and stores them as they pass through.

pub mod cache_file;
pub mod cache_parts;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod file_name;
pub mod http;
pub mod packed_file;
pub mod prefetch;
pub mod proxy;
pub mod request;

use std::sync::Arc;

pub use cache_file::{CacheEntry, CacheStore};
pub use config::ProxyConfig;
pub use database::CacheIndex;
pub use error::{CacheError, ProxyError};
pub use events::{ErrorSink, FailureKind, ProgressSink};
pub use prefetch::Prefetcher;
pub use proxy::MediaProxy;

/// Everything a worker task needs, shared by the listener, its handlers and
/// the prefetcher.
#[derive(Clone)]
pub struct ProxyContext {
    pub config: Arc<ProxyConfig>,
    pub store: Arc<CacheStore>,
    pub origin: http::OriginClient,
}

impl ProxyContext {
    /// Opens the index at `config.index_path`.
    pub fn open(config: ProxyConfig) -> Result<Self, ProxyError> {
        let index = CacheIndex::new(&config.index_path).map_err(CacheError::from)?;
        Self::with_index(config, Arc::new(index))
    }

    pub fn with_index(config: ProxyConfig, index: Arc<CacheIndex>) -> Result<Self, ProxyError> {
        let store = CacheStore::new(&config, index)?;
        let origin = http::OriginClient::new(&config)?;
        Ok(Self {
            config: Arc::new(config),
            store: Arc::new(store),
            origin,
        })
    }
}
