// Prefetcher
// Warms the cache with the head of the next source so playback can start
// from disk. Best effort: failures are logged and never reach the player.

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache_parts::Coverage;
use crate::error::ProxyError;
use crate::ProxyContext;

pub struct Prefetcher {
    ctx: ProxyContext,
    current: Mutex<Option<CancellationToken>>,
}

impl Prefetcher {
    pub fn new(ctx: ProxyContext) -> Self {
        Self {
            ctx,
            current: Mutex::new(None),
        }
    }

    /// Starts fetching the first `prefetch_size` bytes of `url` in the
    /// background. A running prefetch is cancelled first; what it read so far
    /// is still cached. `None` if there is nothing to do.
    pub fn preload(&self, url: &str) -> Option<JoinHandle<()>> {
        let store = &self.ctx.store;
        if !store.is_cacheable(url) {
            log::debug!("Not prefetching {}: not cacheable", url);
            return None;
        }
        match store.open(url) {
            Ok(Some(entry)) => match store.need_download(&entry, 0) {
                Ok(Coverage::Cached) => {
                    log::debug!("Not prefetching {}: head already cached", url);
                    return None;
                }
                Ok(Coverage::Missing(_)) => {}
                Err(e) => {
                    log::warn!("Not prefetching {}: {}", url, e);
                    return None;
                }
            },
            Ok(None) => {}
            Err(e) => {
                log::warn!("Not prefetching {}: {}", url, e);
                return None;
            }
        }

        let cancel = CancellationToken::new();
        if let Some(previous) = self.current.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        let ctx = self.ctx.clone();
        let url = url.to_string();
        Some(tokio::spawn(async move {
            log::info!("Prefetching {}", url);
            match fetch(&ctx, &url, &cancel).await {
                Ok(len) => log::info!("Prefetched {} bytes of {}", len, url),
                Err(e) if cancel.is_cancelled() => log::debug!("Prefetch of {} cancelled: {}", url, e),
                Err(e) => log::warn!("Prefetch of {} failed: {}", url, e),
            }
        }))
    }

    /// Cancels the running prefetch, if any.
    pub fn cancel(&self) {
        if let Some(current) = self.current.lock().take() {
            current.cancel();
        }
    }
}

async fn fetch(ctx: &ProxyContext, url: &str, cancel: &CancellationToken) -> Result<usize, ProxyError> {
    let store = &ctx.store;
    let mut origin = ctx.origin.open(url, &[], 0, cancel).await?;
    let size = origin
        .total_size()
        .ok_or_else(|| ProxyError::UnknownSize(url.to_string()))?;

    let entry = match store.open(url)? {
        Some(entry) => {
            if !store.is_available(&entry)? {
                store.init_cache_parts(&entry)?;
            }
            if store.file_size(&entry)? != Some(size) {
                log::info!("{} is now {} bytes; dropping its cache", url, size);
                store.init_file_size(&entry, size)?;
            }
            entry
        }
        None => store.open_or_create(url, size)?,
    };
    let gap = match store.need_download(&entry, 0)? {
        Coverage::Cached => return Ok(0),
        Coverage::Missing(gap) => gap,
    };

    // Stop where cached data starts, so the insert never crosses it.
    let budget = ctx.config.prefetch_size.min(gap.min(size) as usize);
    let chunk = ctx.config.network_chunk;
    let mut buf = vec![0u8; budget];
    let mut has = 0;
    let result = loop {
        if has == budget {
            break Ok(());
        }
        let want = chunk.min(budget - has);
        match origin.read(&mut buf[has..has + want], cancel).await {
            Ok(0) => break Ok(()),
            Ok(n) => has += n,
            Err(e) => break Err(e),
        }
    };

    if has > 0 {
        let (_, inserted) = store.insert_blocking(&entry, 0, buf, has).await?;
        if !inserted {
            log::warn!("Prefetched head of {} was rejected by the cache", url);
            return result.map(|()| 0);
        }
    }
    result.map(|()| has)
}
