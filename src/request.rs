// Request Handler
// Serves one player request: cached bytes straight from the cache file, gaps
// from the origin while filling the cache, or a plain passthrough when the
// source isn't cacheable.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::cache_file::{CacheEntry, CacheRead};
use crate::cache_parts::Coverage;
use crate::error::ProxyError;
use crate::events::Sinks;
use crate::http::{response_header, ClientRequest, OriginStream};
use crate::ProxyContext;

pub struct RequestHandler<W> {
    ctx: ProxyContext,
    request: ClientRequest,
    cacheable: bool,
    client: W,
    sinks: Sinks,
    cancel: CancellationToken,
    origin: Option<OriginStream>,
    /// Next logical byte owed to the player
    cursor: u64,
    total_size: u64,
}

impl<W> RequestHandler<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(
        ctx: ProxyContext,
        request: ClientRequest,
        cacheable: bool,
        client: W,
        sinks: Sinks,
        cancel: CancellationToken,
    ) -> Self {
        let cursor = request.range_start;
        Self {
            ctx,
            request,
            cacheable,
            client,
            sinks,
            cancel,
            origin: None,
            cursor,
            total_size: 0,
        }
    }

    /// Serves the request to completion, cancellation or failure. Origin
    /// failures are reported to the error sink unless the handler was
    /// superseded.
    pub async fn run(mut self) {
        log::info!(
            "Serving {} from {} ({})",
            self.request.url,
            self.request.range_start,
            if self.cacheable { "cached" } else { "uncached" }
        );
        let result = self.process().await;

        match result {
            Ok(()) => log::info!("Finished {} at {}", self.request.url, self.cursor),
            Err(e) if self.cancel.is_cancelled() || e.is_benign() => {
                log::debug!("Request for {} ended: {}", self.request.url, e);
            }
            Err(e) => match e.failure_kind() {
                Some(kind) => {
                    log::warn!("Request for {} failed ({:?}): {}", self.request.url, kind, e);
                    self.sinks.error(kind);
                }
                None => log::error!("Request for {} failed: {}", self.request.url, e),
            },
        }
        let _ = self.client.shutdown().await;
    }

    async fn process(&mut self) -> Result<(), ProxyError> {
        if self.cacheable && self.ctx.store.is_cacheable(&self.request.url) {
            if let Some(entry) = self.init_cache_entry().await? {
                return self.serve_with_cache(entry).await;
            }
            log::warn!("{} has no declared size; not caching", self.request.url);
        }
        self.serve_without_cache().await
    }

    /// The entry for the request with `total_size` set. Asks the origin for
    /// the size if the index doesn't know it yet. `None` if the origin
    /// doesn't say either.
    async fn init_cache_entry(&mut self) -> Result<Option<CacheEntry>, ProxyError> {
        let store = &self.ctx.store;
        if let Some(entry) = store.open(&self.request.url)? {
            if let Some(size) = store.file_size(&entry)?.filter(|size| *size > 0) {
                self.total_size = size;
                return Ok(Some(entry));
            }
        }

        let origin = self.open_origin(self.cursor).await?;
        let Some(size) = origin.total_size() else {
            self.origin = Some(origin);
            return Ok(None);
        };
        self.origin = Some(origin);
        self.total_size = size;
        Ok(Some(self.ctx.store.open_or_create(&self.request.url, size)?))
    }

    async fn serve_with_cache(&mut self, entry: CacheEntry) -> Result<(), ProxyError> {
        self.send_header().await?;
        let store = self.ctx.store.clone();
        let mut buf = vec![0u8; self.ctx.config.buffer_len(self.total_size)];

        while self.cursor < self.total_size {
            if self.cancel.is_cancelled() {
                return Err(ProxyError::Cancelled);
            }
            match store.need_download(&entry, self.cursor)? {
                Coverage::Cached => {
                    let (back, outcome) = store.read_blocking(&entry, buf, self.cursor).await?;
                    buf = back;
                    if let CacheRead::Read(n) = outcome {
                        write_client(&mut self.client, &buf[..n]).await?;
                        self.cursor += n as u64;
                        self.report_progress();
                    }
                }
                Coverage::Missing(len) => {
                    if !self.download(&entry, &mut buf, len).await? {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Streams the `missing` bytes at the cursor from the origin to the
    /// player, collecting them in `buf` and inserting into the cache each
    /// time it fills. Whatever is collected is inserted on every way out.
    /// Returns false if serving should stop without an error.
    async fn download(&mut self, entry: &CacheEntry, buf: &mut Vec<u8>, missing: u64) -> Result<bool, ProxyError> {
        if !self.connect(entry).await? {
            return Ok(false);
        }
        let cancel = self.cancel.clone();
        let chunk = self.ctx.config.network_chunk;
        let end = self.cursor + missing;
        let mut buf_start = self.cursor;
        let mut has = 0usize;

        while self.cursor < end {
            let want = chunk.min((end - self.cursor) as usize);
            if has + want > buf.len() {
                let kept = self.flush(entry, buf, buf_start, has).await?;
                buf_start = self.cursor;
                has = 0;
                if !kept {
                    // Another writer cached part of this range; re-plan from the cursor.
                    return Ok(true);
                }
            }

            let Some(origin) = self.origin.as_mut() else {
                break;
            };
            let read = origin.read(&mut buf[has..has + want], &cancel).await;
            let n = match read {
                Ok(0) => {
                    log::warn!("{} ended early at {} of {}", self.request.url, self.cursor, end);
                    self.origin = None;
                    self.flush_quietly(entry, buf, buf_start, has).await;
                    return Ok(false);
                }
                Ok(n) => n,
                Err(e) => {
                    self.origin = None;
                    self.flush_quietly(entry, buf, buf_start, has).await;
                    return Err(e);
                }
            };

            let written = write_client(&mut self.client, &buf[has..has + n]).await;
            has += n;
            self.cursor += n as u64;
            if let Err(e) = written {
                self.flush_quietly(entry, buf, buf_start, has).await;
                return Err(e);
            }
            self.report_progress();
        }

        self.flush(entry, buf, buf_start, has).await?;
        Ok(true)
    }

    /// Makes `origin` deliver from the cursor, reusing the open stream when
    /// it's already there. Returns false if the origin now reports another
    /// size, after resetting the entry to it.
    async fn connect(&mut self, entry: &CacheEntry) -> Result<bool, ProxyError> {
        if self.origin.as_ref().is_some_and(|o| o.position() == self.cursor) {
            return Ok(true);
        }
        self.origin = None;
        let origin = self.open_origin(self.cursor).await?;
        if let Some(size) = origin.total_size().filter(|size| *size != self.total_size) {
            log::warn!(
                "{} changed size from {} to {}; dropping its cache",
                self.request.url,
                self.total_size,
                size
            );
            self.ctx.store.init_file_size(entry, size)?;
            return Ok(false);
        }
        self.origin = Some(origin);
        Ok(true)
    }

    async fn open_origin(&mut self, start: u64) -> Result<OriginStream, ProxyError> {
        let mut origin = self
            .ctx
            .origin
            .open(&self.request.url, &self.request.forwarded_headers(), start, &self.cancel)
            .await?;
        if origin.position() < start {
            log::debug!("Origin ignored range {} for {}; skipping", start, self.request.url);
            origin.skip_to(start, &self.cancel).await?;
        } else if origin.position() > start {
            return Err(ProxyError::UnexpectedRange {
                expected: start,
                actual: origin.position(),
            });
        }
        Ok(origin)
    }

    /// Inserts the first `len` bytes of `buf` at `start`. If the range now
    /// overlaps data cached meanwhile, only its uncached pieces are kept and
    /// false is returned.
    async fn flush(&mut self, entry: &CacheEntry, buf: &mut Vec<u8>, start: u64, len: usize) -> Result<bool, ProxyError> {
        if len == 0 {
            return Ok(true);
        }
        let store = &self.ctx.store;
        let (data, inserted) = store.insert_blocking(entry, start, std::mem::take(buf), len).await?;
        if inserted {
            *buf = data;
            return Ok(true);
        }
        let (data, added) = store.insert_uncached_blocking(entry, start, data, len).await?;
        *buf = data;
        log::debug!("Kept {} of {} bytes at {} for {}", added, len, start, entry.name());
        Ok(false)
    }

    // Logs instead of failing; callers are already returning an error.
    async fn flush_quietly(&mut self, entry: &CacheEntry, buf: &mut Vec<u8>, start: u64, len: usize) {
        if let Err(e) = self.flush(entry, buf, start, len).await {
            log::warn!("Failed to cache {} bytes of {}: {}", len, entry.name(), e);
        }
    }

    async fn serve_without_cache(&mut self) -> Result<(), ProxyError> {
        let cancel = self.cancel.clone();
        let mut origin = match self.origin.take() {
            Some(origin) if origin.position() == self.cursor => origin,
            _ => self.open_origin(self.cursor).await?,
        };
        self.total_size = origin
            .total_size()
            .ok_or_else(|| ProxyError::UnknownSize(self.request.url.clone()))?;
        self.send_header().await?;

        let mut buf = vec![0u8; self.ctx.config.network_chunk];
        loop {
            let n = origin.read(&mut buf, &cancel).await?;
            if n == 0 {
                return Ok(());
            }
            write_client(&mut self.client, &buf[..n]).await?;
            self.cursor += n as u64;
            self.report_progress();
        }
    }

    async fn send_header(&mut self) -> Result<(), ProxyError> {
        let header = response_header(self.cursor, self.total_size);
        write_client(&mut self.client, header.as_bytes()).await
    }

    fn report_progress(&self) {
        if self.total_size > 0 && !self.cancel.is_cancelled() {
            self.sinks.progress(self.cursor as f32 / self.total_size as f32);
        }
    }
}

async fn write_client<W: AsyncWrite + Unpin>(client: &mut W, data: &[u8]) -> Result<(), ProxyError> {
    client.write_all(data).await.map_err(ProxyError::from_client_io)?;
    client.flush().await.map_err(ProxyError::from_client_io)
}
