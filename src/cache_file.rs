// Media Cache Store
// One packed cache file per source URL, plus its row in the cache index.
// The file's bytes are trusted only while its length matches the ranges the
// index records; any mismatch resets the entry to empty.

use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache_parts::{CacheParts, Coverage, InsertError};
use crate::config::ProxyConfig;
use crate::database::{CacheFileInfo, CacheIndex};
use crate::error::CacheError;
use crate::file_name::valid_file_name;
use crate::packed_file::{shift_insert, PackedFile};

pub const CACHE_FILE_SUFFIX: &str = ".cache";

/// Handle to one cache file. Holding one doesn't lock anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    name: String,
    path: PathBuf,
}

impl CacheEntry {
    /// Index key and file name, e.g. `track01.mp3.cache`
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Outcome of reading cached bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheRead {
    Read(usize),
    /// The requested offset isn't cached
    NotCached,
    /// The file didn't match the index and was emptied
    Reset,
}

pub struct CacheStore {
    cache_dir: PathBuf,
    index: Arc<CacheIndex>,
    min_free_space: u64,
    shift_buffer: usize,
    /// One lock per cache file name, so a file is only read or written by one
    /// thread at a time
    file_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CacheStore {
    pub fn new(config: &ProxyConfig, index: Arc<CacheIndex>) -> Result<Self, CacheError> {
        fs::create_dir_all(&config.cache_dir)?;
        Ok(Self {
            cache_dir: config.cache_dir.clone(),
            index,
            min_free_space: config.min_free_space,
            shift_buffer: config.shift_buffer,
            file_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn index(&self) -> &Arc<CacheIndex> {
        &self.index
    }

    pub fn entry_name(url: &str) -> Option<String> {
        valid_file_name(url).map(|name| name + CACHE_FILE_SUFFIX)
    }

    /// True if the cache directory has room to spare and the URL yields a
    /// file name.
    pub fn is_cacheable(&self, url: &str) -> bool {
        fs::create_dir_all(&self.cache_dir).ok();
        match fs2::available_space(&self.cache_dir) {
            Ok(free) if free > self.min_free_space => {}
            Ok(free) => {
                log::warn!("Cache directory has only {} bytes free", free);
                return false;
            }
            Err(e) => {
                log::warn!("Cache directory {:?} unusable: {}", self.cache_dir, e);
                return false;
            }
        }
        if valid_file_name(url).is_none() {
            log::warn!("No file name in {}", url);
            return false;
        }
        true
    }

    /// The entry for `url`, only if the index already knows it.
    pub fn open(&self, url: &str) -> Result<Option<CacheEntry>, CacheError> {
        let Some(name) = Self::entry_name(url) else {
            return Ok(None);
        };
        if !self.index.exists(&name)? {
            return Ok(None);
        }
        self.entry(name).map(Some)
    }

    /// Records `file_size` for `url` and returns its entry, creating the
    /// cache file if needed.
    pub fn open_or_create(&self, url: &str, file_size: u64) -> Result<CacheEntry, CacheError> {
        let name = Self::entry_name(url).ok_or_else(|| CacheError::InvalidUrl(url.to_string()))?;
        self.index.insert_or_update(&name, file_size)?;
        self.entry(name)
    }

    fn entry(&self, name: String) -> Result<CacheEntry, CacheError> {
        fs::create_dir_all(&self.cache_dir)?;
        let path = self.cache_dir.join(&name);
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(CacheEntry { name, path })
    }

    pub fn info(&self, entry: &CacheEntry) -> Result<Option<CacheFileInfo>, CacheError> {
        Ok(self.index.get(entry.name())?)
    }

    pub fn file_size(&self, entry: &CacheEntry) -> Result<Option<u64>, CacheError> {
        Ok(self.info(entry)?.and_then(|info| info.file_size))
    }

    pub fn cache_parts(&self, entry: &CacheEntry) -> Result<CacheParts, CacheError> {
        Ok(self.info(entry)?.map(|info| info.cache_parts).unwrap_or_default())
    }

    /// Whether the file length agrees with the recorded ranges.
    pub fn is_available(&self, entry: &CacheEntry) -> Result<bool, CacheError> {
        let lock = self.file_lock(entry.name());
        let _guard = lock.lock();
        let physical = fs::metadata(entry.path()).map(|m| m.len()).unwrap_or(0);
        Ok(self.cache_parts(entry)?.cached_len() == physical)
    }

    pub fn need_download(&self, entry: &CacheEntry, start: u64) -> Result<Coverage, CacheError> {
        let info = self.info(entry)?;
        let file_size = info.as_ref().and_then(|i| i.file_size).unwrap_or(0);
        let parts = info.map(|i| i.cache_parts).unwrap_or_default();
        Ok(parts.need_download(start, file_size))
    }

    /// Reads cached bytes at logical offset `start` into `buf`, stopping at
    /// the end of the covering range.
    pub fn read(&self, entry: &CacheEntry, buf: &mut [u8], start: u64) -> Result<CacheRead, CacheError> {
        let lock = self.file_lock(entry.name());
        let _guard = lock.lock();
        let mut file = self.open_locked(entry)?;

        let parts = self.cache_parts(entry)?;
        let physical = file.byte_len()?;
        if parts.cached_len() != physical {
            log::warn!(
                "READ {}: file holds {} bytes, index [{}]; resetting",
                entry.name(),
                physical,
                parts
            );
            self.reset_locked(entry, &mut file)?;
            return Ok(CacheRead::Reset);
        }

        let Some(span) = parts.locate(start, buf.len() as u64) else {
            log::warn!("READ {}: offset {} not cached in [{}]", entry.name(), start, parts);
            return Ok(CacheRead::NotCached);
        };
        let len = span.len as usize;
        file.read_exact_at(&mut buf[..len], span.skip)?;
        log::debug!("READ cache {} {}-{}", entry.name(), start, start + span.len - 1);
        Ok(CacheRead::Read(len))
    }

    /// Merges `data` at logical offset `start` into the cache file.
    ///
    /// Returns false if the range conflicts with what's already cached; the
    /// entry is left untouched then. A file that doesn't match the index is
    /// reset first and the insert applied to the empty entry.
    pub fn insert(&self, entry: &CacheEntry, start: u64, data: &[u8]) -> Result<bool, CacheError> {
        if data.is_empty() {
            return Ok(false);
        }
        let lock = self.file_lock(entry.name());
        let _guard = lock.lock();
        let mut file = self.open_locked(entry)?;
        self.insert_locked(entry, &mut file, start, data)
    }

    /// Inserts only the pieces of `data` (logical offset `start`) that fall
    /// into gaps of the cache. Bytes already cached are left as they are.
    /// Returns how many bytes were added.
    pub fn insert_uncached(&self, entry: &CacheEntry, start: u64, data: &[u8]) -> Result<u64, CacheError> {
        let lock = self.file_lock(entry.name());
        let _guard = lock.lock();
        let mut file = self.open_locked(entry)?;
        let file_size = self.file_size(entry)?.unwrap_or(0);

        let end = start + data.len() as u64;
        let mut pos = start;
        let mut added = 0;
        while pos < end {
            let parts = self.cache_parts(entry)?;
            let len = match parts.need_download(pos, file_size) {
                Coverage::Cached => {
                    pos += parts.locate(pos, end - pos).map_or(end - pos, |span| span.len);
                    continue;
                }
                Coverage::Missing(gap) => gap.min(end - pos),
            };
            if len == 0 {
                break;
            }
            let offset = (pos - start) as usize;
            let piece = &data[offset..offset + len as usize];
            if !self.insert_locked(entry, &mut file, pos, piece)? {
                break;
            }
            added += len;
            pos += len;
        }
        Ok(added)
    }

    fn insert_locked(&self, entry: &CacheEntry, file: &mut File, start: u64, data: &[u8]) -> Result<bool, CacheError> {
        let file_size = self.file_size(entry)?;
        let mut reset = false;
        loop {
            let parts = self.cache_parts(entry)?;
            let physical = file.byte_len()?;
            match parts.plan_insert(physical, file_size, start, data.len() as u64) {
                Ok(plan) => {
                    shift_insert(file, plan.skip, &data[plan.data.clone()], self.shift_buffer)?;
                    self.index.update_cache_parts(entry.name(), &plan.parts)?;
                    log::debug!(
                        "INSERT cache {} {}-{} -> [{}]",
                        entry.name(),
                        start,
                        start + data.len() as u64 - 1,
                        plan.parts
                    );
                    return Ok(true);
                }
                Err(InsertError::Inconsistent { physical, indexed }) if !reset => {
                    log::warn!(
                        "INSERT {}: file holds {} bytes, index {}; resetting",
                        entry.name(),
                        physical,
                        indexed
                    );
                    self.reset_locked(entry, file)?;
                    reset = true;
                }
                Err(e) => {
                    log::warn!("INSERT {} cancelled: {}", entry.name(), e);
                    return Ok(false);
                }
            }
        }
    }

    /// Drops all cached bytes of the entry.
    pub fn init_cache_parts(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let lock = self.file_lock(entry.name());
        let _guard = lock.lock();
        let mut file = self.open_locked(entry)?;
        self.reset_locked(entry, &mut file)
    }

    /// The source changed size, so nothing cached for it is valid anymore.
    pub fn init_file_size(&self, entry: &CacheEntry, file_size: u64) -> Result<(), CacheError> {
        self.init_cache_parts(entry)?;
        self.index.insert_or_update(entry.name(), file_size)?;
        Ok(())
    }

    pub fn set_duration(&self, entry: &CacheEntry, duration_ms: u64) -> Result<(), CacheError> {
        Ok(self.index.update_duration(entry.name(), duration_ms)?)
    }

    /// Removes the cache file, then its index row.
    pub fn delete(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let lock = self.file_lock(entry.name());
        let _guard = lock.lock();
        match fs::remove_file(entry.path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.index.delete(entry.name())?;
        Ok(())
    }

    /// Fraction of the file cached contiguously from the byte at
    /// `play_progress`. `file_name` is the sanitized name without the cache
    /// suffix.
    pub fn buffering_progress(&self, file_name: &str, play_progress: f32) -> f32 {
        if file_name.is_empty() {
            return 0.0;
        }
        match self.index.get(&format!("{}{}", file_name, CACHE_FILE_SUFFIX)) {
            Ok(Some(info)) => info
                .cache_parts
                .buffering_progress(play_progress, info.file_size.unwrap_or(0)),
            Ok(None) => 0.0,
            Err(e) => {
                log::warn!("Failed to look up {}: {}", file_name, e);
                0.0
            }
        }
    }

    /// Delete every cache file and index row
    pub fn clear(&self) -> Result<usize, CacheError> {
        let mut count = 0;
        for name in self.index.file_names()? {
            let entry = CacheEntry {
                path: self.cache_dir.join(&name),
                name,
            };
            if entry.path.exists() {
                count += 1;
            }
            self.delete(&entry)?;
        }
        if let Ok(entries) = fs::read_dir(&self.cache_dir) {
            for entry in entries.flatten() {
                let is_cache_file = entry
                    .file_name()
                    .to_string_lossy()
                    .ends_with(CACHE_FILE_SUFFIX);
                if is_cache_file && fs::remove_file(entry.path()).is_ok() {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Get cache size in bytes
    pub fn cache_size(&self) -> u64 {
        let mut size = 0;
        if let Ok(entries) = fs::read_dir(&self.cache_dir) {
            for entry in entries.flatten() {
                if let Ok(meta) = entry.metadata() {
                    size += meta.len();
                }
            }
        }
        size
    }

    /// `read` on the blocking pool. The buffer is handed back with the result.
    pub async fn read_blocking(
        self: &Arc<Self>,
        entry: &CacheEntry,
        mut buf: Vec<u8>,
        start: u64,
    ) -> Result<(Vec<u8>, CacheRead), CacheError> {
        let store = Arc::clone(self);
        let entry = entry.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = store.read(&entry, &mut buf, start)?;
            Ok::<_, CacheError>((buf, outcome))
        })
        .await?
    }

    /// `insert` of `data[..len]` on the blocking pool. Once started the shift
    /// runs to completion even if the calling task goes away.
    pub async fn insert_blocking(
        self: &Arc<Self>,
        entry: &CacheEntry,
        start: u64,
        data: Vec<u8>,
        len: usize,
    ) -> Result<(Vec<u8>, bool), CacheError> {
        let store = Arc::clone(self);
        let entry = entry.clone();
        tokio::task::spawn_blocking(move || {
            let inserted = store.insert(&entry, start, &data[..len])?;
            Ok::<_, CacheError>((data, inserted))
        })
        .await?
    }

    /// `insert_uncached` on the blocking pool.
    pub async fn insert_uncached_blocking(
        self: &Arc<Self>,
        entry: &CacheEntry,
        start: u64,
        data: Vec<u8>,
        len: usize,
    ) -> Result<(Vec<u8>, u64), CacheError> {
        let store = Arc::clone(self);
        let entry = entry.clone();
        tokio::task::spawn_blocking(move || {
            let added = store.insert_uncached(&entry, start, &data[..len])?;
            Ok::<_, CacheError>((data, added))
        })
        .await?
    }

    fn file_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.file_locks.lock();
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    // Callers hold the entry's file lock. The OS lock keeps other processes
    // out and is released when the handle closes.
    fn open_locked(&self, entry: &CacheEntry) -> Result<File, CacheError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(entry.path())?;
        file.lock_exclusive()?;
        Ok(file)
    }

    fn reset_locked(&self, entry: &CacheEntry, file: &mut File) -> Result<(), CacheError> {
        file.set_byte_len(0)?;
        self.index.update_cache_parts(entry.name(), &CacheParts::new())?;
        Ok(())
    }
}
