//! Database Module
//! SQLite-backed cache index: declared size and covered ranges per cache file

use parking_lot::Mutex;
use rusqlite::{params, Connection, Result};
use std::path::Path;

use crate::cache_parts::CacheParts;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheFileInfo {
    pub file_name: String,
    pub file_size: Option<u64>,
    pub cache_parts: CacheParts,
    pub duration: Option<u64>,
}

/// The connection is serialized internally, so the index can be shared
/// between worker tasks behind an `Arc`.
pub struct CacheIndex {
    conn: Mutex<Connection>,
}

impl CacheIndex {
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let index = Self {
            conn: Mutex::new(Connection::open(path)?),
        };
        index.initialize()?;
        Ok(index)
    }

    pub fn in_memory() -> Result<Self> {
        let index = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        index.initialize()?;
        Ok(index)
    }

    fn initialize(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS media_cache_files (
                file_name TEXT PRIMARY KEY NOT NULL,
                file_size INTEGER NOT NULL DEFAULT -1,
                cache_parts TEXT,
                duration INTEGER
            );
        "#,
        )?;
        Ok(())
    }

    pub fn exists(&self, file_name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT 1 FROM media_cache_files WHERE file_name = ?1 LIMIT 1")?;
        stmt.exists(params![file_name])
    }

    pub fn insert(&self, file_name: &str, file_size: u64) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO media_cache_files (file_name, file_size) VALUES (?1, ?2)",
            params![file_name, to_sql_size(file_size)],
        )?;
        Ok(())
    }

    pub fn insert_or_update(&self, file_name: &str, file_size: u64) -> Result<()> {
        self.conn.lock().execute(
            r#"INSERT INTO media_cache_files (file_name, file_size) VALUES (?1, ?2)
               ON CONFLICT(file_name) DO UPDATE SET file_size = excluded.file_size"#,
            params![file_name, to_sql_size(file_size)],
        )?;
        Ok(())
    }

    pub fn update_file_size(&self, file_name: &str, file_size: u64) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE media_cache_files SET file_size = ?2 WHERE file_name = ?1",
            params![file_name, to_sql_size(file_size)],
        )?;
        Ok(())
    }

    pub fn update_cache_parts(&self, file_name: &str, cache_parts: &CacheParts) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE media_cache_files SET cache_parts = ?2 WHERE file_name = ?1",
            params![file_name, cache_parts.to_string()],
        )?;
        Ok(())
    }

    pub fn update_duration(&self, file_name: &str, duration_ms: u64) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE media_cache_files SET duration = ?2 WHERE file_name = ?1",
            params![file_name, to_sql_size(duration_ms)],
        )?;
        Ok(())
    }

    pub fn delete(&self, file_name: &str) -> Result<()> {
        self.conn.lock().execute(
            "DELETE FROM media_cache_files WHERE file_name = ?1",
            params![file_name],
        )?;
        Ok(())
    }

    pub fn get(&self, file_name: &str) -> Result<Option<CacheFileInfo>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT file_name, file_size, cache_parts, duration FROM media_cache_files WHERE file_name = ?1",
        )?;

        let result = stmt.query_row(params![file_name], |row| {
            let file_name: String = row.get(0)?;
            let cache_parts: Option<String> = row.get(2)?;
            Ok(CacheFileInfo {
                file_size: from_sql_size(row.get(1)?),
                cache_parts: parse_cache_parts(&file_name, cache_parts.as_deref()),
                duration: row.get::<_, Option<i64>>(3)?.and_then(from_sql_size),
                file_name,
            })
        });

        match result {
            Ok(info) => Ok(Some(info)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn file_names(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT file_name FROM media_cache_files ORDER BY file_name")?;
        let names = stmt.query_map([], |row| row.get(0))?;
        names.collect()
    }
}

fn to_sql_size(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

fn from_sql_size(size: i64) -> Option<u64> {
    u64::try_from(size).ok()
}

// Unreadable ranges count as nothing cached; the length check against the
// cache file then resets it.
fn parse_cache_parts(file_name: &str, raw: Option<&str>) -> CacheParts {
    match raw.unwrap_or("").parse() {
        Ok(parts) => parts,
        Err(e) => {
            log::warn!("Ignoring cache ranges of {}: {}", file_name, e);
            CacheParts::new()
        }
    }
}
