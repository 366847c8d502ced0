// src/cache.rs

//! Content-addressed backup cache
//!
//! Layout under the configured root:
//!
//! ```text
//! caches/<dbName>/<hex-hash>   one backup file per (database, state)
//! hit.json                     {db: {hex: lastHitTicks}}, locked, pretty
//! ```
//!
//! The hit table ranks evictions; it is only ever edited under an
//! exclusive OS file lock with a full read-modify-rewrite, never in
//! place. Backup files are written under their final name only on
//! success, so `try_get` answering "present" is race-safe, and anything
//! half-written is an orphan the next garbage collection removes.

use crate::error::Result;
use crate::hash::StateHash;
use crate::sqlrunner::SqlRunner;
use chrono::Utc;
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Hit-table file name under the cache root
pub const HIT_FILE: &str = "hit.json";

/// Subdirectory holding per-database backup directories
const CACHES_DIR: &str = "caches";

/// `{db: {hex: lastHitTicks}}`; BTreeMap keeps the file diff-stable
type HitTable = BTreeMap<String, BTreeMap<String, i64>>;

/// What a garbage collection did
#[derive(Debug, Default, Clone, Copy)]
pub struct GcStats {
    /// Files with no hit entry (or an unparsable name), deleted
    pub orphans_deleted: usize,
    /// Hit entries with no file, removed
    pub forgotten_removed: usize,
    /// Live entries evicted for the size bound
    pub evicted: usize,
    /// Live bytes remaining after collection
    pub live_size: u64,
}

/// Cache statistics for reporting
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub entries: usize,
    pub live_size: u64,
    pub max_size: i64,
}

/// The cache seam the engine consumes
///
/// `--no-cache` swaps in [`NullCache`]; everything else uses
/// [`BackupCache`].
pub trait StateCache {
    /// Path of the cached backup for `(database, hash)`, if present
    fn try_get(&self, database: &str, hash: &StateHash, update_hit: bool)
        -> Result<Option<PathBuf>>;

    /// Stream a backup of `database` into the cache under `hash`
    fn add(&self, database: &str, hash: &StateHash) -> Result<()>;

    /// Touch the hit timestamps for the given keys
    fn update_hits(&self, keys: &[(String, StateHash)]) -> Result<()>;

    /// Remove orphans and forgotten entries; enforce the size bound
    fn garbage_collect(&self, silent: bool) -> Result<GcStats>;
}

/// Cache that never hits and never stores
#[derive(Debug, Default)]
pub struct NullCache;

impl StateCache for NullCache {
    fn try_get(&self, _db: &str, _hash: &StateHash, _update_hit: bool) -> Result<Option<PathBuf>> {
        Ok(None)
    }

    fn add(&self, _db: &str, _hash: &StateHash) -> Result<()> {
        Ok(())
    }

    fn update_hits(&self, _keys: &[(String, StateHash)]) -> Result<()> {
        Ok(())
    }

    fn garbage_collect(&self, _silent: bool) -> Result<GcStats> {
        Ok(GcStats::default())
    }
}

/// On-disk content-addressed backup store
pub struct BackupCache {
    root: PathBuf,
    /// Live-size bound in bytes; negative means unbounded
    max_size: i64,
    /// Collect silently before every add
    auto_gc: bool,
    connection: String,
    compress: bool,
    runner: Arc<dyn SqlRunner>,
}

impl BackupCache {
    pub fn new(
        root: impl Into<PathBuf>,
        max_size: i64,
        auto_gc: bool,
        connection: impl Into<String>,
        compress: bool,
        runner: Arc<dyn SqlRunner>,
    ) -> Self {
        Self {
            root: root.into(),
            max_size,
            auto_gc,
            connection: connection.into(),
            compress,
            runner,
        }
    }

    fn db_dir(&self, database: &str) -> PathBuf {
        self.root.join(CACHES_DIR).join(database)
    }

    fn entry_path(&self, database: &str, hash: &StateHash) -> PathBuf {
        self.db_dir(database).join(hash.to_hex())
    }

    /// Acquire the hit-table lock, creating root and file as needed
    fn lock_hits(&self) -> Result<HitTableLock> {
        fs::create_dir_all(&self.root)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.root.join(HIT_FILE))?;
        file.lock_exclusive()?;
        Ok(HitTableLock { file })
    }

    /// Enumerate backup files as `(db, file name, path, size)`
    fn entries_on_disk(&self) -> Result<Vec<(String, String, PathBuf, u64)>> {
        let mut out = Vec::new();
        let caches = self.root.join(CACHES_DIR);
        if !caches.is_dir() {
            return Ok(out);
        }

        for db_entry in fs::read_dir(&caches)? {
            let db_entry = db_entry?;
            if !db_entry.file_type()?.is_dir() {
                continue;
            }
            let db = db_entry.file_name().to_string_lossy().to_string();

            for file_entry in fs::read_dir(db_entry.path())? {
                let file_entry = file_entry?;
                if !file_entry.file_type()?.is_file() {
                    continue;
                }
                let name = file_entry.file_name().to_string_lossy().to_string();
                let size = file_entry.metadata()?.len();
                out.push((db.clone(), name, file_entry.path(), size));
            }
        }

        out.sort();
        Ok(out)
    }

    /// Cache statistics over the live join of files and hit entries
    pub fn stats(&self) -> Result<CacheStats> {
        let mut lock = self.lock_hits()?;
        let table = lock.read();

        let mut entries = 0usize;
        let mut live_size = 0u64;
        for (db, name, _path, size) in self.entries_on_disk()? {
            if table.get(&db).is_some_and(|hits| hits.contains_key(&name)) {
                entries += 1;
                live_size += size;
            }
        }

        Ok(CacheStats {
            entries,
            live_size,
            max_size: self.max_size,
        })
    }
}

impl StateCache for BackupCache {
    fn try_get(
        &self,
        database: &str,
        hash: &StateHash,
        update_hit: bool,
    ) -> Result<Option<PathBuf>> {
        let path = self.entry_path(database, hash);
        if !path.is_file() {
            return Ok(None);
        }
        if update_hit {
            self.update_hits(&[(database.to_string(), *hash)])?;
        }
        Ok(Some(path))
    }

    fn add(&self, database: &str, hash: &StateHash) -> Result<()> {
        let path = self.entry_path(database, hash);
        if path.is_file() {
            debug!("already cached: {}/{:?}", database, hash);
            return Ok(());
        }

        if self.auto_gc {
            if let Err(e) = self.garbage_collect(true) {
                warn!("pre-add garbage collection failed: {}", e);
            }
        }

        fs::create_dir_all(self.db_dir(database))?;

        match self
            .runner
            .backup_database(&self.connection, database, &path, self.compress)
        {
            Ok(()) => {
                self.update_hits(&[(database.to_string(), *hash)])?;
                info!("cached backup of {} at {:?}", database, hash);
                Ok(())
            }
            Err(e) => {
                warn!("backup of {} failed, not caching: {}", database, e);
                if path.exists() {
                    let _ = fs::remove_file(&path);
                }
                Ok(())
            }
        }
    }

    fn update_hits(&self, keys: &[(String, StateHash)]) -> Result<()> {
        let mut lock = self.lock_hits()?;
        let mut table = lock.read();
        let now = now_ticks();
        for (db, hash) in keys {
            table.entry(db.clone()).or_default().insert(hash.to_hex(), now);
        }
        lock.write(&table)
    }

    fn garbage_collect(&self, silent: bool) -> Result<GcStats> {
        let mut lock = self.lock_hits()?;
        let mut table = lock.read();
        let mut stats = GcStats::default();

        // Pass 1: delete files without a hit entry; names that do not
        // parse as a hash are always orphans
        let mut live: Vec<(String, String, PathBuf, u64, i64)> = Vec::new();
        for (db, name, path, size) in self.entries_on_disk()? {
            let valid_name = StateHash::from_hex(&name).is_ok();
            let last_hit = table.get(&db).and_then(|hits| hits.get(&name)).copied();

            match last_hit {
                Some(ticks) if valid_name => {
                    live.push((db, name, path, size, ticks));
                }
                _ => {
                    debug!("deleting orphan cache file {}", path.display());
                    fs::remove_file(&path)?;
                    stats.orphans_deleted += 1;
                }
            }
        }

        // Pass 2: drop hit entries whose file is gone
        for (db, hits) in table.iter_mut() {
            let before = hits.len();
            hits.retain(|name, _| {
                live.iter().any(|(ldb, lname, ..)| ldb == db && lname == name)
            });
            stats.forgotten_removed += before - hits.len();
        }
        table.retain(|_, hits| !hits.is_empty());

        // Pass 3: evict in ascending last-hit order until under the bound
        stats.live_size = live.iter().map(|(.., size, _)| *size).sum();
        if self.max_size >= 0 {
            live.sort_by_key(|(.., ticks)| *ticks);
            let mut iter = live.iter();
            while stats.live_size > self.max_size as u64 {
                let Some((db, name, path, size, _)) = iter.next() else {
                    break;
                };
                debug!("evicting {}/{:.16}", db, name);
                fs::remove_file(path)?;
                if let Some(hits) = table.get_mut(db) {
                    hits.remove(name);
                }
                stats.live_size -= size;
                stats.evicted += 1;
            }
            table.retain(|_, hits| !hits.is_empty());
        }

        lock.write(&table)?;

        if !silent {
            info!(
                "cache gc: {} orphan(s), {} forgotten, {} evicted, {} live bytes",
                stats.orphans_deleted, stats.forgotten_removed, stats.evicted, stats.live_size
            );
        }
        Ok(stats)
    }
}

/// Exclusive hold on `hit.json`; the lock releases when this drops
struct HitTableLock {
    file: File,
}

impl HitTableLock {
    /// Read the table; a missing or corrupt table reads as empty, and the
    /// next write repairs the file
    fn read(&mut self) -> HitTable {
        let mut text = String::new();
        if self.file.seek(SeekFrom::Start(0)).is_err()
            || self.file.read_to_string(&mut text).is_err()
        {
            return HitTable::default();
        }
        if text.trim().is_empty() {
            return HitTable::default();
        }
        serde_json::from_str(&text).unwrap_or_else(|e| {
            warn!("hit table unreadable ({}), starting over", e);
            HitTable::default()
        })
    }

    /// Truncate and rewrite the whole table
    fn write(&mut self, table: &HitTable) -> Result<()> {
        let text = serde_json::to_string_pretty(table)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.set_len(0)?;
        self.file.write_all(text.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

impl Drop for HitTableLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Hit timestamps are UTC microseconds
fn now_ticks() -> i64 {
    Utc::now().timestamp_micros()
}
