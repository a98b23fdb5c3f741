//! Content-addressable request cache.
//!
//! Every network response (packuments, tarballs) goes through here. Keys are
//! hashed with BLAKE3 and stored under a two-level shard:
//!
//! ```text
//! <root>/<hex0>/<hex1>/<hash>        value bytes
//! <root>/<hex0>/<hex1>/<hash>.key    original key
//! ```
//!
//! A bounded in-memory LRU (entry count + age) sits in front of the disk.
//! Values larger than `max_entry_size` are only kept on disk. Writes are
//! fire-and-forget; [`Cache::promise`] waits until every queued write has
//! landed. Concurrent fetches of one key share a single in-flight read.

use super::error::PkgError;
use super::integrity;
use crate::config::Config;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};
use vlt_util::fs::{atomic_write, vacuum_empty_dirs};
use vlt_util::hash::blake3_bytes;

/// Suffix of the file holding an entry's original key.
pub const KEY_SUFFIX: &str = ".key";

/// Disk-level cache failures.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("integrity mismatch for {key}: expected {expected}, got {actual}")]
    Integrity {
        key: String,
        expected: String,
        actual: String,
    },
}

impl CacheError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Cache sizing.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub root: PathBuf,
    pub max_entries: usize,
    pub ttl: Duration,
    pub max_entry_size: usize,
}

impl CacheOptions {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_entries: 10_000,
            ttl: Duration::from_secs(300),
            max_entry_size: 4 * 1024 * 1024,
        }
    }

    /// Sizing from the `cache*` settings.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            root: config.cache_dir.clone(),
            max_entries: config.cache_max_entries,
            ttl: Duration::from_secs(config.cache_ttl_secs),
            max_entry_size: config.cache_max_entry_size,
        }
    }
}

/// Counters for observing cache behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_hits: usize,
    pub disk_reads: usize,
    pub fetches: usize,
}

struct MemEntry {
    bytes: Bytes,
    stored: Instant,
}

type InFlight = Shared<BoxFuture<'static, Result<Bytes, PkgError>>>;

struct Inner {
    root: PathBuf,
    ttl: Duration,
    max_entry_size: usize,
    memory: Mutex<LruCache<String, MemEntry>>,
    inflight: Mutex<HashMap<String, InFlight>>,
    pending: AtomicUsize,
    flushed: Notify,
    last_error: Mutex<Option<CacheError>>,
    memory_hits: AtomicUsize,
    disk_reads: AtomicUsize,
    fetches: AtomicUsize,
}

/// Shared cache handle. Clones refer to the same cache.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("root", &self.inner.root)
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Cache {
    #[must_use]
    pub fn new(options: CacheOptions) -> Self {
        let capacity = NonZeroUsize::new(options.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Inner {
                root: options.root,
                ttl: options.ttl,
                max_entry_size: options.max_entry_size,
                memory: Mutex::new(LruCache::new(capacity)),
                inflight: Mutex::new(HashMap::new()),
                pending: AtomicUsize::new(0),
                flushed: Notify::new(),
                last_error: Mutex::new(None),
                memory_hits: AtomicUsize::new(0),
                disk_reads: AtomicUsize::new(0),
                fetches: AtomicUsize::new(0),
            }),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.inner.memory_hits.load(Ordering::Relaxed),
            disk_reads: self.inner.disk_reads.load(Ordering::Relaxed),
            fetches: self.inner.fetches.load(Ordering::Relaxed),
        }
    }

    /// The hex digest a key is stored under.
    #[must_use]
    pub fn hash_key(key: &str) -> String {
        blake3_bytes(key.as_bytes())
    }

    /// Path of the value file for `key`.
    #[must_use]
    pub fn path_for(&self, key: &str) -> PathBuf {
        let hash = Self::hash_key(key);
        self.inner
            .root
            .join(&hash[0..2])
            .join(&hash[2..4])
            .join(&hash)
    }

    fn key_path(value_path: &Path) -> PathBuf {
        let mut name = value_path.as_os_str().to_os_string();
        name.push(KEY_SUFFIX);
        PathBuf::from(name)
    }

    /// Memory-only lookup. Expired entries are dropped and reported absent.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let mut memory = lock(&self.inner.memory);
        let expired = match memory.get(key) {
            Some(entry) if entry.stored.elapsed() < self.inner.ttl => {
                self.inner.memory_hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.bytes.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            memory.pop(key);
        }
        None
    }

    fn remember(&self, key: &str, bytes: &Bytes) {
        if bytes.len() > self.inner.max_entry_size {
            return;
        }
        lock(&self.inner.memory).put(
            key.to_string(),
            MemEntry {
                bytes: bytes.clone(),
                stored: Instant::now(),
            },
        );
    }

    /// Store `bytes` under `key`. Returns immediately; the disk write runs in
    /// the background and is awaited by [`Cache::promise`].
    ///
    /// When `integrity` is given and does not match, nothing is stored and
    /// the mismatch is reported by the next `promise`.
    pub fn set(&self, key: &str, bytes: Bytes, integrity: Option<&str>) {
        if let Some(expected) = integrity {
            if let Err(actual) = integrity::verify(expected, &bytes) {
                self.record_error(CacheError::Integrity {
                    key: key.to_string(),
                    expected: expected.to_string(),
                    actual,
                });
                return;
            }
        }

        self.remember(key, &bytes);

        let path = self.path_for(key);
        let key = key.to_string();
        self.inner.pending.fetch_add(1, Ordering::SeqCst);

        let this = self.clone();
        let write = move || {
            if let Err(e) = write_entry(&path, &key, &bytes) {
                warn!(key = %key, error = %e, "cache write failed");
                this.record_error(e);
            }
            if this.inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                this.inner.flushed.notify_waiters();
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }

    fn record_error(&self, e: CacheError) {
        *lock(&self.inner.last_error) = Some(e);
    }

    /// Wait for every queued write, including ones queued while waiting.
    ///
    /// # Errors
    /// Returns the most recent write failure since the last call.
    pub async fn promise(&self) -> Result<(), CacheError> {
        loop {
            let flushed = self.inner.flushed.notified();
            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                break;
            }
            flushed.await;
        }
        match lock(&self.inner.last_error).take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Read through memory, then disk, then `fetcher`. Concurrent calls for
    /// the same key share one underlying read.
    ///
    /// A fetched value that fails `integrity` is returned as an error and
    /// never cached.
    ///
    /// # Errors
    /// Returns the fetcher's error, an integrity mismatch, or a disk error.
    pub async fn fetch<F, Fut>(
        &self,
        key: &str,
        integrity: Option<&str>,
        fetcher: F,
    ) -> Result<Bytes, PkgError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Bytes, PkgError>> + Send + 'static,
    {
        if let Some(bytes) = self.get(key) {
            return Ok(bytes);
        }

        let shared = {
            let mut inflight = lock(&self.inner.inflight);
            if let Some(existing) = inflight.get(key) {
                debug!(key = %key, "joining in-flight fetch");
                existing.clone()
            } else {
                let this = self.clone();
                let owned_key = key.to_string();
                let integrity = integrity.map(str::to_string);
                let fut = async move {
                    let result = this
                        .read_through(&owned_key, integrity.as_deref(), fetcher)
                        .await;
                    lock(&this.inner.inflight).remove(&owned_key);
                    result
                }
                .boxed()
                .shared();
                inflight.insert(key.to_string(), fut.clone());
                fut
            }
        };

        shared.await
    }

    async fn read_through<F, Fut>(
        &self,
        key: &str,
        integrity: Option<&str>,
        fetcher: F,
    ) -> Result<Bytes, PkgError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, PkgError>>,
    {
        let path = self.path_for(key);
        let read_path = path.clone();
        let on_disk = tokio::task::spawn_blocking(move || read_optional(&read_path))
            .await
            .map_err(|e| PkgError::Cache(format!("cache read task failed: {e}")))?
            .map_err(PkgError::from)?;

        if let Some(bytes) = on_disk {
            self.inner.disk_reads.fetch_add(1, Ordering::Relaxed);
            let valid = integrity.map_or(true, |expected| integrity::verify(expected, &bytes).is_ok());
            if valid {
                debug!(key = %key, "cache disk hit");
                self.remember(key, &bytes);
                return Ok(bytes);
            }
            warn!(key = %key, "cached entry failed integrity check, refetching");
        }

        self.inner.fetches.fetch_add(1, Ordering::Relaxed);
        let bytes = fetcher().await?;
        if let Some(expected) = integrity {
            integrity::verify(expected, &bytes).map_err(|actual| PkgError::IntegrityMismatch {
                target: key.to_string(),
                expected: expected.to_string(),
                actual,
            })?;
        }
        self.set(key, bytes.clone(), None);
        Ok(bytes)
    }

    /// Blocking read through memory, then disk, then `fetcher`. The value is
    /// written before returning.
    ///
    /// # Errors
    /// Returns the fetcher's error, an integrity mismatch, or a disk error.
    pub fn fetch_sync<F>(&self, key: &str, integrity: Option<&str>, fetcher: F) -> Result<Bytes, PkgError>
    where
        F: FnOnce() -> Result<Bytes, PkgError>,
    {
        if let Some(bytes) = self.get(key) {
            return Ok(bytes);
        }

        let path = self.path_for(key);
        if let Some(bytes) = read_optional(&path)? {
            self.inner.disk_reads.fetch_add(1, Ordering::Relaxed);
            if integrity.map_or(true, |expected| integrity::verify(expected, &bytes).is_ok()) {
                self.remember(key, &bytes);
                return Ok(bytes);
            }
        }

        self.inner.fetches.fetch_add(1, Ordering::Relaxed);
        let bytes = fetcher()?;
        if let Some(expected) = integrity {
            integrity::verify(expected, &bytes).map_err(|actual| PkgError::IntegrityMismatch {
                target: key.to_string(),
                expected: expected.to_string(),
                actual,
            })?;
        }
        write_entry(&path, key, &bytes)?;
        self.remember(key, &bytes);
        Ok(bytes)
    }

    /// Remove an entry. With `vacuum`, now-empty shard directories are
    /// removed too, stopping at the first level that still holds anything.
    ///
    /// # Errors
    /// Returns an error if a file or directory cannot be removed.
    pub fn delete(&self, key: &str, vacuum: bool) -> Result<(), CacheError> {
        lock(&self.inner.memory).pop(key);

        let path = self.path_for(key);
        for p in [Self::key_path(&path), path.clone()] {
            match fs::remove_file(&p) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(&p, e)),
            }
        }

        if vacuum {
            if let Some(shard) = path.parent() {
                let removed = vacuum_empty_dirs(shard, &self.inner.root)
                    .map_err(|e| CacheError::io(shard, e))?;
                debug!(key = %key, removed = removed.len(), "vacuumed cache shard");
            }
        }
        Ok(())
    }

    /// Every key currently on disk, sorted.
    ///
    /// Entries that vanish while listing are skipped.
    ///
    /// # Errors
    /// Returns an error if the cache root exists but cannot be read.
    pub fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut keys: Vec<String> = scan_key_files(&self.inner.root)?
            .into_iter()
            .filter_map(|p| read_optional(&p).ok().flatten())
            .filter_map(|b| String::from_utf8(b.to_vec()).ok())
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Every `(key, value)` pair currently on disk, sorted by key.
    ///
    /// # Errors
    /// Returns an error if the cache root exists but cannot be read.
    pub fn entries(&self) -> Result<Vec<(String, Bytes)>, CacheError> {
        let mut entries = Vec::new();
        for key_file in scan_key_files(&self.inner.root)? {
            let value_file = key_file.with_extension("");
            let (Ok(Some(key)), Ok(Some(value))) =
                (read_optional(&key_file), read_optional(&value_file))
            else {
                continue;
            };
            if let Ok(key) = String::from_utf8(key.to_vec()) {
                entries.push((key, value));
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    /// [`Cache::keys`] on the blocking pool.
    ///
    /// # Errors
    /// See [`Cache::keys`].
    pub async fn keys_async(&self) -> Result<Vec<String>, CacheError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.keys())
            .await
            .map_err(|e| CacheError::io(self.root(), io::Error::other(e)))?
    }

    /// [`Cache::entries`] on the blocking pool.
    ///
    /// # Errors
    /// See [`Cache::entries`].
    pub async fn entries_async(&self) -> Result<Vec<(String, Bytes)>, CacheError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.entries())
            .await
            .map_err(|e| CacheError::io(self.root(), io::Error::other(e)))?
    }
}

fn write_entry(path: &Path, key: &str, bytes: &[u8]) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
    }
    atomic_write(path, bytes).map_err(|e| CacheError::io(path, e))?;
    let key_path = Cache::key_path(path);
    atomic_write(&key_path, key.as_bytes()).map_err(|e| CacheError::io(&key_path, e))
}

fn read_optional(path: &Path) -> Result<Option<Bytes>, CacheError> {
    match fs::read(path) {
        Ok(b) => Ok(Some(Bytes::from(b))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CacheError::io(path, e)),
    }
}

/// All `.key` files under the two shard levels. Directories that disappear
/// mid-scan are treated as empty.
fn scan_key_files(root: &Path) -> Result<Vec<PathBuf>, CacheError> {
    let mut out = Vec::new();
    let level0 = match fs::read_dir(root) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(CacheError::io(root, e)),
    };
    for l0 in level0.flatten() {
        let Ok(level1) = fs::read_dir(l0.path()) else {
            continue;
        };
        for l1 in level1.flatten() {
            let Ok(files) = fs::read_dir(l1.path()) else {
                continue;
            };
            for f in files.flatten() {
                let p = f.path();
                if p.extension().is_some_and(|e| e == &KEY_SUFFIX[1..]) {
                    out.push(p);
                }
            }
        }
    }
    Ok(out)
}
