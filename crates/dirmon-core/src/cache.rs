//! In-memory cache of the directory collection.
//!
//! The cache holds exactly one logical collection. Every change replaces the
//! whole collection under a single lock, so readers only ever observe a
//! complete collection. Each change bumps a version counter that callers use
//! to detect intervening writes across an `.await`.

use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::model::Directory;

/// Collection loaded from the server is considered stale after this long.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);

/// Immutable view of the collection at one point in time.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    records: Arc<Vec<Directory>>,
    version: u64,
}

impl CacheSnapshot {
    /// Cache version this snapshot was taken at.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn records(&self) -> &[Directory] {
        &self.records
    }

    pub fn find(&self, id: i64) -> Option<&Directory> {
        self.records.iter().find(|record| record.id == id)
    }

    pub fn to_vec(&self) -> Vec<Directory> {
        self.records.as_ref().clone()
    }
}

impl Deref for CacheSnapshot {
    type Target = [Directory];

    fn deref(&self) -> &[Directory] {
        &self.records
    }
}

impl PartialEq for CacheSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.records == other.records
    }
}

struct CacheState {
    records: Arc<Vec<Directory>>,
    version: u64,
    loaded_at: Option<Instant>,
    invalidated: bool,
}

impl CacheState {
    fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            records: Arc::clone(&self.records),
            version: self.version,
        }
    }

    fn replace(&mut self, records: Vec<Directory>) -> u64 {
        self.records = Arc::new(records);
        self.version += 1;
        self.version
    }
}

/// Process-wide cache of the directory collection.
pub struct ResourceCache {
    state: Mutex<CacheState>,
    max_age: Duration,
}

impl Default for ResourceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::with_max_age(DEFAULT_STALE_AFTER)
    }

    /// Creates an empty cache whose server loads go stale after `max_age`.
    pub fn with_max_age(max_age: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState {
                records: Arc::new(Vec::new()),
                version: 0,
                loaded_at: None,
                invalidated: false,
            }),
            max_age,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the current collection (possibly stale).
    pub fn read(&self) -> CacheSnapshot {
        self.lock().snapshot()
    }

    /// Atomically replaces the collection. Returns the new version.
    ///
    /// Local writes do not change freshness: an optimistic edit is not
    /// server truth.
    pub fn write(&self, records: Vec<Directory>) -> u64 {
        self.lock().replace(records)
    }

    /// Marks the collection stale so the next read path refetches it.
    pub fn invalidate(&self) {
        self.lock().invalidated = true;
    }

    /// `true` if the collection was never loaded, was invalidated, or is
    /// older than the freshness window.
    pub fn is_stale(&self) -> bool {
        let state = self.lock();
        match state.loaded_at {
            None => true,
            Some(_) if state.invalidated => true,
            Some(at) => at.elapsed() >= self.max_age,
        }
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// `true` once a server load has been installed.
    pub fn is_loaded(&self) -> bool {
        self.lock().loaded_at.is_some()
    }

    /// Installs a collection fetched from the server.
    ///
    /// `fetched_at_version` is the cache version observed when the fetch
    /// started. If anything wrote the cache since, the fetched data predates
    /// that write and is discarded (the cache stays stale). Returns whether
    /// the data was installed.
    pub fn load(&self, records: Vec<Directory>, fetched_at_version: u64) -> bool {
        let mut state = self.lock();
        if state.version != fetched_at_version {
            debug!(
                fetched_at_version,
                current_version = state.version,
                "discarding refetch superseded by local write"
            );
            return false;
        }
        state.replace(records);
        state.loaded_at = Some(Instant::now());
        state.invalidated = false;
        true
    }

    /// Read-modify-write under one lock.
    ///
    /// `edit` computes the new collection from the current one. On success
    /// the pre-edit snapshot and the version written are returned; on error
    /// the cache is untouched.
    pub fn apply<E, F>(&self, edit: F) -> Result<(CacheSnapshot, u64), E>
    where
        F: FnOnce(&[Directory]) -> Result<Vec<Directory>, E>,
    {
        let mut state = self.lock();
        let before = state.snapshot();
        let next = edit(&before)?;
        let version = state.replace(next);
        Ok((before, version))
    }

    /// Undoes a write made by `apply`.
    ///
    /// If the cache is still at `written_version`, `snapshot` is restored
    /// verbatim. Otherwise other writes happened in between and only
    /// `partial` is applied to the current collection, so those writes
    /// survive. The merged result is no longer server truth, so the cache
    /// is marked stale.
    pub fn rollback<F>(&self, snapshot: &CacheSnapshot, written_version: u64, partial: F)
    where
        F: FnOnce(&[Directory], &CacheSnapshot) -> Vec<Directory>,
    {
        let mut state = self.lock();
        if state.version == written_version {
            state.records = Arc::clone(&snapshot.records);
            state.version += 1;
        } else {
            let current = Arc::clone(&state.records);
            let next = partial(&current, snapshot);
            state.replace(next);
            state.invalidated = true;
        }
    }
}
