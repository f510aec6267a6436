//! Persistent table cache
//!
//! Holds tables fetched from the cloud on cold reads. Bounded by total
//! bytes with least-recently-used eviction; a capacity of 0 means unbounded.
//! Evicting a file that a reader still has open is safe: the reader keeps
//! its handle and the next open fetches the table again.

use std::fs;
use std::path::{Path, PathBuf};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

/// Cached files by name with their sizes, least recently used first out
struct CacheState {
    files: LruCache<String, u64>,
    used: u64,
}

impl CacheState {
    fn new() -> Self {
        Self {
            files: LruCache::unbounded(),
            used: 0,
        }
    }

    fn insert(&mut self, name: String, size: u64) {
        if let Some(old) = self.files.put(name, size) {
            self.used -= old;
        }
        self.used += size;
    }

    fn remove(&mut self, name: &str) -> bool {
        match self.files.pop(name) {
            Some(size) => {
                self.used -= size;
                true
            }
            None => false,
        }
    }
}

/// Size-bounded LRU directory of table files
pub struct PersistentCache {
    dir: PathBuf,
    capacity: u64,
    state: Mutex<CacheState>,
}

impl PersistentCache {
    /// Open (or create) a cache directory, adopting files already in it
    pub fn open(dir: &Path, capacity: u64) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut state = CacheState::new();
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            // Leftover partial download
            if name.ends_with(".download") {
                let _ = fs::remove_file(&path);
                continue;
            }
            names.push((name, entry.metadata()?.len()));
        }
        names.sort();
        for (name, size) in names {
            state.insert(name, size);
        }

        let cache = Self {
            dir: dir.to_path_buf(),
            capacity,
            state: Mutex::new(state),
        };
        cache.evict("");
        debug!(dir = %dir.display(), used = cache.used_bytes(), capacity, "Opened persistent cache");
        Ok(cache)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Path of a cached file, marking it recently used
    pub fn lookup(&self, name: &str) -> Option<PathBuf> {
        let mut state = self.state.lock();
        state.files.get(name)?;
        let path = self.path_of(name);
        if path.is_file() {
            Some(path)
        } else {
            // Removed behind our back
            state.remove(name);
            None
        }
    }

    /// Fill `name` via `fetch` (which writes the file at the given path),
    /// then account for it and evict down to capacity
    pub fn insert_with<F>(&self, name: &str, fetch: F) -> Result<PathBuf>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let path = self.path_of(name);
        fetch(&path)?;
        let size = fs::metadata(&path)?.len();

        self.state.lock().insert(name.to_string(), size);
        self.evict(name);
        Ok(path)
    }

    /// Drop `name` from the cache
    pub fn remove(&self, name: &str) {
        if self.state.lock().remove(name) {
            let _ = fs::remove_file(self.path_of(name));
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.lock().files.contains(name)
    }

    /// Bytes currently held
    pub fn used_bytes(&self) -> u64 {
        self.state.lock().used
    }

    pub fn len(&self) -> usize {
        self.state.lock().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(&self, keep: &str) {
        if self.capacity == 0 {
            return;
        }
        let mut state = self.state.lock();
        let mut kept = None;
        while state.used > self.capacity {
            let Some((victim, size)) = state.files.pop_lru() else {
                break;
            };
            if victim == keep {
                kept = Some((victim, size));
                continue;
            }
            state.used -= size;
            match fs::remove_file(self.path_of(&victim)) {
                Ok(()) => debug!(file = %victim, "Evicted cached table"),
                Err(e) => warn!(file = %victim, error = %e, "Failed to evict cached table"),
            }
        }
        if let Some((name, size)) = kept {
            state.files.put(name, size);
        }
    }
}
