//! # Cache Module
//!
//! Persistent metadata cache for resolved media URLs.
//!
//! The cache maps the exact URL string a client asked about to the
//! [`MediaRecord`] yt-dlp produced for it. It is the only shared mutable state
//! in the service: every request handler reads it, and the resolver writes to
//! it after each successful cache miss.
//!
//! ## Lifecycle
//!
//! - **Startup**: [`MetadataCache::load`] reads the JSON file at the configured
//!   path. A missing file starts an empty cache; an unreadable one is a
//!   [`MediaError::Decode`] that `main` handles per `CACHE_ON_CORRUPT`.
//! - **Runtime**: [`MetadataCache::get`] and [`MetadataCache::put`] under one
//!   mutex. Entries never expire.
//! - **Persistence**: [`MetadataCache::save`] after every insertion (when
//!   `CACHE_SAVE_ON_INSERT` is on) and once more at shutdown.
//!
//! ## File format
//!
//! ```json
//! {
//!   "https://www.youtube.com/watch?v=abc": {
//!     "id": "abc",
//!     "title": "Example",
//!     "formats": [ { "format_id": "18", "filesize": 1024, ... } ]
//!   }
//! }
//! ```
//!
//! Keys are written in sorted order so the file stays diffable when edited
//! by hand.
//!
//! ## Ownership
//!
//! One process owns one cache file. There is no file locking; two servers
//! pointed at the same path will overwrite each other's saves.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::MediaResult;
use crate::models::MediaRecord;
use crate::storage::JsonStorage;

/// URL → [`MediaRecord`] map guarded by a single mutex, backed by a JSON file.
///
/// The map lock is held only for map operations. Cloning the snapshot for a
/// save happens under it; the file write does not.
#[derive(Debug)]
pub struct MetadataCache {
    entries: Mutex<HashMap<String, MediaRecord>>,
    storage: JsonStorage,
    // Orders saves so an older snapshot never lands after a newer one
    save_lock: Mutex<()>,
}

impl MetadataCache {
    /// Empty cache that will persist to `path`.
    pub fn new(path: impl Into<PathBuf>) -> MediaResult<Self> {
        Ok(Self::with_storage(JsonStorage::new(path)?, HashMap::new()))
    }

    /// Loads the cache from `path`; a missing file yields an empty cache.
    pub fn load(path: impl Into<PathBuf>) -> MediaResult<Self> {
        Self::load_from(JsonStorage::new(path)?)
    }

    pub fn load_from(storage: JsonStorage) -> MediaResult<Self> {
        let entries: HashMap<String, MediaRecord> = storage.read()?.unwrap_or_default();
        info!(
            "📂 Cache loaded from {} ({} entries)",
            storage.path().display(),
            entries.len()
        );
        Ok(Self::with_storage(storage, entries))
    }

    fn with_storage(storage: JsonStorage, entries: HashMap<String, MediaRecord>) -> Self {
        Self {
            entries: Mutex::new(entries),
            storage,
            save_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        self.storage.path()
    }

    pub fn get(&self, url: &str) -> Option<MediaRecord> {
        self.entries.lock().get(url).cloned()
    }

    /// Inserts or replaces the record for `url`. Last write wins; format
    /// lists are never merged.
    pub fn put(&self, url: impl Into<String>, record: MediaRecord) -> Option<MediaRecord> {
        let url = url.into();
        debug!(url = %url, id = %record.id, "cache insert");
        self.entries.lock().insert(url, record)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Writes the whole mapping to the backing file.
    ///
    /// Blocking file I/O; call through `spawn_blocking` from async code.
    pub fn save(&self) -> MediaResult<()> {
        let _saving = self.save_lock.lock();
        let snapshot = self.snapshot();
        self.storage.write(&snapshot)?;
        debug!("💾 Cache saved ({} entries)", snapshot.len());
        Ok(())
    }

    fn snapshot(&self) -> BTreeMap<String, MediaRecord> {
        self.entries
            .lock()
            .iter()
            .map(|(url, record)| (url.clone(), record.clone()))
            .collect()
    }
}
