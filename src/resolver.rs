use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::cache::MetadataCache;
use crate::error::{MediaError, MediaResult};
use crate::models::MediaRecord;
use crate::worker::MediaWorker;

/// Turns a URL into a [`MediaRecord`], consulting the cache first.
pub struct MetadataResolver {
    cache: Arc<MetadataCache>,
    worker: Arc<dyn MediaWorker>,
    sort_formats: bool,
    save_on_insert: bool,
    // One lock per URL currently being resolved
    in_flight: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl MetadataResolver {
    pub fn new(cache: Arc<MetadataCache>, worker: Arc<dyn MediaWorker>) -> Self {
        Self {
            cache,
            worker,
            sort_formats: true,
            save_on_insert: false,
            in_flight: DashMap::new(),
        }
    }

    pub fn with_sort_formats(mut self, sort_formats: bool) -> Self {
        self.sort_formats = sort_formats;
        self
    }

    pub fn with_save_on_insert(mut self, save_on_insert: bool) -> Self {
        self.save_on_insert = save_on_insert;
        self
    }

    /// Returns the cached record for `url`, or runs the worker and caches
    /// the result. Failures leave the cache untouched.
    ///
    /// Concurrent misses for the same URL share one worker run: later
    /// callers wait on the per-URL lock and then find the record cached.
    pub async fn resolve(&self, url: &str) -> MediaResult<MediaRecord> {
        if url.is_empty() {
            return Err(MediaError::client("URL parameter is required"));
        }

        if let Some(record) = self.cache.get(url) {
            debug!(url, "cache hit");
            return Ok(record);
        }

        // Declared before the gate so it drops after it, also on cancellation
        let _cleanup = GateCleanup {
            in_flight: &self.in_flight,
            url,
        };
        let gate = self
            .in_flight
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        self.resolve_miss(url).await
    }

    async fn resolve_miss(&self, url: &str) -> MediaResult<MediaRecord> {
        if let Some(record) = self.cache.get(url) {
            debug!(url, "cache hit after waiting on in-flight resolution");
            return Ok(record);
        }

        info!(url, "cache miss, asking worker");
        let output = self.worker.fetch_metadata(url).await?;
        let record = parse_media_record(&output, self.sort_formats)?;

        info!(
            url,
            id = %record.id,
            formats = record.formats.len(),
            "✅ Resolved \"{}\"",
            record.title
        );
        self.cache.put(url, record.clone());

        if self.save_on_insert {
            self.persist().await;
        }

        Ok(record)
    }

    async fn persist(&self) {
        let cache = self.cache.clone();
        match tokio::task::spawn_blocking(move || cache.save()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to save cache: {}", e),
            Err(e) => warn!("Cache save task failed: {}", e),
        }
    }
}

/// Removes a URL's gate from the in-flight map once the last holder is gone.
struct GateCleanup<'a> {
    in_flight: &'a DashMap<String, Arc<AsyncMutex<()>>>,
    url: &'a str,
}

impl Drop for GateCleanup<'_> {
    fn drop(&mut self) {
        // A waiter still holding a clone keeps the gate alive
        self.in_flight
            .remove_if(self.url, |_, gate| Arc::strong_count(gate) == 1);
    }
}

/// Decodes worker output into a validated record.
///
/// Formats without a positive size are dropped. With `sort_formats` the rest
/// are ordered largest first; equal sizes keep their original order.
pub fn parse_media_record(output: &[u8], sort_formats: bool) -> MediaResult<MediaRecord> {
    let mut record: MediaRecord = serde_json::from_slice(output).map_err(MediaError::Parse)?;

    if record.id.is_empty() {
        return Err(MediaError::Validation);
    }

    record.formats.retain(|format| format.filesize > 0);
    if sort_formats {
        // sort_by is stable
        record.formats.sort_by(|a, b| b.filesize.cmp(&a.filesize));
    }

    Ok(record)
}
