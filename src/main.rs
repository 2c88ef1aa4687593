use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

mod cache;
mod config;
mod error;
mod models;
mod resolver;
mod server;
mod storage;
mod streamer;
mod worker;

use crate::cache::MetadataCache;
use crate::config::{CacheLoadPolicy, Config};
use crate::error::MediaError;
use crate::resolver::MetadataResolver;
use crate::server::AppState;
use crate::storage::JsonStorage;
use crate::streamer::DownloadStreamer;
use crate::worker::{MediaWorker, YtDlpWorker};

#[tokio::main]
async fn main() -> Result<()> {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("media_dl=debug".parse()?)
                .add_directive("tower_http=info".parse()?)
                .add_directive("axum=info".parse()?),
        )
        .init();

    info!("🎬 Starting media-dl v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;

    let ytdlp = YtDlpWorker::new(config.ytdlp_path.clone())
        .with_metadata_timeout(config.metadata_timeout);

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&ytdlp).await;
    }

    info!("{}", config.summary());

    let cache = Arc::new(load_cache(&config)?);
    if cache.is_empty() {
        info!("💾 Starting with an empty cache at {}", cache.path().display());
    } else {
        info!("💾 Loaded {} cached records from {}", cache.len(), cache.path().display());
    }

    let worker: Arc<dyn MediaWorker> = Arc::new(ytdlp);
    let resolver = MetadataResolver::new(cache.clone(), worker.clone())
        .with_sort_formats(config.sort_formats)
        .with_save_on_insert(config.cache_save_on_insert);
    let streamer = DownloadStreamer::new(cache.clone(), worker)
        .with_chunk_size(config.stream_chunk_size)
        .with_buffer_chunks(config.stream_buffer_chunks);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!("🚀 Listening on http://{}", config.bind_addr);

    let served = server::serve(listener, AppState::new(resolver, streamer), shutdown_signal()).await;

    // Final save runs even if the server failed
    info!("💾 Saving metadata cache...");
    let saved = tokio::task::spawn_blocking(move || cache.save())
        .await
        .context("cache save task panicked")?;
    if let Err(e) = &saved {
        error!("❌ Failed to save cache on shutdown: {}", e);
    }

    served?;
    saved?;
    info!("👋 Shutdown complete");
    Ok(())
}

/// Loads the cache file, honouring `CACHE_ON_CORRUPT` for undecodable files.
fn load_cache(config: &Config) -> Result<MetadataCache> {
    match MetadataCache::load(&config.cache_path) {
        Ok(cache) => Ok(cache),
        Err(e @ MediaError::Decode { .. }) if config.cache_on_corrupt == CacheLoadPolicy::Empty => {
            warn!("⚠️ {}; starting with an empty cache", e);
            let moved = JsonStorage::new(&config.cache_path)?.quarantine()?;
            warn!("Corrupt cache file moved to {}", moved.display());
            Ok(MetadataCache::new(&config.cache_path)?)
        }
        Err(e) => Err(e).context("failed to load metadata cache"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("⚠️ Shutdown signal received, finishing open requests...");
}

async fn health_check(ytdlp: &YtDlpWorker) -> Result<()> {
    ytdlp
        .version()
        .await
        .context("yt-dlp is not usable")?;

    println!("OK");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn config_for(path: &Path, policy: CacheLoadPolicy) -> Config {
        Config {
            cache_path: path.to_path_buf(),
            cache_on_corrupt: policy,
            ..Config::default()
        }
    }

    #[test]
    fn test_corrupt_cache_fails_startup_by_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, "{\"https://a\": [").unwrap();

        let err = load_cache(&config_for(&path, CacheLoadPolicy::Fail)).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<MediaError>(),
            Some(MediaError::Decode { .. })
        ));
        // Left in place for the operator to inspect
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"https://a\": [");
    }

    #[test]
    fn test_corrupt_cache_is_moved_aside_when_starting_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, "not json at all").unwrap();

        let cache = load_cache(&config_for(&path, CacheLoadPolicy::Empty)).unwrap();

        assert!(cache.is_empty());
        assert!(!path.exists());
        let moved = dir.path().join("cache.json.corrupt");
        assert_eq!(fs::read_to_string(moved).unwrap(), "not json at all");

        // The next save recreates the file
        cache.save().unwrap();
        assert!(MetadataCache::load(&path).unwrap().is_empty());
    }

    #[test]
    fn test_missing_cache_starts_empty_under_either_policy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");

        for policy in [CacheLoadPolicy::Fail, CacheLoadPolicy::Empty] {
            assert!(load_cache(&config_for(&path, policy)).unwrap().is_empty());
        }
        assert!(!dir.path().join("cache.json.corrupt").exists());
    }
}
