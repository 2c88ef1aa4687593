use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::streamer::{DEFAULT_BUFFER_CHUNKS, DEFAULT_CHUNK_SIZE};

/// Upper bound for `STREAM_CHUNK_SIZE`.
const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Server
    pub bind_addr: SocketAddr,

    // Cache
    pub cache_path: PathBuf,
    pub cache_save_on_insert: bool,
    pub cache_on_corrupt: CacheLoadPolicy,

    // yt-dlp
    pub ytdlp_path: String,
    pub metadata_timeout: Option<Duration>,
    pub sort_formats: bool,

    // Streaming
    pub stream_chunk_size: usize,
    pub stream_buffer_chunks: usize,
}

/// What to do when the cache file exists but cannot be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLoadPolicy {
    /// Abort startup.
    Fail,
    /// Move the file aside and start with an empty cache.
    Empty,
}

impl FromStr for CacheLoadPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "empty" => Ok(Self::Empty),
            other => anyhow::bail!("expected \"fail\" or \"empty\", got {:?}", other),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Builds the configuration from a variable lookup, applying defaults
    /// for anything unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Ok(Self {
            // Server
            bind_addr: parse(&var, "BIND_ADDR", "0.0.0.0:8080")?,

            // Cache
            cache_path: var("CACHE_PATH", "./.cache").into(),
            cache_save_on_insert: parse(&var, "CACHE_SAVE_ON_INSERT", "true")?,
            cache_on_corrupt: parse(&var, "CACHE_ON_CORRUPT", "fail")?,

            // yt-dlp
            ytdlp_path: var("YTDLP_PATH", "yt-dlp"),
            metadata_timeout: parse_timeout(&var("METADATA_TIMEOUT", "60s"))
                .context("invalid METADATA_TIMEOUT")?,
            sort_formats: parse(&var, "SORT_FORMATS", "true")?,

            // Streaming
            stream_chunk_size: parse(&var, "STREAM_CHUNK_SIZE", &DEFAULT_CHUNK_SIZE.to_string())?,
            stream_buffer_chunks: parse(
                &var,
                "STREAM_BUFFER_CHUNKS",
                &DEFAULT_BUFFER_CHUNKS.to_string(),
            )?,
        })
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - `YTDLP_PATH` must not be empty
    /// - `CACHE_PATH` must not be empty or name a directory
    /// - `STREAM_CHUNK_SIZE` must be between 1 byte and 16 MiB
    /// - `STREAM_BUFFER_CHUNKS` must be greater than 0
    pub fn validate(&self) -> Result<()> {
        if self.ytdlp_path.trim().is_empty() {
            anyhow::bail!("YTDLP_PATH must not be empty");
        }

        if self.cache_path.as_os_str().is_empty() {
            anyhow::bail!("CACHE_PATH must not be empty");
        }
        if self.cache_path.is_dir() {
            anyhow::bail!("CACHE_PATH {} is a directory", self.cache_path.display());
        }

        if self.stream_chunk_size == 0 || self.stream_chunk_size > MAX_CHUNK_SIZE {
            anyhow::bail!(
                "STREAM_CHUNK_SIZE must be between 1 and {}, got: {}",
                MAX_CHUNK_SIZE,
                self.stream_chunk_size
            );
        }

        if self.stream_buffer_chunks == 0 {
            anyhow::bail!("STREAM_BUFFER_CHUNKS must be greater than 0");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Server: {}\n  \
            Cache: {} (save on insert: {}, on corrupt: {:?})\n  \
            yt-dlp: {} (metadata timeout: {}, sort formats: {})\n  \
            Streaming: {} byte chunks, {} buffered",
            self.bind_addr,
            self.cache_path.display(),
            self.cache_save_on_insert,
            self.cache_on_corrupt,
            self.ytdlp_path,
            self.metadata_timeout
                .map_or("none".to_string(), |t| humantime::format_duration(t).to_string()),
            self.sort_formats,
            self.stream_chunk_size,
            self.stream_buffer_chunks,
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            cache_path: "./.cache".into(),
            cache_save_on_insert: true,
            cache_on_corrupt: CacheLoadPolicy::Fail,
            ytdlp_path: "yt-dlp".to_string(),
            metadata_timeout: Some(Duration::from_secs(60)),
            sort_formats: true,
            stream_chunk_size: DEFAULT_CHUNK_SIZE,
            stream_buffer_chunks: DEFAULT_BUFFER_CHUNKS,
        }
    }
}

fn parse<T, V>(var: &V, key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str, &str) -> String,
{
    let raw = var(key, default);
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid {}={:?}: {}", key, raw, e))
}

/// `off`, `none` and `0` disable the deadline.
fn parse_timeout(raw: &str) -> Result<Option<Duration>> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "off" | "none" | "0" => Ok(None),
        value => Ok(Some(humantime::parse_duration(value)?)),
    }
}
