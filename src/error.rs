use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the cache, the resolver and the download streamer.
#[derive(Debug, Error)]
pub enum MediaError {
    /// The configured cache path cannot be used.
    #[error("invalid cache path {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },

    /// The cache file exists but is not a valid JSON mapping.
    #[error("failed to decode cache file {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cache I/O error on {}: {source}", path.display())]
    CacheIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// yt-dlp could not be started, timed out, or exited non-zero.
    #[error("external tool failed: {0}")]
    ExternalTool(String),

    #[error("failed to parse media info: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("missing required field: id")]
    Validation,

    /// Bad request parameters, or a download asked for before its info.
    #[error("{0}")]
    Client(String),

    #[error("client disconnected after {bytes} bytes queued")]
    StreamInterrupted { bytes: u64 },
}

impl MediaError {
    pub fn client(message: impl Into<String>) -> Self {
        Self::Client(message.into())
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Client(_))
    }
}

pub type MediaResult<T> = Result<T, MediaError>;
