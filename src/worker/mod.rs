pub mod ytdlp;

use async_trait::async_trait;
use std::fmt;
use tokio::io::AsyncRead;

use crate::error::{MediaError, MediaResult};

pub use ytdlp::YtDlpWorker;

/// Out-of-process media resolver (yt-dlp in production, fakes in tests).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaWorker: Send + Sync {
    /// Runs the metadata command to completion and returns its JSON output.
    async fn fetch_metadata(&self, url: &str) -> MediaResult<Vec<u8>>;

    /// Spawns the download command with piped stdout and stderr.
    fn start_download(&self, url: &str, selector: &FormatSelector) -> MediaResult<DownloadProcess>;
}

/// Byte stream read from a running worker.
pub type WorkerPipe = Box<dyn AsyncRead + Send + Unpin>;

/// A started download: its two output pipes plus control of the process.
pub struct DownloadProcess {
    pub stdout: WorkerPipe,
    pub stderr: WorkerPipe,
    pub handle: Box<dyn ProcessHandle>,
}

impl fmt::Debug for DownloadProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadProcess")
            .field("pid", &self.handle.id())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ProcessHandle: Send {
    fn id(&self) -> Option<u32>;

    /// Asks the process to stop without waiting for it.
    fn kill(&mut self) -> std::io::Result<()>;

    async fn wait(&mut self) -> std::io::Result<ExitState>;
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitState {
    pub success: bool,
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

impl From<std::process::ExitStatus> for ExitState {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            success: status.success(),
            code: status.code(),
        }
    }
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("terminated by signal"),
        }
    }
}

#[async_trait]
impl ProcessHandle for tokio::process::Child {
    fn id(&self) -> Option<u32> {
        tokio::process::Child::id(self)
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.start_kill()
    }

    async fn wait(&mut self) -> std::io::Result<ExitState> {
        tokio::process::Child::wait(self).await.map(ExitState::from)
    }
}

/// Which format(s) a download should fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatSelector {
    Single(String),
    /// Separate audio and video tracks muxed by the worker on the fly.
    Merged { audio: String, video: String },
}

impl FormatSelector {
    /// Parses a `format_id` query value: `"137"` or `"140+137"`.
    pub fn parse(raw: &str) -> MediaResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(MediaError::client("format_id parameter is required"));
        }

        if !raw.contains('+') {
            return Ok(Self::Single(raw.to_string()));
        }

        match raw.split('+').collect::<Vec<_>>().as_slice() {
            [audio, video] if !audio.is_empty() && !video.is_empty() => Ok(Self::Merged {
                audio: audio.to_string(),
                video: video.to_string(),
            }),
            _ => Err(MediaError::client("Invalid media format options")),
        }
    }

    /// Format IDs in the order they are passed to the worker.
    pub fn format_ids(&self) -> Vec<&str> {
        match self {
            Self::Single(id) => vec![id.as_str()],
            Self::Merged { audio, video } => vec![audio.as_str(), video.as_str()],
        }
    }
}

impl fmt::Display for FormatSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(id) => f.write_str(id),
            Self::Merged { audio, video } => write!(f, "{audio}+{video}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_single_selector() {
        assert_eq!(
            FormatSelector::parse("137").unwrap(),
            FormatSelector::Single("137".to_string())
        );
    }

    #[test]
    fn test_parse_merged_selector() {
        let selector = FormatSelector::parse("140+137").unwrap();

        assert_eq!(
            selector,
            FormatSelector::Merged {
                audio: "140".to_string(),
                video: "137".to_string()
            }
        );
        assert_eq!(selector.format_ids(), vec!["140", "137"]);
        assert_eq!(selector.to_string(), "140+137");
    }

    #[test]
    fn test_parse_rejects_malformed_selectors() {
        for raw in ["", "  ", "+", "140+", "+137", "1+2+3"] {
            let err = FormatSelector::parse(raw).unwrap_err();
            assert!(err.is_client_error(), "{raw:?} gave {err:?}");
        }
    }
}
