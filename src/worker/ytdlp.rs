use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use super::{DownloadProcess, FormatSelector, MediaWorker};
use crate::error::{MediaError, MediaResult};

const OUTPUT_STDOUT: &str = "-";

/// Flags shared by every invocation.
const BASE_ARGS: [&str; 3] = ["--no-playlist", "--no-warnings", "--no-cookies"];

/// How many trailing stderr lines end up in an error message.
const STDERR_TAIL_LINES: usize = 5;

/// [`MediaWorker`] backed by the `yt-dlp` binary.
#[derive(Debug, Clone)]
pub struct YtDlpWorker {
    binary: String,
    metadata_timeout: Option<Duration>,
}

impl YtDlpWorker {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            metadata_timeout: None,
        }
    }

    pub fn with_metadata_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.metadata_timeout = timeout;
        self
    }

    /// Runs `yt-dlp --version`; used by the `--health-check` flag.
    pub async fn version(&self) -> MediaResult<String> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .output()
            .await
            .map_err(|e| MediaError::ExternalTool(format!("{} not available: {e}", self.binary)))?;

        if !output.status.success() {
            return Err(MediaError::ExternalTool(format!(
                "{} --version failed with {}",
                self.binary, output.status
            )));
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("✅ yt-dlp version: {}", version);
        Ok(version)
    }

    fn command(&self, args: Vec<String>) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }
}

/// Arguments for a metadata-only run that prints one JSON object.
pub fn metadata_args(url: &str) -> Vec<String> {
    let mut args: Vec<String> = [
        "-j",
        "--skip-download",
        "--extractor-args",
        "youtube:player_client=web",
    ]
    .iter()
    .chain(BASE_ARGS.iter())
    .map(|s| s.to_string())
    .collect();

    args.extend(["--".to_string(), url.to_string()]);
    args
}

/// Arguments for streaming `selector` to stdout.
pub fn download_args(url: &str, selector: &FormatSelector) -> Vec<String> {
    let mut args = vec!["-f".to_string(), selector.to_string()];

    match selector {
        FormatSelector::Single(_) => {
            args.extend(
                ["--progress-template", "", "--throttled-rate", "100K"]
                    .iter()
                    .map(|s| s.to_string()),
            );
        }
        FormatSelector::Merged { .. } => {
            args.extend(
                [
                    "--concurrent-fragments",
                    "4",
                    "--audio-multistreams",
                    "--video-multistreams",
                ]
                .iter()
                .map(|s| s.to_string()),
            );
        }
    }

    args.extend(BASE_ARGS.iter().map(|s| s.to_string()));
    args.extend(
        ["-o", OUTPUT_STDOUT, "--", url]
            .iter()
            .map(|s| s.to_string()),
    );
    args
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

#[async_trait]
impl MediaWorker for YtDlpWorker {
    async fn fetch_metadata(&self, url: &str) -> MediaResult<Vec<u8>> {
        let mut cmd = self.command(metadata_args(url));
        debug!("🚀 Running {} for metadata of {}", self.binary, url);

        let run = cmd.output();
        let output = match self.metadata_timeout {
            // kill_on_drop reaps the process when the deadline drops the future
            Some(limit) => tokio::time::timeout(limit, run).await.map_err(|_| {
                MediaError::ExternalTool(format!(
                    "{} timed out after {}",
                    self.binary,
                    humantime::format_duration(limit)
                ))
            })?,
            None => run.await,
        }
        .map_err(|e| MediaError::ExternalTool(format!("failed to run {}: {e}", self.binary)))?;

        if !output.status.success() {
            return Err(MediaError::ExternalTool(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                stderr_tail(&output.stderr)
            )));
        }

        Ok(output.stdout)
    }

    fn start_download(&self, url: &str, selector: &FormatSelector) -> MediaResult<DownloadProcess> {
        let mut cmd = self.command(download_args(url, selector));
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| MediaError::ExternalTool(format!("Failed to start download: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::ExternalTool("Failed to create stdout pipe".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MediaError::ExternalTool("Failed to create stderr pipe".to_string()))?;

        info!(pid = ?child.id(), format = %selector, "⬇️ Download worker started for {}", url);

        Ok(DownloadProcess {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            handle: Box::new(child),
        })
    }
}
