use bytes::Bytes;
use futures::StreamExt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::cache::MetadataCache;
use crate::error::{MediaError, MediaResult};
use crate::models::MediaRecord;
use crate::worker::{DownloadProcess, ExitState, FormatSelector, MediaWorker, WorkerPipe};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_BUFFER_CHUNKS: usize = 8;

/// Container extension advertised in Content-Disposition.
const DOWNLOAD_EXTENSION: &str = "mp4";
const FALLBACK_FILENAME: &str = "download";

/// How long stderr may stay open after the worker exits.
const STDERR_GRACE: Duration = Duration::from_secs(2);

/// Proxies a running download worker's stdout to an HTTP body.
pub struct DownloadStreamer {
    cache: Arc<MetadataCache>,
    worker: Arc<dyn MediaWorker>,
    chunk_size: usize,
    buffer_chunks: usize,
}

/// A download in progress.
///
/// `body` yields the worker's stdout as it is produced. Dropping it (the
/// client went away) stops the copy loop and kills the worker. `report`
/// resolves once the worker has exited.
#[derive(Debug)]
pub struct DownloadStream {
    pub filename: String,
    pub body: ReceiverStream<io::Result<Bytes>>,
    pub report: JoinHandle<StreamReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// stdout reached end-of-stream.
    Completed,
    /// The receiving side was dropped mid-transfer.
    ClientGone,
    /// Reading stdout failed.
    ReadFailed,
}

/// What happened to one download, observed after the worker exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReport {
    pub url: String,
    /// Bytes handed to the response body. On disconnect this can exceed what
    /// the client received by up to the channel's buffered chunks.
    pub bytes: u64,
    pub outcome: CopyOutcome,
    /// `None` if waiting on the process itself failed.
    pub exit: Option<ExitState>,
}

impl StreamReport {
    /// Collapses the copy outcome and exit status into one result. The
    /// response is already committed by now, so this only feeds logging.
    pub fn into_result(self) -> MediaResult<u64> {
        match (self.outcome, self.exit) {
            (CopyOutcome::ClientGone, _) => Err(MediaError::StreamInterrupted { bytes: self.bytes }),
            (CopyOutcome::ReadFailed, _) => Err(MediaError::ExternalTool(format!(
                "reading worker output failed after {} bytes",
                self.bytes
            ))),
            (CopyOutcome::Completed, Some(exit)) if !exit.success => Err(MediaError::ExternalTool(
                format!("worker ended with {exit} after {} bytes", self.bytes),
            )),
            (CopyOutcome::Completed, _) => Ok(self.bytes),
        }
    }

    fn log(&self) {
        match self.clone().into_result() {
            Ok(bytes) => info!(url = %self.url, "✅ Successfully streamed {} bytes", bytes),
            Err(MediaError::StreamInterrupted { bytes }) => {
                info!(url = %self.url, "Client disconnected after {} bytes queued", bytes)
            }
            Err(e) => warn!(url = %self.url, "Download ended badly: {}", e),
        }
    }
}

impl DownloadStreamer {
    pub fn new(cache: Arc<MetadataCache>, worker: Arc<dyn MediaWorker>) -> Self {
        Self {
            cache,
            worker,
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer_chunks: DEFAULT_BUFFER_CHUNKS,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_buffer_chunks(mut self, buffer_chunks: usize) -> Self {
        self.buffer_chunks = buffer_chunks.max(1);
        self
    }

    /// Starts the worker for `url` and returns the streaming body.
    ///
    /// Errors here happen before any byte is sent and can still become a
    /// proper HTTP error. The URL must already be cached: its title names
    /// the attachment.
    pub fn start(&self, url: &str, selector: &FormatSelector) -> MediaResult<DownloadStream> {
        let record = self
            .cache
            .get(url)
            .ok_or_else(|| MediaError::client("Please fetch media information before downloading"))?;

        log_selected_formats(&record, selector);
        let filename = attachment_filename(&record.title);

        let process = self.worker.start_download(url, selector)?;
        let (tx, rx) = mpsc::channel(self.buffer_chunks);
        let report = tokio::spawn(supervise(process, tx, self.chunk_size, url.to_string()));

        Ok(DownloadStream {
            filename,
            body: ReceiverStream::new(rx),
            report,
        })
    }
}

fn log_selected_formats(record: &MediaRecord, selector: &FormatSelector) {
    for id in selector.format_ids() {
        match record.format(id) {
            Some(format) => debug!(id, kind = %format.kind(), "requested format"),
            None => debug!(id, "requested format not in the cached list"),
        }
    }
}

/// Runs one download to completion: copy loop in this task, stderr drained
/// in another, then reap the worker.
async fn supervise(
    process: DownloadProcess,
    tx: mpsc::Sender<io::Result<Bytes>>,
    chunk_size: usize,
    url: String,
) -> StreamReport {
    let DownloadProcess {
        stdout,
        stderr,
        mut handle,
    } = process;

    let mut drain = tokio::spawn(drain_stderr(stderr));

    let (bytes, outcome) = pump(stdout, &tx, chunk_size).await;
    drop(tx);

    if outcome != CopyOutcome::Completed {
        if let Err(e) = handle.kill() {
            // Already exited
            debug!("kill after {:?} failed: {}", outcome, e);
        }
    }

    let exit = match handle.wait().await {
        Ok(exit) => Some(exit),
        Err(e) => {
            warn!("Failed to wait for download worker: {}", e);
            None
        }
    };

    if tokio::time::timeout(STDERR_GRACE, &mut drain).await.is_err() {
        drain.abort();
    }

    let report = StreamReport {
        url,
        bytes,
        outcome,
        exit,
    };
    report.log();
    report
}

/// Copies stdout into the body channel until EOF, a read error, or the
/// receiver closing.
async fn pump(
    stdout: WorkerPipe,
    tx: &mpsc::Sender<io::Result<Bytes>>,
    chunk_size: usize,
) -> (u64, CopyOutcome) {
    let mut chunks = ReaderStream::with_capacity(stdout, chunk_size);
    let mut bytes = 0u64;

    loop {
        let next = tokio::select! {
            _ = tx.closed() => return (bytes, CopyOutcome::ClientGone),
            next = chunks.next() => next,
        };

        match next {
            None => return (bytes, CopyOutcome::Completed),
            Some(Ok(chunk)) => {
                let len = chunk.len() as u64;
                if tx.send(Ok(chunk)).await.is_err() {
                    return (bytes, CopyOutcome::ClientGone);
                }
                bytes += len;
            }
            Some(Err(e)) => {
                warn!("Error reading worker output: {}", e);
                // Fails the body so the client sees a broken transfer, not a clean EOF
                let _ = tx.send(Err(e)).await;
                return (bytes, CopyOutcome::ReadFailed);
            }
        }
    }
}

async fn drain_stderr(stderr: WorkerPipe) {
    let mut lines = BufReader::new(stderr).split(b'\n');
    loop {
        match lines.next_segment().await {
            Ok(Some(line)) => {
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                if !line.is_empty() {
                    debug!(target: "media_dl::worker", "{}", line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Error reading worker stderr: {}", e);
                break;
            }
        }
    }
}

/// Keeps ASCII letters, digits, `-`, `_` and spaces; everything else becomes
/// `-`. Leading and trailing spaces and hyphens are trimmed.
pub fn sanitize_filename(title: &str) -> String {
    let safe: String = title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ' ') {
                c
            } else {
                '-'
            }
        })
        .collect();

    safe.trim_matches(|c| c == ' ' || c == '-').to_string()
}

pub fn attachment_filename(title: &str) -> String {
    let stem = sanitize_filename(title);
    let stem = if stem.is_empty() {
        FALLBACK_FILENAME
    } else {
        stem.as_str()
    };
    format!("{stem}.{DOWNLOAD_EXTENSION}")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::FormatDescriptor;
    use crate::worker::{MockMediaWorker, ProcessHandle};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::{tempdir, TempDir};
    use tokio::io::{AsyncWriteExt, DuplexStream};

    const URL: &str = "https://www.youtube.com/watch?v=abc";

    /// Stands in for a child process. While `hold` keeps the pipe writers
    /// alive the "process" runs until killed.
    pub(crate) struct FakeHandle {
        exit: ExitState,
        killed: Arc<AtomicBool>,
        hold: Option<(DuplexStream, DuplexStream)>,
    }

    #[async_trait]
    impl ProcessHandle for FakeHandle {
        fn id(&self) -> Option<u32> {
            Some(4242)
        }

        fn kill(&mut self) -> io::Result<()> {
            self.killed.store(true, Ordering::SeqCst);
            self.hold.take();
            Ok(())
        }

        async fn wait(&mut self) -> io::Result<ExitState> {
            if self.killed.load(Ordering::SeqCst) {
                return Ok(ExitState {
                    success: false,
                    code: None,
                });
            }
            if self.hold.is_some() {
                std::future::pending::<()>().await;
            }
            Ok(self.exit)
        }
    }

    /// A process that writes `stdout`/`stderr` and then either exits with
    /// `exit` or, when `run_forever`, keeps its pipes open until killed.
    pub(crate) async fn fake_process(
        stdout: &[u8],
        stderr: &[u8],
        exit: ExitState,
        run_forever: bool,
        killed: Arc<AtomicBool>,
    ) -> DownloadProcess {
        let (mut out_writer, out_reader) = tokio::io::duplex(64 * 1024);
        let (mut err_writer, err_reader) = tokio::io::duplex(64 * 1024);
        out_writer.write_all(stdout).await.unwrap();
        err_writer.write_all(stderr).await.unwrap();

        let hold = run_forever.then_some((out_writer, err_writer));

        DownloadProcess {
            stdout: Box::new(out_reader),
            stderr: Box::new(err_reader),
            handle: Box::new(FakeHandle {
                exit,
                killed,
                hold,
            }),
        }
    }

    pub(crate) fn sample_record(title: &str) -> MediaRecord {
        MediaRecord {
            id: "abc".to_string(),
            title: title.to_string(),
            uploader: "someone".to_string(),
            duration: 10,
            view_count: 1,
            like_count: 1,
            formats: vec![FormatDescriptor {
                format_id: "18".to_string(),
                resolution: "640x360".to_string(),
                ext: "mp4".to_string(),
                filesize: 11,
                note: "360p".to_string(),
                acodec: "mp4a.40.2".to_string(),
                vcodec: "avc1".to_string(),
            }],
        }
    }

    fn cached(dir: &TempDir, title: &str) -> Arc<MetadataCache> {
        let cache = Arc::new(MetadataCache::new(dir.path().join("cache.json")).unwrap());
        cache.put(URL, sample_record(title));
        cache
    }

    const OK_EXIT: ExitState = ExitState {
        success: true,
        code: Some(0),
    };

    async fn collect(body: ReceiverStream<io::Result<Bytes>>) -> Vec<u8> {
        body.map(|chunk| chunk.unwrap())
            .collect::<Vec<Bytes>>()
            .await
            .concat()
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("My: Video?"), "My- Video");
        assert_eq!(sanitize_filename("  -Already_safe name-  "), "Already_safe name");
        assert_eq!(sanitize_filename("a/b\\c\"d"), "a-b-c-d");
        assert_eq!(sanitize_filename("Café"), "Caf");
        assert_eq!(attachment_filename("???"), "download.mp4");
        assert_eq!(attachment_filename("Track 01"), "Track 01.mp4");
    }

    #[tokio::test]
    async fn test_streams_stdout_to_body() {
        let dir = tempdir().unwrap();
        let killed = Arc::new(AtomicBool::new(false));
        let process = fake_process(b"hello world", b"[download] 100%\n", OK_EXIT, false, killed.clone()).await;
        let slot = std::sync::Mutex::new(Some(process));

        let mut worker = MockMediaWorker::new();
        worker
            .expect_start_download()
            .withf(|url, selector| url == URL && selector == &FormatSelector::Single("18".to_string()))
            .times(1)
            .returning(move |_, _| Ok(slot.lock().unwrap().take().unwrap()));

        let streamer = DownloadStreamer::new(cached(&dir, "My: Video?"), Arc::new(worker)).with_chunk_size(4);
        let stream = streamer
            .start(URL, &FormatSelector::Single("18".to_string()))
            .unwrap();

        assert_eq!(stream.filename, "My- Video.mp4");
        assert_eq!(collect(stream.body).await, b"hello world");

        let report = stream.report.await.unwrap();
        assert_eq!(report.outcome, CopyOutcome::Completed);
        assert_eq!(report.bytes, 11);
        assert_eq!(report.exit, Some(OK_EXIT));
        assert!(!killed.load(Ordering::SeqCst));
        assert_eq!(report.into_result().unwrap(), 11);
    }

    #[tokio::test]
    async fn test_uncached_url_spawns_nothing() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(MetadataCache::new(dir.path().join("cache.json")).unwrap());
        let mut worker = MockMediaWorker::new();
        worker.expect_start_download().never();

        let streamer = DownloadStreamer::new(cache, Arc::new(worker));
        let err = streamer
            .start(URL, &FormatSelector::Single("18".to_string()))
            .unwrap_err();

        assert!(err.is_client_error(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_start_failure_is_reported_before_streaming() {
        let dir = tempdir().unwrap();
        let mut worker = MockMediaWorker::new();
        worker
            .expect_start_download()
            .returning(|_, _| Err(MediaError::ExternalTool("Failed to start download: not found".to_string())));

        let streamer = DownloadStreamer::new(cached(&dir, "T"), Arc::new(worker));
        let err = streamer
            .start(URL, &FormatSelector::Single("18".to_string()))
            .unwrap_err();

        assert!(matches!(err, MediaError::ExternalTool(_)));
    }

    #[tokio::test]
    async fn test_nonzero_exit_after_streaming_is_only_reported() {
        let dir = tempdir().unwrap();
        let exit = ExitState {
            success: false,
            code: Some(1),
        };
        let process = fake_process(b"partial", b"ERROR: fragment 3 failed\n", exit, false, Arc::default()).await;
        let slot = std::sync::Mutex::new(Some(process));

        let mut worker = MockMediaWorker::new();
        worker
            .expect_start_download()
            .returning(move |_, _| Ok(slot.lock().unwrap().take().unwrap()));

        let streamer = DownloadStreamer::new(cached(&dir, "T"), Arc::new(worker));
        let stream = streamer.start(URL, &FormatSelector::parse("140+137").unwrap()).unwrap();

        assert_eq!(collect(stream.body).await, b"partial");
        let report = stream.report.await.unwrap();
        assert_eq!(report.exit, Some(exit));
        assert!(matches!(report.into_result(), Err(MediaError::ExternalTool(_))));
    }

    #[tokio::test]
    async fn test_client_disconnect_kills_worker() {
        let dir = tempdir().unwrap();
        let killed = Arc::new(AtomicBool::new(false));
        let process = fake_process(b"first chunk", b"", OK_EXIT, true, killed.clone()).await;
        let slot = std::sync::Mutex::new(Some(process));

        let mut worker = MockMediaWorker::new();
        worker
            .expect_start_download()
            .returning(move |_, _| Ok(slot.lock().unwrap().take().unwrap()));

        let streamer = DownloadStreamer::new(cached(&dir, "T"), Arc::new(worker));
        let mut stream = streamer
            .start(URL, &FormatSelector::Single("18".to_string()))
            .unwrap();

        let first = stream.body.next().await.unwrap().unwrap();
        assert_eq!(&first[..], b"first chunk");
        drop(stream.body);

        let report = tokio::time::timeout(Duration::from_secs(2), stream.report)
            .await
            .expect("copy loop did not stop after disconnect")
            .unwrap();

        assert!(killed.load(Ordering::SeqCst));
        assert_eq!(report.outcome, CopyOutcome::ClientGone);
        assert!(matches!(
            report.into_result(),
            Err(MediaError::StreamInterrupted { bytes: 11 })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_disconnect_kills_real_child_process() {
        use std::process::Stdio;

        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "exec yes"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let process = DownloadProcess {
            stdout: Box::new(child.stdout.take().unwrap()),
            stderr: Box::new(child.stderr.take().unwrap()),
            handle: Box::new(child),
        };

        let (tx, mut rx) = mpsc::channel(2);
        let report = tokio::spawn(supervise(process, tx, 1024, URL.to_string()));

        assert!(!rx.recv().await.unwrap().unwrap().is_empty());
        drop(rx);

        let report = tokio::time::timeout(Duration::from_secs(5), report)
            .await
            .expect("worker was not reaped after disconnect")
            .unwrap();

        assert_eq!(report.outcome, CopyOutcome::ClientGone);
        let exit = report.exit.expect("wait on the child failed");
        assert!(!exit.success);
        // Killed, so no exit code
        assert_eq!(exit.code, None);
    }

    #[test]
    fn test_interrupted_report_counts_queued_bytes() {
        let report = StreamReport {
            url: URL.to_string(),
            bytes: 4096,
            outcome: CopyOutcome::ClientGone,
            exit: None,
        };

        let err = report.into_result().unwrap_err();
        assert_eq!(err.to_string(), "client disconnected after 4096 bytes queued");
    }
}
