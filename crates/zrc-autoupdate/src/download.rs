//! Cancellable artifact downloader.
//!
//! [`DownloadEngine::fetch`] copies a local file (`file://` URL or UNC
//! path) or an HTTPS resource into a [`Sink`], reporting the size up front
//! when known. Indirection endpoints are resolved first (see
//! [`crate::resolve`]).
//!
//! Cancellation is cooperative: the token is checked while waiting for
//! the next chunk and again after every append, so no chunk is committed
//! once cancellation has been observed. Every path that opened the sink
//! closes it exactly once.
//!
//! The engine never retries; that decision belongs to the caller.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::AsyncReadExt;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::DownloadError;
use crate::resolve;
use crate::transport::{BodyStream, HttpTransport};

/// Cancellation signal shared between the caller and a download.
pub type CancelToken = CancellationToken;

/// Largest slice handed to [`Sink::append`] at once.
const MAX_APPEND_SIZE: usize = 64 * 1024;

/// Destination of a download.
///
/// Calls arrive in the order `set_size`, `open`, `append`*, `close`.
/// `close` is called exactly once if and only if `open` succeeded.
pub trait Sink: Send {
    /// Total size, if the source announced one.
    fn set_size(&mut self, size: Option<u64>) -> Result<(), DownloadError>;

    fn open(&mut self) -> Result<(), DownloadError>;

    fn append(&mut self, chunk: &[u8]) -> Result<(), DownloadError>;

    fn close(&mut self) -> Result<(), DownloadError>;
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn set_size(&mut self, size: Option<u64>) -> Result<(), DownloadError> {
        (**self).set_size(size)
    }

    fn open(&mut self) -> Result<(), DownloadError> {
        (**self).open()
    }

    fn append(&mut self, chunk: &[u8]) -> Result<(), DownloadError> {
        (**self).append(chunk)
    }

    fn close(&mut self) -> Result<(), DownloadError> {
        (**self).close()
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Writes the download to a file, creating parent directories.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
    written: u64,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}

impl Sink for FileSink {
    fn set_size(&mut self, _size: Option<u64>) -> Result<(), DownloadError> {
        Ok(())
    }

    fn open(&mut self) -> Result<(), DownloadError> {
        let sink_err = |e: std::io::Error| DownloadError::SinkIo(format!("{}: {}", self.path.display(), e));
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(sink_err)?;
        }
        self.file = Some(File::create(&self.path).map_err(sink_err)?);
        self.written = 0;
        Ok(())
    }

    fn append(&mut self, chunk: &[u8]) -> Result<(), DownloadError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| DownloadError::SinkIo("file sink is not open".to_string()))?;
        file.write_all(chunk)
            .map_err(|e| DownloadError::SinkIo(format!("{}: {}", self.path.display(), e)))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DownloadError> {
        match self.file.take() {
            Some(file) => file
                .sync_all()
                .map_err(|e| DownloadError::SinkIo(format!("{}: {}", self.path.display(), e))),
            None => Ok(()),
        }
    }
}

/// Collects the download in memory. Used for appcasts and release notes.
#[derive(Debug, Default)]
pub struct MemorySink {
    data: Vec<u8>,
    size: Option<u64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size announced by the source.
    pub fn announced_size(&self) -> Option<u64> {
        self.size
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Decode as UTF-8, replacing invalid sequences.
    pub fn into_string(self) -> String {
        match String::from_utf8(self.data) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }
    }
}

impl Sink for MemorySink {
    fn set_size(&mut self, size: Option<u64>) -> Result<(), DownloadError> {
        self.size = size;
        Ok(())
    }

    fn open(&mut self) -> Result<(), DownloadError> {
        self.data.clear();
        if let Some(size) = self.size {
            self.data.reserve(size.min(16 * 1024 * 1024) as usize);
        }
        Ok(())
    }

    fn append(&mut self, chunk: &[u8]) -> Result<(), DownloadError> {
        self.data.extend_from_slice(chunk);
        Ok(())
    }

    fn close(&mut self) -> Result<(), DownloadError> {
        Ok(())
    }
}

/// Download progress information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes downloaded so far.
    pub downloaded: u64,
    /// Total bytes, if announced.
    pub total: Option<u64>,
}

impl DownloadProgress {
    pub fn new(downloaded: u64, total: Option<u64>) -> Self {
        Self { downloaded, total }
    }

    /// Progress as a percentage (0.0 to 100.0), if the total is known.
    pub fn percentage(&self) -> Option<f64> {
        match self.total {
            Some(0) | None => None,
            Some(total) => Some((self.downloaded as f64 / total as f64) * 100.0),
        }
    }
}

impl std::fmt::Display for DownloadProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.total, self.percentage()) {
            (Some(total), Some(pct)) => {
                write!(f, "{}/{} bytes ({:.1}%)", self.downloaded, total, pct)
            }
            _ => write!(f, "{} bytes", self.downloaded),
        }
    }
}

/// Wraps a sink and reports progress after every append.
///
/// Reports are delivered in non-decreasing `downloaded` order.
pub struct ProgressSink<S, F> {
    inner: S,
    callback: F,
    progress: DownloadProgress,
}

impl<S, F> ProgressSink<S, F>
where
    S: Sink,
    F: FnMut(DownloadProgress) + Send,
{
    pub fn new(inner: S, callback: F) -> Self {
        Self {
            inner,
            callback,
            progress: DownloadProgress::new(0, None),
        }
    }

    pub fn progress(&self) -> DownloadProgress {
        self.progress
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, F> Sink for ProgressSink<S, F>
where
    S: Sink,
    F: FnMut(DownloadProgress) + Send,
{
    fn set_size(&mut self, size: Option<u64>) -> Result<(), DownloadError> {
        self.progress.total = size;
        self.inner.set_size(size)
    }

    fn open(&mut self) -> Result<(), DownloadError> {
        self.inner.open()?;
        self.progress.downloaded = 0;
        (self.callback)(self.progress);
        Ok(())
    }

    fn append(&mut self, chunk: &[u8]) -> Result<(), DownloadError> {
        self.inner.append(chunk)?;
        self.progress.downloaded += chunk.len() as u64;
        (self.callback)(self.progress);
        Ok(())
    }

    fn close(&mut self) -> Result<(), DownloadError> {
        self.inner.close()
    }
}

// ============================================================================
// Sources
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Local(PathBuf),
    Remote(Url),
}

impl Source {
    fn parse(location: &str) -> Result<Self, DownloadError> {
        let location = location.trim();
        if location.starts_with(r"\\") {
            return Ok(Self::Local(PathBuf::from(location)));
        }

        let url = Url::parse(location)
            .map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", location, e)))?;
        match url.scheme() {
            "https" => Ok(Self::Remote(url)),
            "file" => url
                .to_file_path()
                .map(Self::Local)
                .map_err(|_| DownloadError::InvalidUrl(location.to_string())),
            "http" => Err(DownloadError::Insecure(format!(
                "plaintext HTTP is not allowed: {}",
                location
            ))),
            other => Err(DownloadError::Insecure(format!(
                "unsupported scheme '{}': {}",
                other, location
            ))),
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Fetches resources into sinks.
#[derive(Clone)]
pub struct DownloadEngine {
    transport: Arc<dyn HttpTransport>,
    manifest_file_name: String,
}

impl DownloadEngine {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            manifest_file_name: "appcast.xml".to_string(),
        }
    }

    /// Asset name looked up when resolving a "latest release" endpoint.
    pub fn with_manifest_file_name(mut self, name: impl Into<String>) -> Self {
        self.manifest_file_name = name.into();
        self
    }

    /// Fetch `location` into `sink`.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::Cancelled`] when `cancel` fires, even if a
    ///   transport error happens at the same time.
    /// - [`DownloadError::Insecure`] / [`DownloadError::InvalidUrl`] for
    ///   rejected locations, before any I/O.
    /// - [`DownloadError::Transport`] for HTTP status >= 400.
    /// - Whatever the transport, the local file, or the sink reports.
    pub async fn fetch<S: Sink + ?Sized>(
        &self,
        location: &str,
        sink: &mut S,
        cancel: &CancelToken,
    ) -> Result<(), DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        match Source::parse(location)? {
            Source::Local(path) => self.fetch_local(&path, sink, cancel).await,
            Source::Remote(url) => {
                let url = self.resolve(url, cancel).await?;
                self.fetch_remote(&url, sink, cancel).await
            }
        }
    }

    /// Fetch a small text resource (appcast, release notes).
    pub async fn fetch_text(&self, location: &str, cancel: &CancelToken) -> Result<String, DownloadError> {
        let mut sink = MemorySink::new();
        self.fetch(location, &mut sink, cancel).await?;
        Ok(sink.into_string())
    }

    /// Run a fetch in a background task.
    ///
    /// The task owns the sink until it finishes; [`DownloadHandle::wait`]
    /// hands it back.
    pub fn spawn<S: Sink + 'static>(&self, location: impl Into<String>, sink: S, cancel: CancelToken) -> DownloadHandle<S> {
        let location = location.into();
        let (status_tx, status_rx) = watch::channel(DownloadTask::new(location.clone()));
        let (done_tx, done_rx) = oneshot::channel();

        let engine = self.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut tracked = TrackedSink {
                inner: sink,
                status: status_tx,
            };
            tracked.status.send_modify(|t| t.state = TaskState::Running);

            let result = engine.fetch(&location, &mut tracked, &task_cancel).await;
            let final_state = match &result {
                Ok(()) => TaskState::Complete,
                Err(DownloadError::Cancelled) => TaskState::Cancelled,
                Err(_) => TaskState::Failed,
            };
            tracked.status.send_modify(|t| t.state = final_state);

            let TrackedSink { inner, .. } = tracked;
            // The handle may have been dropped; nobody is waiting then.
            let _ = done_tx.send((inner, result));
        });

        DownloadHandle {
            cancel,
            status: status_rx,
            done: done_rx,
        }
    }

    async fn resolve(&self, url: Url, cancel: &CancelToken) -> Result<Url, DownloadError> {
        if !resolve::is_latest_release_endpoint(&url) {
            return Ok(url);
        }

        debug!(endpoint = %url, asset = %self.manifest_file_name, "Resolving release indirection");
        let mut sink = MemorySink::new();
        self.fetch_remote(&url, &mut sink, cancel).await?;
        let resolved = resolve::asset_url(&sink.into_string(), &self.manifest_file_name)?;
        if resolved.scheme() != "https" {
            return Err(DownloadError::Insecure(resolved.to_string()));
        }
        info!(from = %url, to = %resolved, "Resolved download location");
        Ok(resolved)
    }

    async fn fetch_local<S: Sink + ?Sized>(
        &self,
        path: &Path,
        sink: &mut S,
        cancel: &CancelToken,
    ) -> Result<(), DownloadError> {
        let local_err = |e: std::io::Error| DownloadError::LocalIo(format!("{}: {}", path.display(), e));

        let mut file = tokio::fs::File::open(path).await.map_err(local_err)?;
        let size = file.metadata().await.map_err(local_err)?.len();
        debug!(path = %path.display(), size, "Copying local file");

        sink.set_size(Some(size))?;
        sink.open()?;
        let copied = copy_file(&mut file, path, sink, cancel).await;
        finish(sink, copied)
    }

    async fn fetch_remote<S: Sink + ?Sized>(
        &self,
        url: &Url,
        sink: &mut S,
        cancel: &CancelToken,
    ) -> Result<(), DownloadError> {
        debug!(url = %url, "Requesting");
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            response = self.transport.get(url) => response?,
        };

        if response.final_url != *url {
            debug!(from = %url, to = %response.final_url, "Redirected");
        }
        if response.final_url.scheme() == "http" {
            return Err(DownloadError::Insecure(format!(
                "redirected to plaintext HTTP: {}",
                response.final_url
            )));
        }

        if response.status >= 400 {
            let text = if response.status_text.is_empty() {
                format!("HTTP {}", response.status)
            } else {
                response.status_text.clone()
            };
            warn!(url = %url, status = response.status, text = %text, "Server refused download");
            return Err(DownloadError::Transport {
                status: response.status,
                text,
            });
        }

        sink.set_size(response.content_length)?;
        sink.open()?;
        let copied = copy_body(response.body, sink, cancel).await;
        finish(sink, copied)
    }
}

/// Append one chunk, in bounded slices, re-checking cancellation.
fn commit<S: Sink + ?Sized>(sink: &mut S, chunk: &[u8], cancel: &CancelToken) -> Result<(), DownloadError> {
    for piece in chunk.chunks(MAX_APPEND_SIZE) {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        sink.append(piece)?;
    }
    if cancel.is_cancelled() {
        return Err(DownloadError::Cancelled);
    }
    Ok(())
}

async fn copy_file<S: Sink + ?Sized>(
    file: &mut tokio::fs::File,
    path: &Path,
    sink: &mut S,
    cancel: &CancelToken,
) -> Result<(), DownloadError> {
    let mut buffer = vec![0u8; MAX_APPEND_SIZE];
    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            read = file.read(&mut buffer) => read
                .map_err(|e| DownloadError::LocalIo(format!("{}: {}", path.display(), e)))?,
        };
        if read == 0 {
            return Ok(());
        }
        commit(sink, &buffer[..read], cancel)?;
    }
}

async fn copy_body<S: Sink + ?Sized>(
    mut body: BodyStream,
    sink: &mut S,
    cancel: &CancelToken,
) -> Result<(), DownloadError> {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            next = body.next() => next,
        };
        let Some(chunk) = next else {
            return Ok(());
        };
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(_) if cancel.is_cancelled() => return Err(DownloadError::Cancelled),
            Err(e) => return Err(e),
        };
        commit(sink, &chunk, cancel)?;
    }
}

/// Close an opened sink exactly once; the copy error wins over a close error.
fn finish<S: Sink + ?Sized>(sink: &mut S, copied: Result<(), DownloadError>) -> Result<(), DownloadError> {
    let closed = sink.close();
    match copied {
        Err(e) => {
            if let Err(close_err) = closed {
                warn!(error = %close_err, "Sink close failed after aborted download");
            }
            Err(e)
        }
        Ok(()) => closed,
    }
}

// ============================================================================
// Background downloads
// ============================================================================

/// Lifecycle of a background download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Complete,
    Cancelled,
    Failed,
}

impl TaskState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Failed)
    }
}

/// Snapshot of a background download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub url: String,
    pub bytes_total: Option<u64>,
    pub bytes_done: u64,
    pub state: TaskState,
}

impl DownloadTask {
    fn new(url: String) -> Self {
        Self {
            url,
            bytes_total: None,
            bytes_done: 0,
            state: TaskState::Pending,
        }
    }
}

struct TrackedSink<S> {
    inner: S,
    status: watch::Sender<DownloadTask>,
}

impl<S: Sink> Sink for TrackedSink<S> {
    fn set_size(&mut self, size: Option<u64>) -> Result<(), DownloadError> {
        self.inner.set_size(size)?;
        self.status.send_modify(|t| t.bytes_total = size);
        Ok(())
    }

    fn open(&mut self) -> Result<(), DownloadError> {
        self.inner.open()
    }

    fn append(&mut self, chunk: &[u8]) -> Result<(), DownloadError> {
        self.inner.append(chunk)?;
        self.status
            .send_modify(|t| t.bytes_done += chunk.len() as u64);
        Ok(())
    }

    fn close(&mut self) -> Result<(), DownloadError> {
        self.inner.close()
    }
}

/// Handle to a background download.
pub struct DownloadHandle<S> {
    cancel: CancelToken,
    status: watch::Receiver<DownloadTask>,
    done: oneshot::Receiver<(S, Result<(), DownloadError>)>,
}

impl<S> DownloadHandle<S> {
    /// Request cancellation. The task still closes its sink.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Current snapshot.
    pub fn task(&self) -> DownloadTask {
        self.status.borrow().clone()
    }

    /// Watch snapshots as they change.
    pub fn subscribe(&self) -> watch::Receiver<DownloadTask> {
        self.status.clone()
    }

    /// Wait for completion and take the sink back.
    pub async fn wait(self) -> Result<S, DownloadError> {
        match self.done.await {
            Ok((sink, Ok(()))) => Ok(sink),
            Ok((_, Err(e))) => Err(e),
            Err(_) => Err(DownloadError::SinkIo(
                "download task ended without reporting".to_string(),
            )),
        }
    }
}
