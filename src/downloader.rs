// src/downloader.rs
// Episode acquisition: direct HTTP streaming or delegation to yt-dlp/youtube-dl

use crate::error::AppError;
use crate::event::{Event, EventBus};
use crate::queue::{Episode, EpisodeState};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as AsyncCommand;
use tokio::sync::watch;

/// Preferred extraction tool
pub const YOUTUBE_DLP: &str = "yt-dlp";
/// Legacy extraction tool, used when yt-dlp is missing
pub const YOUTUBE_DL: &str = "youtube-dl";
/// Arguments passed to the extraction tool before the output and URL
pub const YOUTUBE_FLAGS: &[&str] = &[
    "--add-metadata",
    "--newline",
    "--no-colors",
    "-f",
    "bestaudio",
    "--extract-audio",
    "--audio-format",
    "mp3",
];

/// Minimum time between two progress events from one download
pub const EVENT_INTERVAL: Duration = Duration::from_millis(500);

static PROGRESS_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^\[download\]\s+(\d+(?:\.\d+)?)%").ok());

/// Default tool candidates, most preferred first
pub fn default_tools() -> Vec<String> {
    vec![YOUTUBE_DLP.to_string(), YOUTUBE_DL.to_string()]
}

/// Why a download did not succeed. The display text is what ends up in
/// [`DownloadStatus::error`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownloadFailure {
    #[error("Cancelled")]
    Cancelled,
    #[error("No YouTube downloader")]
    NoYoutubeDownloader,
    #[error("Downloader IO Error")]
    DownloaderIo,
    #[error("Download failed")]
    Failed,
    /// Stream or file error, carrying the underlying message
    #[error("{0}")]
    Io(String),
}

/// How an episode is acquired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Stream the URL straight into the destination file
    Direct,
    /// Hand the URL to an external extraction tool
    Delegated,
}

impl Strategy {
    pub fn for_episode(episode: &Episode) -> Self {
        if episode.is_youtube() {
            Strategy::Delegated
        } else {
            Strategy::Direct
        }
    }
}

/// Point-in-time copy of a download record
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadStatus {
    pub id: usize,
    pub url: String,
    pub path: PathBuf,
    pub started: DateTime<Utc>,
    /// Total bytes, zero when unknown
    pub size: u64,
    /// Bytes written so far
    pub done: u64,
    /// Fraction completed, 0.0 to 1.0
    pub percentage: f64,
    pub completed: bool,
    pub success: bool,
    /// Empty unless the download failed or was cancelled
    pub error: String,
}

#[derive(Debug, Default)]
struct Progress {
    size: u64,
    done: u64,
    percentage: f64,
    completed: bool,
    success: bool,
    error: String,
}

/// One download, in flight or finished. Records are never removed.
#[derive(Debug)]
pub struct Download {
    id: usize,
    episode: Arc<Episode>,
    path: PathBuf,
    started: DateTime<Utc>,
    progress: Mutex<Progress>,
    /// Set by anyone wanting the download to stop
    cancel_tx: watch::Sender<bool>,
    /// Set once, by the download task, when the record becomes terminal
    done_tx: watch::Sender<bool>,
}

impl Download {
    fn new(id: usize, episode: Arc<Episode>) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);

        Self {
            id,
            path: episode.path().to_path_buf(),
            episode,
            started: Utc::now(),
            progress: Mutex::new(Progress::default()),
            cancel_tx,
            done_tx,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn episode(&self) -> &Arc<Episode> {
        &self.episode
    }

    pub fn is_completed(&self) -> bool {
        self.progress.lock().completed
    }

    pub fn snapshot(&self) -> DownloadStatus {
        let p = self.progress.lock();
        DownloadStatus {
            id: self.id,
            url: self.episode.url().to_string(),
            path: self.path.clone(),
            started: self.started,
            size: p.size,
            done: p.done,
            percentage: p.percentage,
            completed: p.completed,
            success: p.success,
            error: p.error.clone(),
        }
    }

    /// Ask the download task to stop. Safe to call any number of times.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    /// Wait until the record is terminal
    pub async fn wait(&self) {
        let mut rx = self.done_tx.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    fn set_size(&self, size: u64) {
        self.progress.lock().size = size;
    }

    fn advance(&self, done: u64) {
        let mut p = self.progress.lock();
        p.done = done;
        if p.size > 0 {
            let fraction = (done as f64 / p.size as f64).min(1.0);
            p.percentage = p.percentage.max(fraction);
        }
    }

    fn set_percentage(&self, fraction: f64) {
        let mut p = self.progress.lock();
        p.percentage = p.percentage.max(fraction.clamp(0.0, 1.0));
    }

    fn finish(&self, outcome: &Result<(), DownloadFailure>) {
        {
            let mut p = self.progress.lock();
            if p.completed {
                warn!("Download {} finished twice", self.id);
                return;
            }
            p.completed = true;
            match outcome {
                Ok(()) => {
                    p.success = true;
                    p.percentage = 1.0;
                    p.error.clear();
                }
                Err(failure) => {
                    p.success = false;
                    p.error = failure.to_string();
                }
            }
        }
        self.done_tx.send_replace(true);
    }
}

/// Extract the fraction from a `[download]  NN.N%` progress line
pub fn parse_progress(line: &str) -> Option<f64> {
    let caps = PROGRESS_RE.as_ref()?.captures(line.trim_start())?;
    let percent: f64 = caps.get(1)?.as_str().parse().ok()?;
    Some(percent / 100.0)
}

/// Locate an executable by name on PATH, or check an explicit path
pub fn find_executable(name: &str) -> Option<PathBuf> {
    if name.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }

    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// First resolvable tool of an ordered candidate list
pub fn resolve_tool(candidates: &[String]) -> Option<PathBuf> {
    candidates.iter().find_map(|name| find_executable(name))
}

/// Resolves once a cancellation has been requested
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancel| *cancel).await.is_err() {
        // Sender gone: nobody can cancel any more
        std::future::pending::<()>().await;
    }
}

#[derive(Debug, Default)]
struct Registry {
    downloads: Vec<Arc<Download>>,
}

/// Registry of every download started during this run.
///
/// Each download runs as its own task; its progress fields sit behind the
/// record's own lock so unrelated downloads never contend.
#[derive(Debug)]
pub struct Downloader {
    client: reqwest::Client,
    events: Arc<EventBus>,
    tools: Vec<String>,
    registry: RwLock<Registry>,
}

impl Downloader {
    /// Create a downloader trying `tools` in order for delegated downloads
    pub fn new(events: Arc<EventBus>, tools: Vec<String>) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("podbit/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::with_client(client, events, tools))
    }

    pub fn with_client(client: reqwest::Client, events: Arc<EventBus>, tools: Vec<String>) -> Self {
        Self {
            client,
            events,
            tools,
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Start downloading `episode` in the background and return its id.
    ///
    /// A second download of a path that is still being fetched is refused;
    /// callers normally consult [`is_downloading`](Self::is_downloading) first.
    pub fn download(&self, episode: Arc<Episode>) -> Result<usize, AppError> {
        if let Some(parent) = episode.path().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| AppError::DirectoryCreation {
                    path: parent.display().to_string(),
                    source,
                })?;
            }
        }

        let strategy = Strategy::for_episode(&episode);
        let download = {
            let mut registry = self.registry.write();
            if let Some(running) = registry
                .downloads
                .iter()
                .find(|d| d.path.as_path() == episode.path() && !d.is_completed())
            {
                return Err(AppError::DownloadError(format!(
                    "{} is already being downloaded as {}",
                    episode.path().display(),
                    running.id
                )));
            }
            let id = registry.downloads.len();
            let download = Arc::new(Download::new(id, episode));
            registry.downloads.push(Arc::clone(&download));
            download
        };

        info!(
            "Download {} started ({:?}): {}",
            download.id,
            strategy,
            download.episode.url()
        );

        let job = Job {
            client: self.client.clone(),
            events: Arc::clone(&self.events),
            tools: self.tools.clone(),
            download: Arc::clone(&download),
        };
        tokio::spawn(job.run(strategy));
        self.events.post(Event::DownloadChanged);

        Ok(download.id)
    }

    /// Id of an unfinished download of `path`, if any
    pub fn is_downloading<P: AsRef<Path>>(&self, path: P) -> Option<usize> {
        let path = path.as_ref();
        self.registry
            .read()
            .downloads
            .iter()
            .rev()
            .find(|d| d.path == path && !d.is_completed())
            .map(|d| d.id)
    }

    pub fn get_download(&self, id: usize) -> Option<DownloadStatus> {
        self.handle(id).map(|d| d.snapshot())
    }

    /// Shared handle to a download record
    pub fn handle(&self, id: usize) -> Option<Arc<Download>> {
        self.registry.read().downloads.get(id).cloned()
    }

    /// Number of unfinished downloads
    pub fn ongoing(&self) -> usize {
        self.registry
            .read()
            .downloads
            .iter()
            .filter(|d| !d.is_completed())
            .count()
    }

    /// Snapshot of every download record
    pub fn downloads(&self) -> Vec<DownloadStatus> {
        let records: Vec<Arc<Download>> = self.registry.read().downloads.clone();
        records.iter().map(|d| d.snapshot()).collect()
    }

    /// Request cancellation. Returns false for unknown or finished downloads.
    pub fn cancel(&self, id: usize) -> bool {
        match self.handle(id) {
            Some(d) if !d.is_completed() => {
                debug!("Cancelling download {}", id);
                d.cancel();
                true
            }
            _ => false,
        }
    }

    /// Wait for a download to finish and return its final state
    pub async fn wait(&self, id: usize) -> Option<DownloadStatus> {
        let download = self.handle(id)?;
        download.wait().await;
        Some(download.snapshot())
    }
}

/// Everything a download task needs, detached from the registry
struct Job {
    client: reqwest::Client,
    events: Arc<EventBus>,
    tools: Vec<String>,
    download: Arc<Download>,
}

impl Job {
    async fn run(self, strategy: Strategy) {
        let mut cancel_rx = self.download.cancel_tx.subscribe();
        let outcome = match strategy {
            Strategy::Direct => self.direct(&mut cancel_rx).await,
            Strategy::Delegated => self.delegated(&mut cancel_rx).await,
        };

        match &outcome {
            Ok(()) => {
                let episode = Arc::clone(&self.download.episode);
                if let Err(e) = tokio::task::spawn_blocking(move || episode.refresh_tags()).await {
                    warn!("Reading tags of download {} failed: {}", self.download.id, e);
                }
                self.download.episode.set_state(EpisodeState::Ready);
                info!("Download {} completed successfully", self.download.id);
            }
            Err(DownloadFailure::Cancelled) => {
                info!("Download {} cancelled", self.download.id);
            }
            Err(e) => {
                warn!("Download {} failed: {}", self.download.id, e);
            }
        }

        self.download.finish(&outcome);
        self.events.post(Event::DownloadChanged);
    }

    fn maybe_post(&self, last_post: &mut Instant) {
        if last_post.elapsed() >= EVENT_INTERVAL {
            self.events.post(Event::DownloadChanged);
            *last_post = Instant::now();
        }
    }

    async fn direct(&self, cancel: &mut watch::Receiver<bool>) -> Result<(), DownloadFailure> {
        let url = self.download.episode.url();
        let path = &self.download.path;

        let response = tokio::select! {
            biased;
            _ = cancelled(cancel) => return Err(DownloadFailure::Cancelled),
            response = self.client.get(url).send() => response,
        };
        let mut response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!("{} answered {}", url, r.status());
                return Err(DownloadFailure::Failed);
            }
            Err(e) => {
                debug!("Request to {} failed: {}", url, e);
                return Err(DownloadFailure::Failed);
            }
        };

        self.download.set_size(response.content_length().unwrap_or(0));
        let mut file = File::create(path)
            .await
            .map_err(|e| DownloadFailure::Io(e.to_string()))?;

        let mut done: u64 = 0;
        let mut last_post = Instant::now();
        let result = loop {
            let chunk = tokio::select! {
                biased;
                _ = cancelled(cancel) => break Err(DownloadFailure::Cancelled),
                chunk = response.chunk() => chunk,
            };

            match chunk {
                Ok(Some(bytes)) => {
                    if let Err(e) = file.write_all(&bytes).await {
                        break Err(DownloadFailure::Io(e.to_string()));
                    }
                    done += bytes.len() as u64;
                    self.download.advance(done);
                    self.maybe_post(&mut last_post);
                }
                Ok(None) => {
                    break file
                        .flush()
                        .await
                        .map_err(|e| DownloadFailure::Io(e.to_string()))
                }
                Err(e) => break Err(DownloadFailure::Io(e.to_string())),
            }
        };

        drop(file);
        if result.is_err() {
            let _ = tokio::fs::remove_file(path).await;
        }
        result
    }

    async fn delegated(&self, cancel: &mut watch::Receiver<bool>) -> Result<(), DownloadFailure> {
        let tool = resolve_tool(&self.tools).ok_or(DownloadFailure::NoYoutubeDownloader)?;
        let path = &self.download.path;

        // The tools refuse to overwrite an existing destination
        if path.exists() {
            let _ = tokio::fs::remove_file(path).await;
        }

        let tmp = temp_base(path);
        let mut command = AsyncCommand::new(&tool);
        command
            .args(YOUTUBE_FLAGS)
            .arg("-o")
            .arg(format!("{}.%(ext)s", tmp.display()))
            .arg(self.download.episode.url())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        debug!("Spawning {} for download {}", tool.display(), self.download.id);
        let mut child = command.spawn().map_err(|e| {
            warn!("Failed to start {}: {}", tool.display(), e);
            DownloadFailure::DownloaderIo
        })?;
        let stdout = child.stdout.take().ok_or(DownloadFailure::DownloaderIo)?;
        let mut lines = BufReader::new(stdout).lines();
        let mut last_post = Instant::now();

        loop {
            let line = tokio::select! {
                biased;
                _ = cancelled(cancel) => {
                    let _ = child.kill().await;
                    remove_temp(&tmp).await;
                    return Err(DownloadFailure::Cancelled);
                }
                line = lines.next_line() => line,
            };

            match line {
                Ok(Some(line)) => {
                    if let Some(fraction) = parse_progress(&line) {
                        self.download.set_percentage(fraction);
                        self.maybe_post(&mut last_post);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Reading {} output failed: {}", tool.display(), e);
                    let _ = child.kill().await;
                    remove_temp(&tmp).await;
                    return Err(DownloadFailure::DownloaderIo);
                }
            }
        }

        let status = child.wait().await.map_err(|_| DownloadFailure::DownloaderIo)?;
        if !status.success() {
            debug!("{} exited with {}", tool.display(), status);
            remove_temp(&tmp).await;
            return Err(DownloadFailure::Failed);
        }

        tokio::fs::rename(with_suffix(&tmp, ".mp3"), path)
            .await
            .map_err(|e| DownloadFailure::Io(e.to_string()))
    }
}

/// Temporary output name next to the destination, without extension
fn temp_base(path: &Path) -> PathBuf {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!(".podbit-ytdl{}", Utc::now().timestamp_micros()))
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

async fn remove_temp(base: &Path) {
    for suffix in [".mp3", ".part", ".webm", ".m4a"] {
        let _ = tokio::fs::remove_file(with_suffix(base, suffix)).await;
    }
}
