// src/queue.rs
// The newsboat queue: every episode podbit knows about, in file order

use crate::error::AppError;
use crate::ledger::ResumeLedger;
use crate::metadata::TagInfo;
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name used for episodes whose podcast cannot be identified
pub const UNKNOWN_PODCAST_NAME: &str = "Unrecognised";

/// Download/playback state of an episode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EpisodeState {
    /// Waiting to be downloaded
    Pending,
    /// Downloaded and ready to play
    Ready,
    /// Played at least once
    Played,
    /// Played through to the end
    Finished,
}

impl EpisodeState {
    /// Name used in the queue file. Pending is written as nothing at all.
    pub fn as_str(self) -> &'static str {
        match self {
            EpisodeState::Pending => "",
            EpisodeState::Ready => "downloaded",
            EpisodeState::Played => "played",
            EpisodeState::Finished => "finished",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "" => Some(EpisodeState::Pending),
            "downloaded" => Some(EpisodeState::Ready),
            "played" => Some(EpisodeState::Played),
            "finished" => Some(EpisodeState::Finished),
            _ => None,
        }
    }
}

impl fmt::Display for EpisodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpisodeState::Pending => write!(f, "pending"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// One entry of the queue file
#[derive(Debug)]
pub struct Episode {
    url: String,
    path: PathBuf,
    youtube: bool,
    state: RwLock<EpisodeState>,
    tags: RwLock<Option<TagInfo>>,
}

impl Episode {
    pub fn new(url: &str, path: impl Into<PathBuf>, youtube: bool, state: EpisodeState) -> Self {
        Self {
            url: url.to_string(),
            path: path.into(),
            youtube,
            state: RwLock::new(state),
            tags: RwLock::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Absolute download destination
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the episode must be fetched by an extraction tool
    pub fn is_youtube(&self) -> bool {
        self.youtube
    }

    pub fn state(&self) -> EpisodeState {
        *self.state.read()
    }

    pub fn set_state(&self, state: EpisodeState) {
        *self.state.write() = state;
    }

    /// Re-read the tags of the downloaded file. Called when the queue is
    /// loaded and after each successful download.
    pub fn refresh_tags(&self) {
        *self.tags.write() = TagInfo::from_file(&self.path);
    }

    pub fn tags(&self) -> Option<TagInfo> {
        self.tags.read().clone()
    }

    /// Display title: the tagged title, else the file name, else the URL
    pub fn title(&self) -> String {
        if let Some(title) = self.tags.read().as_ref().and_then(|t| t.title.clone()) {
            return title;
        }
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.url.clone())
    }

    /// Tagged artist of the episode, if any
    pub fn host(&self) -> Option<String> {
        self.tags.read().as_ref().and_then(|t| t.host.clone())
    }

    /// Serialised queue file line, without the trailing newline
    pub fn to_line(&self) -> String {
        let prefix = if self.youtube { "+" } else { "" };
        let state = self.state();
        let suffix = if state.as_str().is_empty() {
            String::new()
        } else {
            format!(" {}", state.as_str())
        };

        format!("{}{} \"{}\"{}", prefix, self.url, self.path.display(), suffix)
    }
}

/// Human-maintained lookup from episode URLs to podcast names
pub trait PodcastDirectory: Send + Sync + fmt::Debug {
    fn friendly_name(&self, url: &str) -> String;
}

/// Directory used when no podcast names are configured
#[derive(Debug, Default, Clone, Copy)]
pub struct UnknownPodcasts;

impl PodcastDirectory for UnknownPodcasts {
    fn friendly_name(&self, _url: &str) -> String {
        UNKNOWN_PODCAST_NAME.to_string()
    }
}

/// A successfully parsed queue line
struct ParsedLine {
    episode: Episode,
    legacy_stamp: Option<i64>,
}

/// Parse `[+]<url> "<path>"[ <state>][ <timestamp>]`
fn parse_line(line: &str) -> Option<ParsedLine> {
    let (url_field, rest) = line.trim().split_once(' ')?;
    let (youtube, url) = match url_field.strip_prefix('+') {
        Some(url) => (true, url),
        None => (false, url_field),
    };
    if url.is_empty() {
        return None;
    }

    let rest = rest.trim_start();
    let (path, tail) = match rest.strip_prefix('"') {
        Some(quoted) => {
            let end = quoted.find('"')?;
            (&quoted[..end], &quoted[end + 1..])
        }
        None => rest.split_once(' ').unwrap_or((rest, "")),
    };
    if path.is_empty() {
        return None;
    }

    let mut extra = tail.split_whitespace();
    let state_name = extra.next();
    let legacy_stamp = extra.next().and_then(|s| s.parse::<i64>().ok());

    let state = if !Path::new(path).exists() {
        EpisodeState::Pending
    } else {
        match state_name {
            None => EpisodeState::Ready,
            Some(name) => EpisodeState::from_name(name).unwrap_or(EpisodeState::Ready),
        }
    };

    Some(ParsedLine {
        episode: Episode::new(url, path, youtube, state),
        legacy_stamp,
    })
}

#[derive(Debug, Default)]
struct QueueInner {
    items: Vec<Arc<Episode>>,
    by_url: HashMap<String, Arc<Episode>>,
    by_podcast: HashMap<String, Vec<Arc<Episode>>>,
}

/// The ordered set of episodes loaded from the queue file.
///
/// Entries are never removed: reloading only appends URLs not seen before.
/// The URL and podcast indices share the episodes of the backing sequence,
/// so a state change through any of them is visible through all.
#[derive(Debug)]
pub struct QueueStore {
    path: PathBuf,
    ledger: Arc<ResumeLedger>,
    directory: Arc<dyn PodcastDirectory>,
    inner: RwLock<QueueInner>,
}

impl QueueStore {
    /// Open and parse the queue file. Errors are fatal to startup.
    pub fn open<P: AsRef<Path>>(
        path: P,
        ledger: Arc<ResumeLedger>,
        directory: Arc<dyn PodcastDirectory>,
    ) -> Result<Self, AppError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(AppError::QueueNotFound);
        }

        let content = fs::read_to_string(&path)?;
        let store = Self {
            path,
            ledger,
            directory,
            inner: RwLock::new(QueueInner::default()),
        };

        {
            let mut inner = store.inner.write();
            let mut seen = HashSet::new();
            for (idx, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let parsed = parse_line(line).ok_or(AppError::QueueSyntax { line: idx + 1 })?;
                store.merge(&mut inner, &mut seen, parsed, idx + 1);
            }
            info!(
                "Loaded {} episodes from {}",
                inner.items.len(),
                store.path.display()
            );
        }

        Ok(store)
    }

    /// Hot-reload the queue file, appending entries with URLs not yet
    /// known. Existing entries are left exactly as they are. Returns the
    /// number of new episodes.
    pub fn reload(&self) -> usize {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to open queue when reloading: {}", e);
                return 0;
            }
        };

        let mut inner = self.inner.write();
        let before = inner.items.len();
        let mut seen = HashSet::new();

        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(line) {
                Some(parsed) => self.merge(&mut inner, &mut seen, parsed, idx + 1),
                None => warn!("Skipping malformed queue line {} while reloading", idx + 1),
            }
        }

        let added = inner.items.len() - before;
        if added > 0 {
            debug!("Queue reload added {} episodes", added);
        }
        added
    }

    /// Add a parsed line unless its URL is already present. A URL repeated
    /// within one pass over the file is a duplicate and is dropped loudly.
    fn merge(
        &self,
        inner: &mut QueueInner,
        seen: &mut HashSet<String>,
        parsed: ParsedLine,
        line: usize,
    ) {
        let url = parsed.episode.url().to_string();
        if !seen.insert(url.clone()) {
            warn!(
                "Duplicate entry in queue (line {}, url: {}) - dropping subsequent entries",
                line, url
            );
            return;
        }
        if inner.by_url.contains_key(&url) {
            return;
        }

        let present = parsed.episode.path().exists();
        if let Some(stamp) = parsed.legacy_stamp.filter(|_| present) {
            // Already migrated entries report EntryExists, which is expected
            let _ = self.ledger.insert(parsed.episode.path(), stamp);
        }
        if present {
            parsed.episode.refresh_tags();
        }

        let episode = Arc::new(parsed.episode);
        let podcast = self.directory.friendly_name(&url);

        inner.items.push(Arc::clone(&episode));
        inner.by_url.insert(url, Arc::clone(&episode));
        inner.by_podcast.entry(podcast).or_default().push(episode);
    }

    /// Rewrite the queue file from memory
    pub fn save(&self) -> Result<(), AppError> {
        let mut out = String::new();
        {
            let inner = self.inner.read();
            for episode in &inner.items {
                out.push_str(&episode.to_line());
                out.push('\n');
            }
        }

        fs::write(&self.path, out)?;
        debug!("Queue saved to {}", self.path.display());
        Ok(())
    }

    /// Walk the queue in order under the write lock. The callback may change
    /// episode state; returning false stops the walk.
    pub fn range<F>(&self, mut callback: F)
    where
        F: FnMut(usize, &Arc<Episode>) -> bool,
    {
        let inner = self.inner.write();
        for (i, episode) in inner.items.iter().enumerate() {
            if !callback(i, episode) {
                return;
            }
        }
    }

    /// Like [`range`](Self::range), last entry first
    pub fn rev_range<F>(&self, mut callback: F)
    where
        F: FnMut(usize, &Arc<Episode>) -> bool,
    {
        let inner = self.inner.write();
        for (i, episode) in inner.items.iter().enumerate().rev() {
            if !callback(i, episode) {
                return;
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().items.is_empty()
    }

    /// Point-in-time copy of the episode list
    pub fn snapshot(&self) -> Vec<Arc<Episode>> {
        self.inner.read().items.clone()
    }

    pub fn get_by_url(&self, url: &str) -> Option<Arc<Episode>> {
        self.inner.read().by_url.get(url).cloned()
    }

    /// First episode whose display title matches
    pub fn get_by_title(&self, title: &str) -> Option<Arc<Episode>> {
        let inner = self.inner.read();
        inner.items.iter().find(|ep| ep.title() == title).cloned()
    }

    /// Every episode currently in `state`
    pub fn get_by_status(&self, state: EpisodeState) -> Vec<Arc<Episode>> {
        let inner = self.inner.read();
        inner
            .items
            .iter()
            .filter(|ep| ep.state() == state)
            .cloned()
            .collect()
    }

    /// Episodes of a podcast, empty for an unknown name
    pub fn podcast_episodes(&self, name: &str) -> Vec<Arc<Episode>> {
        self.inner
            .read()
            .by_podcast
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Names of every podcast with at least one episode, sorted
    pub fn podcasts(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().by_podcast.keys().cloned().collect();
        names.sort();
        names
    }

    /// Podcast name for a URL
    pub fn friendly_name(&self, url: &str) -> String {
        self.directory.friendly_name(url)
    }
}
