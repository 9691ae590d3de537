// src/playback.rs
// FIFO of episodes to play, independent of the order of the queue file

use crate::queue::{Episode, QueueStore};
use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default)]
struct PlaybackInner {
    items: Vec<Arc<Episode>>,
    /// Index of the next episode to play. The one playing, if any, is head - 1.
    head: usize,
}

/// What the caller has to do to the transport after a queue edit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum QueueEdit {
    /// Nothing changed, or nothing playing was affected
    Unchanged,
    /// The edit moved away from the current episode; playback must stop so
    /// the mainloop re-evaluates the head
    StopTransport,
}

/// Ordered list of episodes with a monotonically advancing head cursor.
///
/// Holds the same episodes as the [`QueueStore`] but is not touched by
/// reloads. [`pop_head`](Self::pop_head) never wraps around.
#[derive(Debug, Default)]
pub struct PlaybackQueue {
    inner: Mutex<PlaybackInner>,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an episode
    pub fn enqueue(&self, episode: Arc<Episode>) {
        debug!("Enqueued {}", episode.url());
        self.inner.lock().items.push(episode);
    }

    /// Enqueue the episode with this URL. Returns false if it is unknown.
    pub fn enqueue_by_url(&self, store: &QueueStore, url: &str) -> bool {
        match store.get_by_url(url) {
            Some(ep) => {
                self.enqueue(ep);
                true
            }
            None => false,
        }
    }

    /// Enqueue the first episode with this title. Returns false if none matches.
    pub fn enqueue_by_title(&self, store: &QueueStore, title: &str) -> bool {
        match store.get_by_title(title) {
            Some(ep) => {
                self.enqueue(ep);
                true
            }
            None => false,
        }
    }

    /// Bulk enqueue every episode of a podcast, in queue file order.
    /// Returns how many were added.
    pub fn enqueue_by_podcast(&self, store: &QueueStore, name: &str) -> usize {
        let episodes = store.podcast_episodes(name);
        let count = episodes.len();
        self.inner.lock().items.extend(episodes);
        count
    }

    /// Drop every entry and reset the head
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.items.clear();
        inner.head = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn head(&self) -> usize {
        self.inner.lock().head
    }

    /// Copy of the queued episodes
    pub fn items(&self) -> Vec<Arc<Episode>> {
        self.inner.lock().items.clone()
    }

    /// Take the episode at the head and advance past it.
    /// `None` once the head has reached the end.
    pub fn pop_head(&self) -> Option<Arc<Episode>> {
        let mut inner = self.inner.lock();
        let ep = inner.items.get(inner.head).cloned()?;
        inner.head += 1;
        Some(ep)
    }

    /// Step the head back by one so the last popped episode is retried
    pub fn rewind(&self) {
        let mut inner = self.inner.lock();
        inner.head = inner.head.saturating_sub(1);
    }

    /// Whether `episode` is the one most recently popped
    pub fn is_at_head(&self, episode: &Arc<Episode>) -> bool {
        let inner = self.inner.lock();
        inner
            .head
            .checked_sub(1)
            .and_then(|i| inner.items.get(i))
            .is_some_and(|current| Arc::ptr_eq(current, episode))
    }

    /// Move the head to `index`. Out-of-range indices are ignored.
    pub fn jump_to(&self, index: usize) -> QueueEdit {
        let mut inner = self.inner.lock();
        if index >= inner.items.len() {
            return QueueEdit::Unchanged;
        }

        inner.head = index;
        QueueEdit::StopTransport
    }

    /// Remove the entry at `index`, keeping the head on the episode that
    /// would have played next. Removing the current episode stops playback.
    pub fn dequeue(&self, index: usize) -> QueueEdit {
        let mut inner = self.inner.lock();
        if index >= inner.items.len() {
            return QueueEdit::Unchanged;
        }

        inner.items.remove(index);

        let mut edit = QueueEdit::Unchanged;
        if index < inner.head {
            if index + 1 == inner.head {
                edit = QueueEdit::StopTransport;
            }
            inner.head -= 1;
        }
        inner.head = inner.head.min(inner.items.len());

        edit
    }
}
