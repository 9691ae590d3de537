// src/player.rs
// Player handle and the mainloop that owns the media backend

use crate::downloader::Downloader;
use crate::error::AppError;
use crate::event::{Event, EventBus};
use crate::ledger::ResumeLedger;
use crate::playback::{PlaybackQueue, QueueEdit};
use crate::queue::{Episode, EpisodeState, QueueStore};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Default time between supervision ticks
pub const UPDATE_INTERVAL: Duration = Duration::from_millis(500);

const MAILBOX_DEPTH: usize = 32;

/// Control surface of a media player process.
///
/// Only the mainloop holds a backend, so implementations need no internal
/// locking.
#[async_trait]
pub trait MediaBackend: Send {
    /// Load `path` and start playing it `start` seconds in
    async fn load(&mut self, path: &Path, start: u64) -> Result<(), AppError>;
    async fn is_paused(&mut self) -> Result<bool, AppError>;
    async fn set_paused(&mut self, paused: bool) -> Result<(), AppError>;
    /// Position in the current media, in seconds
    async fn position(&mut self) -> Result<f64, AppError>;
    /// Length of the current media, in seconds
    async fn duration(&mut self) -> Result<f64, AppError>;
    async fn seek_relative(&mut self, offset: i64) -> Result<(), AppError>;
    async fn stop(&mut self) -> Result<(), AppError>;
    /// Name of the file being played, `None` when idle
    async fn filename(&mut self) -> Result<Option<String>, AppError>;
    /// Tear down the player process, if any
    async fn shutdown(&mut self);
}

/// Transport state of the mainloop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Loading,
    Playing,
    /// Blocked on the download of the head episode
    Waiting,
}

/// Display fields of the episode being played
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NowPlaying {
    pub title: String,
    pub podcast: String,
}

#[derive(Debug)]
enum Action {
    Stop,
    Pause,
    Unpause,
    Toggle,
    Seek(i64),
    JumpTo(usize),
    Dequeue(usize),
    IsPaused(oneshot::Sender<bool>),
    IsPlaying(oneshot::Sender<bool>),
    IsWaiting(oneshot::Sender<bool>),
    State(oneshot::Sender<PlayerState>),
    Timings(oneshot::Sender<(f64, f64)>),
    NowPlaying(oneshot::Sender<NowPlaying>),
    Terminate(oneshot::Sender<()>),
}

/// Shared services the mainloop works against
#[derive(Debug, Clone)]
pub struct Services {
    pub queue: Arc<PlaybackQueue>,
    pub store: Arc<QueueStore>,
    pub ledger: Arc<ResumeLedger>,
    pub downloader: Arc<Downloader>,
    pub events: Arc<EventBus>,
}

/// Cloneable handle to the player mainloop.
///
/// Every call is a message to the mainloop; transport state is never
/// touched from outside it. Calls fail with [`AppError::PlayerGone`] once the
/// mainloop has returned.
#[derive(Debug, Clone)]
pub struct Player {
    tx: mpsc::Sender<Action>,
}

impl Player {
    /// Start the mainloop on `backend`, ticking every `update_interval`
    pub fn spawn<B>(
        services: Services,
        backend: B,
        update_interval: Duration,
    ) -> (Self, JoinHandle<()>)
    where
        B: MediaBackend + 'static,
    {
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        let events = services.events.register();

        let mainloop = Mainloop {
            services,
            backend,
            mailbox: rx,
            events,
            events_open: true,
            update_interval,
            state: PlayerState::Idle,
            current: None,
            current_file: None,
            download: None,
            now: NowPlaying::default(),
            manual_stop: false,
        };

        (Self { tx }, tokio::spawn(mainloop.run()))
    }

    async fn send(&self, action: Action) -> Result<(), AppError> {
        self.tx.send(action).await.map_err(|_| AppError::PlayerGone)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Action,
    ) -> Result<T, AppError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(make(reply_tx)).await?;
        reply_rx.await.map_err(|_| AppError::PlayerGone)
    }

    /// Stop the current episode, keeping its position for next time
    pub async fn stop(&self) -> Result<(), AppError> {
        self.send(Action::Stop).await
    }

    pub async fn pause(&self) -> Result<(), AppError> {
        self.send(Action::Pause).await
    }

    pub async fn unpause(&self) -> Result<(), AppError> {
        self.send(Action::Unpause).await
    }

    pub async fn toggle(&self) -> Result<(), AppError> {
        self.send(Action::Toggle).await
    }

    /// Seek relative to the current position, in seconds
    pub async fn seek(&self, offset: i64) -> Result<(), AppError> {
        self.send(Action::Seek(offset)).await
    }

    /// Move the playback head to `index` and stop the current episode
    pub async fn jump_to(&self, index: usize) -> Result<(), AppError> {
        self.send(Action::JumpTo(index)).await
    }

    /// Remove entry `index` from the playback queue
    pub async fn dequeue(&self, index: usize) -> Result<(), AppError> {
        self.send(Action::Dequeue(index)).await
    }

    pub async fn is_paused(&self) -> Result<bool, AppError> {
        self.request(Action::IsPaused).await
    }

    pub async fn is_playing(&self) -> Result<bool, AppError> {
        self.request(Action::IsPlaying).await
    }

    pub async fn is_waiting(&self) -> Result<bool, AppError> {
        self.request(Action::IsWaiting).await
    }

    pub async fn state(&self) -> Result<PlayerState, AppError> {
        self.request(Action::State).await
    }

    /// `(position, duration)` in seconds, zero when not playing
    pub async fn timings(&self) -> Result<(f64, f64), AppError> {
        self.request(Action::Timings).await
    }

    pub async fn now_playing(&self) -> Result<NowPlaying, AppError> {
        self.request(Action::NowPlaying).await
    }

    /// Terminate the mainloop and its player process.
    /// Returns once both are gone.
    pub async fn destroy(&self) -> Result<(), AppError> {
        match self.request(Action::Terminate).await {
            Ok(()) | Err(AppError::PlayerGone) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

struct Mainloop<B> {
    services: Services,
    backend: B,
    mailbox: mpsc::Receiver<Action>,
    events: mpsc::Receiver<Event>,
    events_open: bool,
    update_interval: Duration,

    state: PlayerState,
    current: Option<Arc<Episode>>,
    /// Backend filename reported right after loading `current`
    current_file: Option<String>,
    /// Episode being waited on, with its download id
    download: Option<(Arc<Episode>, usize)>,
    now: NowPlaying,
    manual_stop: bool,
}

impl<B: MediaBackend> Mainloop<B> {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Player mainloop started");

        loop {
            if self.state == PlayerState::Idle {
                self.advance().await;
            }

            tokio::select! {
                _ = ticker.tick() => self.on_tick().await,
                event = self.events.recv(), if self.events_open => match event {
                    Some(Event::DownloadChanged) => self.check_download(),
                    Some(_) => {}
                    None => self.events_open = false,
                },
                action = self.mailbox.recv() => match action {
                    Some(action) => {
                        if self.handle(action).await.is_break() {
                            break;
                        }
                    }
                    None => {
                        debug!("Every player handle dropped");
                        self.terminate().await;
                        break;
                    }
                },
            }
        }

        info!("Player mainloop terminated");
    }

    fn set_state(&mut self, state: PlayerState) {
        if self.state != state {
            debug!("Player {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// Take the next episode off the playback queue, if any
    async fn advance(&mut self) {
        let Some(episode) = self.services.queue.pop_head() else {
            return;
        };

        if episode.state() != EpisodeState::Pending && episode.path().exists() {
            self.play(episode).await;
        } else {
            self.wait_for(episode);
        }
    }

    async fn play(&mut self, episode: Arc<Episode>) {
        let path = episode.path();
        let start = self
            .services
            .ledger
            .raw_stat(path)
            .map(|(_, resume)| resume)
            .unwrap_or(0);

        self.set_state(PlayerState::Loading);
        info!("Playing {} from {}s", path.display(), start);
        if let Err(e) = self.backend.load(path, start).await {
            error!("Failed to load {}: {}", path.display(), e);
            self.set_state(PlayerState::Idle);
            return;
        }

        self.current_file = self.backend.filename().await.ok().flatten();
        if let Err(e) = self.backend.set_paused(false).await {
            warn!("Failed to unpause: {}", e);
        }

        episode.set_state(EpisodeState::Played);
        if let Err(e) = self.services.ledger.touch(path) {
            warn!("Failed to stamp {}: {}", path.display(), e);
        }

        let title = episode.title();
        self.now = NowPlaying {
            title: if title.is_empty() {
                episode.url().to_string()
            } else {
                title
            },
            podcast: self.services.store.friendly_name(episode.url()),
        };
        self.current = Some(episode);
        self.manual_stop = false;
        self.set_state(PlayerState::Playing);
        self.services.events.post(Event::PlayerChanged);
    }

    fn wait_for(&mut self, episode: Arc<Episode>) {
        let downloader = &self.services.downloader;
        let id = match downloader.is_downloading(episode.path()) {
            Some(id) => id,
            None => match downloader.download(Arc::clone(&episode)) {
                Ok(id) => id,
                Err(e) => {
                    warn!("Skipping {}: {}", episode.url(), e);
                    return;
                }
            },
        };

        debug!("Waiting on download {} for {}", id, episode.url());
        self.download = Some((episode, id));
        self.set_state(PlayerState::Waiting);
        self.services.events.post(Event::PlayerChanged);
    }

    /// Leave the waiting state once the awaited download is over or no
    /// longer at the head. A successful download at the head is retried.
    fn check_download(&mut self) {
        let Some((episode, id)) = &self.download else {
            return;
        };

        let at_head = self.services.queue.is_at_head(episode);
        let status = self.services.downloader.get_download(*id);
        let completed = status.as_ref().map_or(true, |s| s.completed);
        if at_head && !completed {
            return;
        }

        if at_head && status.is_some_and(|s| s.success) {
            self.services.queue.rewind();
        }
        self.download = None;
        self.set_state(PlayerState::Idle);
        self.services.events.post(Event::PlayerChanged);
    }

    async fn on_tick(&mut self) {
        match self.state {
            PlayerState::Playing => {
                match self.backend.filename().await {
                    Ok(name) if name != self.current_file => {
                        self.finish_episode();
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => debug!("Polling player failed: {}", e),
                }

                if !self.backend.is_paused().await.unwrap_or(false) {
                    self.services.events.post(Event::PlayerChanged);
                }
            }
            PlayerState::Waiting => self.check_download(),
            PlayerState::Idle | PlayerState::Loading => {}
        }
    }

    /// Bookkeeping once the current episode is over, naturally or not
    fn finish_episode(&mut self) {
        if let Some(episode) = self.current.take() {
            if !self.manual_stop {
                info!("Finished {}", episode.path().display());
                episode.set_state(EpisodeState::Finished);
                if let Err(e) = self.services.ledger.touch(episode.path()) {
                    warn!("Failed to stamp {}: {}", episode.path().display(), e);
                }
            }
        }

        self.now = NowPlaying::default();
        self.current_file = None;
        self.manual_stop = false;
        self.set_state(PlayerState::Idle);
        self.services.events.post(Event::PlayerChanged);
    }

    async fn save_position(&mut self) {
        let Some(episode) = &self.current else {
            return;
        };

        match self.backend.position().await {
            Ok(pos) => {
                let seconds = pos.max(0.0) as u64;
                if let Err(e) = self.services.ledger.resume(episode.path(), seconds) {
                    warn!("Failed to save position of {}: {}", episode.path().display(), e);
                }
            }
            Err(e) => debug!("No position to save: {}", e),
        }
    }

    async fn stop(&mut self) {
        if self.state != PlayerState::Playing {
            return;
        }

        self.save_position().await;
        self.manual_stop = true;
        if let Err(e) = self.backend.stop().await {
            warn!("Failed to stop player: {}", e);
        }
        self.finish_episode();
    }

    /// Drop whatever the head was doing after a queue edit moved it
    async fn interrupt(&mut self) {
        match self.state {
            PlayerState::Playing => self.stop().await,
            PlayerState::Waiting => {
                self.download = None;
                self.set_state(PlayerState::Idle);
                self.services.events.post(Event::PlayerChanged);
            }
            PlayerState::Idle | PlayerState::Loading => {}
        }
    }

    async fn handle(&mut self, action: Action) -> ControlFlow<()> {
        let playing = self.state == PlayerState::Playing;

        match action {
            Action::Stop => self.stop().await,
            Action::Pause if playing => self.set_paused(true).await,
            Action::Unpause if playing => self.set_paused(false).await,
            Action::Toggle if playing => {
                let paused = self.backend.is_paused().await.unwrap_or(false);
                self.set_paused(!paused).await;
            }
            Action::Seek(offset) if playing => {
                if let Err(e) = self.backend.seek_relative(offset).await {
                    warn!("Seek failed: {}", e);
                }
            }
            Action::Pause | Action::Unpause | Action::Toggle | Action::Seek(_) => {}
            Action::JumpTo(index) => {
                if self.services.queue.jump_to(index) == QueueEdit::StopTransport {
                    self.interrupt().await;
                }
            }
            Action::Dequeue(index) => {
                if self.services.queue.dequeue(index) == QueueEdit::StopTransport {
                    self.interrupt().await;
                }
            }
            Action::IsPaused(reply) => {
                let paused = playing && self.backend.is_paused().await.unwrap_or(false);
                let _ = reply.send(paused);
            }
            Action::IsPlaying(reply) => {
                let _ = reply.send(playing);
            }
            Action::IsWaiting(reply) => {
                let _ = reply.send(self.state == PlayerState::Waiting);
            }
            Action::State(reply) => {
                let _ = reply.send(self.state);
            }
            Action::Timings(reply) => {
                let timings = if playing {
                    (
                        self.backend.position().await.unwrap_or(0.0),
                        self.backend.duration().await.unwrap_or(0.0),
                    )
                } else {
                    (0.0, 0.0)
                };
                let _ = reply.send(timings);
            }
            Action::NowPlaying(reply) => {
                let _ = reply.send(self.now.clone());
            }
            Action::Terminate(ack) => {
                self.terminate().await;
                let _ = ack.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn set_paused(&mut self, paused: bool) {
        match self.backend.set_paused(paused).await {
            Ok(()) => self.services.events.post(Event::PlayerChanged),
            Err(e) => warn!("Failed to set pause: {}", e),
        }
    }

    async fn terminate(&mut self) {
        if self.state == PlayerState::Playing {
            self.save_position().await;
        }
        self.backend.shutdown().await;
        self.current = None;
        self.download = None;
        self.set_state(PlayerState::Idle);
    }
}
