// src/event.rs
// Fan-out event bus shared by the player, the downloader and the front-end

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Buffer depth of every registered consumer
pub const SUBSCRIBER_DEPTH: usize = 16;

/// Events passed between subsystems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Keystroke,
    Resize,
    PlayerChanged,
    DownloadChanged,
    /// The player process went away and the program should exit
    RequestShutdown,
}

impl Event {
    /// Progress-style events which are delivered best-effort
    pub fn is_high_frequency(self) -> bool {
        matches!(self, Event::PlayerChanged | Event::DownloadChanged)
    }
}

/// Multiplexer over the subsystems waiting for events in parallel.
///
/// Producers [`post`](EventBus::post) into a single inbound channel and a
/// dispatcher task copies each event to every registered consumer. Posting
/// never blocks; a lagging consumer only loses progress-style events once its
/// buffer of [`SUBSCRIBER_DEPTH`] is full.
#[derive(Debug)]
pub struct EventBus {
    inbound_tx: mpsc::UnboundedSender<Event>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    subscribers: Arc<RwLock<Vec<mpsc::Sender<Event>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        Self {
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            subscribers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a new consumer. It receives every event posted from now on.
    pub fn register(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_DEPTH);
        self.subscribers.write().push(tx);
        rx
    }

    /// Number of consumers which have not yet been pruned
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Post an event to all consumers
    pub fn post(&self, event: Event) {
        if self.inbound_tx.send(event).is_err() {
            warn!("Event {:?} posted after the dispatcher stopped", event);
        }
    }

    /// Spawn the dispatcher task. Must be called from within a tokio runtime.
    /// Calling it a second time has no effect.
    pub fn start(&self) {
        let mut rx = match self.inbound_rx.lock().take() {
            Some(rx) => rx,
            None => {
                debug!("Event dispatcher already running");
                return;
            }
        };
        let subscribers = Arc::clone(&self.subscribers);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let targets: Vec<mpsc::Sender<Event>> = subscribers.read().clone();
                let mut saw_closed = false;

                for tx in &targets {
                    if event.is_high_frequency() {
                        match tx.try_send(event) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {}
                            Err(TrySendError::Closed(_)) => saw_closed = true,
                        }
                    } else if tx.send(event).await.is_err() {
                        saw_closed = true;
                    }
                }

                if saw_closed {
                    subscribers.write().retain(|tx| !tx.is_closed());
                }
            }
            debug!("Event dispatcher stopped");
        });
    }
}
