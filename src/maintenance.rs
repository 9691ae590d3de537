// src/maintenance.rs
// Background queue reloading and the cache cleanup run at exit

use crate::error::AppError;
use crate::ledger::ResumeLedger;
use crate::queue::{EpisodeState, QueueStore};
use chrono::Utc;
use log::{debug, info, warn};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// The queue is written back every this many reload ticks
pub const SAVE_EVERY: u32 = 4;

/// Requests accepted by [`reload_loop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceCommand {
    /// Reload the queue now
    Reload,
    /// Reload, save the queue and stop the loop
    SaveAndExit,
}

/// Hot-reload the queue file every `period` until told to stop.
///
/// Returns when [`MaintenanceCommand::SaveAndExit`] arrives or every sender
/// is dropped.
pub async fn reload_loop(
    store: Arc<QueueStore>,
    period: Duration,
    mut commands: mpsc::Receiver<MaintenanceCommand>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                store.reload();
                ticks += 1;
                if ticks % SAVE_EVERY == 0 {
                    if let Err(e) = store.save() {
                        warn!("Periodic queue save failed: {}", e);
                    }
                }
            }
            command = commands.recv() => match command {
                Some(MaintenanceCommand::Reload) => {
                    store.reload();
                }
                Some(MaintenanceCommand::SaveAndExit) => {
                    store.reload();
                    if let Err(e) = store.save() {
                        warn!("Final queue save failed: {}", e);
                    }
                    break;
                }
                None => break,
            },
        }
    }

    debug!("Reload loop stopped");
}

/// Reset played or finished episodes last heard more than `max_age` ago:
/// the file is deleted, the episode goes back to pending and its ledger
/// entry is pruned. Returns how many were removed.
pub fn clean_cache(store: &QueueStore, ledger: &ResumeLedger, max_age: Duration) -> usize {
    let now = Utc::now().timestamp();
    let max_age = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
    let mut removed = 0;

    store.range(|_, episode| {
        if !matches!(episode.state(), EpisodeState::Played | EpisodeState::Finished) {
            return true;
        }
        let Ok((stamp, _)) = ledger.raw_stat(episode.path()) else {
            return true;
        };
        if now.saturating_sub(stamp) < max_age {
            return true;
        }

        match std::fs::remove_file(episode.path()) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!("Failed to remove {}: {}", episode.path().display(), e);
                return true;
            }
        }
        episode.set_state(EpisodeState::Pending);
        if let Err(e) = ledger.prune(episode.path()) {
            debug!("Pruning {}: {}", episode.path().display(), e);
        }
        removed += 1;
        true
    });

    info!("Cache cleanup removed {} episodes", removed);
    removed
}

/// Final write-out at exit: pick up any queue changes, optionally clean the
/// cache, then save the queue and the ledger
pub fn shutdown_flush(
    store: &QueueStore,
    ledger: &ResumeLedger,
    clean: Option<Duration>,
) -> Result<(), AppError> {
    store.reload();
    if let Some(max_age) = clean {
        clean_cache(store, ledger, max_age);
    }

    store.save()?;
    ledger.save()?;
    Ok(())
}
