// src/config.rs
// Runtime configuration resolved from the command line and the environment

use crate::downloader::default_tools;
use crate::error::AppError;
use crate::ledger::LEDGER_FILENAME;
use crate::player::UPDATE_INTERVAL;
use clap::ArgMatches;
use dirs_next as dirs;
use log::debug;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the newsboat queue file
pub const QUEUE_FILENAME: &str = "queue";
/// Directories under `$HOME` searched for the queue, in order
pub const QUEUE_DIRS: &[&str] = &[".local/share/newsboat", ".newsboat"];
/// How often the queue file is hot-reloaded
pub const RELOAD_INTERVAL: Duration = Duration::from_secs(60);
/// Played episodes older than this are removed from disk
pub const DEFAULT_CACHE_DAYS: u64 = 3;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub queue_path: PathBuf,
    pub data_dir: PathBuf,
    pub ledger_path: PathBuf,
    pub player: String,
    pub socket: PathBuf,
    pub update_interval: Duration,
    pub reload_interval: Duration,
    pub cache_age: Duration,
    pub clean_on_exit: bool,
    /// Extraction tools for delegated downloads, most preferred first
    pub tools: Vec<String>,
}

impl Config {
    /// Resolve the configuration from parsed arguments.
    /// Creates the data directory if it is missing.
    pub fn from_matches(matches: &ArgMatches) -> Result<Self, AppError> {
        let queue_path = match matches.get_one::<String>("queue") {
            Some(path) => PathBuf::from(path),
            None => {
                let xdg_data = env::var_os("XDG_DATA_HOME").map(PathBuf::from);
                find_queue(dirs::home_dir().as_deref(), xdg_data.as_deref())
                    .ok_or(AppError::QueueNotFound)?
            }
        };

        let data_dir = match matches.get_one::<String>("data-dir") {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir()?,
        };
        fs::create_dir_all(&data_dir).map_err(|source| AppError::DirectoryCreation {
            path: data_dir.display().to_string(),
            source,
        })?;

        let player = matches
            .get_one::<String>("player")
            .cloned()
            .unwrap_or_else(|| crate::mpv::MPV_PROGRAM.to_string());
        let socket = matches
            .get_one::<String>("socket")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(crate::mpv::MPV_SOCKET));
        let cache_days = matches
            .get_one::<u64>("cache-days")
            .copied()
            .unwrap_or(DEFAULT_CACHE_DAYS);

        let config = Self {
            queue_path,
            ledger_path: data_dir.join(LEDGER_FILENAME),
            data_dir,
            player,
            socket,
            update_interval: UPDATE_INTERVAL,
            reload_interval: RELOAD_INTERVAL,
            cache_age: Duration::from_secs(cache_days.saturating_mul(SECONDS_PER_DAY)),
            clean_on_exit: !matches.get_flag("no-clean"),
            tools: default_tools(),
        };
        debug!("Resolved configuration: {:?}", config);
        Ok(config)
    }
}

/// Every place the queue file may live, in search order
pub fn queue_candidates(home: Option<&Path>, xdg_data: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(home) = home {
        candidates.extend(QUEUE_DIRS.iter().map(|dir| home.join(dir).join(QUEUE_FILENAME)));
    }
    if let Some(data) = xdg_data {
        candidates.push(data.join("newsboat").join(QUEUE_FILENAME));
    }
    candidates
}

/// First existing queue file among the candidates
pub fn find_queue(home: Option<&Path>, xdg_data: Option<&Path>) -> Option<PathBuf> {
    queue_candidates(home, xdg_data)
        .into_iter()
        .find(|candidate| candidate.is_file())
}

/// `$XDG_DATA_HOME/podbit`, falling back to `~/.local/share/podbit`
pub fn default_data_dir() -> Result<PathBuf, AppError> {
    dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
        .map(|dir| dir.join("podbit"))
        .ok_or_else(|| AppError::General("Failed to find the home directory".to_string()))
}
