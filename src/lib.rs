// src/lib.rs
// Podbit engine: queue and ledger files, downloads and the player mainloop

pub mod cli;
pub mod config;
pub mod console;
pub mod downloader;
pub mod error;
pub mod event;
pub mod ledger;
pub mod maintenance;
pub mod metadata;
pub mod mpv;
pub mod playback;
pub mod player;
pub mod queue;

pub use error::AppError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
