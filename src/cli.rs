// src/cli.rs

use crate::mpv::{MPV_PROGRAM, MPV_SOCKET};
use clap::{value_parser, Arg, ArgAction, Command};

/// Build the command-line interface for the application
pub fn build_cli() -> Command {
    Command::new("podbit")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Podbit Developers")
        .about("Podcast player and downloader driven by the newsboat queue")
        .arg(
            Arg::new("queue")
                .long("queue")
                .short('q')
                .help("Path to the newsboat queue file (searched for when omitted)")
                .value_name("FILE"),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .short('d')
                .help("Directory holding the podbit cache.db")
                .value_name("DIRECTORY"),
        )
        .arg(
            Arg::new("player")
                .long("player")
                .help("Media player program to spawn")
                .value_name("PROGRAM")
                .default_value(MPV_PROGRAM),
        )
        .arg(
            Arg::new("socket")
                .long("socket")
                .help("Path of the player's IPC socket")
                .value_name("PATH")
                .default_value(MPV_SOCKET),
        )
        .arg(
            Arg::new("no-clean")
                .long("no-clean")
                .help("Keep old played episodes on disk at exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("cache-days")
                .long("cache-days")
                .help("Days after which played episodes are removed from disk")
                .value_name("DAYS")
                .value_parser(value_parser!(u64))
                .default_value("3"),
        )
}
