// src/main.rs

use env_logger::Builder;
use log::{debug, error, info, warn, LevelFilter};
use podbit::cli::build_cli;
use podbit::config::Config;
use podbit::console::Console;
use podbit::downloader::Downloader;
use podbit::error::AppError;
use podbit::event::{Event, EventBus};
use podbit::ledger::ResumeLedger;
use podbit::maintenance::{reload_loop, shutdown_flush, MaintenanceCommand};
use podbit::mpv::MpvBackend;
use podbit::playback::PlaybackQueue;
use podbit::player::{Player, Services};
use podbit::queue::{QueueStore, UnknownPodcasts};
use std::io::Write;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    init_logger();
    info!("podbit starting up - version {}", podbit::VERSION);

    let matches = build_cli().get_matches();
    let config = Config::from_matches(&matches)?;

    // Any failure reading the data files is fatal
    let ledger = Arc::new(ResumeLedger::open(&config.ledger_path)?);
    let store = Arc::new(QueueStore::open(
        &config.queue_path,
        Arc::clone(&ledger),
        Arc::new(UnknownPodcasts),
    )?);

    let events = Arc::new(EventBus::new());
    let mut shutdown_rx = events.register();
    let downloader = Arc::new(Downloader::new(Arc::clone(&events), config.tools.clone())?);
    let services = Services {
        queue: Arc::new(PlaybackQueue::new()),
        store: Arc::clone(&store),
        ledger: Arc::clone(&ledger),
        downloader: Arc::clone(&downloader),
        events: Arc::clone(&events),
    };

    let backend = MpvBackend::new(
        config.player.clone(),
        config.socket.clone(),
        Arc::clone(&events),
    );
    let (player, mainloop) = Player::spawn(services.clone(), backend, config.update_interval);
    events.start();

    let (maintenance_tx, maintenance_rx) = mpsc::channel(4);
    let maintenance = tokio::spawn(reload_loop(
        Arc::clone(&store),
        config.reload_interval,
        maintenance_rx,
    ));

    let console = Console::new(services, player.clone(), maintenance_tx.clone());
    println!("podbit {} - type 'help' for commands", podbit::VERSION);

    let stdin = BufReader::new(tokio::io::stdin());
    tokio::select! {
        result = console.run(stdin, tokio::io::stdout()) => match result {
            Ok(()) => info!("Console closed"),
            Err(e) => error!("Console failed: {}", e),
        },
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = wait_for_shutdown(&mut shutdown_rx) => warn!("Player went away, shutting down"),
    }
    drop(shutdown_rx);

    info!("Shutting down");
    if let Err(e) = player.destroy().await {
        warn!("Failed to stop the player: {}", e);
    }
    if let Err(e) = mainloop.await {
        warn!("Player mainloop panicked: {}", e);
    }

    for download in downloader.downloads().iter().filter(|d| !d.completed) {
        downloader.cancel(download.id);
        downloader.wait(download.id).await;
    }

    let _ = maintenance_tx.send(MaintenanceCommand::SaveAndExit).await;
    let _ = maintenance.await;

    let clean = config.clean_on_exit.then_some(config.cache_age);
    shutdown_flush(&store, &ledger, clean)?;
    info!("Data saved, exiting");

    // A blocking stdin read would otherwise hold up runtime shutdown
    std::process::exit(0)
}

async fn wait_for_shutdown(events: &mut mpsc::Receiver<Event>) {
    while let Some(event) = events.recv().await {
        if event == Event::RequestShutdown {
            return;
        }
    }
    std::future::pending::<()>().await
}

fn init_logger() {
    let mut builder = Builder::from_default_env();

    // Set the default level based on debug/release mode
    if cfg!(debug_assertions) {
        builder.filter_level(LevelFilter::Debug);
    } else {
        builder.filter_level(LevelFilter::Info);
    }

    builder.format(|buf, record| {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        writeln!(
            buf,
            "[{} {} {}] {}",
            timestamp,
            record.level().to_string().to_uppercase(),
            record.module_path().unwrap_or("unknown"),
            record.args()
        )
    });

    // Allow override through RUST_LOG environment variable
    builder.parse_env("RUST_LOG");
    builder.init();

    debug!("Logger initialized");
}
