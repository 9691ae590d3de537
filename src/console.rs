// src/console.rs
// Line-oriented command surface over the player, queue and downloads

use crate::error::AppError;
use crate::event::Event;
use crate::maintenance::MaintenanceCommand;
use crate::player::{Player, Services};
use log::debug;
use std::fmt::Write as _;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

const HELP: &str = "\
Commands:
  add <url>          enqueue the episode with this URL
  title <title>      enqueue the episode with this title
  podcast <name>     enqueue every episode of a podcast
  jump <n>           play queue entry n next
  rm <n>             remove queue entry n
  clear              empty the playback queue
  play | pause | toggle | stop
  seek <+/-secs>     seek relative to the current position
  queue              show the playback queue
  episodes           show every known episode
  podcasts           show podcast names
  download <url>     download an episode without playing it
  downloads          show downloads
  cancel <id>        cancel a download
  status             show what is playing
  reload             reload the queue file now
  quit";

/// A parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Enqueue(String),
    EnqueueTitle(String),
    EnqueuePodcast(String),
    Jump(usize),
    Dequeue(usize),
    Clear,
    Play,
    Pause,
    Toggle,
    Stop,
    Seek(i64),
    Queue,
    Episodes,
    Podcasts,
    Download(String),
    Downloads,
    Cancel(usize),
    Status,
    Reload,
    Help,
    Quit,
}

/// Parse one input line. Errors are messages for the user.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (word, arg) = match line.split_once(char::is_whitespace) {
        Some((word, arg)) => (word, arg.trim()),
        None => (line, ""),
    };

    let text = |name: &str| {
        if arg.is_empty() {
            Err(format!("{} needs an argument", name))
        } else {
            Ok(arg.to_string())
        }
    };
    let index = |name: &str| {
        arg.parse::<usize>()
            .map_err(|_| format!("{} needs a number, got '{}'", name, arg))
    };

    match word {
        "add" | "enqueue" => text(word).map(Command::Enqueue),
        "title" => text(word).map(Command::EnqueueTitle),
        "podcast" => text(word).map(Command::EnqueuePodcast),
        "jump" => index(word).map(Command::Jump),
        "rm" | "dequeue" => index(word).map(Command::Dequeue),
        "clear" => Ok(Command::Clear),
        "play" | "unpause" => Ok(Command::Play),
        "pause" => Ok(Command::Pause),
        "toggle" | "p" => Ok(Command::Toggle),
        "stop" => Ok(Command::Stop),
        "seek" => arg
            .parse::<i64>()
            .map(Command::Seek)
            .map_err(|_| format!("seek needs a signed number of seconds, got '{}'", arg)),
        "queue" | "ls" => Ok(Command::Queue),
        "episodes" => Ok(Command::Episodes),
        "podcasts" => Ok(Command::Podcasts),
        "download" => text(word).map(Command::Download),
        "downloads" => Ok(Command::Downloads),
        "cancel" => index(word).map(Command::Cancel),
        "status" => Ok(Command::Status),
        "reload" => Ok(Command::Reload),
        "help" | "?" => Ok(Command::Help),
        "quit" | "q" | "exit" => Ok(Command::Quit),
        "" => Err(String::new()),
        other => Err(format!("unknown command '{}', try 'help'", other)),
    }
}

/// Format seconds as `HH:MM:SS`
pub fn format_time(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

pub struct Console {
    services: Services,
    player: Player,
    maintenance: mpsc::Sender<MaintenanceCommand>,
}

impl Console {
    pub fn new(
        services: Services,
        player: Player,
        maintenance: mpsc::Sender<MaintenanceCommand>,
    ) -> Self {
        Self {
            services,
            player,
            maintenance,
        }
    }

    /// Read commands until `quit` or end of input
    pub async fn run<R, W>(&self, input: R, mut output: W) -> Result<(), AppError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();

        while let Some(line) = lines.next_line().await? {
            self.services.events.post(Event::Keystroke);

            let reply = match parse_command(&line) {
                Ok(Command::Quit) => break,
                Ok(command) => {
                    debug!("Console command: {:?}", command);
                    match self.execute(command).await {
                        Ok(reply) => reply,
                        Err(AppError::PlayerGone) => return Err(AppError::PlayerGone),
                        Err(e) => format!("error: {}", e),
                    }
                }
                Err(message) => message,
            };

            if !reply.is_empty() {
                output.write_all(reply.as_bytes()).await?;
                if !reply.ends_with('\n') {
                    output.write_all(b"\n").await?;
                }
                output.flush().await?;
            }
        }

        Ok(())
    }

    /// Carry out one command and describe the result
    pub async fn execute(&self, command: Command) -> Result<String, AppError> {
        let Services {
            queue,
            store,
            downloader,
            ..
        } = &self.services;

        let reply = match command {
            Command::Enqueue(url) => {
                if queue.enqueue_by_url(store, &url) {
                    format!("enqueued {}", url)
                } else {
                    format!("no episode with URL {}", url)
                }
            }
            Command::EnqueueTitle(title) => {
                if queue.enqueue_by_title(store, &title) {
                    format!("enqueued {}", title)
                } else {
                    format!("no episode titled {}", title)
                }
            }
            Command::EnqueuePodcast(name) => {
                format!("enqueued {} episodes", queue.enqueue_by_podcast(store, &name))
            }
            Command::Jump(index) => {
                self.player.jump_to(index).await?;
                String::new()
            }
            Command::Dequeue(index) => {
                self.player.dequeue(index).await?;
                String::new()
            }
            Command::Clear => {
                queue.clear();
                self.player.stop().await?;
                "queue cleared".to_string()
            }
            Command::Play => {
                self.player.unpause().await?;
                String::new()
            }
            Command::Pause => {
                self.player.pause().await?;
                String::new()
            }
            Command::Toggle => {
                self.player.toggle().await?;
                String::new()
            }
            Command::Stop => {
                self.player.stop().await?;
                String::new()
            }
            Command::Seek(offset) => {
                self.player.seek(offset).await?;
                String::new()
            }
            Command::Queue => {
                let head = queue.head();
                let mut out = String::new();
                for (i, episode) in queue.items().iter().enumerate() {
                    let marker = if i + 1 == head { '>' } else { ' ' };
                    let _ = writeln!(
                        out,
                        "{}{:3} [{}] {}",
                        marker,
                        i,
                        episode.state(),
                        episode.title()
                    );
                }
                if out.is_empty() {
                    out.push_str("playback queue is empty");
                }
                out
            }
            Command::Episodes => {
                let mut out = String::new();
                store.range(|_, episode| {
                    let _ = write!(
                        out,
                        "[{}] {} {}",
                        episode.state(),
                        episode.url(),
                        episode.title()
                    );
                    if let Some(host) = episode.host() {
                        let _ = write!(out, " ({})", host);
                    }
                    out.push('\n');
                    true
                });
                out
            }
            Command::Podcasts => store.podcasts().join("\n"),
            Command::Download(url) => match store.get_by_url(&url) {
                None => format!("no episode with URL {}", url),
                Some(episode) => match downloader.is_downloading(episode.path()) {
                    Some(id) => format!("already downloading as {}", id),
                    None => format!("started download {}", downloader.download(episode)?),
                },
            },
            Command::Downloads => {
                let mut out = String::new();
                for dl in downloader.downloads() {
                    let status = if !dl.completed {
                        format!("{:5.1}%", dl.percentage * 100.0)
                    } else if dl.success {
                        "done".to_string()
                    } else {
                        dl.error.clone()
                    };
                    let _ = writeln!(out, "{:3} {} {}", dl.id, status, dl.path.display());
                }
                if out.is_empty() {
                    out.push_str("no downloads");
                }
                out
            }
            Command::Cancel(id) => {
                if downloader.cancel(id) {
                    format!("cancelling download {}", id)
                } else {
                    format!("download {} is not running", id)
                }
            }
            Command::Status => {
                let state = self.player.state().await?;
                let now = self.player.now_playing().await?;
                let (position, duration) = self.player.timings().await?;
                let paused = self.player.is_paused().await?;

                let mut out = format!("{:?}{}", state, if paused { " (paused)" } else { "" });
                if !now.title.is_empty() {
                    let _ = write!(
                        out,
                        ": {} - {} [{} / {}]",
                        now.podcast,
                        now.title,
                        format_time(position),
                        format_time(duration)
                    );
                }
                let _ = write!(
                    out,
                    "\nqueue {}/{}, {} downloads running",
                    queue.head(),
                    queue.len(),
                    downloader.ongoing()
                );
                out
            }
            Command::Reload => {
                if self.maintenance.send(MaintenanceCommand::Reload).await.is_err() {
                    store.reload();
                }
                "reloading queue".to_string()
            }
            Command::Help => HELP.to_string(),
            Command::Quit => String::new(),
        };

        Ok(reply)
    }
}
