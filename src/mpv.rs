// src/mpv.rs
// mpv supervision and control over its JSON IPC socket

use crate::error::AppError;
use crate::event::{Event, EventBus};
use crate::player::MediaBackend;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::process::Command as AsyncCommand;
use tokio::sync::{oneshot, watch};

/// Player binary spawned by default
pub const MPV_PROGRAM: &str = "mpv";
/// Default location of the IPC socket
pub const MPV_SOCKET: &str = "/tmp/podbit-mpv";

const CONNECT_RETRY: Duration = Duration::from_millis(20);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const LOAD_TIMEOUT: Duration = Duration::from_secs(10);
const LOAD_POLL: Duration = Duration::from_millis(50);

/// Arguments which idle mpv, waiting for commands on `socket`
pub fn mpv_args(socket: &Path) -> Vec<String> {
    vec![
        "--idle".to_string(),
        "--no-video".to_string(),
        format!("--input-ipc-server={}", socket.display()),
    ]
}

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    request_id: Option<u64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    event: Option<String>,
}

/// One request/reply connection to mpv
struct IpcConnection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
            next_id: 0,
        }
    }

    async fn command(&mut self, args: Vec<Value>) -> Result<Value, AppError> {
        self.next_id += 1;
        let id = self.next_id;

        let mut request = serde_json::to_string(&json!({ "command": args, "request_id": id }))?;
        request.push('\n');
        self.writer.write_all(request.as_bytes()).await?;

        loop {
            let line = tokio::time::timeout(REPLY_TIMEOUT, self.lines.next_line())
                .await
                .map_err(|_| AppError::PlayerError("mpv did not answer".to_string()))??
                .ok_or_else(|| AppError::PlayerError("mpv closed the IPC connection".to_string()))?;

            let reply: Reply = serde_json::from_str(&line)?;
            if let Some(event) = reply.event {
                debug!("mpv event: {}", event);
                continue;
            }
            if reply.request_id != Some(id) {
                continue;
            }

            return match reply.error.as_deref() {
                Some("success") | None => Ok(reply.data.unwrap_or(Value::Null)),
                Some(error) => Err(AppError::PlayerError(error.to_string())),
            };
        }
    }

    async fn get_property(&mut self, name: &str) -> Result<Value, AppError> {
        self.command(vec![json!("get_property"), json!(name)]).await
    }

    async fn set_property(&mut self, name: &str, value: Value) -> Result<(), AppError> {
        self.command(vec![json!("set_property"), json!(name), value])
            .await
            .map(|_| ())
    }
}

/// Treat "property unavailable" as no value
fn optional(result: Result<Value, AppError>) -> Result<Option<Value>, AppError> {
    match result {
        Ok(Value::Null) => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(AppError::PlayerError(e)) if e == "property unavailable" => Ok(None),
        Err(e) => Err(e),
    }
}

/// A running mpv process and the task watching it
struct Process {
    kill_tx: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

/// [`MediaBackend`] driving an idle mpv through its IPC socket.
///
/// mpv is only started by the first [`load`](MediaBackend::load). If it
/// exits on its own, [`Event::RequestShutdown`] is posted.
pub struct MpvBackend {
    program: String,
    socket: PathBuf,
    events: Arc<EventBus>,
    process: Option<Process>,
    conn: Option<IpcConnection>,
}

impl MpvBackend {
    pub fn new(
        program: impl Into<String>,
        socket: impl Into<PathBuf>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            program: program.into(),
            socket: socket.into(),
            events,
            process: None,
            conn: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.process
            .as_ref()
            .is_some_and(|p| !*p.exited.borrow())
    }

    async fn start(&mut self) -> Result<(), AppError> {
        // A socket left by an earlier run would accept nothing
        let _ = std::fs::remove_file(&self.socket);

        let mut child = AsyncCommand::new(&self.program)
            .args(mpv_args(&self.socket))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    AppError::PlayerError(format!("{} not found in PATH", self.program))
                }
                _ => AppError::PlayerError(format!("failed to start {}: {}", self.program, e)),
            })?;
        info!("Started {} (pid {:?})", self.program, child.id());

        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exited) = watch::channel(false);
        let events = Arc::clone(&self.events);

        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => warn!("mpv exited unexpectedly: {}", status),
                        Err(e) => warn!("Lost track of mpv: {}", e),
                    }
                    exit_tx.send_replace(true);
                    events.post(Event::RequestShutdown);
                }
                _ = &mut kill_rx => {
                    if let Err(e) = child.kill().await {
                        debug!("Killing mpv: {}", e);
                    }
                    exit_tx.send_replace(true);
                }
            }
        });

        self.process = Some(Process {
            kill_tx: Some(kill_tx),
            exited,
        });
        self.connect().await
    }

    /// Connect to the IPC socket, retrying while mpv starts up
    async fn connect(&mut self) -> Result<(), AppError> {
        loop {
            if !self.is_running() {
                return Err(AppError::PlayerError(
                    "mpv exited before its IPC socket came up".to_string(),
                ));
            }

            match UnixStream::connect(&self.socket).await {
                Ok(stream) => {
                    debug!("Connected to {}", self.socket.display());
                    self.conn = Some(IpcConnection::new(stream));
                    return Ok(());
                }
                Err(_) => tokio::time::sleep(CONNECT_RETRY).await,
            }
        }
    }

    fn conn(&mut self) -> Result<&mut IpcConnection, AppError> {
        self.conn
            .as_mut()
            .ok_or_else(|| AppError::PlayerError("mpv is not running".to_string()))
    }

    async fn wait_loaded(&mut self, path: &str) -> Result<(), AppError> {
        let deadline = Instant::now() + LOAD_TIMEOUT;

        while Instant::now() < deadline {
            let conn = self.conn()?;
            let loaded = optional(conn.get_property("path").await)?;
            if loaded.as_ref().and_then(Value::as_str) == Some(path) {
                let duration = optional(conn.get_property("duration").await)?;
                if duration.is_some() {
                    return Ok(());
                }
            }
            tokio::time::sleep(LOAD_POLL).await;
        }

        Err(AppError::PlayerError(format!("timed out loading {}", path)))
    }
}

#[async_trait]
impl MediaBackend for MpvBackend {
    async fn load(&mut self, path: &Path, start: u64) -> Result<(), AppError> {
        if self.conn.is_none() || !self.is_running() {
            self.start().await?;
        }

        let target = path.to_string_lossy().into_owned();
        self.conn()?
            .command(vec![json!("loadfile"), json!(target), json!("append-play")])
            .await?;
        self.wait_loaded(&target).await?;

        if start > 0 {
            self.conn()?
                .command(vec![json!("seek"), json!(start), json!("absolute")])
                .await?;
        }
        Ok(())
    }

    async fn is_paused(&mut self) -> Result<bool, AppError> {
        let value = self.conn()?.get_property("pause").await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn set_paused(&mut self, paused: bool) -> Result<(), AppError> {
        self.conn()?.set_property("pause", json!(paused)).await
    }

    async fn position(&mut self) -> Result<f64, AppError> {
        let value = optional(self.conn()?.get_property("time-pos").await)?;
        Ok(value.and_then(|v| v.as_f64()).unwrap_or(0.0))
    }

    async fn duration(&mut self) -> Result<f64, AppError> {
        let value = optional(self.conn()?.get_property("duration").await)?;
        Ok(value.and_then(|v| v.as_f64()).unwrap_or(0.0))
    }

    async fn seek_relative(&mut self, offset: i64) -> Result<(), AppError> {
        self.conn()?
            .command(vec![json!("seek"), json!(offset), json!("relative")])
            .await
            .map(|_| ())
    }

    async fn stop(&mut self) -> Result<(), AppError> {
        self.conn()?.command(vec![json!("stop")]).await.map(|_| ())
    }

    async fn filename(&mut self) -> Result<Option<String>, AppError> {
        let value = optional(self.conn()?.get_property("filename").await)?;
        Ok(value.and_then(|v| v.as_str().map(str::to_string)))
    }

    async fn shutdown(&mut self) {
        // The watcher must see the kill request before mpv goes away, or it
        // reports an unexpected exit
        self.conn = None;

        if let Some(mut process) = self.process.take() {
            if let Some(kill) = process.kill_tx.take() {
                let _ = kill.send(());
            }
            let _ = process.exited.wait_for(|exited| *exited).await;
            info!("mpv stopped");
        }

        let _ = std::fs::remove_file(&self.socket);
    }
}
