// tests/common/mod.rs
// Shared fixtures: a one-shot local HTTP responder and a scripted media backend

#![allow(dead_code)]

use async_trait::async_trait;
use podbit::error::AppError;
use podbit::player::MediaBackend;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// How the local server answers
#[derive(Clone)]
pub enum Reply {
    /// 200 with the whole body
    Body(Vec<u8>),
    /// 200 announcing `length` bytes, sending `prefix` and then stalling
    Stall { length: usize, prefix: Vec<u8> },
    /// Bare status line with an empty body
    Status(u16),
}

/// Serve `reply` to every connection and return the base URL
pub async fn serve(reply: Reply) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let reply = reply.clone();

            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }

                match reply {
                    Reply::Body(body) => {
                        let head = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            body.len()
                        );
                        let _ = stream.write_all(head.as_bytes()).await;
                        let _ = stream.write_all(&body).await;
                        let _ = stream.shutdown().await;
                    }
                    Reply::Stall { length, prefix } => {
                        let head = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            length
                        );
                        let _ = stream.write_all(head.as_bytes()).await;
                        let _ = stream.write_all(&prefix).await;
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    }
                    Reply::Status(code) => {
                        let head = format!(
                            "HTTP/1.1 {} Nope\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                            code
                        );
                        let _ = stream.write_all(head.as_bytes()).await;
                        let _ = stream.shutdown().await;
                    }
                }
            });
        }
    });

    format!("http://{}", addr)
}

/// Client that never goes through a proxy, so the local server is reachable
pub fn local_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// Observable state of a [`FakeBackend`]
#[derive(Debug, Default)]
pub struct FakeState {
    pub loads: Vec<(PathBuf, u64)>,
    pub filename: Option<String>,
    pub paused: bool,
    pub position: f64,
    pub duration: f64,
    pub seeks: Vec<i64>,
    pub stops: usize,
    pub shutdown: bool,
}

/// In-memory player: loading sets the filename, tests end playback by
/// clearing it
#[derive(Debug, Clone, Default)]
pub struct FakeBackend {
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the media running out
    pub fn finish_track(&self) {
        self.state.lock().unwrap().filename = None;
    }

    pub fn set_position(&self, position: f64) {
        self.state.lock().unwrap().position = position;
    }
}

#[async_trait]
impl MediaBackend for FakeBackend {
    async fn load(&mut self, path: &Path, start: u64) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        state.loads.push((path.to_path_buf(), start));
        state.filename = path.file_name().map(|n| n.to_string_lossy().into_owned());
        state.position = start as f64;
        state.duration = 600.0;
        Ok(())
    }

    async fn is_paused(&mut self) -> Result<bool, AppError> {
        Ok(self.state.lock().unwrap().paused)
    }

    async fn set_paused(&mut self, paused: bool) -> Result<(), AppError> {
        self.state.lock().unwrap().paused = paused;
        Ok(())
    }

    async fn position(&mut self) -> Result<f64, AppError> {
        Ok(self.state.lock().unwrap().position)
    }

    async fn duration(&mut self) -> Result<f64, AppError> {
        Ok(self.state.lock().unwrap().duration)
    }

    async fn seek_relative(&mut self, offset: i64) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        state.seeks.push(offset);
        state.position += offset as f64;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        state.stops += 1;
        state.filename = None;
        Ok(())
    }

    async fn filename(&mut self) -> Result<Option<String>, AppError> {
        Ok(self.state.lock().unwrap().filename.clone())
    }

    async fn shutdown(&mut self) {
        self.state.lock().unwrap().shutdown = true;
    }
}

/// A tiny WAV file whose RIFF INFO chunk carries a title and an artist
pub fn tagged_wav(title: &str, artist: &str) -> Vec<u8> {
    fn chunk(id: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = id.to_vec();
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(body);
        if body.len() % 2 == 1 {
            out.push(0);
        }
        out
    }
    fn text(value: &str) -> Vec<u8> {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        bytes
    }

    let mut fmt = Vec::new();
    for (value, width) in [(1u32, 2), (1, 2), (8000, 4), (16000, 4), (2, 2), (16, 2)] {
        fmt.extend_from_slice(&value.to_le_bytes()[..width]);
    }

    let mut info = b"INFO".to_vec();
    info.extend(chunk(b"INAM", &text(title)));
    info.extend(chunk(b"IART", &text(artist)));

    let mut body = b"WAVE".to_vec();
    body.extend(chunk(b"fmt ", &fmt));
    body.extend(chunk(b"data", &[0u8; 16]));
    body.extend(chunk(b"LIST", &info));
    chunk(b"RIFF", &body)
}

/// Poll `check` until it holds or five seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
