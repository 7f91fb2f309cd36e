#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use media_cache_proxy::events::Sinks;
use media_cache_proxy::{CacheIndex, FailureKind, ProxyConfig, ProxyContext};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const ORIGIN_CHUNK: usize = 500;

/// Deterministic media bytes: each byte is its offset modulo 251.
pub fn media(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Small buffers so a few KiB of media exercise every flush path.
pub fn test_context() -> (TempDir, ProxyContext) {
    let dir = tempfile::tempdir().unwrap();
    let config = ProxyConfig {
        cache_dir: dir.path().join("media"),
        index_path: dir.path().join("db").join("cache_index.db"),
        port: 0,
        min_free_space: 0,
        prefetch_size: 2048,
        buffer_min: 1024,
        buffer_max: 4096,
        network_chunk: 512,
        shift_buffer: 256,
        connect_timeout_secs: 2,
        read_timeout_secs: 2,
        ..ProxyConfig::default()
    };
    let index = Arc::new(CacheIndex::in_memory().unwrap());
    let ctx = ProxyContext::with_index(config, index).unwrap();
    (dir, ctx)
}

#[derive(Debug, Clone, Default)]
pub struct OriginOptions {
    /// Answer every request with this status and no body
    pub status: Option<u16>,
    /// Pause between body chunks
    pub chunk_delay: Option<Duration>,
    /// Answer `200` with the whole body whatever the `Range`
    pub ignore_range: bool,
    /// Go silent after sending this many body bytes, keeping the connection open
    pub stall_after: Option<usize>,
}

/// Minimal HTTP origin serving one body with `Range: bytes=N-` support.
pub struct Origin {
    pub addr: SocketAddr,
    body: Arc<Mutex<Vec<u8>>>,
    hits: Arc<AtomicUsize>,
}

impl Origin {
    pub async fn start(body: Vec<u8>, options: OriginOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let body = Arc::new(Mutex::new(body));
        let hits = Arc::new(AtomicUsize::new(0));

        let (served_body, served_hits) = (Arc::clone(&body), Arc::clone(&hits));
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(respond(
                    stream,
                    Arc::clone(&served_body),
                    options.clone(),
                    Arc::clone(&served_hits),
                ));
            }
        });

        Self { addr, body, hits }
    }

    pub fn url(&self, name: &str) -> String {
        format!("http://{}/media/{}", self.addr, name)
    }

    /// Requests answered so far
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn set_body(&self, body: Vec<u8>) {
        *self.body.lock() = body;
    }
}

async fn respond(
    mut stream: TcpStream,
    body: Arc<Mutex<Vec<u8>>>,
    options: OriginOptions,
    hits: Arc<AtomicUsize>,
) {
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => raw.extend_from_slice(&buf[..n]),
        }
        if raw.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    hits.fetch_add(1, Ordering::SeqCst);

    if let Some(status) = options.status {
        let header = format!(
            "HTTP/1.1 {} Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            status
        );
        let _ = stream.write_all(header.as_bytes()).await;
        return;
    }

    let text = String::from_utf8_lossy(&raw).to_string();
    let range_start = text.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case("range") {
            return None;
        }
        value
            .trim()
            .trim_start_matches("bytes=")
            .trim_end_matches('-')
            .parse::<usize>()
            .ok()
    });

    let body = body.lock().clone();
    let total = body.len();
    let (header, from) = match range_start.filter(|_| !options.ignore_range) {
        Some(start) => (
            format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nConnection: close\r\n\r\n",
                total - start,
                start,
                total - 1,
                total
            ),
            start,
        ),
        None => (
            format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                total
            ),
            0,
        ),
    };

    if stream.write_all(header.as_bytes()).await.is_err() {
        return;
    }
    let end = options.stall_after.map_or(total, |len| (from + len).min(total));
    for chunk in body[from..end].chunks(ORIGIN_CHUNK) {
        if let Some(delay) = options.chunk_delay {
            tokio::time::sleep(delay).await;
        }
        if stream.write_all(chunk).await.is_err() {
            return;
        }
    }
    if options.stall_after.is_some() {
        tokio::time::sleep(Duration::from_secs(60)).await;
        return;
    }
    let _ = stream.shutdown().await;
}

/// Collects everything reported to the sinks.
#[derive(Default)]
pub struct Recorder {
    pub errors: Mutex<Vec<FailureKind>>,
    pub progress: Mutex<Vec<f32>>,
}

impl Recorder {
    pub fn sinks(self: &Arc<Self>) -> Sinks {
        let (errors, progress) = (Arc::clone(self), Arc::clone(self));
        Sinks {
            progress: Some(Arc::new(move |p: f32| progress.progress.lock().push(p))),
            errors: Some(Arc::new(move |kind: FailureKind| errors.errors.lock().push(kind))),
        }
    }

    pub fn errors(&self) -> Vec<FailureKind> {
        self.errors.lock().clone()
    }

    pub fn last_progress(&self) -> Option<f32> {
        self.progress.lock().last().copied()
    }
}

/// Splits a raw response into its header block and body.
pub fn split_response(raw: &[u8]) -> (String, Vec<u8>) {
    match raw.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(end) => (
            String::from_utf8_lossy(&raw[..end + 4]).to_string(),
            raw[end + 4..].to_vec(),
        ),
        None => (String::new(), raw.to_vec()),
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// An address nothing listens on.
pub fn closed_port_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}/media/gone.mp3", addr)
}
