// Media Proxy
// Loopback listener the player connects to. Only requests for the current
// playback target are served, and a new request always supersedes the one
// before it.

use parking_lot::{Mutex, RwLock};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::events::{ErrorSink, ProgressSink, Sinks};
use crate::file_name::valid_file_name;
use crate::http::read_request;
use crate::request::RequestHandler;
use crate::ProxyContext;

struct PlaybackTarget {
    url: String,
    file_name: String,
    cacheable: bool,
}

struct ActiveRequest {
    id: u64,
    cancel: CancellationToken,
}

struct Listener {
    addr: SocketAddr,
    cancel: CancellationToken,
}

struct ProxyState {
    /// Port to bind; the first ephemeral port is kept for later restarts
    port: u16,
    listener: Option<Listener>,
    target: Option<PlaybackTarget>,
    current: Option<ActiveRequest>,
}

struct Inner {
    ctx: ProxyContext,
    state: Mutex<ProxyState>,
    sinks: RwLock<Sinks>,
    next_id: AtomicU64,
}

pub struct MediaProxy {
    inner: Arc<Inner>,
}

impl MediaProxy {
    pub fn new(ctx: ProxyContext) -> Self {
        let port = ctx.config.port;
        Self {
            inner: Arc::new(Inner {
                ctx,
                state: Mutex::new(ProxyState {
                    port,
                    listener: None,
                    target: None,
                    current: None,
                }),
                sinks: RwLock::new(Sinks::default()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Binds the loopback listener unless it's already running. Must be
    /// called from within a tokio runtime.
    pub fn start(&self) -> io::Result<SocketAddr> {
        let mut state = self.inner.state.lock();
        if let Some(listener) = &state.listener {
            return Ok(listener.addr);
        }

        let std_listener = match std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, state.port)) {
            Ok(listener) => listener,
            Err(e) if state.port != 0 => {
                log::warn!("Port {} unavailable ({}); using an ephemeral one", state.port, e);
                std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?
            }
            Err(e) => return Err(e),
        };
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        state.port = addr.port();
        state.listener = Some(Listener {
            addr,
            cancel: cancel.clone(),
        });
        drop(state);

        log::info!("Media proxy listening on {}", addr);
        tokio::spawn(accept_loop(Arc::clone(&self.inner), listener, cancel));
        Ok(addr)
    }

    /// Interrupts the current request and closes the listener.
    pub fn stop(&self) {
        let listener = {
            let mut state = self.inner.state.lock();
            if let Some(current) = state.current.take() {
                current.cancel.cancel();
            }
            state.listener.take()
        };
        if let Some(listener) = listener {
            listener.cancel.cancel();
            log::info!("Media proxy on {} stopped", listener.addr);
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.state.lock().listener.as_ref().map(|l| l.addr)
    }

    /// Cancels the request being served, if any. Bytes it collected are still
    /// cached.
    pub fn interrupt_current(&self) {
        if let Some(current) = self.inner.state.lock().current.take() {
            log::debug!("Interrupting request {}", current.id);
            current.cancel.cancel();
        }
    }

    /// Makes `url` the playback target and returns the address the player
    /// should open. Requests for any other source are dropped from now on.
    /// Caching also needs free disk space and a usable file name.
    pub fn set_data_source(&self, url: &str, cacheable: bool) -> String {
        self.interrupt_current();
        let Some(file_name) = valid_file_name(url) else {
            log::warn!("No file name in {}; playing it directly", url);
            self.clear_target();
            return url.to_string();
        };
        let cacheable = cacheable && self.inner.ctx.store.is_cacheable(url);
        log::info!(
            "Playback target {} ({})",
            file_name,
            if cacheable { "cached" } else { "uncached" }
        );
        self.inner.state.lock().target = Some(PlaybackTarget {
            url: url.to_string(),
            file_name,
            cacheable,
        });
        self.proxy_url(url)
    }

    /// Forgets the playback target; every request is dropped until the next
    /// `set_data_source`.
    pub fn clear_target(&self) {
        self.inner.state.lock().target = None;
    }

    /// URL of the current playback target, if any
    pub fn target_url(&self) -> Option<String> {
        self.inner.state.lock().target.as_ref().map(|t| t.url.clone())
    }

    /// Loopback URL for `url`, starting the listener if needed. Falls back
    /// to `url` itself if the listener can't be bound.
    pub fn proxy_url(&self, url: &str) -> String {
        match self.start() {
            Ok(addr) => format!("http://127.0.0.1:{}/{}", addr.port(), url),
            Err(e) => {
                log::error!("Media proxy unavailable: {}", e);
                url.to_string()
            }
        }
    }

    pub fn set_progress_sink(&self, sink: Option<Arc<dyn ProgressSink>>) {
        self.inner.sinks.write().progress = sink;
    }

    pub fn set_error_sink(&self, sink: Option<Arc<dyn ErrorSink>>) {
        self.inner.sinks.write().errors = sink;
    }

    /// Records the duration the player found for the playback target.
    pub fn set_duration(&self, duration_ms: u64) {
        let Some(url) = self.target_url() else {
            return;
        };
        let store = &self.inner.ctx.store;
        let result = match store.open(&url) {
            Ok(Some(entry)) => store.set_duration(&entry, duration_ms),
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            log::warn!("Failed to record duration of {}: {}", url, e);
        }
    }

    /// Buffering progress of the playback target at `play_progress`.
    pub fn buffering_progress(&self, play_progress: f32) -> f32 {
        let file_name = match &self.inner.state.lock().target {
            Some(target) => target.file_name.clone(),
            None => return 0.0,
        };
        self.inner.ctx.store.buffering_progress(&file_name, play_progress)
    }
}

impl Drop for MediaProxy {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                log::debug!("Player connected from {}", peer);
                let inner = Arc::clone(&inner);
                let cancel = cancel.clone();
                tokio::spawn(async move { inner.dispatch(stream, cancel).await });
            }
            Err(e) => log::warn!("Accept failed: {}", e),
        }
    }
}

impl Inner {
    async fn dispatch(&self, mut stream: TcpStream, listener_cancel: CancellationToken) {
        let request = match read_request(&mut stream).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                log::debug!("Ignoring unparseable request");
                return;
            }
            Err(e) => {
                log::debug!("Failed to read request: {}", e);
                return;
            }
        };
        if !request.method.eq_ignore_ascii_case("GET") {
            log::debug!("Ignoring {} request", request.method);
            return;
        }

        let (id, cacheable, cancel) = {
            let mut state = self.state.lock();
            let cacheable = match &state.target {
                Some(target) if valid_file_name(&request.url).as_deref() == Some(target.file_name.as_str()) => {
                    target.cacheable
                }
                Some(target) => {
                    log::info!("Dropping stale request for {} (playing {})", request.url, target.file_name);
                    return;
                }
                None => {
                    log::info!("Dropping request for {}: nothing is being prepared", request.url);
                    return;
                }
            };
            if let Some(previous) = state.current.take() {
                log::debug!("Request {} superseded", previous.id);
                previous.cancel.cancel();
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let cancel = listener_cancel.child_token();
            state.current = Some(ActiveRequest {
                id,
                cancel: cancel.clone(),
            });
            (id, cacheable, cancel)
        };

        let sinks = self.sinks.read().clone();
        RequestHandler::new(self.ctx.clone(), request, cacheable, stream, sinks, cancel)
            .run()
            .await;

        let mut state = self.state.lock();
        if state.current.as_ref().is_some_and(|current| current.id == id) {
            state.current = None;
        }
    }
}
