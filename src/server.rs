//! TCP server.
//!
//! Accepts connections, runs one task per connection, and dispatches each
//! decoded request to a [`Handler`] under a per-connection timeout.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle --listen--> Listening --serve--> Serving --shutdown--> Draining --> Stopped
//! ```
//!
//! Shutdown closes the listener right away, then waits for every
//! connection task that was already accepted to finish on its own
//! (response written, failure, or timeout). In-flight handlers are never
//! cut short.
//!
//! ## Serve modes
//!
//! - [`ServeMode::OneShot`] (default): one request frame in, one response
//!   frame out, then the connection is closed.
//! - [`ServeMode::KeepAlive`]: the read-handle-write cycle repeats on the
//!   same connection until the peer hangs up between frames. Each cycle has
//!   its own timeout, so an idle connection is closed after one timeout.
//!
//! Clients must use the same mode as the server.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{self, FrameBuffer};
use crate::error::{Error, Result};
use crate::handler::Handler;

/// Default per-connection timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Default listen backlog.
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Pause after an accept error that is not tied to a single connection.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// How many exchanges a connection serves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ServeMode {
    /// One exchange, then close.
    #[default]
    OneShot,
    /// Exchanges repeat until the peer disconnects.
    KeepAlive,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to listen on (`host:port`).
    pub listen: String,
    /// Deadline for one read-handle-write cycle.
    pub timeout: Duration,
    /// Connection reuse policy.
    pub mode: ServeMode,
    /// Listen backlog passed to the OS.
    pub backlog: i32,
}

impl ServerConfig {
    /// Configuration with the given address and timeout, other fields defaulted.
    pub fn new(listen: impl Into<String>, timeout: Duration) -> Self {
        Self {
            listen: listen.into(),
            timeout,
            ..Self::default()
        }
    }

    /// Set the serve mode.
    pub fn with_mode(mut self, mode: ServeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the listen backlog.
    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            timeout: DEFAULT_TIMEOUT,
            mode: ServeMode::default(),
            backlog: DEFAULT_BACKLOG,
        }
    }
}

/// Server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Constructed, no listener yet.
    Idle,
    /// Listener bound, not accepting yet.
    Listening,
    /// Accept loop running.
    Serving,
    /// Listener closed, waiting for in-flight connections.
    Draining,
    /// All connections finished.
    Stopped,
}

/// Connection counters for monitoring.
#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    accepted: AtomicU64,
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

impl ConnectionMetrics {
    /// Total connections accepted.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Connections currently being handled.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Connections that finished without error.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Connections closed because of a protocol or handler error.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Connections closed because the timeout elapsed.
    pub fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }

    fn record_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    fn record_finish(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Completed => &self.completed,
            Outcome::Failed => &self.failed,
            Outcome::TimedOut => &self.timed_out,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// How a connection task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
    TimedOut,
}

/// Records the end of one connection task when dropped, so a panicking
/// handler still counts as `Failed`.
struct ConnectionGuard {
    shared: Arc<Shared>,
    outcome: Outcome,
}

impl ConnectionGuard {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            outcome: Outcome::Failed,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.shared.metrics.record_finish(self.outcome);
    }
}

/// State shared between the server, its connection tasks and shutdown handles.
#[derive(Debug)]
struct Shared {
    state: watch::Sender<ServerState>,
    shutdown: watch::Sender<bool>,
    metrics: ConnectionMetrics,
}

impl Shared {
    fn set_state(&self, state: ServerState) {
        self.state.send_replace(state);
    }
}

/// Handle used to stop a running server. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    shared: Arc<Shared>,
}

impl ShutdownHandle {
    /// Stop accepting connections and wait until every in-flight
    /// connection has finished.
    ///
    /// Returns once the server is [`ServerState::Stopped`] or has been
    /// dropped. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == ServerState::Stopped).await;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.shared.state.borrow()
    }

    /// Connection counters.
    pub fn metrics(&self) -> &ConnectionMetrics {
        &self.shared.metrics
    }
}

/// NUL-framed JSON server.
pub struct Server<H> {
    config: ServerConfig,
    handler: Arc<H>,
    listener: Option<TcpListener>,
    shared: Arc<Shared>,
}

impl<H: Handler> Server<H> {
    /// Create an idle server. Performs no I/O.
    pub fn new(config: ServerConfig, handler: H) -> Self {
        let (state, _) = watch::channel(ServerState::Idle);
        let (shutdown, _) = watch::channel(false);

        Server {
            config,
            handler: Arc::new(handler),
            listener: None,
            shared: Arc::new(Shared {
                state,
                shutdown,
                metrics: ConnectionMetrics::default(),
            }),
        }
    }

    /// Create a server and bind its listener.
    pub async fn bind(config: ServerConfig, handler: H) -> Result<Self> {
        let mut server = Self::new(config, handler);
        server.listen().await?;
        Ok(server)
    }

    /// Bind the listen address. On failure the server stays idle.
    pub async fn listen(&mut self) -> Result<()> {
        let listen = self.config.listen.clone();
        let bind_error = |source: io::Error| Error::Bind {
            addr: listen.clone(),
            source,
        };

        let addr = tokio::net::lookup_host(&self.config.listen)
            .await
            .map_err(bind_error)?
            .next()
            .ok_or_else(|| {
                bind_error(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "address did not resolve",
                ))
            })?;

        let listener = create_listener(addr, self.config.backlog).map_err(bind_error)?;
        let listener = TcpListener::from_std(listener).map_err(bind_error)?;

        info!(
            address = %addr,
            mode = ?self.config.mode,
            timeout_ms = self.config.timeout.as_millis() as u64,
            "Server listening"
        );

        self.listener = Some(listener);
        self.shared.set_state(ServerState::Listening);
        Ok(())
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let listener = self.listener.as_ref().ok_or(Error::NotListening)?;
        listener.local_addr().map_err(Error::Socket)
    }

    /// Handle for stopping the server from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.shared.state.borrow()
    }

    /// Connection counters.
    pub fn metrics(&self) -> &ConnectionMetrics {
        &self.shared.metrics
    }

    /// Run the accept loop until shutdown is requested, then drain.
    ///
    /// Returns after every accepted connection has finished.
    pub async fn serve(mut self) -> Result<()> {
        let listener = self.listener.take().ok_or(Error::NotListening)?;
        let mut shutdown = self.shared.shutdown.subscribe();
        let mut tasks = JoinSet::new();

        self.shared.set_state(ServerState::Serving);
        debug!("Accept loop started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown_requested(&mut shutdown) => break,

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_join(joined);
                }

                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "New connection");
                        self.shared.metrics.record_accept();

                        let handler = Arc::clone(&self.handler);
                        let shared = Arc::clone(&self.shared);
                        let timeout = self.config.timeout;
                        let mode = self.config.mode;

                        tasks.spawn(async move {
                            let mut guard = ConnectionGuard::new(shared);
                            guard.outcome = handle_connection(stream, peer, &*handler, timeout, mode).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        if let Some(pause) = accept_backoff(&e) {
                            tokio::time::sleep(pause).await;
                        }
                    }
                },
            }
        }

        drop(listener);
        self.shared.set_state(ServerState::Draining);
        info!(in_flight = tasks.len(), "Shutting down, draining connections");

        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }

        self.shared.set_state(ServerState::Stopped);
        info!(
            accepted = self.shared.metrics.accepted(),
            "Server stopped"
        );
        Ok(())
    }
}

impl<H> Drop for Server<H> {
    fn drop(&mut self) {
        // Unblock shutdown callers if the server never got to drain.
        self.shared.state.send_if_modified(|state| {
            if *state == ServerState::Stopped {
                false
            } else {
                *state = ServerState::Stopped;
                true
            }
        });
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Errors that concern one pending connection are retried at once; anything
/// else (out of descriptors, out of memory) gets a short pause.
fn accept_backoff(e: &io::Error) -> Option<Duration> {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => None,
        _ => Some(ACCEPT_BACKOFF),
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Connection task failed");
    }
}

/// Serve one connection until it is done, then close it.
async fn handle_connection<H: Handler>(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: &H,
    timeout: Duration,
    mode: ServeMode,
) -> Outcome {
    let mut frames = FrameBuffer::new();
    let mut served = 0u64;

    let outcome = loop {
        let mut in_request = false;
        let cycle = exchange(&mut stream, &mut frames, handler, &mut in_request);

        match tokio::time::timeout(timeout, cycle).await {
            Ok(Ok(())) => {
                served += 1;
                trace!(peer = %peer, served, "Response sent");
                if mode == ServeMode::OneShot {
                    break Outcome::Completed;
                }
            }
            Ok(Err(Error::Closed)) if served > 0 => {
                trace!(peer = %peer, served, "Connection closed by client");
                break Outcome::Completed;
            }
            Ok(Err(Error::Closed)) => {
                debug!(peer = %peer, "Connection closed before a request arrived");
                break Outcome::Failed;
            }
            Ok(Err(e)) => {
                warn!(peer = %peer, error = %e, "Request failed, closing connection");
                break Outcome::Failed;
            }
            Err(_) if served > 0 && !in_request && frames.is_empty() => {
                debug!(peer = %peer, served, "Idle keep-alive connection closed");
                break Outcome::Completed;
            }
            Err(_) => {
                warn!(
                    peer = %peer,
                    timeout_ms = timeout.as_millis() as u64,
                    "Connection closed early: timeout"
                );
                break Outcome::TimedOut;
            }
        }
    };

    if let Err(e) = stream.shutdown().await {
        trace!(peer = %peer, error = %e, "Socket shutdown failed");
    }
    outcome
}

/// Read one request frame, run the handler, write the response frame.
async fn exchange<H: Handler>(
    stream: &mut TcpStream,
    frames: &mut FrameBuffer,
    handler: &H,
    in_request: &mut bool,
) -> Result<()> {
    let frame = frames.read_frame(stream).await?;
    *in_request = true;
    let request: Value = codec::decode(&frame)?;
    let response = handler.call(request).await?;
    codec::write_frame(stream, &response).await
}

/// Create a TCP listener with SO_REUSEADDR and the configured backlog.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
